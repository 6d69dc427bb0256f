//! Transition validation for `Release` and `Deployment` status, mirroring the
//! terminal-state and valid-transition guarantees spelled out in I1 and I4.

use crate::model::{DeploymentStatus, ReleaseStatus};

pub fn release_is_terminal(status: ReleaseStatus) -> bool {
    matches!(status, ReleaseStatus::Ready | ReleaseStatus::Failed)
}

pub fn release_valid_transition(from: ReleaseStatus, to: ReleaseStatus) -> bool {
    use ReleaseStatus::*;

    if from == to {
        // Idempotent re-application of the same status, terminal or not, is a
        // no-op at the store layer (I1's "repeat is a no-op" clause).
        return true;
    }

    match (from, to) {
        (_, _) if release_is_terminal(from) => false,
        (Pending, Building) => true,
        (Pending, Failed) => true,
        (Building, Ready) => true,
        (Building, Failed) => true,
        _ => false,
    }
}

pub fn deployment_is_terminal(status: DeploymentStatus) -> bool {
    matches!(
        status,
        DeploymentStatus::Succeeded | DeploymentStatus::Failed | DeploymentStatus::RolledBack
    )
}

pub fn deployment_is_active(status: DeploymentStatus) -> bool {
    matches!(
        status,
        DeploymentStatus::Pending | DeploymentStatus::Progressing
    )
}

pub fn deployment_valid_transition(from: DeploymentStatus, to: DeploymentStatus) -> bool {
    use DeploymentStatus::*;

    if from == to {
        return true;
    }

    match (from, to) {
        (from, _) if deployment_is_terminal(from) => false,
        (Pending, Progressing) => true,
        (Pending, Failed) => true,
        (Progressing, Succeeded) => true,
        (Progressing, Failed) => true,
        (Succeeded, RolledBack) => true,
        _ => false,
    }
}

pub fn validate_deployment_transition(
    from: DeploymentStatus,
    to: DeploymentStatus,
) -> anyhow::Result<()> {
    if !deployment_valid_transition(from, to) {
        anyhow::bail!("invalid deployment transition from {from} to {to}");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use DeploymentStatus::*;
    use ReleaseStatus::*;

    #[test]
    fn release_terminal_states() {
        assert!(release_is_terminal(Ready));
        assert!(release_is_terminal(Failed));
        assert!(!release_is_terminal(Pending));
        assert!(!release_is_terminal(Building));
    }

    #[test]
    fn release_rejects_transitions_out_of_terminal() {
        assert!(!release_valid_transition(Ready, Building));
        assert!(!release_valid_transition(Failed, Pending));
    }

    #[test]
    fn release_valid_build_path() {
        assert!(release_valid_transition(Pending, Building));
        assert!(release_valid_transition(Building, Ready));
        assert!(release_valid_transition(Building, Failed));
        assert!(!release_valid_transition(Pending, Ready));
    }

    #[test]
    fn deployment_terminal_and_active_states() {
        assert!(deployment_is_terminal(Succeeded));
        assert!(deployment_is_terminal(Failed));
        assert!(deployment_is_terminal(RolledBack));
        assert!(deployment_is_active(Pending));
        assert!(deployment_is_active(Progressing));
        assert!(!deployment_is_active(Succeeded));
    }

    #[test]
    fn deployment_rollback_path() {
        assert!(deployment_valid_transition(Succeeded, RolledBack));
        assert!(!deployment_valid_transition(Failed, RolledBack));
        assert!(validate_deployment_transition(Pending, Progressing).is_ok());
        assert!(validate_deployment_transition(Succeeded, Pending).is_err());
    }

    #[test]
    fn repeated_terminal_transition_is_idempotent_noop() {
        assert!(deployment_valid_transition(Succeeded, Succeeded));
    }
}
