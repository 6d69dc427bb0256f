//! Auth gate (interface only, SPEC_FULL.md §2/§4 component table). Token
//! *issuance* belongs to the out-of-scope identity provider; this crate only
//! needs to validate a bearer token it's handed and resolve a principal for
//! authorization decisions made by the out-of-scope HTTP layer. No JWT
//! library is pulled in here for the reason DESIGN.md records: validation of
//! an opaque token is all this boundary needs.

use async_trait::async_trait;

use crate::error::EncliiError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub subject: String,
    pub roles: Vec<String>,
}

impl Principal {
    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }
}

#[async_trait]
pub trait AuthGate: Send + Sync {
    async fn validate(&self, bearer_token: &str) -> Result<Principal, EncliiError>;
}

/// Validates against a single shared-secret token, resolving to a fixed
/// admin principal. Standing in for the identity provider's introspection
/// endpoint until that out-of-scope surface exists; sufficient for the
/// internal enqueue/reconcile callers this crate itself drives.
pub struct StaticTokenAuthGate {
    token: String,
}

impl StaticTokenAuthGate {
    pub fn new(token: impl Into<String>) -> Self {
        Self { token: token.into() }
    }
}

#[async_trait]
impl AuthGate for StaticTokenAuthGate {
    async fn validate(&self, bearer_token: &str) -> Result<Principal, EncliiError> {
        use subtle::ConstantTimeEq;

        if bearer_token.as_bytes().ct_eq(self.token.as_bytes()).into() {
            Ok(Principal { subject: "service-account".to_string(), roles: vec!["admin".to_string()] })
        } else {
            Err(EncliiError::new(crate::error::ErrorKind::Unauthorized, "invalid bearer token"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn accepts_matching_token() {
        let gate = StaticTokenAuthGate::new("s3cr3t");
        let principal = gate.validate("s3cr3t").await.unwrap();
        assert!(principal.has_role("admin"));
    }

    #[tokio::test]
    async fn rejects_mismatched_token() {
        let gate = StaticTokenAuthGate::new("s3cr3t");
        assert!(gate.validate("wrong").await.is_err());
    }
}
