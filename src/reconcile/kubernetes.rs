//! Kubernetes reconcile backend: computes the desired `Deployment`/`Service`/
//! `NetworkPolicy` for a rollout and applies them with server-side-apply,
//! then polls rollout health. Adapted from the teacher's ReplicaSet-based
//! `KubernetesController` (label constants, `Patch::Apply` usage, the
//! crash-loop pod-status check in `check_pod_errors`) but targets a plain
//! K8s `Deployment` instead of a hand-rolled ReplicaSet: this spec has no
//! blue/green drift-detection requirement of its own, so the Deployment
//! controller's built-in rolling update covers what the teacher's
//! `replicaset_has_drifted` existed to compensate for.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{Deployment as K8sDeployment, DeploymentSpec, DeploymentStrategy, RollingUpdateDeployment};
use k8s_openapi::api::core::v1::{Container, ContainerPort, EnvVar as K8sEnvVar, Namespace, PodSpec, PodTemplateSpec, Service as K8sService, ServicePort, ServiceSpec};
use k8s_openapi::api::networking::v1::{NetworkPolicy, NetworkPolicyIngressRule, NetworkPolicyPort, NetworkPolicySpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::{Api, DeleteParams, Patch, PatchParams};
use kube::Client;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::error::{EncliiError, ErrorKind};

use super::{ReconcileBackend, ReconcileTarget, RolloutHealth};

const LABEL_MANAGED_BY: &str = "enclii.dev/managed-by";
const LABEL_PROJECT: &str = "enclii.dev/project";
const LABEL_SERVICE: &str = "enclii.dev/service";
const MANAGER: &str = "enclii-controlplane";

const CRASH_LOOP_REASONS: &[&str] = &[
    "InvalidImageName",
    "ErrImagePull",
    "ImageInspectError",
    "CrashLoopBackOff",
    "CreateContainerConfigError",
    "CreateContainerError",
    "RunContainerError",
];

fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 404)
}

pub struct KubernetesBackendConfig {
    pub namespace_format: String,
    pub node_selector: HashMap<String, String>,
}

pub struct KubernetesBackend {
    client: Client,
    config: KubernetesBackendConfig,
}

impl KubernetesBackend {
    pub fn new(client: Client, config: KubernetesBackendConfig) -> Self {
        Self { client, config }
    }

    fn namespace_for(&self, project_slug: &str) -> String {
        self.config.namespace_format.replace("{project_name}", project_slug)
    }

    fn resource_name(&self, target: &ReconcileTarget) -> String {
        target.service.name.clone()
    }

    fn labels(&self, target: &ReconcileTarget) -> BTreeMap<String, String> {
        let mut labels = BTreeMap::new();
        labels.insert(LABEL_MANAGED_BY.to_string(), MANAGER.to_string());
        labels.insert(LABEL_PROJECT.to_string(), target.service.project_id.to_string());
        labels.insert(LABEL_SERVICE.to_string(), target.service.name.clone());
        labels
    }

    fn desired_namespace(&self, namespace: &str, target: &ReconcileTarget) -> Namespace {
        let mut labels = BTreeMap::new();
        labels.insert(LABEL_MANAGED_BY.to_string(), MANAGER.to_string());
        labels.insert(LABEL_PROJECT.to_string(), target.service.project_id.to_string());
        Namespace {
            metadata: ObjectMeta { name: Some(namespace.to_string()), labels: Some(labels), ..Default::default() },
            ..Default::default()
        }
    }

    fn desired_deployment(&self, namespace: &str, name: &str, target: &ReconcileTarget) -> K8sDeployment {
        let labels = self.labels(target);
        let env: Vec<K8sEnvVar> = target
            .env_vars
            .iter()
            .map(|(k, v)| K8sEnvVar { name: k.clone(), value: Some(v.clone()), ..Default::default() })
            .collect();

        K8sDeployment {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                labels: Some(labels.clone()),
                ..Default::default()
            },
            spec: Some(DeploymentSpec {
                replicas: Some(target.service.desired_replicas),
                selector: LabelSelector { match_labels: Some(labels.clone()), ..Default::default() },
                strategy: Some(DeploymentStrategy {
                    type_: Some("RollingUpdate".to_string()),
                    rolling_update: Some(RollingUpdateDeployment {
                        max_surge: Some(IntOrString::Int(1)),
                        max_unavailable: Some(IntOrString::Int(0)),
                    }),
                }),
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta { labels: Some(labels), ..Default::default() }),
                    spec: Some(PodSpec {
                        containers: vec![Container {
                            name: "app".to_string(),
                            image: Some(target.release.image_uri.clone().unwrap_or_default()),
                            image_pull_policy: Some("IfNotPresent".to_string()),
                            ports: Some(vec![ContainerPort { container_port: target.service.port as i32, ..Default::default() }]),
                            env: if env.is_empty() { None } else { Some(env) },
                            ..Default::default()
                        }],
                        node_selector: if self.config.node_selector.is_empty() {
                            None
                        } else {
                            Some(self.config.node_selector.clone().into_iter().collect())
                        },
                        ..Default::default()
                    }),
                },
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn desired_service(&self, namespace: &str, name: &str, target: &ReconcileTarget) -> K8sService {
        let labels = self.labels(target);
        K8sService {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                labels: Some(labels.clone()),
                ..Default::default()
            },
            spec: Some(ServiceSpec {
                type_: Some("ClusterIP".to_string()),
                selector: Some(labels),
                ports: Some(vec![ServicePort {
                    name: Some("http".to_string()),
                    port: target.service.port as i32,
                    target_port: Some(IntOrString::Int(target.service.port as i32)),
                    protocol: Some("TCP".to_string()),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    /// The ingress port here must come from the same field as the
    /// container port in `desired_deployment` — both derive from
    /// `target.service.port`, never two independently-set values.
    fn desired_network_policy(&self, namespace: &str, name: &str, target: &ReconcileTarget) -> NetworkPolicy {
        let labels = self.labels(target);
        NetworkPolicy {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                labels: Some(labels.clone()),
                ..Default::default()
            },
            spec: Some(NetworkPolicySpec {
                pod_selector: LabelSelector { match_labels: Some(labels), ..Default::default() },
                policy_types: Some(vec!["Ingress".to_string()]),
                ingress: Some(vec![NetworkPolicyIngressRule {
                    ports: Some(vec![NetworkPolicyPort {
                        port: Some(IntOrString::Int(target.service.port as i32)),
                        protocol: Some("TCP".to_string()),
                        ..Default::default()
                    }]),
                    from: None,
                }]),
                egress: None,
            }),
        }
    }

    async fn crash_loop_reason(&self, namespace: &str, service_name: &str) -> Result<Option<String>, EncliiError> {
        use k8s_openapi::api::core::v1::Pod;

        let pod_api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let pods = pod_api
            .list(&kube::api::ListParams::default().labels(&format!("{LABEL_SERVICE}={service_name}")))
            .await
            .map_err(|e| EncliiError::new(ErrorKind::Upstream, format!("failed to list pods for {service_name}: {e}")))?;

        for pod in pods.items {
            let Some(status) = pod.status else { continue };
            let Some(container_statuses) = status.container_statuses else { continue };
            for cs in container_statuses {
                if let Some(waiting) = cs.state.as_ref().and_then(|s| s.waiting.as_ref()) {
                    let reason = waiting.reason.as_deref().unwrap_or("");
                    if CRASH_LOOP_REASONS.contains(&reason) {
                        let message = waiting.message.as_deref().unwrap_or(reason);
                        return Ok(Some(format!("{reason}: {message}")));
                    }
                }
                if let Some(terminated) = cs.state.as_ref().and_then(|s| s.terminated.as_ref()) {
                    if terminated.exit_code != 0 && cs.restart_count >= 3 {
                        let reason = terminated.reason.as_deref().unwrap_or("ContainerFailed");
                        return Ok(Some(format!("{reason} (restarts: {})", cs.restart_count)));
                    }
                }
            }
        }

        Ok(None)
    }
}

#[async_trait]
impl ReconcileBackend for KubernetesBackend {
    async fn apply(&self, target: &ReconcileTarget, cancel: &CancellationToken) -> Result<(), EncliiError> {
        if cancel.is_cancelled() {
            return Err(EncliiError::cancelled("reconcile apply cancelled"));
        }

        let namespace = self.namespace_for(&target.project_slug);
        let name = self.resource_name(target);
        let patch_params = PatchParams::apply(MANAGER).force();

        let ns_api: Api<Namespace> = Api::all(self.client.clone());
        ns_api
            .patch(&namespace, &patch_params, &Patch::Apply(&self.desired_namespace(&namespace, target)))
            .await
            .map_err(|e| EncliiError::new(ErrorKind::Upstream, format!("failed to apply namespace {namespace}: {e}")))?;

        let deploy_api: Api<K8sDeployment> = Api::namespaced(self.client.clone(), &namespace);
        deploy_api
            .patch(&name, &patch_params, &Patch::Apply(&self.desired_deployment(&namespace, &name, target)))
            .await
            .map_err(|e| EncliiError::new(ErrorKind::Upstream, format!("failed to apply deployment {name}: {e}")))?;

        let svc_api: Api<K8sService> = Api::namespaced(self.client.clone(), &namespace);
        svc_api
            .patch(&name, &patch_params, &Patch::Apply(&self.desired_service(&namespace, &name, target)))
            .await
            .map_err(|e| EncliiError::new(ErrorKind::Upstream, format!("failed to apply service {name}: {e}")))?;

        let netpol_api: Api<NetworkPolicy> = Api::namespaced(self.client.clone(), &namespace);
        netpol_api
            .patch(&name, &patch_params, &Patch::Apply(&self.desired_network_policy(&namespace, &name, target)))
            .await
            .map_err(|e| EncliiError::new(ErrorKind::Upstream, format!("failed to apply network policy {name}: {e}")))?;

        info!(service = %target.service.name, namespace = %namespace, "applied deployment, service, network policy");
        Ok(())
    }

    async fn poll_health(&self, target: &ReconcileTarget, cancel: &CancellationToken) -> Result<RolloutHealth, EncliiError> {
        if cancel.is_cancelled() {
            return Err(EncliiError::cancelled("reconcile health poll cancelled"));
        }

        let namespace = self.namespace_for(&target.project_slug);
        let name = self.resource_name(target);

        let deploy_api: Api<K8sDeployment> = Api::namespaced(self.client.clone(), &namespace);
        let deployment = deploy_api
            .get(&name)
            .await
            .map_err(|e| EncliiError::new(ErrorKind::Upstream, format!("failed to read deployment {name}: {e}")))?;

        let desired_replicas = deployment.spec.as_ref().and_then(|s| s.replicas).unwrap_or(0);
        let ready_replicas = deployment.status.as_ref().and_then(|s| s.ready_replicas).unwrap_or(0);

        if let Some(reason) = self.crash_loop_reason(&namespace, &name).await? {
            return Ok(RolloutHealth::Unhealthy { ready_replicas, desired_replicas, reason: Some(reason) });
        }

        if desired_replicas > 0 && ready_replicas >= desired_replicas {
            Ok(RolloutHealth::Healthy { ready_replicas })
        } else if ready_replicas > 0 && ready_replicas < desired_replicas {
            Ok(RolloutHealth::Progressing { ready_replicas, desired_replicas })
        } else {
            Ok(RolloutHealth::Unhealthy { ready_replicas, desired_replicas, reason: None })
        }
    }

    async fn remove(&self, target: &ReconcileTarget, _cancel: &CancellationToken) -> Result<(), EncliiError> {
        let namespace = self.namespace_for(&target.project_slug);
        let name = self.resource_name(target);
        let dp = DeleteParams::default();

        let deploy_api: Api<K8sDeployment> = Api::namespaced(self.client.clone(), &namespace);
        if let Err(e) = deploy_api.delete(&name, &dp).await {
            if !is_not_found(&e) {
                return Err(EncliiError::new(ErrorKind::Upstream, format!("failed to delete deployment {name}: {e}")));
            }
        }

        let svc_api: Api<K8sService> = Api::namespaced(self.client.clone(), &namespace);
        if let Err(e) = svc_api.delete(&name, &dp).await {
            if !is_not_found(&e) {
                return Err(EncliiError::new(ErrorKind::Upstream, format!("failed to delete service {name}: {e}")));
            }
        }

        let netpol_api: Api<NetworkPolicy> = Api::namespaced(self.client.clone(), &namespace);
        if let Err(e) = netpol_api.delete(&name, &dp).await {
            if !is_not_found(&e) {
                return Err(EncliiError::new(ErrorKind::Upstream, format!("failed to delete network policy {name}: {e}")));
            }
        }

        // The namespace is shared by other services in the project, so it
        // (like the teacher's terminate()) is never deleted here.
        Ok(())
    }
}
