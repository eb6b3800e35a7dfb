//! Kubernetes deployer implementation.
//!
//! Rolls a new image out by patching one container of an existing
//! `Deployment` and reads rollout health back from its status.

use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::apps::v1::Deployment;
use kube::Client;
use kube::api::{Api, Patch, PatchParams};
use serde_json::json;
use tracing::{debug, info};
use wpstack_core::deployer::*;
use wpstack_core::{Error, Result};

/// Field manager recorded on patches.
pub const FIELD_MANAGER: &str = "wpstack";

/// Pod template annotation that forces a rollout even when the image
/// reference is unchanged (e.g., a rebuilt `latest`).
pub const DEPLOYED_AT_ANNOTATION: &str = "wpstack.io/deployed-at";
pub const RUN_ANNOTATION: &str = "wpstack.io/deployment-id";

/// Kubernetes-based deployer.
pub struct KubernetesDeployer {
    client: Client,
    namespace: String,
}

impl KubernetesDeployer {
    pub async fn new(namespace: impl Into<String>) -> Result<Self> {
        let client = Client::try_default()
            .await
            .map_err(|e| Error::Internal(e.to_string()))?;
        Ok(Self {
            client,
            namespace: namespace.into(),
        })
    }

    pub fn with_client(client: Client, namespace: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
        }
    }

    fn api(&self) -> Api<Deployment> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    async fn get(&self, service: &str) -> Result<Deployment> {
        self.api().get(service).await.map_err(|e| match e {
            kube::Error::Api(ref response) if response.code == 404 => Error::NotFound(format!(
                "deployment '{}' in namespace '{}'",
                service, self.namespace
            )),
            other => Error::DeploymentFailed(other.to_string()),
        })
    }
}

/// Strategic-merge patch replacing the image of one container.
pub fn image_patch(spec: &DeploymentSpec) -> serde_json::Value {
    json!({
        "spec": {
            "template": {
                "metadata": {
                    "annotations": {
                        DEPLOYED_AT_ANNOTATION: Utc::now().to_rfc3339(),
                        RUN_ANNOTATION: spec.id.to_string(),
                    }
                },
                "spec": {
                    "containers": [{ "name": spec.container, "image": spec.image }]
                }
            }
        }
    })
}

fn container_image(deployment: &Deployment, container: &str) -> Option<Option<String>> {
    deployment
        .spec
        .as_ref()?
        .template
        .spec
        .as_ref()?
        .containers
        .iter()
        .find(|c| c.name == container)
        .map(|c| c.image.clone())
}

fn count(value: Option<i32>) -> u32 {
    value.unwrap_or(0).max(0) as u32
}

/// Derive rollout state from a deployment object.
///
/// The rollout is healthy once the controller has observed `revision` and
/// every desired replica is updated and available with no old replicas
/// left over.
pub fn assess(deployment: &Deployment, container: &str, revision: Option<i64>) -> DeploymentState {
    let desired = count(deployment.spec.as_ref().and_then(|s| s.replicas).or(Some(1)));
    let status = deployment.status.clone().unwrap_or_default();

    let replicas = ReplicaStatus {
        desired,
        updated: count(status.updated_replicas),
        ready: count(status.ready_replicas),
        available: count(status.available_replicas),
        unavailable: count(status.unavailable_replicas),
    };
    let total = count(status.replicas);
    let current_image = container_image(deployment, container).flatten();

    let stalled = status.conditions.unwrap_or_default().into_iter().find(|c| {
        c.type_ == "Progressing" && c.reason.as_deref() == Some("ProgressDeadlineExceeded")
    });

    let observed = status.observed_generation.unwrap_or(0);
    let status = if let Some(condition) = stalled {
        DeploymentStatus::Failed {
            message: condition
                .message
                .unwrap_or_else(|| "progress deadline exceeded".to_string()),
        }
    } else if revision.is_some_and(|r| observed < r) {
        DeploymentStatus::Pending
    } else if replicas.updated >= desired && replicas.available >= desired && total <= desired {
        DeploymentStatus::Healthy
    } else {
        DeploymentStatus::InProgress {
            progress_percent: replicas.progress_percent(),
        }
    };

    DeploymentState {
        status,
        replicas,
        current_image,
        last_updated: Utc::now(),
    }
}

#[async_trait]
impl Deployer for KubernetesDeployer {
    fn name(&self) -> &'static str {
        "kubernetes"
    }

    async fn validate(&self, spec: &DeploymentSpec) -> Result<Vec<ValidationWarning>> {
        let deployment = self.get(&spec.service).await?;

        // A strategic merge on an unknown name would add a container.
        if container_image(&deployment, &spec.container).is_none() {
            return Err(Error::InvalidInput(format!(
                "deployment '{}' has no container named '{}'",
                spec.service, spec.container
            )));
        }

        let mut warnings = Vec::new();
        if deployment.spec.as_ref().and_then(|s| s.replicas) == Some(0) {
            warnings.push(ValidationWarning {
                field: "replicas".to_string(),
                message: format!("deployment '{}' is scaled to zero", spec.service),
            });
        }
        if spec.image.ends_with(":latest") {
            warnings.push(ValidationWarning {
                field: "image".to_string(),
                message: "deploying the shared 'latest' tag".to_string(),
            });
        }
        Ok(warnings)
    }

    async fn deploy(&self, spec: DeploymentSpec) -> Result<DeploymentHandle> {
        info!(
            deployment = %spec.service,
            namespace = %self.namespace,
            container = %spec.container,
            image = %spec.image,
            "Patching deployment image"
        );

        let patched = self
            .api()
            .patch(
                &spec.service,
                &PatchParams {
                    field_manager: Some(FIELD_MANAGER.to_string()),
                    ..Default::default()
                },
                &Patch::Strategic(image_patch(&spec)),
            )
            .await
            .map_err(|e| Error::DeploymentFailed(format!("patch failed: {}", e)))?;

        let revision = patched.metadata.generation;
        debug!(deployment = %spec.service, generation = ?revision, "Deployment patched");

        Ok(DeploymentHandle {
            id: spec.id,
            deployer_name: self.name().to_string(),
            service: spec.service,
            container: spec.container,
            revision,
        })
    }

    async fn state(&self, handle: &DeploymentHandle) -> Result<DeploymentState> {
        let deployment = self.get(&handle.service).await?;
        Ok(assess(&deployment, &handle.container, handle.revision))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wpstack_core::ResourceId;

    fn deployment(status: serde_json::Value) -> Deployment {
        serde_json::from_value(json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": { "name": "wordpress", "generation": 4 },
            "spec": {
                "replicas": 2,
                "selector": { "matchLabels": { "app": "wordpress" } },
                "template": {
                    "metadata": { "labels": { "app": "wordpress" } },
                    "spec": {
                        "containers": [
                            { "name": "web", "image": "registry.local/wordpress:abc1234" },
                            { "name": "sidecar", "image": "busybox" }
                        ]
                    }
                }
            },
            "status": status
        }))
        .unwrap()
    }

    #[test]
    fn test_image_patch_targets_one_container() {
        let spec = DeploymentSpec {
            id: ResourceId::new(),
            service: "wordpress".to_string(),
            container: "web".to_string(),
            image: "registry.local/wordpress:abc1234".to_string(),
        };
        let patch = image_patch(&spec);

        assert_eq!(
            patch["spec"]["template"]["spec"]["containers"],
            json!([{ "name": "web", "image": "registry.local/wordpress:abc1234" }])
        );
        assert!(
            patch["spec"]["template"]["metadata"]["annotations"][DEPLOYED_AT_ANNOTATION].is_string()
        );
    }

    #[test]
    fn test_healthy_when_all_replicas_updated() {
        let d = deployment(json!({
            "observedGeneration": 4,
            "replicas": 2,
            "updatedReplicas": 2,
            "readyReplicas": 2,
            "availableReplicas": 2
        }));
        let state = assess(&d, "web", Some(4));

        assert_eq!(state.status, DeploymentStatus::Healthy);
        assert_eq!(
            state.current_image.as_deref(),
            Some("registry.local/wordpress:abc1234")
        );
    }

    #[test]
    fn test_pending_until_generation_observed() {
        let d = deployment(json!({
            "observedGeneration": 3,
            "replicas": 2,
            "updatedReplicas": 2,
            "availableReplicas": 2
        }));
        assert_eq!(assess(&d, "web", Some(4)).status, DeploymentStatus::Pending);
    }

    #[test]
    fn test_in_progress_while_old_replicas_remain() {
        let d = deployment(json!({
            "observedGeneration": 4,
            "replicas": 3,
            "updatedReplicas": 1,
            "readyReplicas": 2,
            "availableReplicas": 2,
            "unavailableReplicas": 1
        }));
        let state = assess(&d, "web", Some(4));

        assert_eq!(
            state.status,
            DeploymentStatus::InProgress { progress_percent: 50 }
        );
        assert_eq!(state.replicas.unavailable, 1);
    }

    #[test]
    fn test_failed_on_progress_deadline() {
        let d = deployment(json!({
            "observedGeneration": 4,
            "replicas": 3,
            "updatedReplicas": 1,
            "conditions": [{
                "type": "Progressing",
                "status": "False",
                "reason": "ProgressDeadlineExceeded",
                "message": "ReplicaSet \"wordpress-6d4\" has timed out progressing."
            }]
        }));
        assert!(matches!(
            assess(&d, "web", Some(4)).status,
            DeploymentStatus::Failed { .. }
        ));
    }

    #[test]
    fn test_missing_container_has_no_image() {
        let d = deployment(json!({}));
        assert!(container_image(&d, "db").is_none());
        assert!(assess(&d, "db", None).current_image.is_none());
    }

    /// Requires a cluster with a `wordpress` deployment in `default`.
    #[tokio::test]
    #[ignore]
    async fn test_deploy_against_cluster() {
        let deployer = KubernetesDeployer::new("default").await.unwrap();
        let spec = DeploymentSpec {
            id: ResourceId::new(),
            service: "wordpress".to_string(),
            container: "web".to_string(),
            image: "wordpress:6".to_string(),
        };
        deployer.validate(&spec).await.unwrap();
        let handle = deployer.deploy(spec).await.unwrap();
        let state = deployer.state(&handle).await.unwrap();
        assert_eq!(state.current_image.as_deref(), Some("wordpress:6"));
    }
}
