//! Deployer trait and deployment types.
//!
//! Deployers roll a published image out to a running service.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{ResourceId, Result};

/// Specification for a deployment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentSpec {
    pub id: ResourceId,
    /// Service being updated.
    pub service: String,
    /// Container within the service that receives the new image.
    pub container: String,
    /// Fully qualified image reference to deploy.
    pub image: String,
}

/// Handle to an in-flight deployment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentHandle {
    pub id: ResourceId,
    pub deployer_name: String,
    pub service: String,
    pub container: String,
    /// Backend revision the rollout has to reach (e.g., object generation).
    pub revision: Option<i64>,
}

/// Current state of a deployment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentState {
    pub status: DeploymentStatus,
    pub replicas: ReplicaStatus,
    pub current_image: Option<String>,
    pub last_updated: DateTime<Utc>,
}

/// Status of a deployment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeploymentStatus {
    Pending,
    InProgress { progress_percent: u8 },
    /// Every replica runs the new image and passes health checks.
    Healthy,
    Failed { message: String },
}

impl DeploymentStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, DeploymentStatus::Healthy | DeploymentStatus::Failed { .. })
    }
}

/// Replica status information.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaStatus {
    pub desired: u32,
    pub updated: u32,
    pub ready: u32,
    pub available: u32,
    pub unavailable: u32,
}

impl ReplicaStatus {
    pub fn progress_percent(&self) -> u8 {
        if self.desired == 0 {
            return 100;
        }
        let ready = self.updated.min(self.available).min(self.desired);
        ((ready * 100) / self.desired) as u8
    }
}

/// Warning from deployment validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationWarning {
    pub field: String,
    pub message: String,
}

/// Trait for deployers.
#[async_trait]
pub trait Deployer: Send + Sync {
    /// Name of this deployer.
    fn name(&self) -> &'static str;

    /// Validate a deployment spec before deploying.
    async fn validate(&self, spec: &DeploymentSpec) -> Result<Vec<ValidationWarning>>;

    /// Start rolling the image out.
    async fn deploy(&self, spec: DeploymentSpec) -> Result<DeploymentHandle>;

    /// Get current deployment state.
    async fn state(&self, handle: &DeploymentHandle) -> Result<DeploymentState>;
}
