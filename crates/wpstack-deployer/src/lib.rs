//! Deployment backends for wpstack.
//!
//! Provides deployer implementations:
//! - Kubernetes (patches the web container of a Deployment)

pub mod kubernetes;

pub use kubernetes::KubernetesDeployer;
pub use wpstack_core::deployer::{
    Deployer, DeploymentHandle, DeploymentSpec, DeploymentState, DeploymentStatus, ReplicaStatus,
    ValidationWarning,
};
