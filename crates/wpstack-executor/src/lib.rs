//! Execution backends for wpstack.
//!
//! Provides:
//! - Local Docker executor for build jobs
//! - Git source provider
//! - Filesystem artifact store

pub mod artifacts;
pub mod docker;
pub mod git;

pub use artifacts::FsArtifactStore;
pub use docker::LocalDockerExecutor;
pub use git::GitSource;
pub use wpstack_core::executor::{
    Executor, JobHandle, JobResult, JobSpec, JobStatus, LogLine, LogStream, VolumeMount,
};
