//! Configuration for wpstack.
//!
//! This crate handles:
//! - Deployment settings (KDL file plus environment overrides)
//! - Pipeline definitions and their artifact-graph validation
//! - The build specification run by the build action
//! - Variable interpolation for build commands

pub mod buildspec;
pub mod error;
mod node;
pub mod pipeline;
pub mod settings;
pub mod variables;

pub use buildspec::{BuildSpec, parse_buildspec};
pub use error::{ConfigError, ConfigResult};
pub use settings::{BaseSettings, DeploymentSettings, PartialSettings};
pub use variables::{
    AccountContext, ImageContext, PipelineContext, RunContext, SourceContext, StageContext,
    VariableContext, VariableContextBuilder,
};
