//! Source provider abstraction.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::Result;

/// What a source action asks a provider for.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceRequest {
    /// Repository name (resolved to a clone URL by the provider).
    pub repository: String,
    /// Branch to follow when no revision is given.
    pub branch: String,
    /// Exact revision from the trigger, if any.
    pub revision: Option<String>,
}

/// Checked-out sources for one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceBundle {
    pub repository: String,
    /// Resolved revision identifier; `None` when it could not be resolved.
    pub revision: Option<String>,
    pub branch: Option<String>,
    /// Directory holding the checked-out files.
    pub workspace: PathBuf,
}

/// Trait for source providers.
#[async_trait]
pub trait SourceProvider: Send + Sync {
    /// Name of this provider.
    fn name(&self) -> &'static str;

    /// Materialize the requested revision into a workspace directory.
    async fn fetch(&self, request: &SourceRequest) -> Result<SourceBundle>;
}
