//! Git source provider: clones or fetches the application repository and
//! checks out the requested revision.

use async_trait::async_trait;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use tokio::process::Command;
use tracing::{debug, info, warn};
use wpstack_core::source::{SourceBundle, SourceProvider, SourceRequest};
use wpstack_core::{Error, Result};

/// Placeholder replaced by the repository name in a remote template.
pub const REPOSITORY_PLACEHOLDER: &str = "{repository}";

pub struct GitSource {
    /// Base directory for checkouts.
    work_dir: PathBuf,
    /// Clone URL with a `{repository}` placeholder.
    remote_template: String,
}

impl GitSource {
    pub fn new(work_dir: impl Into<PathBuf>, remote_template: impl Into<String>) -> Self {
        Self {
            work_dir: work_dir.into(),
            remote_template: remote_template.into(),
        }
    }

    /// Remote of a CodeCommit repository in `region`.
    pub fn codecommit(work_dir: impl Into<PathBuf>, region: &str) -> Self {
        Self::new(
            work_dir,
            format!(
                "https://git-codecommit.{}.amazonaws.com/v1/repos/{}",
                region, REPOSITORY_PLACEHOLDER
            ),
        )
    }

    pub fn clone_url(&self, repository: &str) -> String {
        self.remote_template
            .replace(REPOSITORY_PLACEHOLDER, repository)
    }

    /// Local checkout directory for a clone URL.
    pub fn checkout_path(&self, clone_url: &str) -> PathBuf {
        let repo_hash = format!("{:x}", md5::compute(clone_url));
        self.work_dir.join(repo_hash)
    }

    async fn git<I, S>(&self, dir: Option<&Path>, args: I) -> Result<Output>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut command = Command::new("git");
        command
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = dir {
            command.current_dir(dir);
        }
        Ok(command.output().await?)
    }

    async fn git_ok<I, S>(&self, dir: Option<&Path>, args: I, what: &str) -> Result<Output>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let output = self.git(dir, args).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!(step = what, "Git command failed");
            return Err(Error::SourceFailed(format!(
                "{} failed: {}",
                what,
                stderr.trim()
            )));
        }
        Ok(output)
    }

    /// Clone the repository, or fetch into an existing checkout.
    async fn sync(&self, clone_url: &str, path: &Path) -> Result<()> {
        if path.join(".git").exists() {
            info!(path = %path.display(), "Fetching latest changes");
            let fetched = self
                .git(Some(path), ["fetch", "--prune", "--tags", "origin"])
                .await?;
            if fetched.status.success() {
                return Ok(());
            }
            warn!("Git fetch failed, re-cloning");
            tokio::fs::remove_dir_all(path).await?;
        } else if path.exists() {
            tokio::fs::remove_dir_all(path).await?;
        }

        tokio::fs::create_dir_all(&self.work_dir).await?;
        info!(clone_url = %clone_url, path = %path.display(), "Cloning repository");
        self.git_ok(
            None,
            [
                OsStr::new("clone"),
                OsStr::new("--no-checkout"),
                OsStr::new(clone_url),
                path.as_os_str(),
            ],
            "clone",
        )
        .await?;
        Ok(())
    }

    /// Commit id of HEAD, or `None` when it cannot be resolved.
    async fn head_revision(&self, path: &Path) -> Option<String> {
        match self.git(Some(path), ["rev-parse", "HEAD"]).await {
            Ok(output) if output.status.success() => {
                let revision = String::from_utf8_lossy(&output.stdout).trim().to_string();
                if revision.is_empty() { None } else { Some(revision) }
            }
            Ok(output) => {
                debug!(
                    stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                    "rev-parse failed"
                );
                None
            }
            Err(e) => {
                debug!(error = %e, "rev-parse could not run");
                None
            }
        }
    }
}

/// The pinned revision, or the branch head when none is given. A blank
/// revision counts as none.
fn checkout_target(request: &SourceRequest) -> String {
    match request.revision.as_deref().map(str::trim) {
        Some(revision) if !revision.is_empty() => revision.to_string(),
        _ => format!("origin/{}", request.branch),
    }
}

#[async_trait]
impl SourceProvider for GitSource {
    fn name(&self) -> &'static str {
        "git"
    }

    async fn fetch(&self, request: &SourceRequest) -> Result<SourceBundle> {
        let clone_url = self.clone_url(&request.repository);
        let path = self.checkout_path(&clone_url);

        self.sync(&clone_url, &path).await?;

        let target = checkout_target(request);
        info!(
            repository = %request.repository,
            target = %target,
            "Checking out source"
        );
        self.git_ok(
            Some(&path),
            ["checkout", "--force", "--detach", target.as_str()],
            "checkout",
        )
        .await?;

        let revision = self.head_revision(&path).await;
        if revision.is_none() {
            warn!(repository = %request.repository, "Could not resolve source revision");
        }

        Ok(SourceBundle {
            repository: request.repository.clone(),
            revision,
            branch: Some(request.branch.clone()),
            workspace: path,
        })
    }
}
