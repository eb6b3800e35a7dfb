//! Variable interpolation for build commands.
//!
//! Supports variables like:
//! - `${source.revision}` - Resolved source revision
//! - `${source.short_revision}` - First 7 characters of the revision
//! - `${source.branch}` - Branch the revision was fetched from
//! - `${image.tag}` - Image tag derived for this build
//! - `${image.repository_name}` - Image repository name
//! - `${image.repository_uri}` - Image repository address
//! - `${account.id}` - Account the image repository lives in
//! - `${account.region}` - Region of the image repository
//! - `${pipeline.name}` - Pipeline name
//! - `${run.id}` - Run ID
//! - `${run.number}` - Run number
//! - `${stage.name}` - Current stage name
//! - `${env.VAR_NAME}` - Environment variable
//! - `${timestamp}` - Unix timestamp
//! - `${date}` - ISO date (YYYY-MM-DD)
//! - `${datetime}` - ISO datetime

use regex::Regex;
use std::collections::HashMap;
use std::sync::LazyLock;
use wpstack_core::image::{ImageTag, SHORT_TAG_LEN};

/// Variable context containing all available variables for interpolation.
#[derive(Debug, Clone, Default)]
pub struct VariableContext {
    pub source: SourceContext,
    pub image: ImageContext,
    pub account: AccountContext,
    pub pipeline: PipelineContext,
    pub run: RunContext,
    pub stage: StageContext,
    pub env: HashMap<String, String>,
    /// Custom variables defined by the caller
    pub custom: HashMap<String, String>,
}

#[derive(Debug, Clone, Default)]
pub struct SourceContext {
    pub revision: String,
    pub short_revision: String,
    pub branch: String,
}

#[derive(Debug, Clone, Default)]
pub struct ImageContext {
    pub tag: String,
    pub repository_name: String,
    pub repository_uri: String,
}

#[derive(Debug, Clone, Default)]
pub struct AccountContext {
    pub id: String,
    pub region: String,
}

#[derive(Debug, Clone, Default)]
pub struct PipelineContext {
    pub name: String,
}

#[derive(Debug, Clone, Default)]
pub struct RunContext {
    pub id: String,
    pub number: u64,
}

#[derive(Debug, Clone, Default)]
pub struct StageContext {
    pub name: String,
    pub index: usize,
}

// Regex for matching ${...} variables
static VAR_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([a-zA-Z_][a-zA-Z0-9_]*(?:\.[a-zA-Z_][a-zA-Z0-9_]*)?)\}").unwrap()
});

impl VariableContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Context for commands run by the hosted build service, where values
    /// are only known at build time and come from its shell environment.
    pub fn hosted_build() -> Self {
        let mut ctx = Self::new();
        ctx.source.revision = "$CODEBUILD_RESOLVED_SOURCE_VERSION".to_string();
        ctx.source.short_revision = "$COMMIT_HASH".to_string();
        ctx.image.tag = "$IMAGE_TAG".to_string();
        ctx.image.repository_name = "$ECR_REPOSITORY_NAME".to_string();
        ctx.image.repository_uri = "$ECR_REPOSITORY_URI".to_string();
        ctx.account.id = "$ACCOUNT_ID".to_string();
        ctx.account.region = "$AWS_DEFAULT_REGION".to_string();
        ctx
    }

    /// Add a custom variable.
    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        self.custom.insert(name.to_string(), value.into());
    }

    /// Resolve a variable name to its value.
    pub fn resolve(&self, var_name: &str) -> Option<String> {
        let parts: Vec<&str> = var_name.split('.').collect();

        match parts.as_slice() {
            ["source", "revision"] => Some(self.source.revision.clone()),
            ["source", "short_revision"] => Some(self.source.short_revision.clone()),
            ["source", "branch"] => Some(self.source.branch.clone()),

            ["image", "tag"] => Some(self.image.tag.clone()),
            ["image", "repository_name"] => Some(self.image.repository_name.clone()),
            ["image", "repository_uri"] => Some(self.image.repository_uri.clone()),

            ["account", "id"] => Some(self.account.id.clone()),
            ["account", "region"] => Some(self.account.region.clone()),

            ["pipeline", "name"] => Some(self.pipeline.name.clone()),

            ["run", "id"] => Some(self.run.id.clone()),
            ["run", "number"] => Some(self.run.number.to_string()),

            ["stage", "name"] => Some(self.stage.name.clone()),
            ["stage", "index"] => Some(self.stage.index.to_string()),

            ["env", name] => self.env.get(*name).cloned(),

            ["timestamp"] => Some(chrono::Utc::now().timestamp().to_string()),
            ["date"] => Some(chrono::Utc::now().format("%Y-%m-%d").to_string()),
            ["datetime"] => Some(chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string()),

            // Single-part names check custom variables
            [name] => self.custom.get(*name).cloned(),

            _ => None,
        }
    }

    /// Interpolate all variables in a string. Unknown variables are kept
    /// verbatim.
    pub fn interpolate(&self, input: &str) -> String {
        VAR_REGEX
            .replace_all(input, |caps: &regex::Captures| {
                let var_name = &caps[1];
                self.resolve(var_name)
                    .unwrap_or_else(|| format!("${{{}}}", var_name))
            })
            .to_string()
    }

    pub fn interpolate_vec(&self, inputs: &[String]) -> Vec<String> {
        inputs.iter().map(|s| self.interpolate(s)).collect()
    }

    pub fn interpolate_map(&self, map: &HashMap<String, String>) -> HashMap<String, String> {
        map.iter()
            .map(|(k, v)| (k.clone(), self.interpolate(v)))
            .collect()
    }

    /// Variable names referenced by a string that this context cannot resolve.
    pub fn unresolved(&self, input: &str) -> Vec<String> {
        VAR_REGEX
            .captures_iter(input)
            .map(|caps| caps[1].to_string())
            .filter(|name| self.resolve(name).is_none())
            .collect()
    }
}

/// Builder for creating VariableContext.
pub struct VariableContextBuilder {
    ctx: VariableContext,
}

impl VariableContextBuilder {
    pub fn new() -> Self {
        Self {
            ctx: VariableContext::new(),
        }
    }

    /// Record the resolved revision. Absent revisions leave the source
    /// variables empty.
    pub fn with_revision(mut self, revision: Option<&str>) -> Self {
        let revision = revision.unwrap_or_default().trim().to_string();
        self.ctx.source.short_revision = revision.chars().take(SHORT_TAG_LEN).collect();
        self.ctx.source.revision = revision;
        self
    }

    pub fn with_branch(mut self, branch: impl Into<String>) -> Self {
        self.ctx.source.branch = branch.into();
        self
    }

    pub fn with_image(
        mut self,
        tag: &ImageTag,
        repository_name: impl Into<String>,
        repository_uri: impl Into<String>,
    ) -> Self {
        self.ctx.image.tag = tag.to_string();
        self.ctx.image.repository_name = repository_name.into();
        self.ctx.image.repository_uri = repository_uri.into();
        self
    }

    pub fn with_account(mut self, id: impl Into<String>, region: impl Into<String>) -> Self {
        self.ctx.account.id = id.into();
        self.ctx.account.region = region.into();
        self
    }

    pub fn with_pipeline(mut self, name: impl Into<String>) -> Self {
        self.ctx.pipeline.name = name.into();
        self
    }

    pub fn with_run(mut self, id: impl Into<String>, number: u64) -> Self {
        self.ctx.run.id = id.into();
        self.ctx.run.number = number;
        self
    }

    pub fn with_stage(mut self, name: impl Into<String>, index: usize) -> Self {
        self.ctx.stage.name = name.into();
        self.ctx.stage.index = index;
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.ctx.env.insert(key.into(), value.into());
        self
    }

    pub fn with_custom(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.ctx.custom.insert(key.into(), value.into());
        self
    }

    pub fn build(self) -> VariableContext {
        self.ctx
    }
}

impl Default for VariableContextBuilder {
    fn default() -> Self {
        Self::new()
    }
}
