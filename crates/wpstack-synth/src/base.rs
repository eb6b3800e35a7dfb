//! Long-lived repositories shared by every pipeline deployment.

use tracing::debug;
use wpstack_config::BaseSettings;
use wpstack_core::resource::{Expr, LogicalId, ResourceSpec, StackDefinition};

use crate::SynthResult;

pub const BASE_STACK_NAME: &str = "WordpressBaseStack";

pub const SOURCE_REPOSITORY_ID: &str = "CodeCommitRepo";
pub const IMAGE_REPOSITORY_ID: &str = "ecrRepo";

pub const OUTPUT_SOURCE_ARN: &str = "CodeCommitRepoArn";
pub const OUTPUT_SOURCE_URL: &str = "CodeCommitRepoUrl";
pub const OUTPUT_IMAGE_URL: &str = "ecrRepoUrl";

/// The source repository and the image repository.
#[derive(Debug, Clone)]
pub struct BaseStack {
    definition: StackDefinition,
}

impl BaseStack {
    pub fn new(settings: &BaseSettings) -> SynthResult<Self> {
        let mut stack = StackDefinition::new(BASE_STACK_NAME);
        stack.description = Some("Source and image repositories for WordPress".to_string());

        let repo = stack.add(
            SOURCE_REPOSITORY_ID,
            ResourceSpec::SourceRepository {
                repository_name: settings.source_repository.clone(),
            },
        )?;
        let ecr = stack.add(
            IMAGE_REPOSITORY_ID,
            ResourceSpec::ImageRepository {
                repository_name: settings.image_repository.clone(),
            },
        )?;

        stack.add_output(OUTPUT_SOURCE_ARN, Expr::attr(&repo, "Arn"))?;
        stack.add_output(OUTPUT_SOURCE_URL, Expr::attr(&repo, "CloneUrlSsh"))?;
        stack.add_output(OUTPUT_IMAGE_URL, Expr::attr(&ecr, "RepositoryUri"))?;

        debug!(
            source = %settings.source_repository,
            image = %settings.image_repository,
            "Assembled base stack"
        );

        Ok(Self { definition: stack })
    }

    pub fn source_repository(&self) -> LogicalId {
        LogicalId::from(SOURCE_REPOSITORY_ID)
    }

    pub fn image_repository(&self) -> LogicalId {
        LogicalId::from(IMAGE_REPOSITORY_ID)
    }

    pub fn definition(&self) -> &StackDefinition {
        &self.definition
    }

    pub fn into_definition(self) -> StackDefinition {
        self.definition
    }
}
