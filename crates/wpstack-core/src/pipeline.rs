//! Pipeline, stage, action and artifact definitions.

use chrono::{DateTime, Utc};
use derive_more::{Display, From};
use serde::{Deserialize, Serialize};

use crate::ResourceId;

/// Name of an artifact passed between actions.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display, From)]
#[display("{_0}")]
#[serde(transparent)]
pub struct ArtifactName(String);

impl ArtifactName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ArtifactName {
    fn from(name: &str) -> Self {
        Self(name.to_string())
    }
}

/// A continuous-delivery pipeline definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineDefinition {
    /// Pipeline name (e.g., "WordpressPipeline").
    pub name: String,
    /// Stages in execution order.
    pub stages: Vec<Stage>,
}

impl PipelineDefinition {
    pub fn stage(&self, name: &str) -> Option<&Stage> {
        self.stages.iter().find(|s| s.name == name)
    }

    /// Position of a stage in execution order.
    pub fn position(&self, name: &str) -> Option<usize> {
        self.stages.iter().position(|s| s.name == name)
    }

    /// All actions with the index of the stage that declares them.
    pub fn actions(&self) -> impl Iterator<Item = (usize, &Action)> {
        self.stages
            .iter()
            .enumerate()
            .flat_map(|(idx, stage)| stage.actions.iter().map(move |a| (idx, a)))
    }

    /// The action producing an artifact, with its stage index.
    pub fn producer_of(&self, artifact: &ArtifactName) -> Option<(usize, &Action)> {
        self.actions()
            .find(|(_, action)| action.output.as_ref() == Some(artifact))
    }
}

/// A stage: a named, ordered phase of the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stage {
    /// Stage name, unique within the pipeline.
    pub name: String,
    /// Actions run when the stage starts.
    pub actions: Vec<Action>,
}

/// A unit of work within a stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Action {
    /// Action name, unique within the pipeline.
    pub name: String,
    /// Artifact consumed by this action.
    pub input: Option<ArtifactName>,
    /// Artifact produced by this action.
    pub output: Option<ArtifactName>,
    /// Kind-specific configuration.
    pub config: ActionConfig,
}

impl Action {
    pub fn kind(&self) -> ActionKind {
        match self.config {
            ActionConfig::Source { .. } => ActionKind::Source,
            ActionConfig::Build { .. } => ActionKind::Build,
            ActionConfig::Deploy { .. } => ActionKind::Deploy,
        }
    }
}

/// What an action does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionKind {
    Source,
    Build,
    Deploy,
}

impl std::fmt::Display for ActionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ActionKind::Source => write!(f, "source"),
            ActionKind::Build => write!(f, "build"),
            ActionKind::Deploy => write!(f, "deploy"),
        }
    }
}

impl std::str::FromStr for ActionKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "source" => Ok(ActionKind::Source),
            "build" => Ok(ActionKind::Build),
            "deploy" => Ok(ActionKind::Deploy),
            other => Err(format!("unknown action kind: {}", other)),
        }
    }
}

/// Kind-specific action configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActionConfig {
    /// Fetch a revision of a source repository.
    Source { repository: String, branch: String },
    /// Run a build project against the input sources.
    Build { project: String },
    /// Roll the image definitions out to a service.
    Deploy { service: String },
}

/// A source-control change that starts a run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trigger {
    /// Revision identifier of the change, if known.
    pub revision: Option<String>,
    /// Branch the change was pushed to.
    pub branch: Option<String>,
    /// Who or what caused the change.
    pub actor: Option<String>,
}

impl Trigger {
    pub fn revision(revision: impl Into<String>) -> Self {
        Self {
            revision: Some(revision.into()),
            ..Default::default()
        }
    }
}

/// A pipeline run instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineRun {
    pub id: ResourceId,
    pub pipeline: String,
    /// Run number (incrementing per orchestrator).
    pub number: u64,
    pub trigger: Trigger,
    pub status: PipelineStatus,
    pub stages: Vec<StageResult>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl PipelineRun {
    pub fn new(number: u64, definition: &PipelineDefinition, trigger: Trigger) -> Self {
        Self {
            id: ResourceId::new(),
            pipeline: definition.name.clone(),
            number,
            trigger,
            status: PipelineStatus::Queued,
            stages: definition
                .stages
                .iter()
                .map(|s| StageResult::pending(&s.name))
                .collect(),
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    pub fn stage(&self, name: &str) -> Option<&StageResult> {
        self.stages.iter().find(|s| s.name == name)
    }

    pub fn stage_mut(&mut self, name: &str) -> Option<&mut StageResult> {
        self.stages.iter_mut().find(|s| s.name == name)
    }
}

/// Overall pipeline status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PipelineStatus {
    Queued,
    Running,
    Succeeded,
    /// Halted at the named stage.
    Failed { stage: String },
}

impl PipelineStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, PipelineStatus::Succeeded | PipelineStatus::Failed { .. })
    }
}

/// Result of a stage execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageResult {
    pub name: String,
    pub status: StageStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl StageResult {
    pub fn pending(name: &str) -> Self {
        Self {
            name: name.to_string(),
            status: StageStatus::Pending,
            started_at: None,
            finished_at: None,
        }
    }
}

/// Status of a stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StageStatus {
    Pending,
    Running,
    Succeeded,
    Failed { message: String },
    /// Not run because an earlier stage failed.
    Skipped { reason: String },
}

impl StageStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StageStatus::Succeeded | StageStatus::Failed { .. } | StageStatus::Skipped { .. }
        )
    }

    pub fn is_success(&self) -> bool {
        matches!(self, StageStatus::Succeeded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn definition() -> PipelineDefinition {
        PipelineDefinition {
            name: "demo".to_string(),
            stages: vec![
                Stage {
                    name: "Source".to_string(),
                    actions: vec![Action {
                        name: "Checkout".to_string(),
                        input: None,
                        output: Some("src".into()),
                        config: ActionConfig::Source {
                            repository: "Wordpress".to_string(),
                            branch: "master".to_string(),
                        },
                    }],
                },
                Stage {
                    name: "Build".to_string(),
                    actions: vec![Action {
                        name: "DockerBuild".to_string(),
                        input: Some("src".into()),
                        output: Some("image".into()),
                        config: ActionConfig::Build {
                            project: "Build".to_string(),
                        },
                    }],
                },
            ],
        }
    }

    #[test]
    fn test_producer_lookup() {
        let def = definition();
        let (idx, action) = def.producer_of(&"image".into()).unwrap();
        assert_eq!(idx, 1);
        assert_eq!(action.name, "DockerBuild");
        assert!(def.producer_of(&"missing".into()).is_none());
    }

    #[test]
    fn test_action_kind_from_config() {
        let def = definition();
        let kinds: Vec<_> = def.actions().map(|(_, a)| a.kind()).collect();
        assert_eq!(kinds, vec![ActionKind::Source, ActionKind::Build]);
    }

    #[test]
    fn test_action_kind_parse() {
        assert_eq!("deploy".parse::<ActionKind>().unwrap(), ActionKind::Deploy);
        assert!("approve".parse::<ActionKind>().is_err());
    }

    #[test]
    fn test_new_run_has_pending_stages() {
        let run = PipelineRun::new(1, &definition(), Trigger::revision("abc"));
        assert_eq!(run.status, PipelineStatus::Queued);
        assert_eq!(run.stages.len(), 2);
        assert!(run.stages.iter().all(|s| s.status == StageStatus::Pending));
        assert!(!run.status.is_terminal());
    }
}
