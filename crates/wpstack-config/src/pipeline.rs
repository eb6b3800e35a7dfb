//! Pipeline definition parsing and validation.
//!
//! ```kdl
//! pipeline "WordpressPipeline"
//!
//! stage "Source" {
//!     action "CodeCommit" kind="source" output="SourceOutput" {
//!         repository "Wordpress"
//!         branch "master"
//!     }
//! }
//!
//! stage "Build" {
//!     action "DockerBuild" kind="build" input="SourceOutput" output="fargateBuildOutput" {
//!         project "Build"
//!     }
//! }
//!
//! stage "Deploy" {
//!     action "ECSDeploy" kind="deploy" input="fargateBuildOutput" {
//!         service "WordpressService"
//!     }
//! }
//! ```

use crate::node::{child_string, first_string_arg, string_prop};
use crate::settings::DeploymentSettings;
use crate::{ConfigError, ConfigResult};
use kdl::{KdlDocument, KdlNode};
use std::collections::{HashMap, HashSet};
use wpstack_core::pipeline::{
    Action, ActionConfig, ActionKind, ArtifactName, PipelineDefinition, Stage,
};

/// Artifact holding the checked-out sources.
pub const SOURCE_ARTIFACT: &str = "SourceOutput";
/// Artifact holding the image-definitions file.
pub const BUILD_ARTIFACT: &str = "fargateBuildOutput";
/// Build project run by the build action.
pub const BUILD_PROJECT: &str = "Build";
/// Service updated by the deploy action.
pub const SERVICE: &str = "WordpressService";

/// Parse a pipeline definition from KDL text and validate it.
pub fn parse_pipeline(kdl: &str) -> ConfigResult<PipelineDefinition> {
    let doc: KdlDocument = kdl.parse()?;

    let mut name = String::new();
    let mut stages = Vec::new();

    for node in doc.nodes() {
        match node.name().value() {
            "pipeline" => {
                name = first_string_arg(node)
                    .ok_or_else(|| ConfigError::MissingField("pipeline name".to_string()))?;
            }
            "stage" => {
                stages.push(parse_stage(node)?);
            }
            _ => {} // Ignore unknown nodes
        }
    }

    let pipeline = PipelineDefinition { name, stages };
    validate_pipeline(&pipeline)?;
    Ok(pipeline)
}

fn parse_stage(node: &KdlNode) -> ConfigResult<Stage> {
    let name = first_string_arg(node)
        .ok_or_else(|| ConfigError::MissingField("stage name".to_string()))?;

    let mut actions = Vec::new();
    if let Some(children) = node.children() {
        for child in children.nodes() {
            if child.name().value() == "action" {
                actions.push(parse_action(&name, child)?);
            }
        }
    }

    Ok(Stage { name, actions })
}

fn parse_action(stage: &str, node: &KdlNode) -> ConfigResult<Action> {
    let name = first_string_arg(node).ok_or_else(|| {
        ConfigError::MissingField(format!("action name in stage '{}'", stage))
    })?;

    let kind: ActionKind = string_prop(node, "kind")
        .ok_or_else(|| ConfigError::MissingField(format!("kind of action '{}'", name)))?
        .parse()
        .map_err(|message| ConfigError::invalid(format!("action '{}' kind", name), message))?;

    let required = |field: &str| {
        child_string(node, field)
            .ok_or_else(|| ConfigError::MissingField(format!("{} for action '{}'", field, name)))
    };

    let config = match kind {
        ActionKind::Source => ActionConfig::Source {
            repository: required("repository")?,
            branch: child_string(node, "branch")
                .unwrap_or_else(|| crate::settings::DEFAULT_BRANCH.to_string()),
        },
        ActionKind::Build => ActionConfig::Build {
            project: required("project")?,
        },
        ActionKind::Deploy => ActionConfig::Deploy {
            service: required("service")?,
        },
    };

    Ok(Action {
        input: string_prop(node, "input").map(ArtifactName::from),
        output: string_prop(node, "output").map(ArtifactName::from),
        name,
        config,
    })
}

/// Check the stage/artifact graph of a pipeline.
///
/// Stage and action names are unique, every stage has at least one action,
/// every artifact has exactly one producer, and every consumed artifact is
/// produced in a stage strictly before the consuming stage. Builds consume
/// what a source action produces and deploys consume what a build produces.
pub fn validate_pipeline(pipeline: &PipelineDefinition) -> ConfigResult<()> {
    if pipeline.name.is_empty() {
        return Err(ConfigError::MissingField("pipeline name".to_string()));
    }
    if pipeline.stages.is_empty() {
        return Err(ConfigError::MissingField(format!(
            "stages of pipeline '{}'",
            pipeline.name
        )));
    }

    let mut stage_names = HashSet::new();
    for stage in &pipeline.stages {
        if !stage_names.insert(stage.name.as_str()) {
            return Err(ConfigError::Duplicate(format!("stage '{}'", stage.name)));
        }
        if stage.actions.is_empty() {
            return Err(ConfigError::MissingField(format!(
                "actions of stage '{}'",
                stage.name
            )));
        }
    }

    let mut action_names = HashSet::new();
    let mut producers: HashMap<&ArtifactName, (usize, &Action)> = HashMap::new();
    for (stage_idx, action) in pipeline.actions() {
        if !action_names.insert(action.name.as_str()) {
            return Err(ConfigError::Duplicate(format!("action '{}'", action.name)));
        }
        check_kind_contract(action)?;
        if let Some(output) = &action.output {
            if let Some((_, other)) = producers.insert(output, (stage_idx, action)) {
                return Err(ConfigError::Duplicate(format!(
                    "artifact '{}' produced by both '{}' and '{}'",
                    output, other.name, action.name
                )));
            }
        }
    }

    for (stage_idx, action) in pipeline.actions() {
        let Some(input) = &action.input else {
            continue;
        };
        match producers.get(input) {
            None => {
                return Err(ConfigError::InvalidReference(format!(
                    "action '{}' consumes artifact '{}' which no action produces",
                    action.name, input
                )));
            }
            Some((producer_stage, producer)) if *producer_stage >= stage_idx => {
                return Err(ConfigError::InvalidReference(format!(
                    "action '{}' in stage '{}' consumes artifact '{}' before '{}' produces it in stage '{}'",
                    action.name,
                    pipeline.stages[stage_idx].name,
                    input,
                    producer.name,
                    pipeline.stages[*producer_stage].name
                )));
            }
            Some((_, producer)) => check_input_kind(action, input, producer)?,
        }
    }

    Ok(())
}

fn check_kind_contract(action: &Action) -> ConfigResult<()> {
    let field = || format!("action '{}'", action.name);
    match action.kind() {
        ActionKind::Source if action.input.is_some() => Err(ConfigError::invalid(
            field(),
            "source actions take no input artifact",
        )),
        ActionKind::Source if action.output.is_none() => Err(ConfigError::invalid(
            field(),
            "source actions must declare an output artifact",
        )),
        ActionKind::Build if action.input.is_none() => Err(ConfigError::invalid(
            field(),
            "build actions need the source artifact as input",
        )),
        ActionKind::Build if action.output.is_none() => Err(ConfigError::invalid(
            field(),
            "build actions must declare the image-definitions artifact as output",
        )),
        ActionKind::Deploy if action.input.is_none() => Err(ConfigError::invalid(
            field(),
            "deploy actions need the image-definitions artifact as input",
        )),
        ActionKind::Deploy if action.output.is_some() => Err(ConfigError::invalid(
            field(),
            "deploy actions produce no artifact",
        )),
        _ => Ok(()),
    }
}

fn check_input_kind(action: &Action, input: &ArtifactName, producer: &Action) -> ConfigResult<()> {
    let expected = match action.kind() {
        ActionKind::Build => ActionKind::Source,
        ActionKind::Deploy => ActionKind::Build,
        ActionKind::Source => return Ok(()),
    };
    if producer.kind() == expected {
        return Ok(());
    }
    Err(ConfigError::invalid(
        format!("action '{}'", action.name),
        format!(
            "{} actions consume {} output, but '{}' comes from {} action '{}'",
            action.kind(),
            expected,
            input,
            producer.kind(),
            producer.name
        ),
    ))
}

/// The Source → Build → Deploy pipeline for a WordPress deployment.
pub fn wordpress_pipeline(settings: &DeploymentSettings) -> ConfigResult<PipelineDefinition> {
    let pipeline = PipelineDefinition {
        name: format!("{}Pipeline", settings.app_name),
        stages: vec![
            Stage {
                name: "Source".to_string(),
                actions: vec![Action {
                    name: "CodeCommit".to_string(),
                    input: None,
                    output: Some(SOURCE_ARTIFACT.into()),
                    config: ActionConfig::Source {
                        repository: settings.source_repository.clone(),
                        branch: settings.branch.clone(),
                    },
                }],
            },
            Stage {
                name: "Build".to_string(),
                actions: vec![Action {
                    name: "DockerBuild".to_string(),
                    input: Some(SOURCE_ARTIFACT.into()),
                    output: Some(BUILD_ARTIFACT.into()),
                    config: ActionConfig::Build {
                        project: BUILD_PROJECT.to_string(),
                    },
                }],
            },
            Stage {
                name: "Deploy".to_string(),
                actions: vec![Action {
                    name: "ECSDeploy".to_string(),
                    input: Some(BUILD_ARTIFACT.into()),
                    output: None,
                    config: ActionConfig::Deploy {
                        service: SERVICE.to_string(),
                    },
                }],
            },
        ],
    };
    validate_pipeline(&pipeline)?;
    Ok(pipeline)
}
