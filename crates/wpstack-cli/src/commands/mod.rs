//! CLI command implementations.

pub mod run;
pub mod synth;

use anyhow::{Context, Result};
use std::path::Path;
use tracing::warn;
use wpstack_config::pipeline::{parse_pipeline, validate_pipeline, wordpress_pipeline};
use wpstack_config::settings::load_settings;
use wpstack_config::{BuildSpec, ConfigError, DeploymentSettings, parse_buildspec};
use wpstack_core::image::derive_image_tag;
use wpstack_core::pipeline::PipelineDefinition;

/// Print a configuration error with its remediation and exit with status 1.
pub fn config_failure(err: ConfigError) -> ! {
    eprintln!("Configuration error: {}", err);
    if let Some(remediation) = err.remediation() {
        eprintln!("{}", remediation);
    }
    std::process::exit(1);
}

/// Settings of the pipeline unit. Exits on configuration errors.
pub fn deployment_settings(config: Option<&Path>) -> DeploymentSettings {
    match load_settings(config).and_then(|partial| partial.resolve()) {
        Ok(settings) => settings,
        Err(e) => config_failure(e),
    }
}

/// The pipeline from `path`, or the WordPress pipeline for `settings`.
pub fn load_pipeline(
    path: Option<&Path>,
    settings: &DeploymentSettings,
) -> Result<PipelineDefinition> {
    match path {
        Some(path) => {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read pipeline file: {}", path.display()))?;
            let pipeline = parse_pipeline(&content)
                .with_context(|| format!("Failed to parse pipeline: {}", path.display()))?;
            validate_pipeline(&pipeline)
                .with_context(|| format!("Invalid pipeline: {}", path.display()))?;
            Ok(pipeline)
        }
        None => Ok(wordpress_pipeline(settings)?),
    }
}

/// The build spec from `path`, or the WordPress build spec.
pub fn load_buildspec(path: Option<&Path>) -> Result<BuildSpec> {
    let spec = match path {
        Some(path) => {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read build spec: {}", path.display()))?;
            parse_buildspec(&content)
                .with_context(|| format!("Failed to parse build spec: {}", path.display()))?
        }
        None => BuildSpec::wordpress(),
    };
    spec.validate().context("Invalid build spec")?;
    Ok(spec)
}

pub fn validate(
    config: Option<&Path>,
    pipeline: Option<&Path>,
    buildspec: Option<&Path>,
) -> Result<()> {
    let settings = deployment_settings(config);
    let pipeline = load_pipeline(pipeline, &settings)?;
    load_buildspec(buildspec)?;

    println!("Configuration is valid");
    println!("  service:  https://{}", settings.service_domain());
    println!("  pipeline: {}", pipeline.name);
    for stage in &pipeline.stages {
        let actions: Vec<_> = stage.actions.iter().map(|a| a.name.as_str()).collect();
        println!("    {} -> {}", stage.name, actions.join(", "));
    }
    Ok(())
}

pub fn tag(revision: Option<&str>) {
    let tag = derive_image_tag(revision);
    if tag.is_fallback() {
        warn!(revision = ?revision, "No usable revision, falling back to '{}'", tag);
    }
    println!("{}", tag);
}
