//! Template synthesis commands.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tracing::info;
use wpstack_config::ConfigError;
use wpstack_config::settings::load_settings;
use wpstack_synth::{
    BaseStack, PipelineStack, StackDefinition, SynthError, synthesize, write_template,
};

use super::{config_failure, deployment_settings, load_buildspec, load_pipeline};

pub const DEFAULT_OUT_DIR: &str = "cdk.out";

/// Synthesize the base stack. Never needs a domain.
pub fn base(config: Option<&Path>, out: &Path) -> Result<()> {
    let settings = match load_settings(config).and_then(|partial| partial.resolve_base()) {
        Ok(settings) => settings,
        Err(e) => config_failure(e),
    };
    let stack = BaseStack::new(&settings).map_err(exit_on_config)?;
    emit(stack.definition(), out)?;
    Ok(())
}

/// Synthesize the pipeline stack. Fails before declaring anything when no
/// domain is configured.
pub fn pipeline(
    config: Option<&Path>,
    out: &Path,
    pipeline: Option<&Path>,
    buildspec: Option<&Path>,
) -> Result<()> {
    let settings = deployment_settings(config);
    let pipeline = load_pipeline(pipeline, &settings)?;
    let buildspec = load_buildspec(buildspec)?;

    let stack = PipelineStack::new(&settings, &pipeline, &buildspec).map_err(exit_on_config)?;
    emit(stack.definition(), out)?;
    println!("Service URL: https://{}", settings.service_domain());
    Ok(())
}

fn exit_on_config(err: SynthError) -> anyhow::Error {
    match err {
        SynthError::Config(e @ ConfigError::MissingDomain) => config_failure(e),
        other => anyhow::Error::new(other),
    }
}

fn emit(stack: &StackDefinition, out: &Path) -> Result<PathBuf> {
    let template =
        synthesize(stack).with_context(|| format!("Failed to synthesize {}", stack.name))?;
    let path = write_template(out, &stack.name, &template)
        .with_context(|| format!("Failed to write template to {}", out.display()))?;
    info!(
        stack = %stack.name,
        resources = template.resources.len(),
        "Synthesized stack"
    );
    println!("{}: {}", stack.name, path.display());
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use wpstack_config::BaseSettings;

    #[test]
    fn test_emit_base_template() {
        let dir = tempfile::tempdir().unwrap();
        let stack = BaseStack::new(&BaseSettings {
            source_repository: "Wordpress".to_string(),
            image_repository: "wordpress".to_string(),
        })
        .unwrap();

        let path = emit(stack.definition(), dir.path()).unwrap();

        assert_eq!(path, dir.path().join("WordpressBaseStack.template.json"));
        let json: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(json["Resources"]["ecrRepo"]["Type"], "AWS::ECR::Repository");
        assert!(json["Outputs"]["CodeCommitRepoUrl"].is_object());
    }
}
