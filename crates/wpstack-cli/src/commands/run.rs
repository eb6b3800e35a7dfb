//! Local pipeline execution command.

use anyhow::{Context, Result};
use clap::Args;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use wpstack_config::DeploymentSettings;
use wpstack_core::executor::LogStream;
use wpstack_core::pipeline::{PipelineStatus, StageStatus, Trigger};
use wpstack_deployer::KubernetesDeployer;
use wpstack_executor::{FsArtifactStore, GitSource, LocalDockerExecutor};
use wpstack_scheduler::orchestrator::DEFAULT_BUILD_IMAGE;
use wpstack_scheduler::{
    Backends, BuildEnvironment, OrchestratorOptions, PipelineEvent, PipelineOrchestrator,
};

#[derive(Args)]
pub struct RunArgs {
    /// Source revision to build; defaults to the head of the branch
    #[arg(long)]
    revision: Option<String>,
    /// Branch to follow when no revision is given
    #[arg(long)]
    branch: Option<String>,
    /// Who triggered the run
    #[arg(long, env = "USER")]
    actor: Option<String>,
    /// Clone URL template containing `{repository}`; defaults to CodeCommit
    #[arg(long, env = "WPSTACK_GIT_REMOTE")]
    remote: Option<String>,
    /// Image repository URI; defaults to the ECR URI for the account and region
    #[arg(long, env = "WPSTACK_REPOSITORY_URI")]
    repository_uri: Option<String>,
    /// Kubernetes namespace of the service
    #[arg(long, default_value = "default")]
    namespace: String,
    /// Kubernetes deployment to roll out; defaults to the pipeline's service name
    #[arg(long)]
    deployment: Option<String>,
    /// Build environment image
    #[arg(long, default_value = DEFAULT_BUILD_IMAGE)]
    build_image: String,
    /// State directory for checkouts and artifacts
    #[arg(long, default_value = ".wpstack")]
    state_dir: PathBuf,
    /// Pipeline definition (KDL); defaults to the WordPress pipeline
    #[arg(long)]
    pipeline: Option<PathBuf>,
    /// Build spec (KDL); defaults to the WordPress build spec
    #[arg(long)]
    buildspec: Option<PathBuf>,
    /// Seconds to wait for the rollout to become healthy
    #[arg(long, default_value = "600")]
    deploy_timeout: u64,
}

/// `<account>.dkr.ecr.<region>.amazonaws.com/<repository>`, when both the
/// account and region are known.
pub fn ecr_repository_uri(settings: &DeploymentSettings) -> Option<String> {
    match (&settings.account_id, &settings.region) {
        (Some(account), Some(region)) => Some(format!(
            "{}.dkr.ecr.{}.amazonaws.com/{}",
            account, region, settings.image_repository
        )),
        _ => None,
    }
}

fn source_provider(
    args: &RunArgs,
    settings: &DeploymentSettings,
    work_dir: PathBuf,
) -> Result<GitSource> {
    match (&args.remote, &settings.region) {
        (Some(remote), _) => Ok(GitSource::new(work_dir, remote.clone())),
        (None, Some(region)) => Ok(GitSource::codecommit(work_dir, region)),
        (None, None) => anyhow::bail!(
            "no git remote: pass --remote or set WPSTACK_REGION for the CodeCommit remote"
        ),
    }
}

/// Run the pipeline once against local Docker and a Kubernetes cluster.
pub async fn run(config: Option<&Path>, args: RunArgs) -> Result<()> {
    let settings = super::deployment_settings(config);
    let pipeline = super::load_pipeline(args.pipeline.as_deref(), &settings)?;
    let buildspec = super::load_buildspec(args.buildspec.as_deref())?;

    let repository_uri = match args
        .repository_uri
        .clone()
        .or_else(|| ecr_repository_uri(&settings))
    {
        Some(uri) => uri,
        None => anyhow::bail!(
            "no image repository: pass --repository-uri or set WPSTACK_ACCOUNT_ID and WPSTACK_REGION"
        ),
    };

    std::fs::create_dir_all(&args.state_dir)
        .with_context(|| format!("Failed to create {}", args.state_dir.display()))?;
    let state_dir = args
        .state_dir
        .canonicalize()
        .context("Failed to resolve state directory")?;

    let source = source_provider(&args, &settings, state_dir.join("checkouts"))?;
    let executor = LocalDockerExecutor::new().context("Failed to connect to Docker")?;
    let deployer = KubernetesDeployer::new(args.namespace.clone())
        .await
        .context("Failed to connect to Kubernetes")?;

    let backends = Backends {
        source: Arc::new(source),
        executor: Arc::new(executor),
        deployer: Arc::new(deployer),
        artifacts: Arc::new(FsArtifactStore::new(state_dir.join("artifacts"))),
    };
    let environment = BuildEnvironment {
        account_id: settings.account_id.clone().unwrap_or_default(),
        region: settings.region.clone().unwrap_or_default(),
        repository_name: settings.image_repository.clone(),
        repository_uri,
    };
    let options = OrchestratorOptions {
        build_image: args.build_image.clone(),
        deploy_timeout: Duration::from_secs(args.deploy_timeout),
        deploy_target: args.deployment.clone(),
        ..OrchestratorOptions::default()
    };

    let orchestrator = PipelineOrchestrator::new(pipeline, buildspec, environment, backends)?
        .with_options(options);

    let trigger = Trigger {
        revision: args.revision,
        branch: args.branch,
        actor: args.actor,
    };

    println!("Running pipeline: {}", orchestrator.pipeline().name);
    println!("\n--- Starting pipeline execution ---\n");

    let (mut rx, result_handle) = orchestrator.execute(trigger);

    while let Some(event) = rx.recv().await {
        match event {
            PipelineEvent::StageStarted { stage } => {
                println!("▶ Stage '{}' started", stage);
            }
            PipelineEvent::StageLog { stage, line } => {
                let stream_marker = match line.stream {
                    LogStream::Stdout => " ",
                    LogStream::Stderr => "!",
                    LogStream::System => "*",
                };
                println!("  [{}]{} {}", stage, stream_marker, line.content);
            }
            PipelineEvent::StageCompleted { stage, success } => {
                if success {
                    println!("✓ Stage '{}' completed successfully\n", stage);
                } else {
                    println!("✗ Stage '{}' failed\n", stage);
                }
            }
            PipelineEvent::PipelineCompleted { status } => {
                if status == PipelineStatus::Succeeded {
                    println!("--- Pipeline completed successfully ---");
                } else {
                    println!("--- Pipeline failed ---");
                }
            }
        }
    }

    let run = result_handle
        .await
        .context("Pipeline execution task failed")?;

    println!("\n--- Stage Summary (run #{}) ---", run.number);
    for stage in &run.stages {
        let status = match &stage.status {
            StageStatus::Succeeded => "✓ succeeded".to_string(),
            StageStatus::Failed { message } => format!("✗ failed: {}", message),
            StageStatus::Skipped { reason } => format!("⊘ skipped: {}", reason),
            StageStatus::Pending => "○ pending".to_string(),
            StageStatus::Running => "▶ running".to_string(),
        };
        println!("  {} - {}", stage.name, status);
    }

    match run.status {
        PipelineStatus::Succeeded => {
            println!("\n✓ Pipeline succeeded!");
            Ok(())
        }
        PipelineStatus::Failed { stage } => anyhow::bail!("Pipeline failed at stage '{}'", stage),
        other => anyhow::bail!("Pipeline ended in state {:?}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wpstack_config::PartialSettings;

    fn settings(vars: &[(&str, &str)]) -> DeploymentSettings {
        let vars: Vec<(String, String)> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        PartialSettings::default()
            .with_overrides(|key| {
                vars.iter()
                    .find(|(k, _)| k == key)
                    .map(|(_, v)| v.clone())
            })
            .resolve()
            .unwrap()
    }

    #[test]
    fn test_ecr_uri_from_account_and_region() {
        let settings = settings(&[
            ("domainName", "example.com"),
            ("WPSTACK_ACCOUNT_ID", "123456789012"),
            ("WPSTACK_REGION", "eu-west-1"),
        ]);
        assert_eq!(
            ecr_repository_uri(&settings).as_deref(),
            Some("123456789012.dkr.ecr.eu-west-1.amazonaws.com/wordpress")
        );
    }

    #[test]
    fn test_ecr_uri_needs_region() {
        let settings = settings(&[
            ("domainName", "example.com"),
            ("WPSTACK_ACCOUNT_ID", "123456789012"),
        ]);
        assert!(ecr_repository_uri(&settings).is_none());
    }
}
