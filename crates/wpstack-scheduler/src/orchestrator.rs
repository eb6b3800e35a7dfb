//! Pipeline orchestrator - runs the stages of a pipeline in order.
//!
//! A stage starts only after every action of the previous stage succeeded.
//! The first failing action halts the run and every later stage is
//! recorded as skipped.

use bytes::Bytes;
use chrono::Utc;
use futures::StreamExt;
use futures::future::join_all;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use wpstack_config::pipeline::validate_pipeline;
use wpstack_config::{BuildSpec, ConfigResult, VariableContextBuilder};
use wpstack_core::artifact::{
    ArtifactKey, ArtifactRef, ArtifactStore, IMAGE_DEFINITIONS_FILE, ImageDefinitions,
    WEB_CONTAINER,
};
use wpstack_core::deployer::{Deployer, DeploymentSpec, DeploymentStatus};
use wpstack_core::executor::{Executor, JobSpec, JobStatus, LogLine, VolumeMount};
use wpstack_core::image::{ImageReference, derive_image_tag};
use wpstack_core::pipeline::{
    Action, ActionConfig, ArtifactName, PipelineDefinition, PipelineRun, PipelineStatus,
    StageStatus, Trigger,
};
use wpstack_core::source::{SourceBundle, SourceProvider, SourceRequest};
use wpstack_core::{Error, ResourceId, Result};

/// Mount point of the checked-out sources inside the build container.
pub const WORKSPACE_MOUNT: &str = "/workspace";

/// Default build environment image (CodeBuild standard 3.0).
pub const DEFAULT_BUILD_IMAGE: &str = "aws/codebuild/standard:3.0";

/// How long buffered build logs may keep arriving after the job exits.
const LOG_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Event emitted during pipeline execution.
#[derive(Debug, Clone)]
pub enum PipelineEvent {
    StageStarted { stage: String },
    StageLog { stage: String, line: LogLine },
    StageCompleted { stage: String, success: bool },
    PipelineCompleted { status: PipelineStatus },
}

/// Values handed to the build job's environment.
#[derive(Debug, Clone, Default)]
pub struct BuildEnvironment {
    pub account_id: String,
    pub region: String,
    pub repository_name: String,
    pub repository_uri: String,
}

/// Tunables for a run.
#[derive(Debug, Clone)]
pub struct OrchestratorOptions {
    pub build_image: String,
    pub build_timeout: Duration,
    pub deploy_timeout: Duration,
    pub poll_interval: Duration,
    /// Overrides the service name of deploy actions (e.g., the name of a
    /// Kubernetes deployment).
    pub deploy_target: Option<String>,
}

impl Default for OrchestratorOptions {
    fn default() -> Self {
        Self {
            build_image: DEFAULT_BUILD_IMAGE.to_string(),
            build_timeout: Duration::from_secs(30 * 60),
            deploy_timeout: Duration::from_secs(10 * 60),
            poll_interval: Duration::from_secs(5),
            deploy_target: None,
        }
    }
}

/// Backends a pipeline runs against.
#[derive(Clone)]
pub struct Backends {
    pub source: Arc<dyn SourceProvider>,
    pub executor: Arc<dyn Executor>,
    pub deployer: Arc<dyn Deployer>,
    pub artifacts: Arc<dyn ArtifactStore>,
}

/// An artifact produced during a run.
#[derive(Debug, Clone)]
enum RunArtifact {
    /// Checked-out sources; lives in the provider's work directory.
    Source(SourceBundle),
    /// A file held by the artifact store.
    Stored(ArtifactRef),
}

type ActionOutput = Option<(ArtifactName, RunArtifact)>;

/// Orchestrates the execution of a pipeline.
#[derive(Clone)]
pub struct PipelineOrchestrator {
    pipeline: Arc<PipelineDefinition>,
    buildspec: Arc<BuildSpec>,
    environment: Arc<BuildEnvironment>,
    backends: Backends,
    options: OrchestratorOptions,
    runs: Arc<AtomicU64>,
}

impl PipelineOrchestrator {
    /// Create an orchestrator for a pipeline. The pipeline and build spec
    /// are validated here so a run never starts on a broken definition.
    pub fn new(
        pipeline: PipelineDefinition,
        buildspec: BuildSpec,
        environment: BuildEnvironment,
        backends: Backends,
    ) -> ConfigResult<Self> {
        validate_pipeline(&pipeline)?;
        buildspec.validate()?;
        Ok(Self {
            pipeline: Arc::new(pipeline),
            buildspec: Arc::new(buildspec),
            environment: Arc::new(environment),
            backends,
            options: OrchestratorOptions::default(),
            runs: Arc::new(AtomicU64::new(0)),
        })
    }

    pub fn with_options(mut self, options: OrchestratorOptions) -> Self {
        self.options = options;
        self
    }

    pub fn pipeline(&self) -> &PipelineDefinition {
        &self.pipeline
    }

    /// Start a run, returning a channel of events and a handle to the
    /// finished run.
    pub fn execute(
        &self,
        trigger: Trigger,
    ) -> (mpsc::Receiver<PipelineEvent>, JoinHandle<PipelineRun>) {
        let (tx, rx) = mpsc::channel(100);
        let number = self.runs.fetch_add(1, Ordering::SeqCst) + 1;
        let run = PipelineRun::new(number, &self.pipeline, trigger);
        let this = self.clone();

        let handle = tokio::spawn(async move { this.execute_inner(run, tx).await });
        (rx, handle)
    }

    /// Run to completion, logging events as they arrive.
    pub async fn run(&self, trigger: Trigger) -> Result<PipelineRun> {
        let (mut events, handle) = self.execute(trigger);
        while let Some(event) = events.recv().await {
            match event {
                PipelineEvent::StageLog { stage, line } => {
                    debug!(stage = %stage, stream = ?line.stream, "{}", line.content)
                }
                other => debug!(event = ?other, "Pipeline event"),
            }
        }
        handle
            .await
            .map_err(|e| Error::Internal(format!("pipeline task failed: {}", e)))
    }

    async fn execute_inner(
        &self,
        mut run: PipelineRun,
        tx: mpsc::Sender<PipelineEvent>,
    ) -> PipelineRun {
        info!(
            pipeline = %run.pipeline,
            run_id = %run.id,
            number = run.number,
            revision = ?run.trigger.revision,
            "Starting pipeline run"
        );
        run.status = PipelineStatus::Running;
        run.started_at = Some(Utc::now());

        let mut artifacts: HashMap<ArtifactName, RunArtifact> = HashMap::new();
        let mut failed_stage: Option<String> = None;

        for (stage_idx, stage) in self.pipeline.stages.iter().enumerate() {
            if let Some(failed) = &failed_stage {
                info!(stage = %stage.name, failed = %failed, "Skipping stage");
                if let Some(result) = run.stage_mut(&stage.name) {
                    result.status = StageStatus::Skipped {
                        reason: format!("stage '{}' failed", failed),
                    };
                }
                continue;
            }

            let _ = tx
                .send(PipelineEvent::StageStarted {
                    stage: stage.name.clone(),
                })
                .await;
            if let Some(result) = run.stage_mut(&stage.name) {
                result.status = StageStatus::Running;
                result.started_at = Some(Utc::now());
            }

            let outcomes = join_all(stage.actions.iter().map(|action| {
                self.execute_action(&run, stage_idx, &stage.name, action, &artifacts, &tx)
            }))
            .await;

            let mut errors = Vec::new();
            for (action, outcome) in stage.actions.iter().zip(outcomes) {
                match outcome {
                    Ok(Some((name, artifact))) => {
                        artifacts.insert(name, artifact);
                    }
                    Ok(None) => {}
                    Err(e) => {
                        error!(stage = %stage.name, action = %action.name, error = %e, "Action failed");
                        errors.push(format!("{}: {}", action.name, e));
                    }
                }
            }

            let success = errors.is_empty();
            if let Some(result) = run.stage_mut(&stage.name) {
                result.finished_at = Some(Utc::now());
                result.status = if success {
                    StageStatus::Succeeded
                } else {
                    StageStatus::Failed {
                        message: errors.join("; "),
                    }
                };
            }
            if success {
                info!(stage = %stage.name, "Stage completed successfully");
            } else {
                failed_stage = Some(stage.name.clone());
            }
            let _ = tx
                .send(PipelineEvent::StageCompleted {
                    stage: stage.name.clone(),
                    success,
                })
                .await;
        }

        run.status = match failed_stage {
            Some(stage) => PipelineStatus::Failed { stage },
            None => PipelineStatus::Succeeded,
        };
        run.finished_at = Some(Utc::now());

        if let Err(e) = self.backends.artifacts.purge(&run.id).await {
            warn!(run_id = %run.id, error = %e, "Failed to purge run artifacts");
        }

        info!(run_id = %run.id, status = ?run.status, "Pipeline run finished");
        let _ = tx
            .send(PipelineEvent::PipelineCompleted {
                status: run.status.clone(),
            })
            .await;
        run
    }

    async fn execute_action(
        &self,
        run: &PipelineRun,
        stage_idx: usize,
        stage: &str,
        action: &Action,
        artifacts: &HashMap<ArtifactName, RunArtifact>,
        tx: &mpsc::Sender<PipelineEvent>,
    ) -> Result<ActionOutput> {
        let input = match &action.input {
            Some(name) => Some(artifacts.get(name).ok_or_else(|| {
                Error::NotFound(format!("input artifact '{}' of '{}'", name, action.name))
            })?),
            None => None,
        };

        let produced = match (&action.config, input) {
            (ActionConfig::Source { repository, branch }, _) => {
                let bundle = self.source(run, repository, branch).await?;
                log(tx, stage, format!(
                    "Fetched {} at {}",
                    bundle.repository,
                    bundle.revision.as_deref().unwrap_or("unknown revision")
                ))
                .await;
                RunArtifact::Source(bundle)
            }
            (ActionConfig::Build { project }, Some(RunArtifact::Source(bundle))) => {
                let output = action.output.as_ref().ok_or_else(|| {
                    Error::InvalidInput(format!("build action '{}' has no output", action.name))
                })?;
                let reference = self
                    .build(run, stage_idx, stage, project, bundle, output, tx)
                    .await?;
                RunArtifact::Stored(reference)
            }
            (ActionConfig::Deploy { service }, Some(RunArtifact::Stored(reference))) => {
                self.deploy(run, stage, service, reference, tx).await?;
                return Ok(None);
            }
            (_, _) => {
                return Err(Error::InvalidArtifact(format!(
                    "action '{}' received an input of the wrong kind",
                    action.name
                )));
            }
        };

        Ok(action.output.clone().map(|name| (name, produced)))
    }

    async fn source(
        &self,
        run: &PipelineRun,
        repository: &str,
        branch: &str,
    ) -> Result<SourceBundle> {
        let request = SourceRequest {
            repository: repository.to_string(),
            branch: run.trigger.branch.clone().unwrap_or_else(|| branch.to_string()),
            revision: run
                .trigger
                .revision
                .clone()
                .filter(|r| !r.trim().is_empty()),
        };
        info!(
            provider = self.backends.source.name(),
            repository = %request.repository,
            branch = %request.branch,
            "Fetching source"
        );
        self.backends.source.fetch(&request).await
    }

    #[allow(clippy::too_many_arguments)]
    async fn build(
        &self,
        run: &PipelineRun,
        stage_idx: usize,
        stage: &str,
        project: &str,
        bundle: &SourceBundle,
        output: &ArtifactName,
        tx: &mpsc::Sender<PipelineEvent>,
    ) -> Result<ArtifactRef> {
        let tag = derive_image_tag(bundle.revision.as_deref());
        if tag.is_fallback() {
            warn!(
                run_id = %run.id,
                revision = ?bundle.revision,
                "No usable source revision, tagging image as '{}'",
                tag
            );
        }
        let image = ImageReference::new(&self.environment.repository_uri, tag.clone());

        let ctx = VariableContextBuilder::new()
            .with_revision(bundle.revision.as_deref())
            .with_branch(bundle.branch.clone().unwrap_or_default())
            .with_image(
                &tag,
                &self.environment.repository_name,
                &self.environment.repository_uri,
            )
            .with_account(&self.environment.account_id, &self.environment.region)
            .with_pipeline(&run.pipeline)
            .with_run(run.id.to_string(), run.number)
            .with_stage(stage, stage_idx)
            .build();
        let script = self.buildspec.render_script(&ctx);

        let job = JobSpec {
            id: ResourceId::new(),
            image: self.options.build_image.clone(),
            command: vec!["/bin/sh".to_string(), "-c".to_string(), script],
            working_dir: Some(WORKSPACE_MOUNT.to_string()),
            env: build_env(&self.environment, bundle, tag.as_str()),
            timeout: Some(self.options.build_timeout),
            volumes: vec![workspace_mount(&bundle.workspace)],
            privileged: true,
        };

        info!(stage = %stage, project = %project, image = %image, "Spawning build job");
        let executor = &self.backends.executor;
        let handle = executor.spawn(job).await?;

        let mut log_stream = executor.logs(&handle).await?;
        let stage_name = stage.to_string();
        let log_tx = tx.clone();
        let log_handle = tokio::spawn(async move {
            while let Some(line) = log_stream.next().await {
                let _ = log_tx
                    .send(PipelineEvent::StageLog {
                        stage: stage_name.clone(),
                        line,
                    })
                    .await;
            }
        });

        let waited = tokio::time::timeout(self.options.build_timeout, executor.wait(&handle)).await;

        // Give the stream a moment to flush, it may still be following a
        // stopped container.
        let mut log_handle = log_handle;
        if tokio::time::timeout(LOG_DRAIN_TIMEOUT, &mut log_handle).await.is_err() {
            log_handle.abort();
            let _ = log_handle.await;
        }

        let result = match waited {
            Ok(result) => result?,
            Err(_) => {
                if let Err(e) = executor.cancel(&handle).await {
                    warn!(job = %handle.executor_id, error = %e, "Failed to cancel timed-out build");
                }
                return Err(Error::Timeout(format!(
                    "build project '{}' exceeded {:?}",
                    project, self.options.build_timeout
                )));
            }
        };

        match result.status {
            JobStatus::Succeeded { .. } => {}
            JobStatus::Failed { message, .. } => {
                return Err(Error::ExecutionFailed(format!("build failed: {}", message)));
            }
            JobStatus::Cancelled { .. } => return Err(Error::Cancelled),
            other => {
                return Err(Error::ExecutionFailed(format!(
                    "build ended in unexpected state {:?}",
                    other
                )));
            }
        }

        let definitions = ImageDefinitions::for_web(&image).to_json()?;
        let key = ArtifactKey {
            run_id: run.id,
            artifact: output.to_string(),
            file: IMAGE_DEFINITIONS_FILE.to_string(),
        };
        let reference = self.backends.artifacts.put(&key, Bytes::from(definitions)).await?;
        log(tx, stage, format!("Published {}", image)).await;
        Ok(reference)
    }

    async fn deploy(
        &self,
        run: &PipelineRun,
        stage: &str,
        service: &str,
        reference: &ArtifactRef,
        tx: &mpsc::Sender<PipelineEvent>,
    ) -> Result<()> {
        let data = self.backends.artifacts.get(reference).await?;
        let definitions = ImageDefinitions::from_json(&data)?;
        let image = definitions.image_for(WEB_CONTAINER).ok_or_else(|| {
            Error::InvalidArtifact(format!(
                "{} has no entry for container '{}'",
                IMAGE_DEFINITIONS_FILE, WEB_CONTAINER
            ))
        })?;

        let spec = DeploymentSpec {
            id: ResourceId::new(),
            service: self
                .options
                .deploy_target
                .clone()
                .unwrap_or_else(|| service.to_string()),
            container: WEB_CONTAINER.to_string(),
            image: image.to_string(),
        };

        let deployer = &self.backends.deployer;
        for warning in deployer.validate(&spec).await? {
            warn!(run_id = %run.id, field = %warning.field, "{}", warning.message);
        }

        info!(
            deployer = deployer.name(),
            service = %spec.service,
            image = %spec.image,
            "Deploying image"
        );
        let handle = deployer.deploy(spec).await?;

        let deadline = tokio::time::Instant::now() + self.options.deploy_timeout;
        let mut last_progress = None;
        loop {
            let state = deployer.state(&handle).await?;
            match state.status {
                DeploymentStatus::Healthy => {
                    log(tx, stage, format!("Service {} is healthy", handle.service)).await;
                    return Ok(());
                }
                DeploymentStatus::Failed { message } => {
                    return Err(Error::DeploymentFailed(message));
                }
                DeploymentStatus::InProgress { progress_percent } => {
                    if last_progress != Some(progress_percent) {
                        last_progress = Some(progress_percent);
                        log(tx, stage, format!("Rollout {}% complete", progress_percent)).await;
                    }
                }
                DeploymentStatus::Pending => {}
            }

            if tokio::time::Instant::now() >= deadline {
                return Err(Error::Timeout(format!(
                    "service '{}' not healthy after {:?}",
                    handle.service, self.options.deploy_timeout
                )));
            }
            tokio::time::sleep(self.options.poll_interval).await;
        }
    }
}

async fn log(tx: &mpsc::Sender<PipelineEvent>, stage: &str, content: String) {
    let _ = tx
        .send(PipelineEvent::StageLog {
            stage: stage.to_string(),
            line: LogLine::system(content),
        })
        .await;
}

fn workspace_mount(workspace: &Path) -> VolumeMount {
    VolumeMount {
        source: workspace.to_string_lossy().to_string(),
        mount_path: WORKSPACE_MOUNT.to_string(),
        read_only: false,
    }
}

/// Environment of the build job. The build spec reads the tag from
/// `IMAGE_TAG` and the repository coordinates from the `ECR_*` values.
fn build_env(env: &BuildEnvironment, bundle: &SourceBundle, tag: &str) -> HashMap<String, String> {
    HashMap::from([
        ("ACCOUNT_ID".to_string(), env.account_id.clone()),
        ("AWS_DEFAULT_REGION".to_string(), env.region.clone()),
        ("ECR_REPOSITORY_NAME".to_string(), env.repository_name.clone()),
        ("ECR_REPOSITORY_URI".to_string(), env.repository_uri.clone()),
        ("IMAGE_TAG".to_string(), tag.to_string()),
        (
            "SOURCE_REVISION".to_string(),
            bundle.revision.clone().unwrap_or_default(),
        ),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::*;
    use wpstack_core::pipeline::{Stage, StageStatus};

    #[tokio::test]
    async fn test_successful_run_deploys_revision_tag() {
        let harness = Harness::new();
        let run = harness
            .orchestrator()
            .run(Trigger::revision("0123456789abcdef"))
            .await
            .unwrap();

        assert_eq!(run.status, PipelineStatus::Succeeded);
        assert!(run.stages.iter().all(|s| s.status == StageStatus::Succeeded));
        assert_eq!(harness.calls(), vec!["source", "build", "deploy"]);

        let deployed = harness.deployer.deployed();
        assert_eq!(deployed.len(), 1);
        assert_eq!(deployed[0].container, "web");
        assert_eq!(deployed[0].image, format!("{}:0123456", REPOSITORY_URI));

        let job = harness.executor.last_job().unwrap();
        assert_eq!(job.env["IMAGE_TAG"], "0123456");
        assert_eq!(job.env["SOURCE_REVISION"], "0123456789abcdef");
        assert_eq!(job.env["ECR_REPOSITORY_URI"], REPOSITORY_URI);
        assert!(job.privileged);
        assert_eq!(job.volumes[0].mount_path, WORKSPACE_MOUNT);
        assert!(job.command[2].contains("cd wordpress"));
        assert!(job.command[2].contains(&format!("{}:0123456", REPOSITORY_URI)));
    }

    #[tokio::test]
    async fn test_missing_revision_falls_back_to_latest() {
        let harness = Harness::new();
        harness.source.set_revision(None);

        let run = harness.orchestrator().run(Trigger::default()).await.unwrap();

        assert_eq!(run.status, PipelineStatus::Succeeded);
        assert_eq!(
            harness.deployer.deployed()[0].image,
            format!("{}:latest", REPOSITORY_URI)
        );
        assert_eq!(harness.executor.last_job().unwrap().env["IMAGE_TAG"], "latest");
    }

    #[tokio::test]
    async fn test_blank_trigger_revision_follows_branch_head() {
        let harness = Harness::new();

        let run = harness
            .orchestrator()
            .run(Trigger::revision("   "))
            .await
            .unwrap();

        assert_eq!(run.status, PipelineStatus::Succeeded);
        assert_eq!(harness.executor.last_job().unwrap().env["IMAGE_TAG"], "f00dfac");
        assert_eq!(
            harness.deployer.deployed()[0].image,
            format!("{}:f00dfac", REPOSITORY_URI)
        );
    }

    #[tokio::test]
    async fn test_build_failure_skips_deploy() {
        let harness = Harness::new();
        harness.executor.fail_with("docker push denied");

        let run = harness
            .orchestrator()
            .run(Trigger::revision("abcdef1234"))
            .await
            .unwrap();

        assert_eq!(
            run.status,
            PipelineStatus::Failed {
                stage: "Build".to_string()
            }
        );
        assert!(matches!(
            run.stage("Build").unwrap().status,
            StageStatus::Failed { ref message } if message.contains("docker push denied")
        ));
        assert!(matches!(
            run.stage("Deploy").unwrap().status,
            StageStatus::Skipped { .. }
        ));
        assert_eq!(harness.calls(), vec!["source", "build"]);
        assert!(harness.deployer.deployed().is_empty());
    }

    #[tokio::test]
    async fn test_source_failure_stops_run() {
        let harness = Harness::new();
        harness.source.fail();

        let run = harness.orchestrator().run(Trigger::default()).await.unwrap();

        assert_eq!(
            run.status,
            PipelineStatus::Failed {
                stage: "Source".to_string()
            }
        );
        assert_eq!(harness.calls(), vec!["source"]);
        assert!(harness.executor.last_job().is_none());
        for stage in ["Build", "Deploy"] {
            assert!(matches!(
                run.stage(stage).unwrap().status,
                StageStatus::Skipped { .. }
            ));
        }
    }

    #[tokio::test]
    async fn test_unhealthy_rollout_fails_deploy_stage() {
        let harness = Harness::new();
        harness.deployer.set_outcome(DeploymentStatus::Failed {
            message: "tasks failed health checks".to_string(),
        });

        let run = harness
            .orchestrator()
            .run(Trigger::revision("abcdef1234"))
            .await
            .unwrap();

        assert_eq!(
            run.status,
            PipelineStatus::Failed {
                stage: "Deploy".to_string()
            }
        );
        assert!(run.stage("Build").unwrap().status.is_success());
    }

    #[tokio::test]
    async fn test_rollout_timeout_fails_deploy_stage() {
        let harness = Harness::new();
        harness
            .deployer
            .set_outcome(DeploymentStatus::InProgress { progress_percent: 50 });

        let orchestrator = harness.orchestrator().with_options(OrchestratorOptions {
            deploy_timeout: Duration::from_millis(50),
            poll_interval: Duration::from_millis(10),
            ..OrchestratorOptions::default()
        });
        let run = orchestrator.run(Trigger::revision("abcdef1234")).await.unwrap();

        assert!(matches!(
            run.stage("Deploy").unwrap().status,
            StageStatus::Failed { ref message } if message.contains("timeout")
        ));
    }

    #[tokio::test]
    async fn test_deploy_target_override() {
        let harness = Harness::new();
        let orchestrator = harness.orchestrator().with_options(OrchestratorOptions {
            deploy_target: Some("wordpress".to_string()),
            poll_interval: Duration::from_millis(1),
            ..OrchestratorOptions::default()
        });
        orchestrator.run(Trigger::revision("abcdef1234")).await.unwrap();

        assert_eq!(harness.deployer.deployed()[0].service, "wordpress");
    }

    #[tokio::test]
    async fn test_events_follow_stage_order() {
        let harness = Harness::new();
        let (mut events, handle) = harness.orchestrator().execute(Trigger::revision("abcdef1234"));

        let mut seen = Vec::new();
        while let Some(event) = events.recv().await {
            match event {
                PipelineEvent::StageStarted { stage } => seen.push(format!("start:{}", stage)),
                PipelineEvent::StageCompleted { stage, success } => {
                    seen.push(format!("done:{}:{}", stage, success))
                }
                PipelineEvent::PipelineCompleted { status } => {
                    seen.push(format!("pipeline:{:?}", status))
                }
                PipelineEvent::StageLog { .. } => {}
            }
        }
        let run = handle.await.unwrap();

        assert_eq!(
            seen,
            vec![
                "start:Source",
                "done:Source:true",
                "start:Build",
                "done:Build:true",
                "start:Deploy",
                "done:Deploy:true",
                "pipeline:Succeeded",
            ]
        );
        assert_eq!(run.number, 1);
    }

    #[tokio::test]
    async fn test_late_build_logs_are_delivered() {
        let harness = Harness::new();
        harness.executor.delay_logs(Duration::from_millis(100));
        let (mut events, handle) = harness.orchestrator().execute(Trigger::revision("abcdef1234"));

        let mut build_logs = Vec::new();
        while let Some(event) = events.recv().await {
            if let PipelineEvent::StageLog { stage, line } = event {
                if stage == "Build" {
                    build_logs.push(line.content);
                }
            }
        }
        handle.await.unwrap();

        assert!(build_logs.iter().any(|l| l == "Step 1/3 : FROM wordpress"));
    }

    #[tokio::test]
    async fn test_artifacts_purged_after_run() {
        let harness = Harness::new();
        let run = harness
            .orchestrator()
            .run(Trigger::revision("abcdef1234"))
            .await
            .unwrap();

        assert!(harness.store.list(&run.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_run_numbers_increment() {
        let harness = Harness::new();
        let orchestrator = harness.orchestrator();
        let first = orchestrator.run(Trigger::revision("aaaaaaa1")).await.unwrap();
        let second = orchestrator.run(Trigger::revision("bbbbbbb2")).await.unwrap();

        assert_eq!(first.number, 1);
        assert_eq!(second.number, 2);
        assert_ne!(first.id, second.id);
    }

    #[tokio::test]
    async fn test_concurrent_actions_in_one_stage() {
        let harness = Harness::new();
        let mut pipeline = harness.pipeline();
        let mut extra = pipeline.stages[0].actions[0].clone();
        extra.name = "SecondCheckout".to_string();
        extra.output = Some("SecondSource".into());
        pipeline.stages[0].actions.push(extra);

        let orchestrator = harness.orchestrator_for(pipeline);
        let run = orchestrator.run(Trigger::revision("abcdef1234")).await.unwrap();

        assert_eq!(run.status, PipelineStatus::Succeeded);
        assert_eq!(harness.calls().iter().filter(|c| **c == "source").count(), 2);
    }

    #[test]
    fn test_invalid_pipeline_rejected() {
        let harness = Harness::new();
        let mut pipeline = harness.pipeline();
        pipeline.stages.push(Stage {
            name: "Verify".to_string(),
            actions: vec![],
        });

        assert!(
            PipelineOrchestrator::new(
                pipeline,
                BuildSpec::wordpress(),
                environment(),
                harness.backends(),
            )
            .is_err()
        );
    }
}
