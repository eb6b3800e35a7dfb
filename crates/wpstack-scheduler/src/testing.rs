//! Mock backends shared by the scheduler tests.

use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use futures::stream::BoxStream;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use wpstack_config::pipeline::wordpress_pipeline;
use wpstack_config::{BuildSpec, PartialSettings};
use wpstack_core::deployer::*;
use wpstack_core::executor::*;
use wpstack_core::pipeline::PipelineDefinition;
use wpstack_core::source::{SourceBundle, SourceProvider, SourceRequest};
use wpstack_core::{Error, Result};
use wpstack_executor::FsArtifactStore;

use crate::orchestrator::{Backends, BuildEnvironment, PipelineOrchestrator};

pub const REPOSITORY_URI: &str = "123456789012.dkr.ecr.eu-west-1.amazonaws.com/wordpress";

type Calls = Arc<Mutex<Vec<&'static str>>>;

pub fn environment() -> BuildEnvironment {
    BuildEnvironment {
        account_id: "123456789012".to_string(),
        region: "eu-west-1".to_string(),
        repository_name: "wordpress".to_string(),
        repository_uri: REPOSITORY_URI.to_string(),
    }
}

pub struct MockSource {
    calls: Calls,
    workspace: std::path::PathBuf,
    revision: Mutex<Option<String>>,
    fail: Mutex<bool>,
}

impl MockSource {
    pub fn set_revision(&self, revision: Option<&str>) {
        *self.revision.lock().unwrap() = revision.map(String::from);
    }

    pub fn fail(&self) {
        *self.fail.lock().unwrap() = true;
    }
}

#[async_trait]
impl SourceProvider for MockSource {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn fetch(&self, request: &SourceRequest) -> Result<SourceBundle> {
        self.calls.lock().unwrap().push("source");
        if *self.fail.lock().unwrap() {
            return Err(Error::SourceFailed("repository unreachable".to_string()));
        }
        let revision = request
            .revision
            .clone()
            .or_else(|| self.revision.lock().unwrap().clone());
        Ok(SourceBundle {
            repository: request.repository.clone(),
            revision,
            branch: Some(request.branch.clone()),
            workspace: self.workspace.clone(),
        })
    }
}

#[derive(Default)]
pub struct MockExecutor {
    calls: Calls,
    jobs: Mutex<Vec<JobSpec>>,
    failure: Mutex<Option<String>>,
    log_delay: Mutex<Option<Duration>>,
}

impl MockExecutor {
    pub fn fail_with(&self, message: &str) {
        *self.failure.lock().unwrap() = Some(message.to_string());
    }

    /// Hold the log line back until after the job has finished.
    pub fn delay_logs(&self, delay: Duration) {
        *self.log_delay.lock().unwrap() = Some(delay);
    }

    pub fn last_job(&self) -> Option<JobSpec> {
        self.jobs.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl Executor for MockExecutor {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn can_execute(&self, _spec: &JobSpec) -> bool {
        true
    }

    async fn spawn(&self, spec: JobSpec) -> Result<JobHandle> {
        self.calls.lock().unwrap().push("build");
        let id = spec.id;
        self.jobs.lock().unwrap().push(spec);
        Ok(JobHandle {
            id,
            executor_id: id.short(),
            executor_name: "mock".to_string(),
        })
    }

    async fn logs(&self, _handle: &JobHandle) -> Result<BoxStream<'static, LogLine>> {
        let delay = *self.log_delay.lock().unwrap();
        Ok(futures::stream::once(async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            LogLine::system("Step 1/3 : FROM wordpress")
        })
        .boxed())
    }

    async fn status(&self, _handle: &JobHandle) -> Result<JobStatus> {
        Ok(JobStatus::Pending)
    }

    async fn wait(&self, _handle: &JobHandle) -> Result<JobResult> {
        let now = Utc::now();
        Ok(match self.failure.lock().unwrap().clone() {
            Some(message) => JobResult {
                status: JobStatus::Failed {
                    started_at: Some(now),
                    finished_at: now,
                    exit_code: Some(1),
                    message,
                },
                exit_code: Some(1),
            },
            None => JobResult {
                status: JobStatus::Succeeded {
                    started_at: now,
                    finished_at: now,
                },
                exit_code: Some(0),
            },
        })
    }

    async fn cancel(&self, _handle: &JobHandle) -> Result<()> {
        Ok(())
    }
}

pub struct MockDeployer {
    calls: Calls,
    deployed: Mutex<Vec<DeploymentSpec>>,
    outcome: Mutex<DeploymentStatus>,
}

impl MockDeployer {
    pub fn set_outcome(&self, status: DeploymentStatus) {
        *self.outcome.lock().unwrap() = status;
    }

    pub fn deployed(&self) -> Vec<DeploymentSpec> {
        self.deployed.lock().unwrap().clone()
    }
}

#[async_trait]
impl Deployer for MockDeployer {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn validate(&self, _spec: &DeploymentSpec) -> Result<Vec<ValidationWarning>> {
        Ok(vec![])
    }

    async fn deploy(&self, spec: DeploymentSpec) -> Result<DeploymentHandle> {
        self.calls.lock().unwrap().push("deploy");
        let handle = DeploymentHandle {
            id: spec.id,
            deployer_name: "mock".to_string(),
            service: spec.service.clone(),
            container: spec.container.clone(),
            revision: Some(1),
        };
        self.deployed.lock().unwrap().push(spec);
        Ok(handle)
    }

    async fn state(&self, _handle: &DeploymentHandle) -> Result<DeploymentState> {
        Ok(DeploymentState {
            status: self.outcome.lock().unwrap().clone(),
            replicas: ReplicaStatus::default(),
            current_image: None,
            last_updated: Utc::now(),
        })
    }
}

/// Mocks wired to a shared call log and a temporary artifact store.
pub struct Harness {
    _dir: TempDir,
    calls: Calls,
    pub source: Arc<MockSource>,
    pub executor: Arc<MockExecutor>,
    pub deployer: Arc<MockDeployer>,
    pub store: Arc<FsArtifactStore>,
}

impl Harness {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let calls: Calls = Arc::default();
        Self {
            source: Arc::new(MockSource {
                calls: calls.clone(),
                workspace: dir.path().join("src"),
                revision: Mutex::new(Some("f00dfacecafe".to_string())),
                fail: Mutex::new(false),
            }),
            executor: Arc::new(MockExecutor {
                calls: calls.clone(),
                ..MockExecutor::default()
            }),
            deployer: Arc::new(MockDeployer {
                calls: calls.clone(),
                deployed: Mutex::default(),
                outcome: Mutex::new(DeploymentStatus::Healthy),
            }),
            store: Arc::new(FsArtifactStore::new(dir.path().join("artifacts"))),
            calls,
            _dir: dir,
        }
    }

    pub fn calls(&self) -> Vec<&'static str> {
        self.calls.lock().unwrap().clone()
    }

    pub fn backends(&self) -> Backends {
        Backends {
            source: self.source.clone(),
            executor: self.executor.clone(),
            deployer: self.deployer.clone(),
            artifacts: self.store.clone(),
        }
    }

    pub fn pipeline(&self) -> PipelineDefinition {
        let settings = PartialSettings::default()
            .with_overrides(|key| (key == "domainName").then(|| "example.com".to_string()))
            .resolve()
            .unwrap();
        wordpress_pipeline(&settings).unwrap()
    }

    pub fn orchestrator_for(&self, pipeline: PipelineDefinition) -> PipelineOrchestrator {
        PipelineOrchestrator::new(pipeline, BuildSpec::wordpress(), environment(), self.backends())
            .unwrap()
    }

    pub fn orchestrator(&self) -> PipelineOrchestrator {
        self.orchestrator_for(self.pipeline())
    }
}
