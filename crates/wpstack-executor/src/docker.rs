//! Local Docker executor implementation.

use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{
    Config, CreateContainerOptions, LogOutput, LogsOptions, RemoveContainerOptions,
    StartContainerOptions, WaitContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::HostConfig;
use chrono::Utc;
use futures::StreamExt;
use futures::stream::BoxStream;
use tracing::{debug, info, warn};
use wpstack_core::executor::*;
use wpstack_core::{Error, ResourceId, Result};

/// Socket mounted into privileged build containers so they can build and
/// push images with the host daemon.
pub const DOCKER_SOCKET: &str = "/var/run/docker.sock";

/// Runs build jobs as containers on the local Docker daemon.
pub struct LocalDockerExecutor {
    docker: Docker,
}

impl LocalDockerExecutor {
    /// Create a new LocalDockerExecutor connecting to the local Docker daemon.
    pub fn new() -> Result<Self> {
        let docker =
            Docker::connect_with_local_defaults().map_err(|e| Error::Internal(e.to_string()))?;
        Ok(Self { docker })
    }

    /// Create with a custom Docker client.
    pub fn with_client(docker: Docker) -> Self {
        Self { docker }
    }

    fn container_name(job_id: &ResourceId) -> String {
        format!("wpstack-build-{}", job_id)
    }

    fn binds(spec: &JobSpec) -> Option<Vec<String>> {
        let mut binds: Vec<String> = spec
            .volumes
            .iter()
            .map(|v| {
                let mode = if v.read_only { "ro" } else { "rw" };
                format!("{}:{}:{}", v.source, v.mount_path, mode)
            })
            .collect();
        if spec.privileged {
            binds.push(format!("{}:{}", DOCKER_SOCKET, DOCKER_SOCKET));
        }
        if binds.is_empty() { None } else { Some(binds) }
    }

    async fn pull(&self, image: &str) {
        info!(image = %image, "Pulling image");
        let options = CreateImageOptions {
            from_image: image.to_string(),
            ..Default::default()
        };

        let mut pull_stream = self.docker.create_image(Some(options), None, None);
        while let Some(result) = pull_stream.next().await {
            match result {
                Ok(info) => {
                    if let Some(status) = info.status {
                        debug!(status = %status, "Pull progress");
                    }
                }
                Err(e) => {
                    // A locally built image may not exist in any registry.
                    warn!(error = %e, "Pull warning");
                }
            }
        }
    }
}

#[async_trait]
impl Executor for LocalDockerExecutor {
    fn name(&self) -> &'static str {
        "docker"
    }

    async fn can_execute(&self, _spec: &JobSpec) -> bool {
        self.docker.ping().await.is_ok()
    }

    async fn spawn(&self, spec: JobSpec) -> Result<JobHandle> {
        let container_name = Self::container_name(&spec.id);
        self.pull(&spec.image).await;

        let env: Vec<String> = spec
            .env
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();

        let cmd = if spec.command.is_empty() {
            None
        } else {
            Some(spec.command.clone())
        };

        let host_config = HostConfig {
            binds: Self::binds(&spec),
            privileged: Some(spec.privileged),
            ..Default::default()
        };

        let config = Config {
            image: Some(spec.image.clone()),
            cmd,
            env: Some(env),
            working_dir: spec.working_dir.clone(),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            tty: Some(false),
            host_config: Some(host_config),
            ..Default::default()
        };

        let create_options = CreateContainerOptions {
            name: container_name.clone(),
            platform: None,
        };

        info!(container = %container_name, privileged = spec.privileged, "Creating container");
        let container = self
            .docker
            .create_container(Some(create_options), config)
            .await
            .map_err(|e| Error::ExecutionFailed(format!("Failed to create container: {}", e)))?;

        info!(container = %container_name, "Starting container");
        self.docker
            .start_container(&container_name, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| Error::ExecutionFailed(format!("Failed to start container: {}", e)))?;

        Ok(JobHandle {
            id: spec.id,
            executor_id: container.id,
            executor_name: self.name().to_string(),
        })
    }

    async fn logs(&self, handle: &JobHandle) -> Result<BoxStream<'static, LogLine>> {
        let container_name = Self::container_name(&handle.id);

        let options = LogsOptions::<String> {
            follow: true,
            stdout: true,
            stderr: true,
            timestamps: false,
            ..Default::default()
        };

        let stream = self.docker.logs(&container_name, Some(options));

        let mapped_stream = stream.filter_map(|result| async move {
            match result {
                Ok(output) => {
                    let (stream, message) = match output {
                        LogOutput::StdErr { message } => (LogStream::Stderr, message),
                        LogOutput::StdOut { message }
                        | LogOutput::Console { message }
                        | LogOutput::StdIn { message } => (LogStream::Stdout, message),
                    };
                    Some(LogLine {
                        timestamp: Utc::now(),
                        stream,
                        content: String::from_utf8_lossy(&message).trim_end().to_string(),
                    })
                }
                Err(e) => {
                    warn!(error = %e, "Log stream error");
                    None
                }
            }
        });

        Ok(Box::pin(mapped_stream))
    }

    async fn status(&self, handle: &JobHandle) -> Result<JobStatus> {
        let container_name = Self::container_name(&handle.id);

        let inspect = self
            .docker
            .inspect_container(&container_name, None)
            .await
            .map_err(|e| Error::NotFound(format!("Container not found: {}", e)))?;

        let state = inspect
            .state
            .ok_or_else(|| Error::Internal("No state".to_string()))?;

        let parse = |s: Option<String>| {
            s.and_then(|s| chrono::DateTime::parse_from_rfc3339(&s).ok())
                .map(|dt| dt.with_timezone(&Utc))
        };

        let status = if state.running.unwrap_or(false) {
            JobStatus::Running {
                started_at: parse(state.started_at).unwrap_or_else(Utc::now),
            }
        } else if state.paused.unwrap_or(false) {
            JobStatus::Pending
        } else {
            let exit_code = state.exit_code.map(|c| c as i32);
            let started_at = parse(state.started_at);
            let finished_at = parse(state.finished_at).unwrap_or_else(Utc::now);

            if exit_code == Some(0) {
                JobStatus::Succeeded {
                    started_at: started_at.unwrap_or(finished_at),
                    finished_at,
                }
            } else {
                JobStatus::Failed {
                    started_at,
                    finished_at,
                    exit_code,
                    message: state.error.unwrap_or_default(),
                }
            }
        };

        Ok(status)
    }

    async fn wait(&self, handle: &JobHandle) -> Result<JobResult> {
        let container_name = Self::container_name(&handle.id);

        let current_status = self.status(handle).await?;
        if current_status.is_terminal() {
            let exit_code = match &current_status {
                JobStatus::Succeeded { .. } => Some(0),
                JobStatus::Failed { exit_code, .. } => *exit_code,
                _ => None,
            };
            return Ok(JobResult {
                status: current_status,
                exit_code,
            });
        }

        let options = WaitContainerOptions {
            condition: "not-running",
        };

        let mut stream = self.docker.wait_container(&container_name, Some(options));

        // Non-zero exits surface as errors from the wait stream; the
        // inspected state below carries the real outcome.
        let exit_code = match stream.next().await {
            Some(Ok(response)) => Some(response.status_code as i32),
            Some(Err(e)) => {
                debug!(error = %e, "Wait returned error");
                None
            }
            None => None,
        };

        let status = self.status(handle).await?;
        let exit_code = match &status {
            JobStatus::Failed { exit_code: Some(code), .. } => Some(*code),
            JobStatus::Succeeded { .. } => Some(0),
            _ => exit_code,
        };

        Ok(JobResult { status, exit_code })
    }

    async fn cancel(&self, handle: &JobHandle) -> Result<()> {
        let container_name = Self::container_name(&handle.id);

        if let Err(e) = self.docker.stop_container(&container_name, None).await {
            debug!(container = %container_name, error = %e, "Stop failed, removing anyway");
        }

        cleanup_container(&self.docker, &handle.id).await
    }
}

/// Remove a job's container.
pub async fn cleanup_container(docker: &Docker, job_id: &ResourceId) -> Result<()> {
    let container_name = LocalDockerExecutor::container_name(job_id);

    let options = RemoveContainerOptions {
        force: true,
        ..Default::default()
    };

    docker
        .remove_container(&container_name, Some(options))
        .await
        .map_err(|e| Error::ExecutionFailed(format!("Failed to remove container: {}", e)))?;

    Ok(())
}


/// Integration tests that require Docker to be running.
/// Run with: cargo test -- --ignored
#[cfg(test)]
mod integration_tests {
    use super::*;
    use std::collections::HashMap;

    fn shell_job(script: &str) -> JobSpec {
        JobSpec {
            id: ResourceId::new(),
            image: "alpine:latest".to_string(),
            command: vec!["/bin/sh".to_string(), "-c".to_string(), script.to_string()],
            working_dir: None,
            env: HashMap::from([("IMAGE_TAG".to_string(), "abc1234".to_string())]),
            timeout: None,
            volumes: vec![],
            privileged: false,
        }
    }

    #[tokio::test]
    #[ignore]
    async fn test_job_lifecycle() {
        let executor = LocalDockerExecutor::new().unwrap();
        assert!(executor.can_execute(&shell_job("true")).await);

        let handle = executor.spawn(shell_job("echo tag=$IMAGE_TAG")).await.unwrap();
        let result = executor.wait(&handle).await.unwrap();
        assert_eq!(result.exit_code, Some(0));

        let mut logs = executor.logs(&handle).await.unwrap();
        let mut found = false;
        while let Some(line) = logs.next().await {
            if line.content.contains("tag=abc1234") {
                found = true;
            }
        }
        assert!(found, "Should find the image tag in output");

        let _ = executor.cancel(&handle).await;
    }

    #[tokio::test]
    #[ignore]
    async fn test_failing_job() {
        let executor = LocalDockerExecutor::new().unwrap();

        let handle = executor.spawn(shell_job("exit 42")).await.unwrap();
        let result = executor.wait(&handle).await.unwrap();

        assert_eq!(result.exit_code, Some(42));
        assert!(matches!(
            result.status,
            JobStatus::Failed {
                exit_code: Some(42),
                ..
            }
        ));

        let _ = executor.cancel(&handle).await;
    }

    #[tokio::test]
    #[ignore]
    async fn test_job_cancellation() {
        let executor = LocalDockerExecutor::new().unwrap();

        let handle = executor.spawn(shell_job("sleep 300")).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_secs(1)).await;
        assert!(matches!(
            executor.status(&handle).await.unwrap(),
            JobStatus::Running { .. }
        ));

        executor.cancel(&handle).await.unwrap();
        assert!(executor.status(&handle).await.is_err());
    }
}
