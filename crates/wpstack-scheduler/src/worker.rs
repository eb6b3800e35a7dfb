//! Worker that drains the trigger queue, one pipeline run at a time.

use crate::orchestrator::PipelineOrchestrator;
use crate::queue::TriggerReceiver;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use wpstack_core::pipeline::{PipelineRun, PipelineStatus};

/// A worker that runs queued triggers sequentially.
pub struct Worker {
    id: String,
    orchestrator: PipelineOrchestrator,
    triggers: TriggerReceiver,
    results: Option<mpsc::Sender<PipelineRun>>,
}

impl Worker {
    pub fn new(
        id: impl Into<String>,
        orchestrator: PipelineOrchestrator,
        triggers: TriggerReceiver,
    ) -> Self {
        Self {
            id: id.into(),
            orchestrator,
            triggers,
            results: None,
        }
    }

    /// Publish every finished run on `results`.
    pub fn with_results(mut self, results: mpsc::Sender<PipelineRun>) -> Self {
        self.results = Some(results);
        self
    }

    /// Run the worker loop until the queue closes. Returns the number of
    /// runs that finished.
    pub async fn run(mut self) -> u64 {
        info!(worker_id = %self.id, pipeline = %self.orchestrator.pipeline().name, "Starting worker");
        let mut finished = 0;

        while let Some(trigger) = self.triggers.next().await {
            info!(worker_id = %self.id, revision = ?trigger.revision, "Picked up trigger");

            let run = match self.orchestrator.run(trigger).await {
                Ok(run) => run,
                Err(e) => {
                    error!(worker_id = %self.id, error = %e, "Pipeline run aborted");
                    continue;
                }
            };
            finished += 1;

            match &run.status {
                PipelineStatus::Succeeded => {
                    info!(run_id = %run.id, number = run.number, "Run succeeded")
                }
                PipelineStatus::Failed { stage } => {
                    warn!(run_id = %run.id, number = run.number, stage = %stage, "Run failed")
                }
                other => warn!(run_id = %run.id, status = ?other, "Run ended unexpectedly"),
            }

            let dropped = match &self.results {
                Some(results) => results.send(run).await.is_err(),
                None => false,
            };
            if dropped {
                warn!(worker_id = %self.id, "Result receiver dropped");
                self.results = None;
            }
        }

        info!(worker_id = %self.id, runs = finished, "Trigger queue closed, worker stopping");
        finished
    }
}
