//! Pipeline run scheduling for wpstack.
//!
//! Triggers are queued and handed to a single worker, which runs the
//! pipeline stages in order through the orchestrator.

pub mod orchestrator;
pub mod queue;
pub mod worker;

#[cfg(test)]
mod testing;

pub use orchestrator::{
    Backends, BuildEnvironment, OrchestratorOptions, PipelineEvent, PipelineOrchestrator,
};
pub use queue::{TriggerQueue, TriggerReceiver};
pub use worker::Worker;
