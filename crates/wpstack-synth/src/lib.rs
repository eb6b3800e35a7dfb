//! Stack assembly and template synthesis.
//!
//! Stacks are declared as plain [`StackDefinition`] values and turned into
//! provider templates in a separate step:
//! - [`BaseStack`]: the long-lived source and image repositories
//! - [`PipelineStack`]: network, database, service and delivery pipeline
//! - [`template`]: reference checking and JSON rendering

pub mod base;
pub mod error;
pub mod pipeline;
pub mod template;

pub use base::BaseStack;
pub use error::{SynthError, SynthResult};
pub use pipeline::PipelineStack;
pub use template::{Template, synthesize, write_template};
pub use wpstack_core::resource::StackDefinition;
