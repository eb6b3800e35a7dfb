//! Synthesis errors.

use thiserror::Error;
use wpstack_config::ConfigError;

#[derive(Debug, Error)]
pub enum SynthError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Stack(#[from] wpstack_core::Error),

    #[error("'{resource}' references '{reference}', which is not declared before it")]
    UndeclaredReference { resource: String, reference: String },

    #[error("'{resource}' has no attribute '{attribute}'")]
    UnknownAttribute { resource: String, attribute: String },

    #[error("'{resource}': {message}")]
    InvalidExpression { resource: String, message: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type SynthResult<T> = std::result::Result<T, SynthError>;
