//! Core domain types and traits for wpstack.
//!
//! This crate contains:
//! - Resource identifiers and common types
//! - Pipeline, stage, action and artifact definitions
//! - Image tag derivation
//! - Desired-resource value objects for stack declarations
//! - Backend traits (source providers, executors, deployers, artifact stores)

pub mod artifact;
pub mod deployer;
pub mod error;
pub mod executor;
pub mod id;
pub mod image;
pub mod pipeline;
pub mod resource;
pub mod source;

pub use error::{Error, Result};
pub use id::ResourceId;
