//! gpufleet-core: Core types for the gpufleet control plane
//!
//! This crate provides the fundamental types used throughout gpufleet:
//! - Model sources and model specs
//! - Backend resolution and spec validation
//! - Model instances, resource claims and the instance state machine
//! - Worker and GPU inventory
//! - Configuration types
//! - Error handling

pub mod backend;
pub mod config;
pub mod error;
pub mod gpu;
pub mod instance;
pub mod model;

pub use backend::*;
pub use config::*;
pub use error::*;
pub use gpu::*;
pub use instance::*;
pub use model::*;
