//! gpufleet-runtime: instance lifecycles on top of backend processes
//!
//! This crate provides:
//! - The runtime trait the lifecycle drives (files, processes, health)
//! - A process-based runtime that builds backend command lines
//! - HTTP health checking and GGUF / config.json analysis
//! - The lifecycle manager, one task per placed instance

pub mod analyze;
pub mod health;
pub mod lifecycle;
pub mod process;
pub mod traits;

pub use analyze::ModelAnalysis;
pub use health::HealthChecker;
pub use lifecycle::{LifecycleManager, ProgressReport};
pub use process::{HubEndpoints, LaunchCommand, ProcessRuntime};
pub use traits::{LaunchOutcome, LaunchRequest, Runtime, Target};
