//! gpufleet-scheduler: placement and reconciliation
//!
//! This crate decides where model instances run:
//! - Per-worker capacity accounting with exclusive reservations
//! - Spread and binpack placement, resource claim computation
//! - Coordination modes for multi-worker instances
//! - Per-model reconciliation to the desired replica count

pub mod capacity;
pub mod coordinator;
pub mod placement;
pub mod scheduler;

pub use capacity::{Allocatable, CapacityLedger, WorkerSnapshot};
pub use coordinator::DistributedCoordinator;
pub use placement::{
    plan, Assignment, MetaEstimator, PlacementPlan, PlacementStrategy, ResourceEstimate,
    ResourceEstimator,
};
pub use scheduler::{InstanceSupervisor, NoopSupervisor, ReconcileOutcome, Scheduler};
