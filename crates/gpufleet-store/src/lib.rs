//! gpufleet-store: entity storage
//!
//! This crate provides:
//! - An in-memory store for model specs and instances
//! - Watch streams of entity changes
//! - A local model file cache with LRU eviction

pub mod cache;
pub mod store;
pub mod watch;

pub use cache::{CacheStats, CachedModel, ModelFileCache};
pub use store::Store;
pub use watch::{Entity, EntityKind, EventType, WatchEvent, WatchFilter};
