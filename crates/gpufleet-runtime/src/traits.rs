//! Runtime trait definitions

use async_trait::async_trait;
use gpufleet_core::{FleetResult, ModelInstance, ModelSource, ModelSpec};
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;

use crate::analyze::ModelAnalysis;

/// Which process of an instance a launch or report is about
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Target {
    Main,
    /// Index into `distributed_servers.subordinate_workers`
    Subordinate(usize),
}

impl std::fmt::Display for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Target::Main => write!(f, "main"),
            Target::Subordinate(i) => write!(f, "subordinate#{}", i),
        }
    }
}

/// Everything needed to launch one backend process of an instance
#[derive(Debug, Clone)]
pub struct LaunchRequest {
    pub instance: ModelInstance,
    pub spec: ModelSpec,
    pub target: Target,
    /// Local model files; `None` for processes that never read them
    pub model_path: Option<PathBuf>,
    /// `ip:port` of subordinate processes already launched, in rank order
    pub peers: Vec<String>,
}

/// Result of a launch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LaunchOutcome {
    Launched { pid: u32, ports: Vec<u16> },
    /// Resources are held but no process was started
    Reserved,
}

/// Runtime trait for fetching model files and managing backend processes
#[async_trait]
pub trait Runtime: Send + Sync {
    /// Local path of the model files when they are already present
    async fn locate(&self, source: &ModelSource) -> FleetResult<Option<PathBuf>>;

    /// Fetch the model files, sending progress in `[0.0, 1.0]`
    async fn download(
        &self,
        source: &ModelSource,
        progress: mpsc::Sender<f64>,
    ) -> FleetResult<PathBuf>;

    /// Probe model files for their final resource requirements
    async fn analyze(&self, path: &Path) -> FleetResult<ModelAnalysis>;

    /// Launch a backend process
    async fn launch(&self, request: &LaunchRequest) -> FleetResult<LaunchOutcome>;

    /// Stop a process started by `launch`
    async fn stop(&self, pid: u32) -> FleetResult<()>;

    /// Check if a process is still running
    async fn is_alive(&self, pid: u32) -> bool;

    /// Check if the backend at `ip:port` is serving
    async fn is_healthy(&self, ip: &str, port: u16) -> bool;

    /// Get the runtime name
    fn name(&self) -> &'static str;
}
