//! Model instance, resource claim and lifecycle state machine

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::error::{FleetError, FleetResult};
use crate::model::{ModelSource, ModelSpec};

/// Lifecycle state of an instance (and of each subordinate worker)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceState {
    #[default]
    Initializing,
    Pending,
    Downloading,
    Analyzing,
    Starting,
    Running,
    Scheduled,
    Error,
    Unreachable,
}

impl std::fmt::Display for InstanceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            InstanceState::Initializing => "initializing",
            InstanceState::Pending => "pending",
            InstanceState::Downloading => "downloading",
            InstanceState::Analyzing => "analyzing",
            InstanceState::Starting => "starting",
            InstanceState::Running => "running",
            InstanceState::Scheduled => "scheduled",
            InstanceState::Error => "error",
            InstanceState::Unreachable => "unreachable",
        };
        write!(f, "{}", s)
    }
}

impl InstanceState {
    /// Terminal for the current cycle; only a restart leaves these.
    pub fn is_terminal(&self) -> bool {
        matches!(self, InstanceState::Error | InstanceState::Unreachable)
    }

    /// Whether the state machine allows `self -> to` outside of a restart.
    pub fn can_transition_to(&self, to: InstanceState) -> bool {
        use InstanceState::*;
        match (*self, to) {
            (Initializing, Pending) => true,
            (Pending, Downloading) | (Pending, Analyzing) => true,
            (Downloading, Analyzing) => true,
            (Analyzing, Starting) => true,
            (Starting, Running) | (Starting, Scheduled) => true,
            (Scheduled, Starting) => true,
            (Running, Unreachable) | (Scheduled, Unreachable) => true,
            (Unreachable, Error) => true,
            (from, Error) => from != Error,
            _ => false,
        }
    }

    pub fn check_transition(&self, to: InstanceState) -> FleetResult<()> {
        if self.can_transition_to(to) {
            Ok(())
        } else {
            Err(FleetError::InvalidTransition { from: *self, to })
        }
    }
}

/// Compute resources committed to an instance
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceClaim {
    #[serde(default)]
    pub is_unified_memory: bool,
    #[serde(default)]
    pub offload_layers: Option<u32>,
    #[serde(default)]
    pub total_layers: Option<u32>,
    /// Bytes of system memory
    #[serde(default)]
    pub ram: u64,
    /// Bytes of VRAM by GPU index
    #[serde(default)]
    pub vram: BTreeMap<u32, u64>,
    /// Relative weight per rank, in rank order
    #[serde(default)]
    pub tensor_split: Vec<u64>,
}

impl ResourceClaim {
    pub fn total_vram(&self) -> u64 {
        self.vram.values().sum()
    }

    pub fn gpu_indexes(&self) -> Vec<u32> {
        self.vram.keys().copied().collect()
    }

    /// Scale layer counts after analysis found the real layer count.
    pub fn rescale_layers(&mut self, total_layers: u32) {
        let offload = match (self.offload_layers, self.total_layers) {
            (Some(offload), Some(total)) if total > 0 && offload < total => {
                ((offload as u64 * total_layers as u64) / total as u64) as u32
            }
            (Some(_), _) => total_layers,
            (None, _) => 0,
        };
        self.total_layers = Some(total_layers);
        self.offload_layers = Some(offload);
    }
}

/// Startup ordering between the main worker and its subordinates
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoordinateMode {
    /// The backend coordinates its own distributed startup
    #[default]
    Delegated,
    /// Subordinates start after the main worker is running
    InitializeLater,
    /// Subordinates must be running before the main worker starts
    RunFirst,
}

impl std::fmt::Display for CoordinateMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CoordinateMode::Delegated => write!(f, "delegated"),
            CoordinateMode::InitializeLater => write!(f, "initialize_later"),
            CoordinateMode::RunFirst => write!(f, "run_first"),
        }
    }
}

/// An auxiliary worker participating in a multi-worker instance
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SubordinateWorker {
    pub worker_id: Uuid,
    pub worker_name: String,
    pub worker_ip: String,
    #[serde(default)]
    pub total_gpus: u32,
    #[serde(default)]
    pub gpu_indexes: Vec<u32>,
    #[serde(default)]
    pub gpu_addresses: Vec<String>,
    #[serde(default)]
    pub computed_resource_claim: ResourceClaim,
    #[serde(default)]
    pub download_progress: Option<f64>,
    #[serde(default)]
    pub pid: Option<u32>,
    #[serde(default)]
    pub ports: Vec<u16>,
    #[serde(default)]
    pub arguments: Vec<String>,
    #[serde(default = "pending_state")]
    pub state: InstanceState,
    #[serde(default)]
    pub state_message: Option<String>,
}

fn pending_state() -> InstanceState {
    InstanceState::Pending
}

impl SubordinateWorker {
    pub fn new(worker_id: Uuid, worker_name: String, worker_ip: String) -> Self {
        Self {
            worker_id,
            worker_name,
            worker_ip,
            state: InstanceState::Pending,
            ..Default::default()
        }
    }

    pub fn transition(&mut self, to: InstanceState, message: Option<String>) -> FleetResult<()> {
        self.state.check_transition(to)?;
        self.state = to;
        self.state_message = message;
        Ok(())
    }
}

/// Multi-worker block of an instance
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DistributedServers {
    /// Fixed at creation time
    pub mode: CoordinateMode,
    #[serde(default = "default_download")]
    pub download_model_files: bool,
    #[serde(default)]
    pub subordinate_workers: Vec<SubordinateWorker>,
}

fn default_download() -> bool {
    true
}

impl DistributedServers {
    /// May the main worker enter `starting`?
    pub fn main_may_start(&self) -> bool {
        match self.mode {
            CoordinateMode::RunFirst => self
                .subordinate_workers
                .iter()
                .all(|s| s.state == InstanceState::Running),
            CoordinateMode::Delegated | CoordinateMode::InitializeLater => true,
        }
    }

    /// May subordinates enter `starting` while the main worker is in `main_state`?
    pub fn subordinates_may_start(&self, main_state: InstanceState) -> bool {
        match self.mode {
            CoordinateMode::InitializeLater => main_state == InstanceState::Running,
            CoordinateMode::Delegated | CoordinateMode::RunFirst => true,
        }
    }
}

/// One deployment of a spec on a worker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelInstance {
    pub id: Uuid,
    /// Globally unique
    pub name: String,
    /// Owning spec
    pub model_id: Uuid,
    pub model_name: String,
    #[serde(flatten)]
    pub source: ModelSource,
    #[serde(default)]
    pub worker_id: Option<Uuid>,
    #[serde(default)]
    pub worker_name: Option<String>,
    #[serde(default)]
    pub worker_ip: Option<String>,
    #[serde(default)]
    pub pid: Option<u32>,
    #[serde(default)]
    pub ports: Vec<u16>,
    #[serde(default)]
    pub download_progress: Option<f64>,
    /// Local path of the fetched model files
    #[serde(default)]
    pub resolved_path: Option<String>,
    #[serde(default)]
    pub restart_count: u32,
    #[serde(default)]
    pub last_restart_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub state: InstanceState,
    #[serde(default)]
    pub state_message: Option<String>,
    #[serde(default)]
    pub computed_resource_claim: Option<ResourceClaim>,
    #[serde(default)]
    pub gpu_indexes: Vec<u32>,
    #[serde(default)]
    pub gpu_addresses: Vec<String>,
    #[serde(default)]
    pub distributed_servers: Option<DistributedServers>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ModelInstance {
    /// New unplaced instance of `spec`, in `initializing`
    pub fn new(spec: &ModelSpec, name: String) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name,
            model_id: spec.id,
            model_name: spec.name.clone(),
            source: spec.source.clone(),
            worker_id: None,
            worker_name: None,
            worker_ip: None,
            pid: None,
            ports: Vec::new(),
            download_progress: None,
            resolved_path: None,
            restart_count: 0,
            last_restart_time: None,
            state: InstanceState::Initializing,
            state_message: None,
            computed_resource_claim: None,
            gpu_indexes: Vec::new(),
            gpu_addresses: Vec::new(),
            distributed_servers: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_placed(&self) -> bool {
        self.worker_id.is_some()
    }

    pub fn is_distributed(&self) -> bool {
        self.distributed_servers
            .as_ref()
            .is_some_and(|d| !d.subordinate_workers.is_empty())
    }

    pub fn subordinates(&self) -> &[SubordinateWorker] {
        self.distributed_servers
            .as_ref()
            .map(|d| d.subordinate_workers.as_slice())
            .unwrap_or(&[])
    }

    pub fn subordinate_mut(&mut self, index: usize) -> FleetResult<&mut SubordinateWorker> {
        let name = self.name.clone();
        self.distributed_servers
            .as_mut()
            .and_then(|d| d.subordinate_workers.get_mut(index))
            .ok_or_else(|| FleetError::not_found("Subordinate worker", format!("{}#{}", name, index)))
    }

    /// Apply a state machine transition.
    pub fn transition(&mut self, to: InstanceState, message: Option<String>) -> FleetResult<()> {
        self.state.check_transition(to)?;
        if to == InstanceState::Starting {
            if let Some(ds) = &self.distributed_servers {
                if !ds.main_may_start() {
                    return Err(FleetError::Runtime(format!(
                        "main worker of {} must wait for subordinate workers ({} mode)",
                        self.name, ds.mode
                    )));
                }
            }
        }
        self.state = to;
        self.state_message = message;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Transition subordinate `index`, honouring the coordination mode.
    pub fn transition_subordinate(
        &mut self,
        index: usize,
        to: InstanceState,
        message: Option<String>,
    ) -> FleetResult<()> {
        let main_state = self.state;
        if to == InstanceState::Starting {
            if let Some(ds) = &self.distributed_servers {
                if !ds.subordinates_may_start(main_state) {
                    return Err(FleetError::Runtime(format!(
                        "subordinate workers of {} must wait for the main worker ({} mode)",
                        self.name, ds.mode
                    )));
                }
            }
        }
        self.subordinate_mut(index)?.transition(to, message)?;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Move to `error`, recording the cause. No-op when already in `error`.
    pub fn fail(&mut self, message: impl Into<String>) {
        if self.state != InstanceState::Error {
            self.state = InstanceState::Error;
            self.state_message = Some(message.into());
            self.updated_at = Utc::now();
        }
    }

    /// Restart out of `error`/`unreachable` back to `initializing`.
    ///
    /// Returns `Ok(false)` without touching the instance when it is in `error`
    /// and the spec does not allow restarts.
    pub fn restart(&mut self, restart_on_error: bool) -> FleetResult<bool> {
        match self.state {
            InstanceState::Error if !restart_on_error => return Ok(false),
            InstanceState::Error | InstanceState::Unreachable => {}
            from => {
                return Err(FleetError::InvalidTransition {
                    from,
                    to: InstanceState::Initializing,
                })
            }
        }

        let now = Utc::now();
        self.state = InstanceState::Initializing;
        self.state_message = None;
        self.restart_count += 1;
        self.last_restart_time = Some(now);
        self.pid = None;
        self.ports.clear();
        self.download_progress = None;
        if let Some(ds) = &mut self.distributed_servers {
            for sub in &mut ds.subordinate_workers {
                sub.state = InstanceState::Pending;
                sub.state_message = None;
                sub.pid = None;
                sub.ports.clear();
                sub.download_progress = None;
            }
        }
        self.updated_at = now;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ModelSource;

    fn instance() -> ModelInstance {
        let spec = ModelSpec::new("llama3", ModelSource::ollama("llama3").unwrap());
        ModelInstance::new(&spec, "llama3-abc123".to_string())
    }

    fn distributed(mode: CoordinateMode) -> ModelInstance {
        let mut inst = instance();
        inst.distributed_servers = Some(DistributedServers {
            mode,
            download_model_files: true,
            subordinate_workers: vec![SubordinateWorker::new(
                Uuid::new_v4(),
                "worker-2".to_string(),
                "10.0.0.2".to_string(),
            )],
        });
        inst
    }

    fn walk(inst: &mut ModelInstance, states: &[InstanceState]) {
        for s in states {
            inst.transition(*s, None).unwrap();
        }
    }

    #[test]
    fn test_happy_path() {
        let mut inst = instance();
        use InstanceState::*;
        walk(&mut inst, &[Pending, Downloading, Analyzing, Starting, Running]);
        assert_eq!(inst.state, Running);
    }

    #[test]
    fn test_running_requires_starting() {
        use InstanceState::*;
        for from in [Initializing, Pending, Downloading, Analyzing, Scheduled, Error, Unreachable] {
            assert!(!from.can_transition_to(Running), "{} -> running", from);
        }
        assert!(Starting.can_transition_to(Running));
    }

    #[test]
    fn test_no_skipping() {
        let mut inst = instance();
        let err = inst.transition(InstanceState::Analyzing, None).unwrap_err();
        assert!(matches!(err, FleetError::InvalidTransition { .. }));
        assert_eq!(inst.state, InstanceState::Initializing);
    }

    #[test]
    fn test_error_from_any_non_error_state() {
        use InstanceState::*;
        for from in [Initializing, Pending, Downloading, Analyzing, Starting, Running, Scheduled, Unreachable] {
            assert!(from.can_transition_to(Error));
        }
        assert!(!Error.can_transition_to(Error));
        assert!(!Error.can_transition_to(Initializing));
    }

    #[test]
    fn test_unreachable_only_from_running_or_scheduled() {
        use InstanceState::*;
        assert!(Running.can_transition_to(Unreachable));
        assert!(Scheduled.can_transition_to(Unreachable));
        assert!(!Starting.can_transition_to(Unreachable));
        assert!(!Pending.can_transition_to(Unreachable));
    }

    #[test]
    fn test_restart_increments_once() {
        let mut inst = instance();
        inst.fail("process exited with code 1");
        assert!(inst.restart(true).unwrap());
        assert_eq!(inst.restart_count, 1);
        assert_eq!(inst.state, InstanceState::Initializing);
        assert!(inst.last_restart_time.is_some());
        assert!(inst.state_message.is_none());

        // not restartable from initializing
        assert!(inst.restart(true).is_err());
        assert_eq!(inst.restart_count, 1);
    }

    #[test]
    fn test_restart_noop_without_restart_on_error() {
        let mut inst = instance();
        inst.fail("boom");
        assert!(!inst.restart(false).unwrap());
        assert_eq!(inst.state, InstanceState::Error);
        assert_eq!(inst.restart_count, 0);
        assert_eq!(inst.state_message.as_deref(), Some("boom"));
    }

    #[test]
    fn test_restart_from_unreachable() {
        let mut inst = instance();
        use InstanceState::*;
        walk(&mut inst, &[Pending, Analyzing, Starting, Running, Unreachable]);
        assert!(inst.restart(false).unwrap());
        assert_eq!(inst.restart_count, 1);
    }

    #[test]
    fn test_initialize_later_gates_subordinates() {
        use InstanceState::*;
        let mut inst = distributed(CoordinateMode::InitializeLater);
        walk(&mut inst, &[Pending, Analyzing]);
        inst.transition_subordinate(0, Analyzing, None).unwrap();
        assert!(inst.transition_subordinate(0, Starting, None).is_err());

        walk(&mut inst, &[Starting, Running]);
        inst.transition_subordinate(0, Starting, None).unwrap();
        inst.transition_subordinate(0, Running, None).unwrap();
        assert_eq!(inst.subordinates()[0].state, Running);
    }

    #[test]
    fn test_run_first_gates_main() {
        use InstanceState::*;
        let mut inst = distributed(CoordinateMode::RunFirst);
        walk(&mut inst, &[Pending, Analyzing]);
        assert!(inst.transition(Starting, None).is_err());
        assert_eq!(inst.state, Analyzing);

        inst.transition_subordinate(0, Analyzing, None).unwrap();
        inst.transition_subordinate(0, Starting, None).unwrap();
        inst.transition_subordinate(0, Running, None).unwrap();
        walk(&mut inst, &[Starting, Running]);
    }

    #[test]
    fn test_delegated_has_no_ordering() {
        use InstanceState::*;
        let mut inst = distributed(CoordinateMode::Delegated);
        walk(&mut inst, &[Pending, Analyzing, Starting]);
        inst.transition_subordinate(0, Analyzing, None).unwrap();
        inst.transition_subordinate(0, Starting, None).unwrap();
    }

    #[test]
    fn test_rescale_layers() {
        let mut claim = ResourceClaim {
            offload_layers: Some(10),
            total_layers: Some(20),
            ..Default::default()
        };
        claim.rescale_layers(40);
        assert_eq!(claim.total_layers, Some(40));
        assert_eq!(claim.offload_layers, Some(20));

        let mut full = ResourceClaim {
            offload_layers: Some(33),
            total_layers: Some(33),
            ..Default::default()
        };
        full.rescale_layers(81);
        assert_eq!(full.offload_layers, Some(81));
    }

    #[test]
    fn test_instance_serializes_flat_source() {
        let inst = instance();
        let value = serde_json::to_value(&inst).unwrap();
        assert_eq!(value["source"], "ollama_library");
        assert_eq!(value["state"], "initializing");
        let back: ModelInstance = serde_json::from_value(value).unwrap();
        assert_eq!(back.name, inst.name);
    }
}
