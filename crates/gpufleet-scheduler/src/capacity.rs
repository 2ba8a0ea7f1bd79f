//! Per-worker capacity accounting
//!
//! Every worker has its own lock. A reservation re-checks the worker's
//! allocatable resources inside that lock, so two placements planned against
//! the same snapshot can never both commit more than the worker has.

use gpufleet_core::{FleetError, FleetResult, ResourceClaim, Worker, WorkerState};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::debug;
use uuid::Uuid;

use crate::placement::{Assignment, PlacementPlan};

/// Resources still free on a worker
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Allocatable {
    pub ram: u64,
    /// Free VRAM by GPU index
    pub vram: BTreeMap<u32, u64>,
}

impl Allocatable {
    pub fn total_vram(&self) -> u64 {
        self.vram.values().sum()
    }
}

#[derive(Debug, Clone)]
struct Allocation {
    model_id: Uuid,
    ram: u64,
    vram: BTreeMap<u32, u64>,
    subordinate: bool,
}

/// A worker and what has been committed on it
#[derive(Debug)]
pub struct WorkerCapacity {
    worker: Worker,
    allocations: HashMap<Uuid, Allocation>,
}

impl WorkerCapacity {
    fn new(worker: Worker) -> Self {
        Self {
            worker,
            allocations: HashMap::new(),
        }
    }

    fn allocated(&self) -> (u64, BTreeMap<u32, u64>) {
        let mut ram = 0u64;
        let mut vram: BTreeMap<u32, u64> = BTreeMap::new();
        for allocation in self.allocations.values() {
            // Subordinate claims only hold VRAM on their worker
            if !allocation.subordinate {
                ram += allocation.ram;
            }
            for (index, bytes) in &allocation.vram {
                *vram.entry(*index).or_default() += bytes;
            }
        }
        (ram, vram)
    }

    /// Total minus allocated minus system reserved, floored at zero.
    ///
    /// On unified memory the GPU shares system RAM: RAM additionally loses the
    /// reserved and allocated VRAM, and GPU 0 can never offer more than RAM.
    pub fn allocatable(&self) -> Allocatable {
        let (allocated_ram, allocated_vram) = self.allocated();
        let reserved = self.worker.system_reserved;

        let mut vram: BTreeMap<u32, u64> = self
            .worker
            .gpu_devices
            .iter()
            .map(|gpu| {
                let used = allocated_vram.get(&gpu.index).copied().unwrap_or(0);
                let free = gpu
                    .memory_total
                    .saturating_sub(used)
                    .saturating_sub(reserved.vram);
                (gpu.index, free)
            })
            .collect();

        let mut ram = self
            .worker
            .memory
            .total
            .saturating_sub(allocated_ram)
            .saturating_sub(reserved.ram);

        if self.worker.memory.is_unified_memory {
            let all_vram: u64 = allocated_vram.values().sum();
            ram = ram.saturating_sub(reserved.vram).saturating_sub(all_vram);
            if let Some(first) = vram.values_mut().next() {
                *first = (*first).min(ram);
            }
        }

        Allocatable { ram, vram }
    }

    fn fits(&self, claim: &ResourceClaim, subordinate: bool) -> bool {
        let free = self.allocatable();
        let ram_needed = if subordinate { 0 } else { claim.ram };

        let vram_ok = claim
            .vram
            .iter()
            .all(|(index, bytes)| free.vram.get(index).is_some_and(|f| f >= bytes));
        if !vram_ok {
            return false;
        }
        if self.worker.memory.is_unified_memory {
            let vram_total = claim.total_vram();
            ram_needed + vram_total <= free.ram
        } else {
            ram_needed <= free.ram
        }
    }

    fn replicas(&self) -> HashMap<Uuid, u32> {
        let mut counts = HashMap::new();
        for allocation in self.allocations.values().filter(|a| !a.subordinate) {
            *counts.entry(allocation.model_id).or_insert(0) += 1;
        }
        counts
    }
}

/// Point-in-time view of one worker, used for planning
#[derive(Debug, Clone)]
pub struct WorkerSnapshot {
    pub worker: Worker,
    pub allocatable: Allocatable,
    /// Instances per model currently holding resources here
    pub replicas: HashMap<Uuid, u32>,
}

impl WorkerSnapshot {
    pub fn replicas_of(&self, model_id: Uuid) -> u32 {
        self.replicas.get(&model_id).copied().unwrap_or(0)
    }

    pub fn free_vram(&self) -> u64 {
        self.allocatable.total_vram()
    }
}

/// Capacity of every known worker
#[derive(Default)]
pub struct CapacityLedger {
    workers: RwLock<BTreeMap<Uuid, Arc<Mutex<WorkerCapacity>>>>,
}

impl CapacityLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn from_workers(workers: impl IntoIterator<Item = Worker>) -> Self {
        let ledger = Self::new();
        for worker in workers {
            ledger.upsert_worker(worker).await;
        }
        ledger
    }

    /// Add a worker or refresh its inventory, keeping existing allocations
    pub async fn upsert_worker(&self, worker: Worker) {
        let mut workers = self.workers.write().await;
        if let Some(existing) = workers.get(&worker.id).cloned() {
            existing.lock().await.worker = worker;
            return;
        }
        debug!(worker = %worker.name, gpus = worker.gpu_devices.len(), "Registered worker");
        workers.insert(worker.id, Arc::new(Mutex::new(WorkerCapacity::new(worker))));
    }

    pub async fn set_worker_state(&self, worker_id: Uuid, state: WorkerState) -> FleetResult<()> {
        let entry = self.entry(worker_id).await?;
        entry.lock().await.worker.state = state;
        Ok(())
    }

    pub async fn allocatable(&self, worker_id: Uuid) -> FleetResult<Allocatable> {
        let entry = self.entry(worker_id).await?;
        let capacity = entry.lock().await;
        Ok(capacity.allocatable())
    }

    pub async fn snapshot(&self) -> Vec<WorkerSnapshot> {
        let entries: Vec<Arc<Mutex<WorkerCapacity>>> =
            self.workers.read().await.values().cloned().collect();
        let mut snapshot = Vec::with_capacity(entries.len());
        for entry in entries {
            let capacity = entry.lock().await;
            snapshot.push(WorkerSnapshot {
                worker: capacity.worker.clone(),
                allocatable: capacity.allocatable(),
                replicas: capacity.replicas(),
            });
        }
        snapshot
    }

    async fn entry(&self, worker_id: Uuid) -> FleetResult<Arc<Mutex<WorkerCapacity>>> {
        self.workers
            .read()
            .await
            .get(&worker_id)
            .cloned()
            .ok_or_else(|| FleetError::not_found("Worker", worker_id))
    }

    async fn try_reserve(
        &self,
        instance_id: Uuid,
        model_id: Uuid,
        assignment: &Assignment,
        subordinate: bool,
    ) -> FleetResult<()> {
        let claim = &assignment.claim;
        let entry = self.entry(assignment.worker_id).await?;
        let mut capacity = entry.lock().await;
        if !capacity.worker.is_schedulable() {
            return Err(FleetError::Scheduling(format!(
                "worker {} is not ready",
                capacity.worker.name
            )));
        }
        if !capacity.fits(claim, subordinate) {
            return Err(FleetError::Scheduling(format!(
                "worker {} no longer has room for the claim",
                capacity.worker.name
            )));
        }
        capacity.allocations.insert(
            instance_id,
            Allocation {
                model_id,
                ram: claim.ram,
                vram: claim.vram.clone(),
                subordinate,
            },
        );
        debug!(
            instance_id = %instance_id,
            worker = %capacity.worker.name,
            ram = claim.ram,
            vram = claim.total_vram(),
            "Reserved capacity"
        );
        Ok(())
    }

    /// Commit every part of `plan` or nothing
    pub async fn reserve(
        &self,
        instance_id: Uuid,
        model_id: Uuid,
        plan: &PlacementPlan,
    ) -> FleetResult<()> {
        let mut reserved: Vec<Uuid> = Vec::new();
        for (assignment, subordinate) in plan.parts() {
            if let Err(e) = self
                .try_reserve(instance_id, model_id, assignment, subordinate)
                .await
            {
                for worker_id in reserved {
                    self.release_on(worker_id, instance_id).await;
                }
                return Err(e);
            }
            reserved.push(assignment.worker_id);
        }
        Ok(())
    }

    async fn release_on(&self, worker_id: Uuid, instance_id: Uuid) -> bool {
        match self.entry(worker_id).await {
            Ok(entry) => entry.lock().await.allocations.remove(&instance_id).is_some(),
            Err(_) => false,
        }
    }

    /// Free whatever `instance_id` holds on any worker
    pub async fn release(&self, instance_id: Uuid) -> bool {
        let entries: Vec<Arc<Mutex<WorkerCapacity>>> =
            self.workers.read().await.values().cloned().collect();
        let mut released = false;
        for entry in entries {
            released |= entry.lock().await.allocations.remove(&instance_id).is_some();
        }
        if released {
            debug!(instance_id = %instance_id, "Released capacity");
        }
        released
    }
}
