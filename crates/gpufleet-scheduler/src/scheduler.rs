//! Model reconciliation
//!
//! The scheduler turns model specs into placed instances. Each spec is
//! reconciled under its own lock, either on demand or by a background task
//! once [`Scheduler::start`] has been called.

use async_trait::async_trait;
use chrono::Utc;
use gpufleet_core::{
    prepare_spec, FleetError, FleetResult, InstanceState, ModelInstance, ModelSpec,
    ModelSpecPatch, PatchEffect, SchedulerConfig,
};
use gpufleet_store::Store;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::capacity::CapacityLedger;
use crate::coordinator::DistributedCoordinator;
use crate::placement::{self, MetaEstimator, PlacementPlan, ResourceEstimator};

const NAME_ATTEMPTS: usize = 5;

/// Receives instances the scheduler placed or removed
#[async_trait]
pub trait InstanceSupervisor: Send + Sync {
    /// The instance is `pending` with a placement and can be driven forward
    async fn instance_placed(&self, instance: &ModelInstance);

    /// The instance is gone; stop anything launched for it
    async fn instance_removed(&self, instance: &ModelInstance);
}

/// Supervisor that does nothing, for dry runs
pub struct NoopSupervisor;

#[async_trait]
impl InstanceSupervisor for NoopSupervisor {
    async fn instance_placed(&self, _instance: &ModelInstance) {}
    async fn instance_removed(&self, _instance: &ModelInstance) {}
}

/// What one reconciliation pass did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileOutcome {
    pub created: u32,
    pub deleted: u32,
    pub placed: u32,
    /// Instances still waiting for capacity
    pub pending: u32,
    pub ready_replicas: u32,
}

impl ReconcileOutcome {
    pub fn changed(&self) -> bool {
        self.created > 0 || self.deleted > 0 || self.placed > 0
    }
}

struct SpecTask {
    notify: Arc<Notify>,
    cancel: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Scheduler for model specs
pub struct Scheduler {
    store: Arc<Store>,
    ledger: Arc<CapacityLedger>,
    estimator: Arc<dyn ResourceEstimator>,
    coordinator: DistributedCoordinator,
    supervisor: Arc<dyn InstanceSupervisor>,
    config: SchedulerConfig,
    spec_locks: Mutex<HashMap<Uuid, Arc<Mutex<()>>>>,
    tasks: Mutex<HashMap<Uuid, SpecTask>>,
    started: AtomicBool,
}

impl Scheduler {
    pub fn new(store: Arc<Store>, ledger: Arc<CapacityLedger>, config: SchedulerConfig) -> Self {
        Self {
            store,
            ledger,
            estimator: Arc::new(MetaEstimator::new(&config)),
            coordinator: DistributedCoordinator,
            supervisor: Arc::new(NoopSupervisor),
            config,
            spec_locks: Mutex::new(HashMap::new()),
            tasks: Mutex::new(HashMap::new()),
            started: AtomicBool::new(false),
        }
    }

    pub fn with_supervisor(mut self, supervisor: Arc<dyn InstanceSupervisor>) -> Self {
        self.supervisor = supervisor;
        self
    }

    pub fn with_estimator(mut self, estimator: Arc<dyn ResourceEstimator>) -> Self {
        self.estimator = estimator;
        self
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn ledger(&self) -> &Arc<CapacityLedger> {
        &self.ledger
    }

    /// Validate and store a new spec
    pub async fn create(self: &Arc<Self>, mut spec: ModelSpec) -> FleetResult<ModelSpec> {
        let backend = prepare_spec(&mut spec)?;
        self.estimator.estimate(&spec)?;
        let spec = self.store.create_spec(spec).await?;

        info!(
            model_id = %spec.id,
            name = %spec.name,
            backend = %backend,
            replicas = spec.replicas,
            "Created model"
        );
        self.trigger(spec.id).await;
        Ok(spec)
    }

    /// Apply a patch, re-resolving backend defaults and re-validating.
    ///
    /// A change to anything placement depends on removes every instance so
    /// that the next pass places them again.
    pub async fn update(self: &Arc<Self>, id: Uuid, patch: ModelSpecPatch) -> FleetResult<ModelSpec> {
        let lock = self.spec_lock(id).await;
        let guard = lock.lock().await;

        let mut effect = PatchEffect::default();
        let estimator = Arc::clone(&self.estimator);
        let spec = self
            .store
            .update_spec(id, |spec| {
                effect = patch.apply(spec);
                prepare_spec(spec)?;
                estimator.estimate(spec)?;
                spec.updated_at = Utc::now();
                Ok(())
            })
            .await?;

        info!(
            model_id = %id,
            replicas_changed = effect.replicas_changed,
            placement_changed = effect.placement_changed,
            "Updated model"
        );

        if effect.placement_changed {
            for instance in self.store.instances_of(id).await? {
                self.remove_instance(&instance).await;
            }
        }
        drop(guard);

        if effect.placement_changed || effect.replicas_changed {
            self.trigger(id).await;
        }
        Ok(spec)
    }

    /// Delete a spec, cancelling its reconciliation and removing its instances
    pub async fn delete(&self, id: Uuid) -> FleetResult<ModelSpec> {
        if let Some(task) = self.tasks.lock().await.remove(&id) {
            let _ = task.cancel.send(true);
        }

        let lock = self.spec_lock(id).await;
        let guard = lock.lock().await;
        let (spec, removed) = self.store.delete_spec(id).await?;
        for instance in &removed {
            self.supervisor.instance_removed(instance).await;
            self.ledger.release(instance.id).await;
        }
        drop(guard);
        self.spec_locks.lock().await.remove(&id);

        info!(
            model_id = %id,
            name = %spec.name,
            instances = removed.len(),
            "Deleted model"
        );
        Ok(spec)
    }

    /// Bring the number of instances of `id` to its desired replica count
    pub async fn reconcile(&self, id: Uuid) -> FleetResult<ReconcileOutcome> {
        let lock = self.spec_lock(id).await;
        let _guard = lock.lock().await;

        let spec = self.store.get_spec(id).await?;
        let mut outcome = ReconcileOutcome::default();
        let mut instances = self.store.instances_of(id).await?;
        let desired = spec.replicas as usize;

        if instances.len() > desired {
            instances.sort_by(|a, b| {
                victim_rank(a.state)
                    .cmp(&victim_rank(b.state))
                    .then(b.created_at.cmp(&a.created_at))
            });
            let excess = instances.len() - desired;
            for victim in instances.drain(..excess) {
                info!(
                    instance_id = %victim.id,
                    name = %victim.name,
                    state = %victim.state,
                    "Scaling down instance"
                );
                self.remove_instance(&victim).await;
                outcome.deleted += 1;
            }
        }

        for instance in instances.iter().filter(|i| !i.is_placed()) {
            if self.place(&spec, instance.id).await? {
                outcome.placed += 1;
            } else {
                outcome.pending += 1;
            }
        }

        for _ in instances.len()..desired {
            let instance = self.create_instance(&spec).await?;
            outcome.created += 1;
            if self.place(&spec, instance.id).await? {
                outcome.placed += 1;
            } else {
                outcome.pending += 1;
            }
        }

        let ready = self
            .store
            .instances_of(id)
            .await?
            .iter()
            .filter(|i| i.state == InstanceState::Running)
            .count() as u32;
        if spec.ready_replicas != ready {
            self.store
                .update_spec(id, |s| {
                    s.ready_replicas = ready;
                    Ok(())
                })
                .await?;
        }
        outcome.ready_replicas = ready;

        if outcome.changed() {
            debug!(model_id = %id, outcome = ?outcome, "Reconciled model");
        }
        Ok(outcome)
    }

    /// Spawn reconciliation tasks for every stored spec
    pub async fn start(self: &Arc<Self>) {
        self.started.store(true, Ordering::SeqCst);
        let specs = self.store.list_specs().await;
        for spec in &specs {
            self.trigger(spec.id).await;
        }
        info!(models = specs.len(), "Scheduler started");
    }

    /// Cancel every reconciliation task and wait for them to finish
    pub async fn shutdown(&self) {
        self.started.store(false, Ordering::SeqCst);
        let tasks: Vec<SpecTask> = self.tasks.lock().await.drain().map(|(_, t)| t).collect();
        for task in &tasks {
            let _ = task.cancel.send(true);
        }
        for task in tasks {
            let _ = task.handle.await;
        }
        info!("Scheduler stopped");
    }

    async fn trigger(self: &Arc<Self>, id: Uuid) {
        if !self.started.load(Ordering::SeqCst) {
            return;
        }
        let mut tasks = self.tasks.lock().await;
        if let Some(task) = tasks.get(&id) {
            task.notify.notify_one();
            return;
        }
        let notify = Arc::new(Notify::new());
        let (cancel, cancel_rx) = watch::channel(false);
        let handle = tokio::spawn(reconcile_loop(
            Arc::clone(self),
            id,
            Arc::clone(&notify),
            cancel_rx,
        ));
        tasks.insert(
            id,
            SpecTask {
                notify,
                cancel,
                handle,
            },
        );
    }

    async fn spec_lock(&self, id: Uuid) -> Arc<Mutex<()>> {
        let mut locks = self.spec_locks.lock().await;
        Arc::clone(locks.entry(id).or_default())
    }

    async fn create_instance(&self, spec: &ModelSpec) -> FleetResult<ModelInstance> {
        for _ in 0..NAME_ATTEMPTS {
            let name = format!("{}-{}", spec.name, name_suffix());
            match self.store.create_instance(ModelInstance::new(spec, name)).await {
                Ok(instance) => {
                    return self
                        .store
                        .update_instance(instance.id, |i| i.transition(InstanceState::Pending, None))
                        .await;
                }
                Err(FleetError::Conflict(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        Err(FleetError::Conflict(format!(
            "no free instance name for model {} after {} attempts",
            spec.name, NAME_ATTEMPTS
        )))
    }

    /// Try to place one instance. `Ok(false)` leaves it pending with the reason.
    async fn place(&self, spec: &ModelSpec, instance_id: Uuid) -> FleetResult<bool> {
        let estimate = self.estimator.estimate(spec)?;
        let mut last_error: Option<FleetError> = None;

        for attempt in 1..=self.config.max_placement_attempts.max(1) {
            let snapshot = self.ledger.snapshot().await;
            let plan = match placement::plan(spec, estimate, &snapshot) {
                Ok(plan) => plan,
                Err(e) => {
                    last_error = Some(e);
                    break;
                }
            };
            match self.ledger.reserve(instance_id, spec.id, &plan).await {
                Ok(()) => {
                    self.commit(spec, instance_id, plan).await?;
                    return Ok(true);
                }
                Err(e) => {
                    debug!(
                        instance_id = %instance_id,
                        attempt = attempt,
                        error = %e,
                        "Reservation lost a race, planning again"
                    );
                    last_error = Some(e);
                }
            }
        }

        let message = match last_error {
            Some(e) => e.to_string(),
            None => "no placement found".to_string(),
        };
        warn!(
            model = %spec.name,
            instance_id = %instance_id,
            error = %message,
            "Failed to schedule instance"
        );
        self.store
            .update_instance(instance_id, |i| {
                if i.state == InstanceState::Initializing {
                    i.transition(InstanceState::Pending, None)?;
                }
                i.state_message = Some(message);
                Ok(())
            })
            .await?;
        Ok(false)
    }

    async fn commit(&self, spec: &ModelSpec, instance_id: Uuid, plan: PlacementPlan) -> FleetResult<()> {
        let servers = self.coordinator.servers_for(&spec.resolved_backend(), &plan);
        let main = plan.main;

        let result = self
            .store
            .update_instance(instance_id, move |i| {
                if i.state == InstanceState::Initializing {
                    i.transition(InstanceState::Pending, None)?;
                }
                i.worker_id = Some(main.worker_id);
                i.worker_name = Some(main.worker_name.clone());
                i.worker_ip = Some(main.worker_ip.clone());
                i.gpu_indexes = main.gpu_indexes();
                i.gpu_addresses = main.gpu_addresses;
                i.computed_resource_claim = Some(main.claim);
                i.distributed_servers = servers;
                i.state_message = None;
                i.updated_at = Utc::now();
                Ok(())
            })
            .await;

        match result {
            Ok(instance) => {
                info!(
                    instance_id = %instance.id,
                    name = %instance.name,
                    worker = instance.worker_name.as_deref().unwrap_or_default(),
                    gpus = ?instance.gpu_indexes,
                    subordinates = instance.subordinates().len(),
                    "Placed instance"
                );
                self.supervisor.instance_placed(&instance).await;
                Ok(())
            }
            Err(e) => {
                self.ledger.release(instance_id).await;
                Err(e)
            }
        }
    }

    async fn remove_instance(&self, instance: &ModelInstance) {
        self.supervisor.instance_removed(instance).await;
        match self.store.delete_instance(instance.id).await {
            Ok(_) | Err(FleetError::NotFound { .. }) => {}
            Err(e) => warn!(instance_id = %instance.id, error = %e, "Failed to delete instance"),
        }
        self.ledger.release(instance.id).await;
    }
}

/// Scale-down order: broken instances go first, serving ones last
fn victim_rank(state: InstanceState) -> u8 {
    match state {
        InstanceState::Error => 0,
        InstanceState::Unreachable => 1,
        InstanceState::Initializing | InstanceState::Pending => 2,
        InstanceState::Downloading | InstanceState::Analyzing => 3,
        InstanceState::Starting => 4,
        InstanceState::Scheduled => 5,
        InstanceState::Running => 6,
    }
}

fn name_suffix() -> String {
    Uuid::new_v4().simple().to_string()[..6].to_string()
}

async fn reconcile_loop(
    scheduler: Arc<Scheduler>,
    id: Uuid,
    notify: Arc<Notify>,
    mut cancel: watch::Receiver<bool>,
) {
    let interval = scheduler.config.reconcile_interval();
    loop {
        match scheduler.reconcile(id).await {
            Ok(_) => {}
            Err(FleetError::NotFound { .. }) => {
                debug!(model_id = %id, "Model gone, stopping reconciliation");
                break;
            }
            Err(e) => warn!(model_id = %id, error = %e, "Reconciliation failed"),
        }

        tokio::select! {
            _ = notify.notified() => {}
            _ = tokio::time::sleep(interval) => {}
            _ = cancel.changed() => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gpufleet_core::{Backend, ModelSource, Worker};
    use std::sync::Mutex as StdMutex;

    const GIB: u64 = 1 << 30;

    #[derive(Default)]
    struct Recorder {
        placed: StdMutex<Vec<Uuid>>,
        removed: StdMutex<Vec<Uuid>>,
    }

    #[async_trait]
    impl InstanceSupervisor for Recorder {
        async fn instance_placed(&self, instance: &ModelInstance) {
            self.placed.lock().unwrap().push(instance.id);
        }
        async fn instance_removed(&self, instance: &ModelInstance) {
            self.removed.lock().unwrap().push(instance.id);
        }
    }

    async fn scheduler(workers: Vec<Worker>) -> (Arc<Scheduler>, Arc<Recorder>) {
        let store = Arc::new(Store::new());
        let ledger = Arc::new(CapacityLedger::from_workers(workers).await);
        let recorder = Arc::new(Recorder::default());
        let scheduler = Scheduler::new(store, ledger, SchedulerConfig::default())
            .with_supervisor(recorder.clone());
        (Arc::new(scheduler), recorder)
    }

    fn spec(name: &str, vram: &str, replicas: u32) -> ModelSpec {
        let mut spec = ModelSpec::new(
            name,
            ModelSource::huggingface("Qwen/Qwen2-0.5B-Instruct", None).unwrap(),
        );
        spec.meta.insert("vram".to_string(), serde_json::json!(vram));
        spec.meta.insert("ram".to_string(), serde_json::json!("256Mi"));
        spec.replicas = replicas;
        spec
    }

    #[tokio::test]
    async fn test_create_validates() {
        let (scheduler, _) = scheduler(vec![]).await;
        let mut bad = spec("bad", "1Gi", 1);
        bad.backend = Some(Backend::Vllm);
        bad.cpu_offloading = Some(true);
        let err = scheduler.create(bad).await.unwrap_err();
        assert!(matches!(err, FleetError::Validation(_)));
        assert!(scheduler.store().list_specs().await.is_empty());
    }

    #[tokio::test]
    async fn test_create_applies_defaults() {
        let (scheduler, _) = scheduler(vec![]).await;
        let created = scheduler.create(spec("qwen", "1Gi", 1)).await.unwrap();
        assert_eq!(created.cpu_offloading, Some(false));
        assert_eq!(created.distributed_inference_across_workers, Some(true));
    }

    #[tokio::test]
    async fn test_reconcile_places_replicas() {
        let worker = Worker::new("w1", "10.0.0.1", 64 * GIB).with_gpu(24 * GIB);
        let (scheduler, recorder) = scheduler(vec![worker]).await;
        let created = scheduler.create(spec("qwen", "4Gi", 2)).await.unwrap();

        let outcome = scheduler.reconcile(created.id).await.unwrap();
        assert_eq!(outcome.created, 2);
        assert_eq!(outcome.placed, 2);

        let instances = scheduler.store().instances_of(created.id).await.unwrap();
        assert_eq!(instances.len(), 2);
        for instance in &instances {
            assert_eq!(instance.state, InstanceState::Pending);
            assert!(instance.name.starts_with("qwen-"));
            assert_eq!(instance.name.len(), "qwen-".len() + 6);
            assert_eq!(instance.worker_name.as_deref(), Some("w1"));
            assert!(instance.computed_resource_claim.is_some());
        }
        assert_eq!(recorder.placed.lock().unwrap().len(), 2);

        let again = scheduler.reconcile(created.id).await.unwrap();
        assert!(!again.changed());
    }

    #[tokio::test]
    async fn test_unschedulable_stays_pending_then_places() {
        let (scheduler, _) = scheduler(vec![]).await;
        let created = scheduler.create(spec("qwen", "4Gi", 1)).await.unwrap();

        let outcome = scheduler.reconcile(created.id).await.unwrap();
        assert_eq!(outcome.pending, 1);
        let instance = &scheduler.store().instances_of(created.id).await.unwrap()[0];
        assert_eq!(instance.state, InstanceState::Pending);
        assert!(!instance.is_placed());
        assert!(instance.state_message.is_some());

        scheduler
            .ledger()
            .upsert_worker(Worker::new("w1", "10.0.0.1", 64 * GIB).with_gpu(24 * GIB))
            .await;
        let outcome = scheduler.reconcile(created.id).await.unwrap();
        assert_eq!(outcome.placed, 1);
        assert_eq!(outcome.created, 0);
        let instance = &scheduler.store().instances_of(created.id).await.unwrap()[0];
        assert!(instance.is_placed());
        assert!(instance.state_message.is_none());
    }

    #[tokio::test]
    async fn test_scale_down_removes_broken_first() {
        let worker = Worker::new("w1", "10.0.0.1", 64 * GIB).with_gpu(24 * GIB);
        let (scheduler, recorder) = scheduler(vec![worker.clone()]).await;
        let created = scheduler.create(spec("qwen", "4Gi", 3)).await.unwrap();
        scheduler.reconcile(created.id).await.unwrap();

        let instances = scheduler.store().instances_of(created.id).await.unwrap();
        let broken = instances[1].id;
        scheduler
            .store()
            .update_instance(broken, |i| {
                i.fail("exit code 1");
                Ok(())
            })
            .await
            .unwrap();

        scheduler
            .update(
                created.id,
                ModelSpecPatch {
                    replicas: Some(2),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let outcome = scheduler.reconcile(created.id).await.unwrap();
        assert_eq!(outcome.deleted, 1);
        assert_eq!(*recorder.removed.lock().unwrap(), vec![broken]);

        let free = scheduler.ledger().allocatable(worker.id).await.unwrap();
        assert_eq!(free.vram[&0], 16 * GIB);
    }

    #[tokio::test]
    async fn test_placement_change_recreates_instances() {
        let worker = Worker::new("w1", "10.0.0.1", 64 * GIB).with_gpu(24 * GIB);
        let (scheduler, _) = scheduler(vec![worker]).await;
        let created = scheduler.create(spec("qwen", "4Gi", 1)).await.unwrap();
        scheduler.reconcile(created.id).await.unwrap();
        let before = scheduler.store().instances_of(created.id).await.unwrap()[0].id;

        let mut meta = created.meta.clone();
        meta.insert("vram".to_string(), serde_json::json!("8Gi"));
        scheduler
            .update(
                created.id,
                ModelSpecPatch {
                    meta: Some(meta),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(scheduler
            .store()
            .instances_of(created.id)
            .await
            .unwrap()
            .is_empty());

        scheduler.reconcile(created.id).await.unwrap();
        let after = &scheduler.store().instances_of(created.id).await.unwrap()[0];
        assert_ne!(after.id, before);
        assert_eq!(after.computed_resource_claim.as_ref().unwrap().total_vram(), 8 * GIB);
    }

    #[tokio::test]
    async fn test_invalid_update_is_rejected() {
        let (scheduler, _) = scheduler(vec![]).await;
        let created = scheduler.create(spec("qwen", "4Gi", 1)).await.unwrap();
        let err = scheduler
            .update(
                created.id,
                ModelSpecPatch {
                    cpu_offloading: Some(true),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, FleetError::Validation(_)));
        let stored = scheduler.store().get_spec(created.id).await.unwrap();
        assert_eq!(stored.cpu_offloading, Some(false));
    }

    #[tokio::test]
    async fn test_delete_cascades_and_releases() {
        let worker = Worker::new("w1", "10.0.0.1", 64 * GIB).with_gpu(24 * GIB);
        let (scheduler, recorder) = scheduler(vec![worker.clone()]).await;
        let created = scheduler.create(spec("qwen", "4Gi", 2)).await.unwrap();
        scheduler.reconcile(created.id).await.unwrap();

        scheduler.delete(created.id).await.unwrap();
        assert!(scheduler.store().list_instances().await.is_empty());
        assert_eq!(recorder.removed.lock().unwrap().len(), 2);
        assert_eq!(
            scheduler.ledger().allocatable(worker.id).await.unwrap().vram[&0],
            24 * GIB
        );
        assert!(matches!(
            scheduler.reconcile(created.id).await,
            Err(FleetError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_ready_replicas_recomputed() {
        let worker = Worker::new("w1", "10.0.0.1", 64 * GIB).with_gpu(24 * GIB);
        let (scheduler, _) = scheduler(vec![worker]).await;
        let created = scheduler.create(spec("qwen", "4Gi", 1)).await.unwrap();
        scheduler.reconcile(created.id).await.unwrap();

        let id = scheduler.store().instances_of(created.id).await.unwrap()[0].id;
        for state in [
            InstanceState::Analyzing,
            InstanceState::Starting,
            InstanceState::Running,
        ] {
            scheduler
                .store()
                .update_instance(id, |i| i.transition(state, None))
                .await
                .unwrap();
        }

        let outcome = scheduler.reconcile(created.id).await.unwrap();
        assert_eq!(outcome.ready_replicas, 1);
        assert_eq!(
            scheduler.store().get_spec(created.id).await.unwrap().ready_replicas,
            1
        );
    }

    #[tokio::test]
    async fn test_background_task_reconciles_after_start() {
        let worker = Worker::new("w1", "10.0.0.1", 64 * GIB).with_gpu(24 * GIB);
        let (scheduler, _) = scheduler(vec![worker]).await;
        scheduler.start().await;
        let created = scheduler.create(spec("qwen", "4Gi", 1)).await.unwrap();

        let mut placed = false;
        for _ in 0..100 {
            let instances = scheduler.store().instances_of(created.id).await.unwrap();
            if instances.iter().any(|i| i.is_placed()) {
                placed = true;
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert!(placed);
        scheduler.shutdown().await;
    }
}
