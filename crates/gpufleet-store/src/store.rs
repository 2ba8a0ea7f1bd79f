//! In-memory entity store
//!
//! Holds model specs and model instances with the invariants the control
//! plane relies on:
//! - spec names and instance names are unique
//! - every instance belongs to exactly one spec, and the spec record owns the
//!   set of its instance ids; deleting a spec removes its instances
//! - every mutation is published to watchers before the call returns

use futures::stream::BoxStream;
use futures::FutureExt;
use gpufleet_core::{FleetError, FleetResult, ModelInstance, ModelSpec};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tracing::debug;
use uuid::Uuid;

use crate::watch::{self, Entity, EventType, WatchEvent, WatchFilter};

const WATCH_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
struct SpecRecord {
    spec: ModelSpec,
    instances: BTreeSet<Uuid>,
}

#[derive(Default)]
struct Inner {
    specs: HashMap<Uuid, SpecRecord>,
    instances: HashMap<Uuid, ModelInstance>,
}

impl Inner {
    fn spec_name_taken(&self, name: &str, except: Option<Uuid>) -> bool {
        self.specs
            .values()
            .any(|r| r.spec.name == name && Some(r.spec.id) != except)
    }

    fn instance_name_taken(&self, name: &str, except: Option<Uuid>) -> bool {
        self.instances
            .values()
            .any(|i| i.name == name && Some(i.id) != except)
    }

    fn entities(&self) -> Vec<Entity> {
        let mut entities: Vec<Entity> = self
            .specs
            .values()
            .map(|r| Entity::Model(r.spec.clone()))
            .collect();
        entities.extend(
            self.instances
                .values()
                .map(|i| Entity::ModelInstance(i.clone())),
        );
        entities
    }
}

/// Entity store shared by the scheduler and the lifecycle manager
pub struct Store {
    inner: Arc<RwLock<Inner>>,
    events: broadcast::Sender<WatchEvent>,
}

impl Store {
    /// Create an empty store
    pub fn new() -> Self {
        Self::with_watch_capacity(WATCH_CAPACITY)
    }

    /// Create an empty store whose watchers may fall `capacity` events behind
    /// before they are resynced
    pub fn with_watch_capacity(capacity: usize) -> Self {
        let (events, _) = broadcast::channel(capacity.max(1));
        Self {
            inner: Arc::new(RwLock::new(Inner::default())),
            events,
        }
    }

    fn resync(&self) -> watch::Resync {
        let inner = Arc::clone(&self.inner);
        Arc::new(move || {
            let inner = Arc::clone(&inner);
            async move { inner.read().await.entities() }.boxed()
        })
    }

    fn publish(&self, event_type: EventType, entity: Entity) {
        // No receivers is fine
        let _ = self.events.send(WatchEvent::new(event_type, entity));
    }

    // ----- model specs -----

    /// Insert a spec; fails with `Conflict` on a duplicate id or name
    pub async fn create_spec(&self, spec: ModelSpec) -> FleetResult<ModelSpec> {
        let mut inner = self.inner.write().await;
        if inner.specs.contains_key(&spec.id) || inner.spec_name_taken(&spec.name, None) {
            return Err(FleetError::Conflict(format!(
                "model '{}' already exists",
                spec.name
            )));
        }
        inner.specs.insert(
            spec.id,
            SpecRecord {
                spec: spec.clone(),
                instances: BTreeSet::new(),
            },
        );
        self.publish(EventType::Created, Entity::Model(spec.clone()));
        debug!(model_id = %spec.id, name = %spec.name, "Stored model");
        Ok(spec)
    }

    pub async fn get_spec(&self, id: Uuid) -> FleetResult<ModelSpec> {
        self.inner
            .read()
            .await
            .specs
            .get(&id)
            .map(|r| r.spec.clone())
            .ok_or_else(|| FleetError::not_found("Model", id))
    }

    pub async fn get_spec_by_name(&self, name: &str) -> FleetResult<ModelSpec> {
        self.inner
            .read()
            .await
            .specs
            .values()
            .find(|r| r.spec.name == name)
            .map(|r| r.spec.clone())
            .ok_or_else(|| FleetError::not_found("Model", name))
    }

    pub async fn list_specs(&self) -> Vec<ModelSpec> {
        let inner = self.inner.read().await;
        let mut specs: Vec<ModelSpec> = inner.specs.values().map(|r| r.spec.clone()).collect();
        specs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.name.cmp(&b.name)));
        specs
    }

    /// Mutate a spec in place. `f` may reject the change; nothing is stored then.
    pub async fn update_spec<F>(&self, id: Uuid, f: F) -> FleetResult<ModelSpec>
    where
        F: FnOnce(&mut ModelSpec) -> FleetResult<()>,
    {
        let mut inner = self.inner.write().await;
        let mut candidate = inner
            .specs
            .get(&id)
            .map(|r| r.spec.clone())
            .ok_or_else(|| FleetError::not_found("Model", id))?;
        f(&mut candidate)?;
        candidate.id = id;
        if inner.spec_name_taken(&candidate.name, Some(id)) {
            return Err(FleetError::Conflict(format!(
                "model '{}' already exists",
                candidate.name
            )));
        }
        if let Some(record) = inner.specs.get_mut(&id) {
            record.spec = candidate.clone();
        }
        self.publish(EventType::Updated, Entity::Model(candidate.clone()));
        Ok(candidate)
    }

    /// Remove a spec and every instance it owns. Returns the removed instances
    /// so the caller can tear down anything they launched.
    pub async fn delete_spec(&self, id: Uuid) -> FleetResult<(ModelSpec, Vec<ModelInstance>)> {
        let mut inner = self.inner.write().await;
        let record = inner
            .specs
            .remove(&id)
            .ok_or_else(|| FleetError::not_found("Model", id))?;

        let mut removed = Vec::with_capacity(record.instances.len());
        for instance_id in &record.instances {
            if let Some(instance) = inner.instances.remove(instance_id) {
                self.publish(EventType::Deleted, Entity::ModelInstance(instance.clone()));
                removed.push(instance);
            }
        }
        self.publish(EventType::Deleted, Entity::Model(record.spec.clone()));
        debug!(model_id = %id, instances = removed.len(), "Deleted model");
        Ok((record.spec, removed))
    }

    // ----- model instances -----

    /// Insert an instance owned by `instance.model_id`
    pub async fn create_instance(&self, instance: ModelInstance) -> FleetResult<ModelInstance> {
        let mut inner = self.inner.write().await;
        if !inner.specs.contains_key(&instance.model_id) {
            return Err(FleetError::not_found("Model", instance.model_id));
        }
        if inner.instances.contains_key(&instance.id)
            || inner.instance_name_taken(&instance.name, None)
        {
            return Err(FleetError::Conflict(format!(
                "model instance '{}' already exists",
                instance.name
            )));
        }
        if let Some(record) = inner.specs.get_mut(&instance.model_id) {
            record.instances.insert(instance.id);
        }
        inner.instances.insert(instance.id, instance.clone());
        self.publish(EventType::Created, Entity::ModelInstance(instance.clone()));
        Ok(instance)
    }

    pub async fn get_instance(&self, id: Uuid) -> FleetResult<ModelInstance> {
        self.inner
            .read()
            .await
            .instances
            .get(&id)
            .cloned()
            .ok_or_else(|| FleetError::not_found("Model instance", id))
    }

    /// Instances owned by a spec, oldest first
    pub async fn instances_of(&self, model_id: Uuid) -> FleetResult<Vec<ModelInstance>> {
        let inner = self.inner.read().await;
        let record = inner
            .specs
            .get(&model_id)
            .ok_or_else(|| FleetError::not_found("Model", model_id))?;
        let mut instances: Vec<ModelInstance> = record
            .instances
            .iter()
            .filter_map(|id| inner.instances.get(id).cloned())
            .collect();
        instances.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(instances)
    }

    pub async fn list_instances(&self) -> Vec<ModelInstance> {
        let inner = self.inner.read().await;
        let mut instances: Vec<ModelInstance> = inner.instances.values().cloned().collect();
        instances.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        instances
    }

    /// Mutate an instance in place. `f` may reject the change; nothing is stored then.
    pub async fn update_instance<F>(&self, id: Uuid, f: F) -> FleetResult<ModelInstance>
    where
        F: FnOnce(&mut ModelInstance) -> FleetResult<()>,
    {
        let mut inner = self.inner.write().await;
        let mut candidate = inner
            .instances
            .get(&id)
            .cloned()
            .ok_or_else(|| FleetError::not_found("Model instance", id))?;
        let model_id = candidate.model_id;
        f(&mut candidate)?;
        candidate.id = id;
        candidate.model_id = model_id;
        if inner.instance_name_taken(&candidate.name, Some(id)) {
            return Err(FleetError::Conflict(format!(
                "model instance '{}' already exists",
                candidate.name
            )));
        }
        inner.instances.insert(id, candidate.clone());
        self.publish(EventType::Updated, Entity::ModelInstance(candidate.clone()));
        Ok(candidate)
    }

    pub async fn delete_instance(&self, id: Uuid) -> FleetResult<ModelInstance> {
        let mut inner = self.inner.write().await;
        let instance = inner
            .instances
            .remove(&id)
            .ok_or_else(|| FleetError::not_found("Model instance", id))?;
        if let Some(record) = inner.specs.get_mut(&instance.model_id) {
            record.instances.remove(&id);
        }
        self.publish(EventType::Deleted, Entity::ModelInstance(instance.clone()));
        Ok(instance)
    }

    // ----- watching -----

    /// Live change events matching `filter`
    pub fn watch(&self, filter: WatchFilter) -> BoxStream<'static, WatchEvent> {
        watch::live_stream(
            self.events.clone(),
            self.events.subscribe(),
            filter,
            self.resync(),
        )
    }

    /// Current matching entities as `created` events, then live changes.
    /// Subscribes before taking the snapshot so no change falls in between.
    pub async fn watch_with_snapshot(&self, filter: WatchFilter) -> BoxStream<'static, WatchEvent> {
        let inner = self.inner.read().await;
        let receiver = self.events.subscribe();
        let snapshot = inner.entities();
        drop(inner);
        watch::snapshot_then_live(
            snapshot,
            self.events.clone(),
            receiver,
            filter,
            self.resync(),
        )
    }
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use gpufleet_core::{InstanceState, ModelSource};

    fn spec(name: &str) -> ModelSpec {
        ModelSpec::new(name, ModelSource::ollama("llama3").unwrap())
    }

    #[tokio::test]
    async fn test_spec_name_conflict() {
        let store = Store::new();
        store.create_spec(spec("llama3")).await.unwrap();
        let err = store.create_spec(spec("llama3")).await.unwrap_err();
        assert!(matches!(err, FleetError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_update_spec_rename_conflict() {
        let store = Store::new();
        store.create_spec(spec("a")).await.unwrap();
        let b = store.create_spec(spec("b")).await.unwrap();
        let err = store
            .update_spec(b.id, |s| {
                s.name = "a".to_string();
                Ok(())
            })
            .await
            .unwrap_err();
        assert!(matches!(err, FleetError::Conflict(_)));
        assert_eq!(store.get_spec(b.id).await.unwrap().name, "b");
    }

    #[tokio::test]
    async fn test_instance_requires_owner() {
        let store = Store::new();
        let orphan = ModelInstance::new(&spec("ghost"), "ghost-000000".to_string());
        let err = store.create_instance(orphan).await.unwrap_err();
        assert!(matches!(err, FleetError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_delete_spec_cascades() {
        let store = Store::new();
        let s = store.create_spec(spec("llama3")).await.unwrap();
        for i in 0..3 {
            let inst = ModelInstance::new(&s, format!("llama3-{:06}", i));
            store.create_instance(inst).await.unwrap();
        }
        assert_eq!(store.instances_of(s.id).await.unwrap().len(), 3);

        let (_, removed) = store.delete_spec(s.id).await.unwrap();
        assert_eq!(removed.len(), 3);
        assert!(store.list_instances().await.is_empty());
        assert!(store.get_spec(s.id).await.is_err());
    }

    #[tokio::test]
    async fn test_failed_update_is_not_stored() {
        let store = Store::new();
        let s = store.create_spec(spec("llama3")).await.unwrap();
        let inst = store
            .create_instance(ModelInstance::new(&s, "llama3-aaaaaa".to_string()))
            .await
            .unwrap();

        let result = store
            .update_instance(inst.id, |i| i.transition(InstanceState::Running, None))
            .await;
        assert!(result.is_err());
        assert_eq!(
            store.get_instance(inst.id).await.unwrap().state,
            InstanceState::Initializing
        );
    }

    #[tokio::test]
    async fn test_watch_sees_every_transition_in_order() {
        let store = Store::new();
        let s = store.create_spec(spec("llama3")).await.unwrap();
        let mut events = store.watch(WatchFilter::instances_of(s.id));

        let inst = store
            .create_instance(ModelInstance::new(&s, "llama3-aaaaaa".to_string()))
            .await
            .unwrap();
        for state in [
            InstanceState::Pending,
            InstanceState::Analyzing,
            InstanceState::Starting,
        ] {
            store
                .update_instance(inst.id, |i| i.transition(state, None))
                .await
                .unwrap();
        }
        store.delete_instance(inst.id).await.unwrap();

        let mut seen = Vec::new();
        for _ in 0..5 {
            let event = events.next().await.unwrap();
            let state = match &event.entity {
                Entity::ModelInstance(i) => i.state,
                Entity::Model(_) => unreachable!(),
            };
            seen.push((event.event_type, state));
        }
        assert_eq!(
            seen,
            vec![
                (EventType::Created, InstanceState::Initializing),
                (EventType::Updated, InstanceState::Pending),
                (EventType::Updated, InstanceState::Analyzing),
                (EventType::Updated, InstanceState::Starting),
                (EventType::Deleted, InstanceState::Starting),
            ]
        );
    }

    #[tokio::test]
    async fn test_watch_with_snapshot() {
        let store = Store::new();
        store.create_spec(spec("a")).await.unwrap();
        let mut events = store.watch_with_snapshot(WatchFilter::models()).await;
        store.create_spec(spec("b")).await.unwrap();

        let first = events.next().await.unwrap();
        assert_eq!(first.entity.name(), "a");
        let second = events.next().await.unwrap();
        assert_eq!(second.entity.name(), "b");
        assert_eq!(second.event_type, EventType::Created);
    }

    #[tokio::test]
    async fn test_lagged_watch_resyncs_to_terminal_state() {
        let store = Store::with_watch_capacity(4);
        let s = store.create_spec(spec("llama3")).await.unwrap();
        let mut events = store.watch(WatchFilter::instances_of(s.id));

        let inst = store
            .create_instance(ModelInstance::new(&s, "llama3-aaaaaa".to_string()))
            .await
            .unwrap();
        store
            .update_instance(inst.id, |i| i.transition(InstanceState::Pending, None))
            .await
            .unwrap();
        for n in 0..8 {
            store
                .update_instance(inst.id, move |i| {
                    i.state_message = Some(format!("waiting {}", n));
                    Ok(())
                })
                .await
                .unwrap();
        }
        store
            .update_instance(inst.id, |i| {
                i.fail("out of memory".to_string());
                Ok(())
            })
            .await
            .unwrap();

        let event = events.next().await.unwrap();
        assert_eq!(event.event_type, EventType::Resync);
        match event.entity {
            Entity::ModelInstance(i) => {
                assert_eq!(i.id, inst.id);
                assert_eq!(i.state, InstanceState::Error);
            }
            Entity::Model(_) => panic!("filter lets only instances through"),
        }

        store.delete_instance(inst.id).await.unwrap();
        let deleted = events.next().await.unwrap();
        assert_eq!(deleted.event_type, EventType::Deleted);
    }
}
