//! Entity change events and watch streams

use futures::future::BoxFuture;
use futures::stream::{self, BoxStream, StreamExt};
use gpufleet_core::{ModelInstance, ModelSpec};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tracing::warn;
use uuid::Uuid;

/// Kind of change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    Created,
    Updated,
    Deleted,
    /// Current state re-sent after the watcher fell behind; changes in
    /// between were dropped, including deletions
    Resync,
}

/// Kind of entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Model,
    ModelInstance,
}

/// The entity as it was right after the change (or right before deletion)
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum Entity {
    Model(ModelSpec),
    ModelInstance(ModelInstance),
}

impl Entity {
    pub fn kind(&self) -> EntityKind {
        match self {
            Entity::Model(_) => EntityKind::Model,
            Entity::ModelInstance(_) => EntityKind::ModelInstance,
        }
    }

    pub fn id(&self) -> Uuid {
        match self {
            Entity::Model(m) => m.id,
            Entity::ModelInstance(i) => i.id,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Entity::Model(m) => &m.name,
            Entity::ModelInstance(i) => &i.name,
        }
    }

    /// Spec the entity belongs to (itself for a spec)
    pub fn model_id(&self) -> Uuid {
        match self {
            Entity::Model(m) => m.id,
            Entity::ModelInstance(i) => i.model_id,
        }
    }
}

/// A single change
#[derive(Debug, Clone, Serialize)]
pub struct WatchEvent {
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub entity: Entity,
}

impl WatchEvent {
    pub fn new(event_type: EventType, entity: Entity) -> Self {
        Self { event_type, entity }
    }
}

/// Which events a watcher wants; empty fields match everything
#[derive(Debug, Clone, Default)]
pub struct WatchFilter {
    pub kind: Option<EntityKind>,
    pub model_id: Option<Uuid>,
    pub name: Option<String>,
}

impl WatchFilter {
    pub fn models() -> Self {
        Self {
            kind: Some(EntityKind::Model),
            ..Default::default()
        }
    }

    pub fn instances_of(model_id: Uuid) -> Self {
        Self {
            kind: Some(EntityKind::ModelInstance),
            model_id: Some(model_id),
            name: None,
        }
    }

    pub fn matches(&self, entity: &Entity) -> bool {
        self.kind.map_or(true, |k| k == entity.kind())
            && self.model_id.map_or(true, |id| id == entity.model_id())
            && self.name.as_deref().map_or(true, |n| n == entity.name())
    }
}

/// Current entities of the store, read when a watcher has to catch up
pub(crate) type Resync = Arc<dyn Fn() -> BoxFuture<'static, Vec<Entity>> + Send + Sync>;

struct Live {
    events: BroadcastStream<WatchEvent>,
    sender: broadcast::Sender<WatchEvent>,
    filter: WatchFilter,
    resync: Resync,
    pending: VecDeque<WatchEvent>,
}

impl Live {
    async fn next(mut self) -> Option<(WatchEvent, Self)> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Some((event, self));
            }
            match self.events.next().await? {
                Ok(event) if self.filter.matches(&event.entity) => return Some((event, self)),
                Ok(_) => {}
                Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                    warn!(skipped = skipped, "Watcher lagged behind, resyncing");
                    // Rejoin at the tail before reading, so nothing after the
                    // snapshot is lost and nothing older is replayed after it
                    self.events = BroadcastStream::new(self.sender.subscribe());
                    let entities = (self.resync)().await;
                    let filter = &self.filter;
                    self.pending.extend(
                        entities
                            .into_iter()
                            .filter(|e| filter.matches(e))
                            .map(|e| WatchEvent::new(EventType::Resync, e)),
                    );
                }
            }
        }
    }
}

/// Live events matching `filter`. A receiver that lags gets the current
/// matching entities as `resync` events and continues from there.
pub(crate) fn live_stream(
    sender: broadcast::Sender<WatchEvent>,
    receiver: broadcast::Receiver<WatchEvent>,
    filter: WatchFilter,
    resync: Resync,
) -> BoxStream<'static, WatchEvent> {
    let live = Live {
        events: BroadcastStream::new(receiver),
        sender,
        filter,
        resync,
        pending: VecDeque::new(),
    };
    stream::unfold(live, Live::next).boxed()
}

/// Current entities as `created` events followed by the live stream, which is
/// what a reconnecting watcher needs to rebuild its view.
pub(crate) fn snapshot_then_live(
    snapshot: Vec<Entity>,
    sender: broadcast::Sender<WatchEvent>,
    receiver: broadcast::Receiver<WatchEvent>,
    filter: WatchFilter,
    resync: Resync,
) -> BoxStream<'static, WatchEvent> {
    let initial: Vec<WatchEvent> = snapshot
        .into_iter()
        .filter(|e| filter.matches(e))
        .map(|e| WatchEvent::new(EventType::Created, e))
        .collect();
    stream::iter(initial)
        .chain(live_stream(sender, receiver, filter, resync))
        .boxed()
}
