//! Shared, thread-safe event store with live queries.

use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use async_trait::async_trait;
use nostr::{Coordinate, DatabaseError, Event, EventDatabase, Filter, StorageVector};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, trace};

use crate::config::{Clock, StoreConfig, SystemClock};
use crate::error::Result;
use crate::index::{AddOutcome, EventIndex};
use crate::live::{EventStream, LiveQuery, Registry, Selector};

#[derive(Debug)]
pub(crate) struct Shared {
    pub(crate) index: EventIndex,
    pub(crate) live: Registry,
}

/// In-memory event store.
///
/// Cloning is cheap and every clone sees the same events. Mutations are
/// serialized behind a write lock; reads run concurrently and always observe
/// a complete mutation. Live queries are refreshed inside the mutation that
/// changed them, so subscribers see updates in mutation order.
#[derive(Debug, Clone)]
pub struct Store {
    shared: Arc<RwLock<Shared>>,
    clock: Arc<dyn Clock>,
}

impl Default for Store {
    fn default() -> Self {
        Self::new(StoreConfig::default())
    }
}

impl Store {
    pub fn new(config: StoreConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: StoreConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            shared: Arc::new(RwLock::new(Shared {
                index: EventIndex::new(config),
                live: Registry::default(),
            })),
            clock,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Shared> {
        self.shared.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Shared> {
        self.shared.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn now(&self) -> u64 {
        self.clock.now()
    }

    pub fn len(&self) -> usize {
        self.read().index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().index.is_empty()
    }

    /// Number of distinct live computations currently shared by subscribers.
    pub fn model_count(&self) -> usize {
        self.read().live.model_count()
    }

    pub fn add(&self, event: Event) -> Result<AddOutcome> {
        let now = self.clock.now();
        let event = Arc::new(event);

        let mut guard = self.write();
        let shared = &mut *guard;
        let outcome = shared.index.add(Arc::clone(&event), now)?;

        match &outcome {
            AddOutcome::Inserted { replaced, deleted } => {
                let mut changed = Vec::with_capacity(2 + deleted.len());
                changed.push(Arc::clone(&event));
                changed.extend(replaced.iter().cloned());
                changed.extend(deleted.iter().cloned());
                shared.live.refresh(&changed, &shared.index, now);
                shared.live.publish(&event);
                trace!(id = %event.id, kind = event.kind, "event stored");
            }
            AddOutcome::Ephemeral => shared.live.publish(&event),
            AddOutcome::Rejected(reason) => {
                trace!(id = %event.id, ?reason, "event rejected");
            }
        }

        Ok(outcome)
    }

    /// Hard removal. Returns whether the event was stored.
    pub fn remove(&self, id: &str) -> bool {
        let now = self.clock.now();
        let mut guard = self.write();
        let shared = &mut *guard;

        match shared.index.remove(id) {
            Some(event) => {
                shared.live.refresh(&[event], &shared.index, now);
                true
            }
            None => false,
        }
    }

    pub fn get(&self, id: &str) -> Option<Arc<Event>> {
        self.read().index.get(id, self.clock.now())
    }

    pub fn get_replaceable(&self, coordinate: &Coordinate) -> Option<Arc<Event>> {
        self.read()
            .index
            .get_replaceable(coordinate, self.clock.now())
    }

    pub fn replaceable_history(&self, coordinate: &Coordinate) -> Vec<Arc<Event>> {
        self.read()
            .index
            .replaceable_history(coordinate, self.clock.now())
    }

    /// One-shot query, newest first.
    pub fn timeline(&self, filters: &[Filter]) -> Result<Vec<Arc<Event>>> {
        self.read().index.timeline(filters, self.clock.now())
    }

    pub fn count(&self, filters: &[Filter]) -> Result<usize> {
        self.read().index.count(filters, self.clock.now())
    }

    pub fn storage_vector(&self, filter: &Filter) -> Result<StorageVector> {
        self.read().index.storage_vector(filter, self.clock.now())
    }

    /// Evict expired events and notify the live queries that contained them.
    pub fn prune_expired(&self) -> Vec<Arc<Event>> {
        let now = self.clock.now();
        let mut guard = self.write();
        let shared = &mut *guard;

        let pruned = shared.index.prune_expired(now);
        if !pruned.is_empty() {
            shared.live.refresh(&pruned, &shared.index, now);
        }
        pruned
    }

    pub fn subscribe(&self, selector: Selector) -> Result<LiveQuery> {
        selector.validate()?;
        let now = self.clock.now();

        let mut guard = self.write();
        let shared = &mut *guard;
        let (id, signature, receiver) = shared.live.subscribe(selector, &shared.index, now);
        drop(guard);

        debug!(%signature, "live query subscribed");
        Ok(LiveQuery::new(
            id,
            signature,
            receiver,
            Arc::downgrade(&self.shared),
        ))
    }

    /// Live timeline query.
    pub fn query(&self, filters: Vec<Filter>) -> Result<LiveQuery> {
        self.subscribe(Selector::Timeline(filters))
    }

    /// Stream of events accepted from now on that match any of `filters`.
    pub fn stream(&self, filters: Vec<Filter>) -> Result<EventStream> {
        for filter in &filters {
            filter.validate()?;
        }
        let (id, receiver) = self.write().live.add_stream(filters);
        Ok(EventStream::new(id, receiver, Arc::downgrade(&self.shared)))
    }

    /// Periodically evict expired events until the task is aborted or the
    /// store is dropped.
    pub fn spawn_expiration_sweeper(&self, period: Duration) -> JoinHandle<()> {
        let shared = Arc::downgrade(&self.shared);
        let clock = Arc::clone(&self.clock);
        let period = period.max(Duration::from_millis(1));

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(shared) = shared.upgrade() else {
                    break;
                };
                let store = Store {
                    shared,
                    clock: Arc::clone(&clock),
                };
                let pruned = store.prune_expired();
                if !pruned.is_empty() {
                    debug!(count = pruned.len(), "swept expired events");
                }
            }
        })
    }
}

#[async_trait]
impl EventDatabase for Store {
    async fn save_event(&self, event: &Event) -> std::result::Result<bool, DatabaseError> {
        Ok(self.add(event.clone())?.is_inserted())
    }

    async fn has_event(&self, id: &str) -> std::result::Result<bool, DatabaseError> {
        Ok(self.get(id).is_some())
    }

    async fn event_by_id(&self, id: &str) -> std::result::Result<Option<Event>, DatabaseError> {
        Ok(self.get(id).map(|event| Event::clone(&event)))
    }

    async fn negentropy_items(
        &self,
        filter: &Filter,
    ) -> std::result::Result<StorageVector, DatabaseError> {
        Ok(self.storage_vector(filter)?)
    }
}
