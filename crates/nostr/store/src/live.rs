//! Live queries and event streams.
//!
//! Every distinct [`Selector`] signature owns one [`Model`]: the current
//! result plus the subscribers it fans out to. Mutations recompute only the
//! models they can affect, and subscribers receive a new snapshot only when
//! the result actually changed.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::pin::Pin;
use std::sync::{Arc, PoisonError, RwLock, Weak};
use std::task::{Context, Poll};

use futures_util::Stream;
use nostr::{Coordinate, Event, Filter, filters_signature};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use crate::error::Result;
use crate::index::EventIndex;
use crate::store::Shared;

/// Result of a live query: matching events, newest first.
pub type Snapshot = Arc<Vec<Arc<Event>>>;

/// What a live query watches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selector {
    /// Events matching any of the filters.
    Timeline(Vec<Filter>),
    /// A single event by id.
    Event(String),
    /// The current version of a replaceable or addressable coordinate.
    Replaceable(Coordinate),
}

impl Selector {
    /// Canonical key. Selectors with equal signatures share one computation.
    pub fn signature(&self) -> String {
        match self {
            Self::Timeline(filters) => format!("timeline:{}", filters_signature(filters)),
            Self::Event(id) => format!("event:{id}"),
            Self::Replaceable(coordinate) => format!("replaceable:{coordinate}"),
        }
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if let Self::Timeline(filters) = self {
            for filter in filters {
                filter.validate()?;
            }
        }
        Ok(())
    }

    fn evaluate(&self, index: &EventIndex, now: u64) -> Snapshot {
        let events = match self {
            // Filters were validated at subscription time.
            Self::Timeline(filters) => index.timeline(filters, now).unwrap_or_default(),
            Self::Event(id) => index.get(id, now).into_iter().collect(),
            Self::Replaceable(coordinate) => {
                index.get_replaceable(coordinate, now).into_iter().collect()
            }
        };
        Arc::new(events)
    }

    fn affected_by(&self, event: &Event, index: &EventIndex) -> bool {
        match self {
            Self::Timeline(filters) => filters.iter().any(|filter| filter.matches(event)),
            Self::Event(id) => event.id == *id,
            Self::Replaceable(coordinate) => {
                index.coordinate_of(event).as_ref() == Some(coordinate)
            }
        }
    }
}

#[derive(Debug)]
struct Model {
    selector: Selector,
    current: Snapshot,
    subscribers: HashMap<u64, UnboundedSender<Snapshot>>,
}

#[derive(Debug)]
struct StreamEntry {
    filters: Vec<Filter>,
    sender: UnboundedSender<Arc<Event>>,
}

/// Models and streams of one store. Lives under the store lock.
#[derive(Debug, Default)]
pub(crate) struct Registry {
    next_id: u64,
    models: HashMap<String, Model>,
    streams: HashMap<u64, StreamEntry>,
}

impl Registry {
    fn allocate_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    pub(crate) fn model_count(&self) -> usize {
        self.models.len()
    }

    /// Register a subscriber. Its channel already holds the snapshot at `now`;
    /// a shared model that went stale is pushed to its existing subscribers first.
    pub(crate) fn subscribe(
        &mut self,
        selector: Selector,
        index: &EventIndex,
        now: u64,
    ) -> (u64, String, UnboundedReceiver<Snapshot>) {
        let id = self.allocate_id();
        let signature = selector.signature();
        let (sender, receiver) = mpsc::unbounded_channel();

        let model = match self.models.entry(signature.clone()) {
            Entry::Vacant(entry) => entry.insert(Model {
                current: selector.evaluate(index, now),
                selector,
                subscribers: HashMap::new(),
            }),
            Entry::Occupied(entry) => {
                // Expirations since the last touching mutation have not been
                // applied to the cached result yet.
                let model = entry.into_mut();
                let fresh = model.selector.evaluate(index, now);
                if !same_events(&model.current, &fresh) {
                    model.current = fresh;
                    model
                        .subscribers
                        .retain(|_, existing| existing.send(Arc::clone(&model.current)).is_ok());
                }
                model
            }
        };
        let _ = sender.send(Arc::clone(&model.current));
        model.subscribers.insert(id, sender);

        (id, signature, receiver)
    }

    pub(crate) fn unsubscribe(&mut self, signature: &str, id: u64) {
        if let Some(model) = self.models.get_mut(signature) {
            model.subscribers.remove(&id);
            if model.subscribers.is_empty() {
                self.models.remove(signature);
            }
        }
    }

    pub(crate) fn add_stream(&mut self, filters: Vec<Filter>) -> (u64, UnboundedReceiver<Arc<Event>>) {
        let id = self.allocate_id();
        let (sender, receiver) = mpsc::unbounded_channel();
        self.streams.insert(id, StreamEntry { filters, sender });
        (id, receiver)
    }

    pub(crate) fn remove_stream(&mut self, id: u64) {
        self.streams.remove(&id);
    }

    /// Recompute the models touched by `changed` and push changed results.
    pub(crate) fn refresh(&mut self, changed: &[Arc<Event>], index: &EventIndex, now: u64) {
        for model in self.models.values_mut() {
            if !changed
                .iter()
                .any(|event| model.selector.affected_by(event, index))
            {
                continue;
            }
            let next = model.selector.evaluate(index, now);
            if same_events(&model.current, &next) {
                continue;
            }
            model.current = next;
            model
                .subscribers
                .retain(|_, sender| sender.send(Arc::clone(&model.current)).is_ok());
        }
    }

    /// Forward a newly accepted event to the matching streams.
    pub(crate) fn publish(&mut self, event: &Arc<Event>) {
        self.streams.retain(|_, stream| {
            if stream.filters.iter().any(|filter| filter.matches(event)) {
                stream.sender.send(Arc::clone(event)).is_ok()
            } else {
                !stream.sender.is_closed()
            }
        });
    }
}

fn same_events(a: &[Arc<Event>], b: &[Arc<Event>]) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(a, b)| a.id == b.id)
}

/// Handle to a live query.
///
/// Yields the result at subscription time first, then one snapshot per
/// mutation that changed the result. Dropping the handle unsubscribes.
#[derive(Debug)]
pub struct LiveQuery {
    id: u64,
    signature: String,
    receiver: UnboundedReceiver<Snapshot>,
    shared: Weak<RwLock<Shared>>,
}

impl LiveQuery {
    pub(crate) fn new(
        id: u64,
        signature: String,
        receiver: UnboundedReceiver<Snapshot>,
        shared: Weak<RwLock<Shared>>,
    ) -> Self {
        Self {
            id,
            signature,
            receiver,
            shared,
        }
    }

    pub fn signature(&self) -> &str {
        &self.signature
    }

    /// Wait for the next snapshot. `None` once the store is gone.
    pub async fn next(&mut self) -> Option<Snapshot> {
        self.receiver.recv().await
    }

    /// Next snapshot if one is already queued.
    pub fn try_next(&mut self) -> Option<Snapshot> {
        self.receiver.try_recv().ok()
    }
}

impl Stream for LiveQuery {
    type Item = Snapshot;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().receiver.poll_recv(cx)
    }
}

impl Drop for LiveQuery {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.upgrade() {
            let mut shared = shared.write().unwrap_or_else(PoisonError::into_inner);
            shared.live.unsubscribe(&self.signature, self.id);
        }
    }
}

/// Newly accepted events matching a filter set, ephemeral events included.
#[derive(Debug)]
pub struct EventStream {
    id: u64,
    receiver: UnboundedReceiver<Arc<Event>>,
    shared: Weak<RwLock<Shared>>,
}

impl EventStream {
    pub(crate) fn new(
        id: u64,
        receiver: UnboundedReceiver<Arc<Event>>,
        shared: Weak<RwLock<Shared>>,
    ) -> Self {
        Self {
            id,
            receiver,
            shared,
        }
    }

    pub async fn next(&mut self) -> Option<Arc<Event>> {
        self.receiver.recv().await
    }

    pub fn try_next(&mut self) -> Option<Arc<Event>> {
        self.receiver.try_recv().ok()
    }
}

impl Stream for EventStream {
    type Item = Arc<Event>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().receiver.poll_recv(cx)
    }
}

impl Drop for EventStream {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.upgrade() {
            let mut shared = shared.write().unwrap_or_else(PoisonError::into_inner);
            shared.live.remove_stream(self.id);
        }
    }
}
