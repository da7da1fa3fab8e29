//! Synchronous event index: primary storage, secondary indices, tombstones,
//! expiration and replaceable history.

use std::borrow::Borrow;
use std::cmp::{Ordering, Reverse};
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::hash::Hash;
use std::sync::Arc;

use nostr::{
    Coordinate, DELETION_REQUEST_KIND, DeletionRequest, Event, Filter, KindClassification,
    StorageVector, expiration, is_expired, is_hex_id, supersedes,
};
use tracing::debug;

use crate::config::StoreConfig;
use crate::error::{Result, StoreError};

/// Ordering key of the timeline sets: newest first, then ascending id.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
struct TimelineKey {
    created_at: Reverse<u64>,
    id: String,
}

impl TimelineKey {
    fn of(event: &Event) -> Self {
        Self {
            created_at: Reverse(event.created_at),
            id: event.id.clone(),
        }
    }

    /// Smallest key at `created_at`.
    fn first_at(created_at: u64) -> Self {
        Self {
            created_at: Reverse(created_at),
            id: String::new(),
        }
    }
}

type KeySet = BTreeSet<TimelineKey>;

/// Why an event was not stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// Already stored under the same id.
    Duplicate,
    /// Not newer than the stored version of its coordinate.
    Superseded,
    /// Covered by a deletion request.
    Deleted,
    /// Its expiration timestamp has passed.
    Expired,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddOutcome {
    /// Stored. `replaced` is the previous version of the same coordinate and
    /// `deleted` the events removed by a deletion request.
    Inserted {
        replaced: Option<Arc<Event>>,
        deleted: Vec<Arc<Event>>,
    },
    /// Ephemeral kind: forwarded to live streams, never stored.
    Ephemeral,
    Rejected(RejectReason),
}

impl AddOutcome {
    pub fn is_inserted(&self) -> bool {
        matches!(self, Self::Inserted { .. })
    }

    /// Inserted or forwarded as ephemeral.
    pub fn is_accepted(&self) -> bool {
        !matches!(self, Self::Rejected(_))
    }
}

/// Versioned in-memory event storage.
///
/// Not synchronized; [`Store`](crate::Store) wraps it behind a lock.
#[derive(Debug, Default)]
pub struct EventIndex {
    config: StoreConfig,
    events: HashMap<String, Arc<Event>>,
    replaceable: HashMap<Coordinate, String>,
    timeline: KeySet,
    by_kind: HashMap<u16, KeySet>,
    by_author: HashMap<String, KeySet>,
    by_tag: HashMap<String, HashMap<String, KeySet>>,
    expirations: BTreeSet<(u64, String)>,
    id_tombstones: HashMap<String, HashSet<String>>,
    coordinate_tombstones: HashMap<Coordinate, u64>,
    history: HashMap<Coordinate, VecDeque<Arc<Event>>>,
}

impl EventIndex {
    pub fn new(config: StoreConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn classify(&self, event: &Event) -> KindClassification {
        self.config.classify(event.kind)
    }

    pub fn coordinate_of(&self, event: &Event) -> Option<Coordinate> {
        Coordinate::with_classification(event, self.classify(event))
    }

    pub fn add(&mut self, event: impl Into<Arc<Event>>, now: u64) -> Result<AddOutcome> {
        let event = event.into();
        if !is_hex_id(&event.id) {
            return Err(StoreError::InvalidEvent(format!("malformed id {:?}", event.id)));
        }
        if !is_hex_id(&event.pubkey) {
            return Err(StoreError::InvalidEvent(format!(
                "malformed pubkey {:?}",
                event.pubkey
            )));
        }
        if self.events.contains_key(&event.id) {
            return Ok(AddOutcome::Rejected(RejectReason::Duplicate));
        }

        let classification = self.classify(&event);
        if classification == KindClassification::Ephemeral {
            return Ok(AddOutcome::Ephemeral);
        }
        if !self.config.keep_expired && is_expired(&event, now) {
            debug!(id = %event.id, "rejecting expired event");
            return Ok(AddOutcome::Rejected(RejectReason::Expired));
        }
        if self.is_tombstoned(&event, classification) {
            debug!(id = %event.id, "rejecting deleted event");
            return Ok(AddOutcome::Rejected(RejectReason::Deleted));
        }

        let deletion = if event.kind == DELETION_REQUEST_KIND {
            Some(self.check_deletion(&event)?)
        } else {
            None
        };

        let coordinate = Coordinate::with_classification(&event, classification);
        let mut replaced = None;
        if let Some(coordinate) = &coordinate {
            let current = self
                .replaceable
                .get(coordinate)
                .and_then(|id| self.events.get(id))
                .cloned();
            if let Some(current) = current {
                if !supersedes(&event, &current) {
                    return Ok(AddOutcome::Rejected(RejectReason::Superseded));
                }
                self.remove_entry(&current.id);
                self.push_history(coordinate, Arc::clone(&current));
                debug!(%coordinate, old = %current.id, new = %event.id, "replaced event");
                replaced = Some(current);
            }
        }

        self.insert_entry(event, coordinate);

        let deleted = deletion
            .map(|request| self.apply_deletion(&request))
            .unwrap_or_default();

        Ok(AddOutcome::Inserted { replaced, deleted })
    }

    /// Hard removal, independent of deletion requests: the event may be added again.
    pub fn remove(&mut self, id: &str) -> Option<Arc<Event>> {
        self.remove_entry(id)
    }

    pub fn get(&self, id: &str, now: u64) -> Option<Arc<Event>> {
        self.events
            .get(id)
            .filter(|event| !is_expired(event, now))
            .cloned()
    }

    pub fn get_replaceable(&self, coordinate: &Coordinate, now: u64) -> Option<Arc<Event>> {
        self.replaceable
            .get(coordinate)
            .and_then(|id| self.get(id, now))
    }

    /// Superseded versions of `coordinate` that have not expired, newest first.
    pub fn replaceable_history(&self, coordinate: &Coordinate, now: u64) -> Vec<Arc<Event>> {
        self.history
            .get(coordinate)
            .map(|versions| {
                versions
                    .iter()
                    .filter(|version| !is_expired(version, now))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Events matching any of `filters`, newest first.
    ///
    /// Each filter's `limit` applies to that filter before the union.
    pub fn timeline(&self, filters: &[Filter], now: u64) -> Result<Vec<Arc<Event>>> {
        for filter in filters {
            filter.validate()?;
        }

        let mut seen = HashSet::new();
        let mut events = Vec::new();
        for filter in filters {
            for event in self.query_filter(filter, now) {
                if seen.insert(event.id.clone()) {
                    events.push(event);
                }
            }
        }

        if filters.len() > 1 {
            events.sort_by(|a, b| newest_first(a, b));
        }
        Ok(events)
    }

    pub fn count(&self, filters: &[Filter], now: u64) -> Result<usize> {
        Ok(self.timeline(filters, now)?.len())
    }

    /// Sealed reconciliation input for the events matching `filter`.
    pub fn storage_vector(&self, filter: &Filter, now: u64) -> Result<StorageVector> {
        let mut storage = StorageVector::new();
        for event in self.timeline(std::slice::from_ref(filter), now)? {
            let id = event
                .id_bytes()
                .map_err(|error| StoreError::InvalidEvent(error.to_string()))?;
            storage.insert(event.created_at, id)?;
        }
        storage.seal()?;
        Ok(storage)
    }

    /// Remove every event whose expiration is at or before `now`.
    pub fn prune_expired(&mut self, now: u64) -> Vec<Arc<Event>> {
        let due: Vec<String> = self
            .expirations
            .iter()
            .take_while(|(expires_at, _)| *expires_at <= now)
            .map(|(_, id)| id.clone())
            .collect();

        due.iter().filter_map(|id| self.remove_entry(id)).collect()
    }

    fn is_tombstoned(&self, event: &Event, classification: KindClassification) -> bool {
        if self
            .id_tombstones
            .get(&event.id)
            .is_some_and(|deleters| deleters.contains(&event.pubkey))
        {
            return true;
        }
        Coordinate::with_classification(event, classification).is_some_and(|coordinate| {
            self.coordinate_tombstones
                .get(&coordinate)
                .is_some_and(|deleted_until| event.created_at <= *deleted_until)
        })
    }

    fn check_deletion(&self, event: &Event) -> Result<DeletionRequest> {
        let request = DeletionRequest::from_event(event)?;
        for id in &request.ids {
            if let Some(target) = self.events.get(id) {
                if !request.authorizes(target) {
                    return Err(StoreError::CrossAuthorDeletion {
                        author: request.pubkey.clone(),
                        target: id.clone(),
                    });
                }
            }
        }
        Ok(request)
    }

    fn apply_deletion(&mut self, request: &DeletionRequest) -> Vec<Arc<Event>> {
        let mut deleted = Vec::new();

        for id in &request.ids {
            self.id_tombstones
                .entry(id.clone())
                .or_default()
                .insert(request.pubkey.clone());
            if let Some(target) = self.remove_entry(id) {
                deleted.push(target);
            }
        }
        if !request.ids.is_empty() {
            for versions in self.history.values_mut() {
                versions.retain(|version| {
                    version.pubkey != request.pubkey || !request.ids.contains(&version.id)
                });
            }
        }

        for coordinate in &request.coordinates {
            let deleted_until = self
                .coordinate_tombstones
                .entry(coordinate.clone())
                .or_insert(0);
            *deleted_until = (*deleted_until).max(request.created_at);

            let current = self
                .replaceable
                .get(coordinate)
                .and_then(|id| self.events.get(id))
                .filter(|current| current.created_at <= request.created_at)
                .map(|current| current.id.clone());
            if let Some(target) = current.and_then(|id| self.remove_entry(&id)) {
                deleted.push(target);
            }
            if let Some(versions) = self.history.get_mut(coordinate) {
                versions.retain(|version| version.created_at > request.created_at);
            }
        }
        self.history.retain(|_, versions| !versions.is_empty());

        if !deleted.is_empty() {
            debug!(author = %request.pubkey, count = deleted.len(), "applied deletion request");
        }
        deleted
    }

    fn push_history(&mut self, coordinate: &Coordinate, event: Arc<Event>) {
        if self.config.history_limit == 0 {
            return;
        }
        let versions = self.history.entry(coordinate.clone()).or_default();
        versions.push_front(event);
        versions.truncate(self.config.history_limit);
    }

    fn insert_entry(&mut self, event: Arc<Event>, coordinate: Option<Coordinate>) {
        let key = TimelineKey::of(&event);

        self.timeline.insert(key.clone());
        self.by_kind.entry(event.kind).or_default().insert(key.clone());
        self.by_author
            .entry(event.pubkey.clone())
            .or_default()
            .insert(key.clone());
        for (name, value) in indexed_tags(&event) {
            self.by_tag
                .entry(name.to_string())
                .or_default()
                .entry(value.to_string())
                .or_default()
                .insert(key.clone());
        }
        if let Some(expires_at) = expiration(&event) {
            self.expirations.insert((expires_at, event.id.clone()));
        }
        if let Some(coordinate) = coordinate {
            self.replaceable.insert(coordinate, event.id.clone());
        }

        self.events.insert(event.id.clone(), event);
    }

    fn remove_entry(&mut self, id: &str) -> Option<Arc<Event>> {
        let event = self.events.remove(id)?;
        let key = TimelineKey::of(&event);

        self.timeline.remove(&key);
        remove_key(&mut self.by_kind, &event.kind, &key);
        remove_key(&mut self.by_author, event.pubkey.as_str(), &key);
        for (name, value) in indexed_tags(&event) {
            if let Some(by_value) = self.by_tag.get_mut(name) {
                remove_key(by_value, value, &key);
                if by_value.is_empty() {
                    self.by_tag.remove(name);
                }
            }
        }
        if let Some(expires_at) = expiration(&event) {
            self.expirations.remove(&(expires_at, event.id.clone()));
        }
        if let Some(coordinate) = self.coordinate_of(&event) {
            if self.replaceable.get(&coordinate) == Some(&event.id) {
                self.replaceable.remove(&coordinate);
            }
        }

        Some(event)
    }

    fn query_filter(&self, filter: &Filter, now: u64) -> Vec<Arc<Event>> {
        let limit = filter.limit.unwrap_or(usize::MAX);
        if limit == 0 {
            return Vec::new();
        }
        let accept = |event: &&Arc<Event>| filter.matches(event) && !is_expired(event, now);

        if let Some(ids) = &filter.ids {
            let mut events: Vec<Arc<Event>> = ids
                .iter()
                .filter_map(|id| self.events.get(id))
                .filter(accept)
                .cloned()
                .collect();
            events.sort_by(|a, b| newest_first(a, b));
            events.truncate(limit);
            return events;
        }

        if let Some(keys) = self.plan(filter) {
            return keys
                .into_iter()
                .filter_map(|key| self.events.get(&key.id))
                .filter(accept)
                .take(limit)
                .cloned()
                .collect();
        }

        let since = filter.since.unwrap_or(0);
        let start = TimelineKey::first_at(filter.until.unwrap_or(u64::MAX));
        self.timeline
            .range(start..)
            .take_while(|key| key.created_at.0 >= since)
            .filter_map(|key| self.events.get(&key.id))
            .filter(accept)
            .take(limit)
            .cloned()
            .collect()
    }

    /// Candidate keys from the smallest secondary index the filter constrains,
    /// newest first. `None` when the filter only constrains time.
    fn plan(&self, filter: &Filter) -> Option<Vec<&TimelineKey>> {
        let mut candidates: Vec<Vec<&KeySet>> = Vec::new();

        if let Some(authors) = &filter.authors {
            candidates.push(
                authors
                    .iter()
                    .filter_map(|author| self.by_author.get(author.as_str()))
                    .collect(),
            );
        }
        if let Some(kinds) = &filter.kinds {
            candidates.push(kinds.iter().filter_map(|kind| self.by_kind.get(kind)).collect());
        }
        for (name, values) in filter.tag_conditions() {
            candidates.push(
                self.by_tag
                    .get(name)
                    .map(|by_value| {
                        values
                            .iter()
                            .filter_map(|value| by_value.get(value.as_str()))
                            .collect()
                    })
                    .unwrap_or_default(),
            );
        }

        let sets = candidates
            .into_iter()
            .min_by_key(|sets| sets.iter().map(|set| set.len()).sum::<usize>())?;

        if let [set] = sets.as_slice() {
            return Some(set.iter().collect());
        }
        let mut keys: Vec<&TimelineKey> = sets.into_iter().flatten().collect();
        keys.sort_unstable();
        keys.dedup();
        Some(keys)
    }
}

fn newest_first(a: &Event, b: &Event) -> Ordering {
    b.created_at
        .cmp(&a.created_at)
        .then_with(|| a.id.cmp(&b.id))
}

/// `(name, value)` of every tag with a single-letter name.
fn indexed_tags(event: &Event) -> impl Iterator<Item = (&str, &str)> {
    event.tags.iter().filter_map(|tag| match tag.as_slice() {
        [name, value, ..] if name.len() == 1 && name.as_bytes()[0].is_ascii_alphabetic() => {
            Some((name.as_str(), value.as_str()))
        }
        _ => None,
    })
}

fn remove_key<K, Q>(map: &mut HashMap<K, KeySet>, index: &Q, key: &TimelineKey)
where
    K: Borrow<Q> + Hash + Eq,
    Q: Hash + Eq + ?Sized,
{
    if let Some(keys) = map.get_mut(index) {
        keys.remove(key);
        if keys.is_empty() {
            map.remove(index);
        }
    }
}
