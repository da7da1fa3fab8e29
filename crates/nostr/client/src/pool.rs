//! Relay pool for multi-relay fanout.
//!
//! Every pool operation captures the member list when it is called, so
//! adding or removing relays never disturbs work already in flight. One
//! relay failing or stalling shows up as that relay's entry in the results
//! and never fails the whole call.

use std::collections::{HashMap, HashSet};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures_util::Stream;
use futures_util::future::join_all;
use nostr::{Event, EventDatabase, EventId, Filter};
use serde::{Deserialize, Serialize};
use tokio::sync::{RwLock, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};
use url::Url;

use crate::config::PoolConfig;
use crate::error::{ClientError, Result};
use crate::relay::{PublishConfirmation, RelayConnection, SubscribeOptions};
use crate::subscription::{Subscription, SubscriptionItem};

/// Ids per `REQ` when fetching reconciliation results.
const FETCH_CHUNK_SIZE: usize = 256;

/// Outcome of a pool operation on one relay.
#[derive(Debug)]
pub struct RelayResult<T> {
    pub relay_url: String,
    pub result: Result<T>,
}

impl<T> RelayResult<T> {
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }
}

/// Options for a pool request or subscription.
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    /// Restrict the request to these relays; all members when `None`.
    pub relays: Option<Vec<String>>,
    /// Per-relay EOSE deadline; `PoolConfig::eose_timeout` when `None`.
    pub eose_timeout: Option<Duration>,
    /// End the merged stream after the group EOSE.
    pub close_on_eose: bool,
    pub subscription_id: Option<String>,
}

impl RequestOptions {
    pub fn relays<I, S>(mut self, relays: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.relays = Some(relays.into_iter().map(Into::into).collect());
        self
    }

    pub fn eose_timeout(mut self, timeout: Duration) -> Self {
        self.eose_timeout = Some(timeout);
        self
    }

    pub fn close_on_eose(mut self) -> Self {
        self.close_on_eose = true;
        self
    }

    pub fn subscription_id(mut self, id: impl Into<String>) -> Self {
        self.subscription_id = Some(id.into());
        self
    }
}

/// Item of a merged pool stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolItem {
    /// First delivery of an event within this request.
    Event { relay_url: String, event: Event },
    /// Every relay has sent EOSE, failed, or passed its deadline.
    Eose,
    /// One relay ended its part of the request.
    Closed { relay_url: String, reason: String },
}

/// Per-relay progress reported to the aggregator.
enum Feed {
    Event(String, Event),
    Eose(String),
    Closed(String, String),
}

/// Merged, deduplicated stream over several relays.
///
/// Dropping it cancels every relay task, which closes the relay subscriptions.
pub struct PoolSubscription {
    receiver: mpsc::UnboundedReceiver<PoolItem>,
    tasks: Vec<JoinHandle<()>>,
}

impl PoolSubscription {
    /// Next item, or `None` once the stream has ended.
    pub async fn next(&mut self) -> Option<PoolItem> {
        let item = self.receiver.recv().await;
        if item.is_none() {
            self.cancel();
        }
        item
    }

    fn cancel(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

impl Stream for PoolSubscription {
    type Item = PoolItem;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        let item = std::task::ready!(this.receiver.poll_recv(cx));
        if item.is_none() {
            this.cancel();
        }
        Poll::Ready(item)
    }
}

impl Drop for PoolSubscription {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncDirection {
    /// Fetch what relays have and the database lacks.
    #[default]
    Down,
    /// Publish what the database has and relays lack.
    Up,
    Both,
}

impl SyncDirection {
    fn downloads(self) -> bool {
        matches!(self, Self::Down | Self::Both)
    }

    fn uploads(self) -> bool {
        matches!(self, Self::Up | Self::Both)
    }
}

#[derive(Debug, Clone)]
pub struct SyncOptions {
    pub direction: SyncDirection,
    pub relays: Option<Vec<String>>,
    /// Download with a plain request from relays that refuse negentropy.
    pub fallback_to_request: bool,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            direction: SyncDirection::Down,
            relays: None,
            fallback_to_request: true,
        }
    }
}

/// What one relay sync did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelaySyncReport {
    /// Ids only the local database had.
    pub have: usize,
    /// Ids only the relay had.
    pub need: usize,
    /// Events newly saved locally.
    pub fetched: usize,
    /// Events the relay accepted.
    pub uploaded: usize,
    pub rounds: usize,
    pub used_fallback: bool,
}

#[derive(Debug, Default)]
pub struct SyncSummary {
    pub relays: Vec<RelayResult<RelaySyncReport>>,
}

impl SyncSummary {
    /// Events newly saved across all relays.
    pub fn fetched(&self) -> usize {
        self.reports().map(|report| report.fetched).sum()
    }

    pub fn uploaded(&self) -> usize {
        self.reports().map(|report| report.uploaded).sum()
    }

    fn reports(&self) -> impl Iterator<Item = &RelaySyncReport> {
        self.relays
            .iter()
            .filter_map(|entry| entry.result.as_ref().ok())
    }
}

/// Multi-relay pool.
#[derive(Clone)]
pub struct RelayPool {
    relays: Arc<RwLock<HashMap<String, RelayConnection>>>,
    config: PoolConfig,
    database: Option<Arc<dyn EventDatabase>>,
}

impl RelayPool {
    /// Create new relay pool.
    pub fn new(config: PoolConfig) -> Self {
        Self {
            relays: Arc::new(RwLock::new(HashMap::new())),
            config,
            database: None,
        }
    }

    /// Pool that saves every event it delivers into `database`.
    pub fn with_database(config: PoolConfig, database: Arc<dyn EventDatabase>) -> Self {
        Self {
            database: Some(database),
            ..Self::new(config)
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Add relay URL to pool. Connection happens on `connect_all` or on first use.
    pub async fn add_relay(&self, url: &str) -> Result<()> {
        let relay = RelayConnection::with_config(url, self.config.relay_config.clone())?;
        let mut relays = self.relays.write().await;
        if relays.contains_key(relay.url()) {
            return Ok(());
        }
        if relays.len() >= self.config.max_relays {
            return Err(ClientError::InvalidRequest(format!(
                "maximum relay limit ({}) reached",
                self.config.max_relays
            )));
        }
        relays.insert(relay.url().to_string(), relay);
        Ok(())
    }

    /// Remove a relay. Requests already using it finish first; the relay
    /// disconnects once it is idle.
    pub async fn remove_relay(&self, url: &str) -> Result<bool> {
        let key = normalize(url)?;
        let Some(relay) = self.relays.write().await.remove(&key) else {
            return Ok(false);
        };
        debug!("removed relay {} from pool", key);
        relay.disconnect_when_idle();
        Ok(true)
    }

    /// Get relay by URL.
    pub async fn relay(&self, url: &str) -> Option<RelayConnection> {
        let key = normalize(url).ok()?;
        self.relays.read().await.get(&key).cloned()
    }

    pub async fn relay_urls(&self) -> Vec<String> {
        let mut urls: Vec<String> = self.relays.read().await.keys().cloned().collect();
        urls.sort();
        urls
    }

    /// Connect all relays concurrently. Fails only if none connect.
    pub async fn connect_all(&self) -> Result<()> {
        let relays = self.members(None).await?;
        let results = join_all(relays.iter().map(|relay| relay.connect())).await;

        let mut connected = 0usize;
        for (relay, result) in relays.iter().zip(results) {
            match result {
                Ok(()) | Err(ClientError::AlreadyConnected) => connected += 1,
                Err(error) => warn!("relay {} connect failed: {}", relay.url(), error),
            }
        }
        if connected == 0 {
            return Err(ClientError::Connection(
                "failed to connect to any relay".to_string(),
            ));
        }
        info!("connected to {}/{} relays", connected, relays.len());
        Ok(())
    }

    /// Disconnect all relays.
    pub async fn disconnect_all(&self) -> Result<()> {
        let relays: Vec<RelayConnection> = self.relays.read().await.values().cloned().collect();
        let results = join_all(relays.iter().map(|relay| relay.disconnect())).await;
        results.into_iter().collect()
    }

    /// Publish event to every member concurrently.
    pub async fn publish(&self, event: &Event) -> Result<Vec<RelayResult<PublishConfirmation>>> {
        self.publish_to(None, event).await
    }

    /// Publish to a subset of members, or every member when `relays` is `None`.
    pub async fn publish_to(
        &self,
        relays: Option<&[String]>,
        event: &Event,
    ) -> Result<Vec<RelayResult<PublishConfirmation>>> {
        let relays = self.members(relays).await?;
        let results = join_all(relays.iter().map(|relay| relay.publish(event))).await;
        Ok(relays
            .iter()
            .zip(results)
            .map(|(relay, result)| {
                if let Err(error) = &result {
                    debug!("publish of {} to {} failed: {}", event.id, relay.url(), error);
                }
                RelayResult {
                    relay_url: relay.url().to_string(),
                    result,
                }
            })
            .collect())
    }

    /// Per-relay NIP-45 counts.
    pub async fn count(&self, filters: Vec<Filter>) -> Result<Vec<RelayResult<u64>>> {
        let relays = self.members(None).await?;
        let results = join_all(relays.iter().map(|relay| relay.count(filters.clone()))).await;
        Ok(relays
            .iter()
            .zip(results)
            .map(|(relay, result)| RelayResult {
                relay_url: relay.url().to_string(),
                result,
            })
            .collect())
    }

    /// Subscribe on every selected relay and merge the results.
    ///
    /// Each event id is delivered once per subscription. The group `Eose`
    /// fires after every relay sent EOSE, failed, or missed its deadline.
    pub async fn subscribe(
        &self,
        filters: Vec<Filter>,
        options: RequestOptions,
    ) -> Result<PoolSubscription> {
        for filter in &filters {
            filter
                .validate()
                .map_err(|error| ClientError::InvalidRequest(error.to_string()))?;
        }
        let relays = self.members(options.relays.as_deref()).await?;
        let eose_timeout = options.eose_timeout.unwrap_or(self.config.eose_timeout);

        let (feed_tx, feed_rx) = mpsc::unbounded_channel();
        let (output_tx, output_rx) = mpsc::unbounded_channel();
        let mut tasks = Vec::with_capacity(relays.len() + 1);

        let pending: HashSet<String> = relays.iter().map(|relay| relay.url().to_string()).collect();
        tasks.push(tokio::spawn(aggregate(
            feed_rx,
            output_tx,
            pending,
            options.close_on_eose,
            self.database.clone(),
        )));

        for relay in relays {
            let relay_options = SubscribeOptions {
                id: options.subscription_id.clone(),
                close_on_eose: options.close_on_eose,
            };
            tasks.push(tokio::spawn(drive_relay(
                relay,
                filters.clone(),
                relay_options,
                eose_timeout,
                feed_tx.clone(),
            )));
        }

        Ok(PoolSubscription {
            receiver: output_rx,
            tasks,
        })
    }

    /// Merged request that ends after the group EOSE.
    pub async fn request(
        &self,
        filters: Vec<Filter>,
        options: RequestOptions,
    ) -> Result<PoolSubscription> {
        self.subscribe(filters, options.close_on_eose()).await
    }

    /// Stored events from every relay, deduplicated, newest first.
    pub async fn fetch(&self, filters: Vec<Filter>, options: RequestOptions) -> Result<Vec<Event>> {
        let mut stream = self.request(filters, options).await?;
        let mut events = Vec::new();
        while let Some(item) = stream.next().await {
            match item {
                PoolItem::Event { event, .. } => events.push(event),
                PoolItem::Eose => break,
                PoolItem::Closed { .. } => {}
            }
        }
        events.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(events)
    }

    /// Reconcile `database` with every selected relay over `filter`.
    pub async fn sync(
        &self,
        database: &dyn EventDatabase,
        filter: &Filter,
        options: &SyncOptions,
    ) -> Result<SyncSummary> {
        filter
            .validate()
            .map_err(|error| ClientError::InvalidRequest(error.to_string()))?;
        let relays = self.members(options.relays.as_deref()).await?;
        let results = join_all(
            relays
                .iter()
                .map(|relay| sync_relay(relay, database, filter, options)),
        )
        .await;

        let summary = SyncSummary {
            relays: relays
                .iter()
                .zip(results)
                .map(|(relay, result)| RelayResult {
                    relay_url: relay.url().to_string(),
                    result,
                })
                .collect(),
        };
        info!(
            "sync finished: {} fetched, {} uploaded across {} relays",
            summary.fetched(),
            summary.uploaded(),
            summary.relays.len()
        );
        Ok(summary)
    }

    async fn members(&self, subset: Option<&[String]>) -> Result<Vec<RelayConnection>> {
        let relays = self.relays.read().await;
        let selected: Vec<RelayConnection> = match subset {
            None => relays.values().cloned().collect(),
            Some(urls) => {
                let mut selected = Vec::with_capacity(urls.len());
                for url in urls {
                    let key = normalize(url)?;
                    let relay = relays.get(&key).cloned().ok_or_else(|| {
                        ClientError::InvalidRequest(format!("unknown relay: {}", url))
                    })?;
                    selected.push(relay);
                }
                selected
            }
        };
        if selected.is_empty() {
            return Err(ClientError::NoRelays);
        }
        Ok(selected)
    }
}

fn normalize(url: &str) -> Result<String> {
    Ok(Url::parse(url)?.to_string())
}

async fn drive_relay(
    relay: RelayConnection,
    filters: Vec<Filter>,
    options: SubscribeOptions,
    eose_timeout: Duration,
    feed: mpsc::UnboundedSender<Feed>,
) {
    let url = relay.url().to_string();
    let deadline = tokio::time::sleep(eose_timeout);
    tokio::pin!(deadline);
    let mut stored = true;

    let subscribe = relay.subscribe(filters, options);
    tokio::pin!(subscribe);
    let subscribed = loop {
        tokio::select! {
            result = &mut subscribe => break result,
            () = &mut deadline, if stored => {
                debug!("relay {} missed the EOSE deadline while connecting", url);
                stored = false;
                let _ = feed.send(Feed::Eose(url.clone()));
            }
        }
    };
    let mut subscription: Subscription = match subscribed {
        Ok(subscription) => subscription,
        Err(error) => {
            warn!("subscribe on {} failed: {}", url, error);
            let _ = feed.send(Feed::Closed(url, error.to_string()));
            return;
        }
    };

    loop {
        tokio::select! {
            item = subscription.next() => match item {
                Some(SubscriptionItem::Event(event)) => {
                    if feed.send(Feed::Event(url.clone(), event)).is_err() {
                        return;
                    }
                }
                Some(SubscriptionItem::Eose) => {
                    if stored {
                        stored = false;
                        let _ = feed.send(Feed::Eose(url.clone()));
                    }
                }
                Some(SubscriptionItem::Closed(reason)) => {
                    let _ = feed.send(Feed::Closed(url, reason));
                    return;
                }
                None => {
                    if stored {
                        let _ = feed.send(Feed::Eose(url));
                    }
                    return;
                }
            },
            () = &mut deadline, if stored => {
                debug!("relay {} missed the EOSE deadline", url);
                stored = false;
                let _ = feed.send(Feed::Eose(url.clone()));
            }
        }
    }
}

async fn aggregate(
    mut feed: mpsc::UnboundedReceiver<Feed>,
    output: mpsc::UnboundedSender<PoolItem>,
    mut pending: HashSet<String>,
    close_on_eose: bool,
    database: Option<Arc<dyn EventDatabase>>,
) {
    let mut seen: HashSet<String> = HashSet::new();
    let mut eose_sent = false;

    while let Some(item) = feed.recv().await {
        match item {
            Feed::Event(relay_url, event) => {
                if !seen.insert(event.id.clone()) {
                    trace!("duplicate {} from {}", event.id, relay_url);
                    continue;
                }
                if let Some(database) = &database {
                    if let Err(error) = database.save_event(&event).await {
                        warn!("failed to save {} from {}: {}", event.id, relay_url, error);
                    }
                }
                if output.send(PoolItem::Event { relay_url, event }).is_err() {
                    return;
                }
            }
            Feed::Eose(relay_url) => {
                pending.remove(&relay_url);
            }
            Feed::Closed(relay_url, reason) => {
                pending.remove(&relay_url);
                let _ = output.send(PoolItem::Closed { relay_url, reason });
            }
        }

        if pending.is_empty() && !eose_sent {
            eose_sent = true;
            let _ = output.send(PoolItem::Eose);
            if close_on_eose {
                return;
            }
        }
    }

    if !eose_sent {
        let _ = output.send(PoolItem::Eose);
    }
}

async fn sync_relay(
    relay: &RelayConnection,
    database: &dyn EventDatabase,
    filter: &Filter,
    options: &SyncOptions,
) -> Result<RelaySyncReport> {
    let storage = database.negentropy_items(filter).await?;
    let url = relay.url().to_string();
    let reconciled = relay
        .reconcile(filter, storage, |update| {
            trace!(
                "{} round {}: {} have, {} need",
                url,
                update.round,
                update.have.len(),
                update.need.len()
            );
        })
        .await;

    let outcome = match reconciled {
        Ok(outcome) => outcome,
        Err(error @ (ClientError::RelayError(_) | ClientError::Timeout(_)))
            if options.fallback_to_request && options.direction.downloads() =>
        {
            warn!("negentropy with {} failed ({}); falling back to request", url, error);
            return fallback_sync(relay, database, filter).await;
        }
        Err(error) => return Err(error),
    };

    let mut report = RelaySyncReport {
        have: outcome.have.len(),
        need: outcome.need.len(),
        rounds: outcome.rounds,
        ..RelaySyncReport::default()
    };

    if options.direction.downloads() {
        report.fetched = fetch_missing(relay, database, &outcome.need).await?;
    }
    if options.direction.uploads() {
        report.uploaded = upload_missing(relay, database, &outcome.have).await?;
    }
    debug!("sync with {}: {:?}", url, report);
    Ok(report)
}

async fn fetch_missing(
    relay: &RelayConnection,
    database: &dyn EventDatabase,
    need: &[EventId],
) -> Result<usize> {
    let mut fetched = 0;
    for chunk in need.chunks(FETCH_CHUNK_SIZE) {
        let filter = Filter::new().ids(chunk.iter().map(hex::encode));
        fetched += save_request(relay, database, filter).await?;
    }
    Ok(fetched)
}

async fn upload_missing(
    relay: &RelayConnection,
    database: &dyn EventDatabase,
    have: &[EventId],
) -> Result<usize> {
    let mut uploaded = 0;
    for id in have {
        let id = hex::encode(id);
        let Some(event) = database.event_by_id(&id).await? else {
            continue;
        };
        match relay.publish(&event).await {
            Ok(confirmation) if confirmation.accepted => uploaded += 1,
            Ok(confirmation) => {
                debug!("{} refused {}: {}", relay.url(), id, confirmation.message);
            }
            Err(error) => warn!("upload of {} to {} failed: {}", id, relay.url(), error),
        }
    }
    Ok(uploaded)
}

async fn fallback_sync(
    relay: &RelayConnection,
    database: &dyn EventDatabase,
    filter: &Filter,
) -> Result<RelaySyncReport> {
    let fetched = save_request(relay, database, filter.clone()).await?;
    Ok(RelaySyncReport {
        fetched,
        used_fallback: true,
        ..RelaySyncReport::default()
    })
}

/// Request stored events and save them, returning how many were new.
async fn save_request(
    relay: &RelayConnection,
    database: &dyn EventDatabase,
    filter: Filter,
) -> Result<usize> {
    let mut subscription = relay.request(vec![filter]).await?;
    let mut saved = 0;
    while let Some(item) = subscription.next().await {
        match item {
            SubscriptionItem::Event(event) => {
                if database.save_event(&event).await? {
                    saved += 1;
                }
            }
            SubscriptionItem::Eose => break,
            SubscriptionItem::Closed(reason) => return Err(ClientError::RelayError(reason)),
        }
    }
    Ok(saved)
}
