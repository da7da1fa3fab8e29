//! Single relay connection management.
//!
//! One WebSocket session multiplexes every subscription, count and
//! negentropy session by id. A background supervisor reads frames, routes
//! them, and when the transport drops reconnects with backoff and re-sends
//! the live `REQ`s.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use nostr::nip77::decode_message_hex;
use nostr::{Event, Filter, ReconcileOutcome, RoundUpdate, StorageVector};
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};
use tracing::{debug, info, warn};
use url::Url;

use crate::config::RelayConfig;
use crate::error::{ClientError, Result};
use crate::message::{ClientMessage, RelayMessage, parse_relay_message};
use crate::negentropy::RelayNegentropySession;
use crate::subscription::{Subscription, SubscriptionItem};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsWriter = SplitSink<WsStream, Message>;
type WsReader = SplitStream<WsStream>;

const IDLE_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Closing,
}

/// Unsolicited relay messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayNotification {
    Notice(String),
    Auth(String),
}

/// Publish confirmation from a relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishConfirmation {
    pub relay_url: String,
    pub event_id: String,
    pub accepted: bool,
    pub message: String,
    /// Transport attempts used, including the successful one.
    pub attempts: u32,
}

#[derive(Debug, Clone, Default)]
pub struct SubscribeOptions {
    /// Subscription id; generated when absent.
    pub id: Option<String>,
    /// End the subscription after the relay's EOSE.
    pub close_on_eose: bool,
}

impl SubscribeOptions {
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn close_on_eose(mut self) -> Self {
        self.close_on_eose = true;
        self
    }
}

/// Where frames for one subscription id go.
enum Route {
    Subscription {
        filters: Vec<Filter>,
        sender: mpsc::UnboundedSender<SubscriptionItem>,
    },
    Count(oneshot::Sender<Result<u64>>),
    Negentropy(mpsc::UnboundedSender<Result<Vec<u8>>>),
}

fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct RelayInner {
    url: Url,
    config: RelayConfig,
    state: watch::Sender<ConnectionState>,
    writer: Mutex<Option<WsWriter>>,
    routes: StdMutex<HashMap<String, Route>>,
    pending_ok: StdMutex<HashMap<String, Vec<oneshot::Sender<(bool, String)>>>>,
    notifications: broadcast::Sender<RelayNotification>,
    supervisor: StdMutex<Option<JoinHandle<()>>>,
    closing: AtomicBool,
    next_id: AtomicU64,
}

impl RelayInner {
    fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.send_replace(state);
    }

    fn next_id(&self, prefix: &str) -> String {
        format!("{}-{}", prefix, self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    fn is_busy(&self) -> bool {
        !lock(&self.routes).is_empty() || !lock(&self.pending_ok).is_empty()
    }

    async fn open(&self) -> Result<WsReader> {
        let (stream, _response) = timeout(
            self.config.connect_timeout,
            connect_async(self.url.as_str()),
        )
        .await
        .map_err(|_| {
            ClientError::Timeout(format!(
                "connection timeout after {:?}",
                self.config.connect_timeout
            ))
        })?
        .map_err(|error| ClientError::WebSocket(error.to_string()))?;

        let (writer, reader) = stream.split();
        *self.writer.lock().await = Some(writer);
        self.set_state(ConnectionState::Connected);
        Ok(reader)
    }

    async fn send(&self, message: &ClientMessage) -> Result<()> {
        if self.state() != ConnectionState::Connected {
            return Err(ClientError::NotConnected);
        }
        let text = message.to_json()?;
        let mut writer_guard = self.writer.lock().await;
        let writer = writer_guard.as_mut().ok_or(ClientError::NotConnected)?;
        writer
            .send(Message::Text(text.into()))
            .await
            .map_err(|error| ClientError::WebSocket(error.to_string()))
    }

    fn dispatch(&self, message: RelayMessage) {
        match message {
            RelayMessage::Event(subscription_id, event) => {
                self.forward(&subscription_id, SubscriptionItem::Event(event));
            }
            RelayMessage::Eose(subscription_id) => {
                self.forward(&subscription_id, SubscriptionItem::Eose);
            }
            RelayMessage::Closed(subscription_id, reason) => {
                debug!("relay {} closed {}: {}", self.url, subscription_id, reason);
                let route = lock(&self.routes).remove(&subscription_id);
                match route {
                    Some(Route::Subscription { sender, .. }) => {
                        let _ = sender.send(SubscriptionItem::Closed(reason));
                    }
                    Some(Route::Count(sender)) => {
                        let _ = sender.send(Err(ClientError::RelayError(reason)));
                    }
                    Some(Route::Negentropy(sender)) => {
                        let _ = sender.send(Err(ClientError::RelayError(reason)));
                    }
                    None => {}
                }
            }
            RelayMessage::Ok(event_id, accepted, message) => {
                let waiters = lock(&self.pending_ok).remove(&event_id);
                for waiter in waiters.into_iter().flatten() {
                    let _ = waiter.send((accepted, message.clone()));
                }
            }
            RelayMessage::Count(subscription_id, count) => {
                let mut routes = lock(&self.routes);
                match routes.remove(&subscription_id) {
                    Some(Route::Count(sender)) => {
                        let _ = sender.send(Ok(count));
                    }
                    Some(other) => {
                        routes.insert(subscription_id, other);
                    }
                    None => {}
                }
            }
            RelayMessage::NegMsg(subscription_id, payload) => {
                let routes = lock(&self.routes);
                if let Some(Route::Negentropy(sender)) = routes.get(&subscription_id) {
                    let _ = sender.send(decode_message_hex(&payload).map_err(ClientError::from));
                }
            }
            RelayMessage::NegErr(subscription_id, reason) => {
                let mut routes = lock(&self.routes);
                match routes.remove(&subscription_id) {
                    Some(Route::Negentropy(sender)) => {
                        let _ = sender.send(Err(ClientError::RelayError(reason)));
                    }
                    Some(other) => {
                        routes.insert(subscription_id, other);
                    }
                    None => {}
                }
            }
            RelayMessage::Notice(text) => {
                debug!("notice from {}: {}", self.url, text);
                let _ = self.notifications.send(RelayNotification::Notice(text));
            }
            RelayMessage::Auth(challenge) => {
                let _ = self.notifications.send(RelayNotification::Auth(challenge));
            }
        }
    }

    fn forward(&self, subscription_id: &str, item: SubscriptionItem) {
        let mut routes = lock(&self.routes);
        let delivered = match routes.get(subscription_id) {
            Some(Route::Subscription { sender, .. }) => sender.send(item).is_ok(),
            _ => return,
        };
        if !delivered {
            routes.remove(subscription_id);
        }
    }

    /// Drop the transport. Live subscriptions survive when a reconnect follows;
    /// everything else fails.
    async fn on_disconnect(&self, keep_subscriptions: bool) {
        *self.writer.lock().await = None;
        self.set_state(ConnectionState::Disconnected);
        lock(&self.pending_ok).clear();

        lock(&self.routes).retain(|_, route| match route {
            Route::Subscription { sender, .. } if keep_subscriptions => !sender.is_closed(),
            Route::Subscription { sender, .. } => {
                let _ = sender.send(SubscriptionItem::Closed("connection closed".to_string()));
                false
            }
            Route::Count(_) | Route::Negentropy(_) => false,
        });
    }

    async fn resubscribe(&self) {
        let requests: Vec<ClientMessage> = lock(&self.routes)
            .iter()
            .filter_map(|(subscription_id, route)| match route {
                Route::Subscription { filters, .. } => Some(ClientMessage::Req {
                    subscription_id: subscription_id.clone(),
                    filters: filters.clone(),
                }),
                _ => None,
            })
            .collect();

        for request in requests {
            if let Err(error) = self.send(&request).await {
                warn!("resubscribe on {} failed: {}", self.url, error);
            }
        }
    }
}

impl Drop for RelayInner {
    fn drop(&mut self) {
        if let Some(task) = lock(&self.supervisor).take() {
            task.abort();
        }
    }
}

async fn read_frames(weak: &Weak<RelayInner>, reader: &mut WsReader) {
    while let Some(frame) = reader.next().await {
        let Some(inner) = weak.upgrade() else {
            return;
        };
        match frame {
            Ok(Message::Text(text)) => match parse_relay_message(text.as_str()) {
                Ok(Some(message)) => inner.dispatch(message),
                Ok(None) => {}
                Err(error) => {
                    warn!("protocol parse error on {}: {}", inner.url, error);
                    let _ = inner
                        .notifications
                        .send(RelayNotification::Notice(format!("parse error: {}", error)));
                }
            },
            Ok(Message::Ping(payload)) => {
                debug!("received ping from {} ({} bytes)", inner.url, payload.len());
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(error) => {
                warn!("websocket read error on {}: {}", inner.url, error);
                break;
            }
        }
    }
}

async fn supervise(weak: Weak<RelayInner>, mut reader: WsReader) {
    loop {
        read_frames(&weak, &mut reader).await;

        let Some(inner) = weak.upgrade() else {
            return;
        };
        let reconnect = inner.config.auto_reconnect && !inner.closing.load(Ordering::SeqCst);
        inner.on_disconnect(reconnect).await;
        if !reconnect {
            debug!("relay {} disconnected", inner.url);
            return;
        }
        warn!("relay {} connection lost, reconnecting", inner.url);
        drop(inner);

        match reconnect_with_backoff(&weak).await {
            Some(next) => reader = next,
            None => return,
        }
    }
}

/// Retry forever until connected, torn down, or dropped.
async fn reconnect_with_backoff(weak: &Weak<RelayInner>) -> Option<WsReader> {
    let mut attempt: u32 = 0;
    loop {
        attempt = attempt.saturating_add(1);
        let delay = {
            let inner = weak.upgrade()?;
            if inner.closing.load(Ordering::SeqCst) {
                return None;
            }
            inner.set_state(ConnectionState::Connecting);
            inner.config.backoff.delay_for_attempt(attempt)
        };
        tokio::time::sleep(delay).await;

        let inner = weak.upgrade()?;
        if inner.closing.load(Ordering::SeqCst) {
            return None;
        }
        match inner.open().await {
            Ok(reader) => {
                info!("relay {} reconnected after {} attempts", inner.url, attempt);
                inner.resubscribe().await;
                return Some(reader);
            }
            Err(error) => {
                inner.set_state(ConnectionState::Connecting);
                debug!("reconnect attempt {} to {} failed: {}", attempt, inner.url, error);
            }
        }
    }
}

/// Removes a route when the operation waiting on it ends, including by cancellation.
struct RouteGuard<'a> {
    inner: &'a RelayInner,
    id: String,
}

impl Drop for RouteGuard<'_> {
    fn drop(&mut self) {
        lock(&self.inner.routes).remove(&self.id);
    }
}

/// Relay connection.
///
/// Cloning is cheap; clones share the connection.
#[derive(Clone)]
pub struct RelayConnection {
    inner: Arc<RelayInner>,
}

impl fmt::Debug for RelayConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelayConnection")
            .field("url", &self.url())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl RelayConnection {
    /// Create a new relay connection with default config.
    pub fn new(url: &str) -> Result<Self> {
        Self::with_config(url, RelayConfig::default())
    }

    /// Create a new relay connection with custom config.
    pub fn with_config(url: &str, config: RelayConfig) -> Result<Self> {
        let parsed_url = Url::parse(url)?;
        if parsed_url.scheme() != "ws" && parsed_url.scheme() != "wss" {
            return Err(ClientError::InvalidUrl(format!(
                "URL must use ws:// or wss:// scheme, got: {}",
                parsed_url.scheme()
            )));
        }

        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (notifications, _) = broadcast::channel(64);

        Ok(Self {
            inner: Arc::new(RelayInner {
                url: parsed_url,
                config,
                state,
                writer: Mutex::new(None),
                routes: StdMutex::new(HashMap::new()),
                pending_ok: StdMutex::new(HashMap::new()),
                notifications,
                supervisor: StdMutex::new(None),
                closing: AtomicBool::new(false),
                next_id: AtomicU64::new(0),
            }),
        })
    }

    /// Relay URL as string.
    pub fn url(&self) -> &str {
        self.inner.url.as_str()
    }

    pub fn config(&self) -> &RelayConfig {
        &self.inner.config
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        self.inner.state()
    }

    /// Open subscriptions, counts and negentropy sessions.
    pub fn active_requests(&self) -> usize {
        lock(&self.inner.routes).len()
    }

    /// NOTICE and AUTH messages received from now on.
    pub fn notifications(&self) -> broadcast::Receiver<RelayNotification> {
        self.inner.notifications.subscribe()
    }

    /// Connect to relay and start the background supervisor.
    ///
    /// Transport failures are retried `connect_attempts` times with backoff.
    pub async fn connect(&self) -> Result<()> {
        let mut begun = false;
        self.inner.state.send_if_modified(|state| {
            if *state == ConnectionState::Disconnected {
                *state = ConnectionState::Connecting;
                begun = true;
                true
            } else {
                false
            }
        });
        if !begun {
            return match self.state() {
                ConnectionState::Connected => Err(ClientError::AlreadyConnected),
                _ => self.wait_connected().await,
            };
        }

        self.inner.closing.store(false, Ordering::SeqCst);
        let attempts = self.inner.config.connect_attempts.max(1);
        let mut attempt = 0;
        let reader = loop {
            attempt += 1;
            match self.inner.open().await {
                Ok(reader) => break reader,
                Err(error) if error.is_transient() && attempt < attempts => {
                    let delay = self.inner.config.backoff.delay_for_attempt(attempt);
                    debug!(
                        "connect attempt {} to {} failed: {}; retrying in {:?}",
                        attempt,
                        self.url(),
                        error,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(error) => {
                    self.inner.set_state(ConnectionState::Disconnected);
                    return Err(error);
                }
            }
        };

        let task = tokio::spawn(supervise(Arc::downgrade(&self.inner), reader));
        if let Some(previous) = lock(&self.inner.supervisor).replace(task) {
            previous.abort();
        }
        debug!("connected to relay {}", self.url());
        Ok(())
    }

    /// Disconnect from relay and stop background tasks.
    ///
    /// Open subscriptions end with `SubscriptionItem::Closed`.
    pub async fn disconnect(&self) -> Result<()> {
        self.inner.closing.store(true, Ordering::SeqCst);
        self.inner.set_state(ConnectionState::Closing);
        if let Some(task) = lock(&self.inner.supervisor).take() {
            task.abort();
        }

        let writer = self.inner.writer.lock().await.take();
        let result = match writer {
            Some(mut writer) => writer
                .send(Message::Close(None))
                .await
                .map_err(|error| ClientError::WebSocket(error.to_string())),
            None => Ok(()),
        };

        self.inner.on_disconnect(false).await;
        result
    }

    /// Disconnect once every open subscription and pending publish finished.
    pub fn disconnect_when_idle(&self) {
        let relay = self.clone();
        tokio::spawn(async move {
            while relay.inner.is_busy() {
                tokio::time::sleep(IDLE_POLL_INTERVAL).await;
            }
            if let Err(error) = relay.disconnect().await {
                debug!("idle disconnect of {} failed: {}", relay.url(), error);
            }
        });
    }

    async fn wait_connected(&self) -> Result<()> {
        let mut receiver = self.inner.state.subscribe();
        let outcome = timeout(
            self.inner.config.connect_timeout,
            receiver.wait_for(|state| *state != ConnectionState::Connecting),
        )
        .await;

        match outcome {
            Err(_) => Err(ClientError::Timeout(format!(
                "relay {} still connecting after {:?}",
                self.url(),
                self.inner.config.connect_timeout
            ))),
            Ok(Ok(state)) if *state == ConnectionState::Connected => Ok(()),
            Ok(_) => Err(ClientError::NotConnected),
        }
    }

    /// Connect lazily for caller-driven operations.
    async fn ensure_connected(&self) -> Result<()> {
        match self.state() {
            ConnectionState::Connected => Ok(()),
            ConnectionState::Connecting => self.wait_connected().await,
            ConnectionState::Closing => Err(ClientError::NotConnected),
            ConnectionState::Disconnected => match self.connect().await {
                Err(ClientError::AlreadyConnected) => Ok(()),
                other => other,
            },
        }
    }

    /// Open a subscription. Events sent before the relay's EOSE are stored
    /// events; later ones are live.
    pub async fn subscribe(
        &self,
        filters: Vec<Filter>,
        options: SubscribeOptions,
    ) -> Result<Subscription> {
        validate_filters(&filters)?;
        self.ensure_connected().await?;

        let id = options.id.unwrap_or_else(|| self.inner.next_id("sub"));
        let (sender, receiver) = mpsc::unbounded_channel();
        {
            let mut routes = lock(&self.inner.routes);
            if routes.contains_key(&id) {
                return Err(ClientError::InvalidRequest(format!(
                    "subscription id {} already in use",
                    id
                )));
            }
            routes.insert(
                id.clone(),
                Route::Subscription {
                    filters: filters.clone(),
                    sender,
                },
            );
        }

        let request = ClientMessage::Req {
            subscription_id: id.clone(),
            filters,
        };
        if let Err(error) = self.inner.send(&request).await {
            lock(&self.inner.routes).remove(&id);
            return Err(error);
        }

        Ok(Subscription::new(
            id,
            self.clone(),
            receiver,
            options.close_on_eose,
        ))
    }

    /// Subscription that ends after the relay's EOSE.
    pub async fn request(&self, filters: Vec<Filter>) -> Result<Subscription> {
        self.subscribe(filters, SubscribeOptions::default().close_on_eose())
            .await
    }

    /// Close subscription on relay.
    pub async fn close(&self, subscription_id: &str) -> Result<()> {
        let removed = lock(&self.inner.routes).remove(subscription_id).is_some();
        if removed && self.state() == ConnectionState::Connected {
            self.inner
                .send(&ClientMessage::Close(subscription_id.to_string()))
                .await?;
        }
        Ok(())
    }

    /// Forget a route and tell the relay in the background.
    pub(crate) fn release(&self, subscription_id: &str, frame: ClientMessage) {
        let removed = lock(&self.inner.routes).remove(subscription_id).is_some();
        if !removed || self.state() != ConnectionState::Connected {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let inner = Arc::clone(&self.inner);
        runtime.spawn(async move {
            if let Err(error) = inner.send(&frame).await {
                debug!("failed to release subscription on {}: {}", inner.url, error);
            }
        });
    }

    pub(crate) fn release_subscription(&self, subscription_id: &str) {
        self.release(
            subscription_id,
            ClientMessage::Close(subscription_id.to_string()),
        );
    }

    pub(crate) fn remove_route(&self, subscription_id: &str) -> bool {
        lock(&self.inner.routes).remove(subscription_id).is_some()
    }

    pub(crate) fn register_negentropy(
        &self,
    ) -> (String, mpsc::UnboundedReceiver<Result<Vec<u8>>>) {
        let id = self.inner.next_id("neg");
        let (sender, receiver) = mpsc::unbounded_channel();
        lock(&self.inner.routes).insert(id.clone(), Route::Negentropy(sender));
        (id, receiver)
    }

    pub(crate) async fn send_message(&self, message: &ClientMessage) -> Result<()> {
        self.inner.send(message).await
    }

    /// Publish an event and wait for the relay's `OK`.
    ///
    /// Transport failures are retried up to `publish_attempts` times with
    /// backoff. A relay rejection is returned as-is and never retried.
    pub async fn publish(&self, event: &Event) -> Result<PublishConfirmation> {
        let attempts = self.inner.config.publish_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.publish_once(event).await {
                Ok((accepted, message)) => {
                    if !accepted {
                        debug!("{} rejected {}: {}", self.url(), event.id, message);
                    }
                    return Ok(PublishConfirmation {
                        relay_url: self.url().to_string(),
                        event_id: event.id.clone(),
                        accepted,
                        message,
                        attempts: attempt,
                    });
                }
                Err(error) if error.is_transient() && attempt < attempts => {
                    let delay = self.inner.config.backoff.delay_for_attempt(attempt);
                    debug!(
                        "publish of {} to {} failed: {}; retrying in {:?}",
                        event.id,
                        self.url(),
                        error,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(error) => return Err(error),
            }
        }
    }

    async fn publish_once(&self, event: &Event) -> Result<(bool, String)> {
        self.ensure_connected().await?;

        let (sender, receiver) = oneshot::channel();
        lock(&self.inner.pending_ok)
            .entry(event.id.clone())
            .or_default()
            .push(sender);

        let sent = self
            .inner
            .send(&ClientMessage::Event(event.clone()))
            .await;
        let reply = match sent {
            Ok(()) => timeout(self.inner.config.publish_timeout, receiver).await,
            Err(error) => {
                drop(receiver);
                self.prune_pending_ok(&event.id);
                return Err(error);
            }
        };

        match reply {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(ClientError::Connection(format!(
                "connection to {} lost before OK",
                self.url()
            ))),
            Err(_) => {
                self.prune_pending_ok(&event.id);
                Err(ClientError::Timeout(format!(
                    "no OK from {} after {:?}",
                    self.url(),
                    self.inner.config.publish_timeout
                )))
            }
        }
    }

    fn prune_pending_ok(&self, event_id: &str) {
        let mut pending = lock(&self.inner.pending_ok);
        if let Some(waiters) = pending.get_mut(event_id) {
            waiters.retain(|waiter| !waiter.is_closed());
            if waiters.is_empty() {
                pending.remove(event_id);
            }
        }
    }

    /// NIP-45 event count.
    pub async fn count(&self, filters: Vec<Filter>) -> Result<u64> {
        validate_filters(&filters)?;
        self.ensure_connected().await?;

        let id = self.inner.next_id("count");
        let (sender, receiver) = oneshot::channel();
        lock(&self.inner.routes).insert(id.clone(), Route::Count(sender));
        let _guard = RouteGuard {
            inner: &self.inner,
            id: id.clone(),
        };

        self.inner
            .send(&ClientMessage::Count {
                subscription_id: id,
                filters,
            })
            .await?;

        match timeout(self.inner.config.request_timeout, receiver).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ClientError::Connection(format!(
                "connection to {} lost before COUNT reply",
                self.url()
            ))),
            Err(_) => Err(ClientError::Timeout(format!(
                "no COUNT reply from {} after {:?}",
                self.url(),
                self.inner.config.request_timeout
            ))),
        }
    }

    /// Reconcile `storage` with the relay's events matching `filter` (NIP-77).
    ///
    /// `on_round` sees the cumulative `have`/`need` after every round trip.
    /// A relay that refuses negentropy fails with `ClientError::RelayError`.
    pub async fn reconcile<F>(
        &self,
        filter: &Filter,
        storage: StorageVector,
        on_round: F,
    ) -> Result<ReconcileOutcome>
    where
        F: FnMut(RoundUpdate<'_>) + Send,
    {
        validate_filters(std::slice::from_ref(filter))?;
        self.ensure_connected().await?;

        let mut session = RelayNegentropySession::new(self.clone(), filter.clone());
        let outcome = nostr::reconcile(
            storage,
            &mut session,
            self.inner.config.frame_size_limit,
            on_round,
        )
        .await?;
        debug!(
            "reconciled with {} in {} rounds: {} have, {} need",
            self.url(),
            outcome.rounds,
            outcome.have.len(),
            outcome.need.len()
        );
        Ok(outcome)
    }
}

fn validate_filters(filters: &[Filter]) -> Result<()> {
    for filter in filters {
        filter
            .validate()
            .map_err(|error| ClientError::InvalidRequest(error.to_string()))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unreachable_config() -> RelayConfig {
        RelayConfig {
            connect_timeout: Duration::from_millis(500),
            connect_attempts: 2,
            publish_attempts: 2,
            auto_reconnect: false,
            backoff: crate::config::BackoffConfig {
                initial_delay: Duration::from_millis(5),
                max_delay: Duration::from_millis(10),
                factor: 2.0,
                jitter: 0.0,
            },
            ..RelayConfig::default()
        }
    }

    #[test]
    fn rejects_non_websocket_urls() {
        assert!(matches!(
            RelayConnection::new("https://relay.example.com"),
            Err(ClientError::InvalidUrl(_))
        ));
        assert!(matches!(
            RelayConnection::new("not a url"),
            Err(ClientError::UrlParse(_))
        ));

        let relay = RelayConnection::new("wss://relay.example.com").unwrap();
        assert_eq!(relay.url(), "wss://relay.example.com/");
        assert_eq!(relay.state(), ConnectionState::Disconnected);
        assert_eq!(relay.active_requests(), 0);
    }

    #[test]
    fn subscribe_options_builder() {
        let options = SubscribeOptions::default().id("feed").close_on_eose();
        assert_eq!(options.id.as_deref(), Some("feed"));
        assert!(options.close_on_eose);
    }

    #[tokio::test]
    async fn unreachable_relay_fails_after_retries() {
        let relay = RelayConnection::with_config("ws://127.0.0.1:1", unreachable_config()).unwrap();

        let error = relay.connect().await.unwrap_err();
        assert!(error.is_transient(), "{error}");
        assert_eq!(relay.state(), ConnectionState::Disconnected);

        let event = Event {
            id: "0".repeat(64),
            pubkey: "1".repeat(64),
            created_at: 1,
            kind: 1,
            tags: vec![],
            content: String::new(),
            sig: String::new(),
        };
        assert!(relay.publish(&event).await.unwrap_err().is_transient());
    }

    #[tokio::test]
    async fn malformed_filters_fail_before_connecting() {
        let relay = RelayConnection::with_config("ws://127.0.0.1:1", unreachable_config()).unwrap();
        let error = relay
            .request(vec![Filter::new().since(10).until(1)])
            .await
            .unwrap_err();
        assert!(matches!(error, ClientError::InvalidRequest(_)));
        assert_eq!(relay.state(), ConnectionState::Disconnected);
    }
}
