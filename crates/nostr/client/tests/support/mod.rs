//! In-process relay for client integration tests.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use nostr::nip77::{NegErr, NegMsg, NegOpen, decode_message_hex};
use nostr::{Event, Filter, Negentropy, StorageVector};
use nostr_client::{BackoffConfig, PoolConfig, RelayConfig};
use serde_json::{Value, json};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;

pub const AUTHOR: &str = "0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef";

/// Note with a synthetic hex id derived from `n`.
pub fn note(n: u64, created_at: u64) -> Event {
    Event {
        id: format!("{:064x}", n),
        pubkey: AUTHOR.to_string(),
        created_at,
        kind: 1,
        tags: vec![],
        content: format!("note {}", n),
        sig: String::new(),
    }
}

pub fn fast_relay_config() -> RelayConfig {
    RelayConfig {
        connect_timeout: Duration::from_secs(2),
        publish_timeout: Duration::from_secs(2),
        request_timeout: Duration::from_secs(2),
        backoff: BackoffConfig {
            initial_delay: Duration::from_millis(20),
            max_delay: Duration::from_millis(100),
            factor: 2.0,
            jitter: 0.0,
        },
        ..RelayConfig::default()
    }
}

pub fn fast_pool_config() -> PoolConfig {
    PoolConfig {
        eose_timeout: Duration::from_secs(2),
        relay_config: fast_relay_config(),
        ..PoolConfig::default()
    }
}

#[derive(Debug, Clone, Default)]
pub struct MockBehavior {
    pub events: Vec<Event>,
    /// Never answer `REQ` with EOSE.
    pub withhold_eose: bool,
    /// Answer every `EVENT` with `OK false` and this reason.
    pub reject_publish: Option<String>,
    /// Answer `NEG-OPEN` with `NEG-ERR`.
    pub negentropy_disabled: bool,
    /// Drop the connection instead of answering this many `EVENT` frames.
    pub drop_before_ok: usize,
}

#[derive(Default)]
struct MockState {
    behavior: MockBehavior,
    frames: Vec<Value>,
    connections: usize,
    dropped: usize,
}

pub struct MockRelay {
    url: String,
    state: Arc<Mutex<MockState>>,
    kick: broadcast::Sender<()>,
    task: JoinHandle<()>,
}

impl MockRelay {
    pub async fn start(behavior: MockBehavior) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let state = Arc::new(Mutex::new(MockState {
            behavior,
            ..MockState::default()
        }));
        let (kick, _) = broadcast::channel(4);

        let accept_state = Arc::clone(&state);
        let accept_kick = kick.clone();
        let task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                accept_state.lock().unwrap().connections += 1;
                tokio::spawn(serve(
                    stream,
                    Arc::clone(&accept_state),
                    accept_kick.subscribe(),
                ));
            }
        });

        Self {
            url,
            state,
            kick,
            task,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Drop every open connection without a close handshake.
    pub fn kick(&self) {
        let _ = self.kick.send(());
    }

    pub fn add_event(&self, event: Event) {
        self.state.lock().unwrap().behavior.events.push(event);
    }

    pub fn events(&self) -> Vec<Event> {
        self.state.lock().unwrap().behavior.events.clone()
    }

    pub fn connections(&self) -> usize {
        self.state.lock().unwrap().connections
    }

    /// Frames received with the given label, e.g. `"REQ"`.
    pub fn frames(&self, label: &str) -> Vec<Value> {
        self.state
            .lock()
            .unwrap()
            .frames
            .iter()
            .filter(|frame| frame[0] == label)
            .cloned()
            .collect()
    }
}

impl Drop for MockRelay {
    fn drop(&mut self) {
        self.kick();
        self.task.abort();
    }
}

async fn serve(
    stream: TcpStream,
    state: Arc<Mutex<MockState>>,
    mut kick: broadcast::Receiver<()>,
) {
    let Ok(socket) = accept_async(stream).await else {
        return;
    };
    let (mut write, mut read) = socket.split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Value>();
    let writer = tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            if write.send(Message::Text(frame.to_string())).await.is_err() {
                break;
            }
        }
    });

    let mut sessions: HashMap<String, Negentropy> = HashMap::new();
    loop {
        tokio::select! {
            _ = kick.recv() => break,
            frame = read.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    let Ok(value) = serde_json::from_str::<Value>(&text) else {
                        continue;
                    };
                    let Some(replies) = handle(&value, &state, &mut sessions) else {
                        break;
                    };
                    for reply in replies {
                        let _ = out_tx.send(reply);
                    }
                }
                Some(Ok(_)) => {}
                Some(Err(_)) | None => break,
            }
        }
    }
    writer.abort();
}

fn matching(events: &[Event], filters: &[Filter]) -> Vec<Event> {
    events
        .iter()
        .filter(|event| filters.iter().any(|filter| filter.matches(event)))
        .cloned()
        .collect()
}

fn filters_from(frame: &[Value]) -> Vec<Filter> {
    frame
        .iter()
        .skip(2)
        .filter_map(|value| serde_json::from_value(value.clone()).ok())
        .collect()
}

/// Replies to one client frame; `None` drops the connection.
fn handle(
    value: &Value,
    state: &Arc<Mutex<MockState>>,
    sessions: &mut HashMap<String, Negentropy>,
) -> Option<Vec<Value>> {
    let mut state = state.lock().unwrap();
    state.frames.push(value.clone());
    let Some(frame) = value.as_array() else {
        return Some(vec![]);
    };
    let label = frame[0].as_str().unwrap_or_default();
    let subscription_id = frame.get(1).and_then(Value::as_str).unwrap_or_default();

    let replies = match label {
        "REQ" => {
            let filters = filters_from(frame);
            let mut replies: Vec<Value> = matching(&state.behavior.events, &filters)
                .into_iter()
                .map(|event| json!(["EVENT", subscription_id, event]))
                .collect();
            if !state.behavior.withhold_eose {
                replies.push(json!(["EOSE", subscription_id]));
            }
            replies
        }
        "COUNT" => {
            let filters = filters_from(frame);
            let count = matching(&state.behavior.events, &filters).len();
            vec![json!(["COUNT", subscription_id, {"count": count}])]
        }
        "EVENT" => {
            if state.dropped < state.behavior.drop_before_ok {
                state.dropped += 1;
                return None;
            }
            let event: Event = serde_json::from_value(frame[1].clone()).unwrap();
            if let Some(reason) = state.behavior.reject_publish.clone() {
                return Some(vec![json!(["OK", event.id, false, reason])]);
            }
            let id = event.id.clone();
            if !state.behavior.events.iter().any(|known| known.id == id) {
                state.behavior.events.push(event);
            }
            vec![json!(["OK", id, true, ""])]
        }
        "NEG-OPEN" => {
            if state.behavior.negentropy_disabled {
                return Some(vec![
                    NegErr::blocked(subscription_id, "negentropy disabled").to_json(),
                ]);
            }
            let open = NegOpen::from_json(value).unwrap();
            let mut storage = StorageVector::new();
            for event in matching(&state.behavior.events, std::slice::from_ref(&open.filter)) {
                storage.insert_hex(event.created_at, &event.id).unwrap();
            }
            storage.seal().unwrap();
            let mut responder = Negentropy::new(storage, 0).unwrap();
            let query = decode_message_hex(&open.initial_message).unwrap();
            let reply = responder.reconcile(&query).unwrap();
            sessions.insert(open.subscription_id.clone(), responder);
            vec![NegMsg::new(open.subscription_id, &reply).to_json()]
        }
        "NEG-MSG" => {
            let message = NegMsg::from_json(value).unwrap();
            let Some(responder) = sessions.get_mut(&message.subscription_id) else {
                return Some(vec![
                    NegErr::closed(subscription_id, "unknown session").to_json(),
                ]);
            };
            let query = decode_message_hex(&message.message).unwrap();
            let reply = responder.reconcile(&query).unwrap();
            vec![NegMsg::new(message.subscription_id, &reply).to_json()]
        }
        "NEG-CLOSE" => {
            sessions.remove(subscription_id);
            vec![]
        }
        _ => vec![],
    };
    Some(replies)
}

/// Poll `condition` until it holds or two seconds pass.
pub async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
