//! Relay protocol frames.

use nostr::nip77::{NegClose, NegMsg, NegOpen};
use nostr::{Event, Filter};
use serde_json::{Value, json};

use crate::error::{ClientError, Result};

/// Relay message received from a relay.
#[derive(Debug, Clone)]
pub enum RelayMessage {
    Event(String, Event),
    /// `event_id`, accepted flag, relay message.
    Ok(String, bool, String),
    Eose(String),
    /// Subscription ended by the relay, with its reason.
    Closed(String, String),
    Notice(String),
    Auth(String),
    Count(String, u64),
    /// Subscription id and hex negentropy message.
    NegMsg(String, String),
    NegErr(String, String),
}

/// Message sent from client to relay.
#[derive(Debug, Clone)]
pub enum ClientMessage {
    Event(Event),
    Req {
        subscription_id: String,
        filters: Vec<Filter>,
    },
    Close(String),
    Count {
        subscription_id: String,
        filters: Vec<Filter>,
    },
    NegOpen(NegOpen),
    NegMsg(NegMsg),
    NegClose(NegClose),
}

impl ClientMessage {
    pub fn to_value(&self) -> Value {
        match self {
            Self::Event(event) => json!(["EVENT", event]),
            Self::Req {
                subscription_id,
                filters,
            } => filter_frame("REQ", subscription_id, filters),
            Self::Close(subscription_id) => json!(["CLOSE", subscription_id]),
            Self::Count {
                subscription_id,
                filters,
            } => filter_frame("COUNT", subscription_id, filters),
            Self::NegOpen(open) => open.to_json(),
            Self::NegMsg(message) => message.to_json(),
            Self::NegClose(close) => close.to_json(),
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.to_value())?)
    }
}

fn filter_frame(label: &str, subscription_id: &str, filters: &[Filter]) -> Value {
    let mut frame = vec![json!(label), json!(subscription_id)];
    frame.extend(filters.iter().map(|filter| json!(filter)));
    Value::Array(frame)
}

fn string_at(array: &[Value], index: usize, what: &str) -> Result<String> {
    array
        .get(index)
        .and_then(Value::as_str)
        .map(str::to_owned)
        .ok_or_else(|| ClientError::Protocol(format!("invalid {what}")))
}

fn require_len(array: &[Value], len: usize, kind: &str) -> Result<()> {
    if array.len() < len {
        return Err(ClientError::Protocol(format!("invalid {kind} message")));
    }
    Ok(())
}

/// Parse relay protocol JSON text message into typed relay message.
///
/// Unknown message kinds and empty arrays yield `None`.
pub fn parse_relay_message(text: &str) -> Result<Option<RelayMessage>> {
    let value: Value = serde_json::from_str(text)?;
    let array = value
        .as_array()
        .ok_or_else(|| ClientError::Protocol("expected JSON array relay message".to_string()))?;
    if array.is_empty() {
        return Ok(None);
    }

    let kind = array[0]
        .as_str()
        .ok_or_else(|| ClientError::Protocol("missing relay message kind".to_string()))?;

    let message = match kind {
        "EVENT" => {
            require_len(array, 3, "EVENT")?;
            let subscription_id = string_at(array, 1, "EVENT subscription id")?;
            let event: Event = serde_json::from_value(array[2].clone()).map_err(|error| {
                ClientError::Protocol(format!("invalid EVENT payload: {}", error))
            })?;
            RelayMessage::Event(subscription_id, event)
        }
        "OK" => {
            require_len(array, 4, "OK")?;
            let event_id = string_at(array, 1, "OK event id")?;
            let accepted = array[2]
                .as_bool()
                .ok_or_else(|| ClientError::Protocol("invalid OK accepted flag".to_string()))?;
            let message = string_at(array, 3, "OK message text")?;
            RelayMessage::Ok(event_id, accepted, message)
        }
        "EOSE" => {
            require_len(array, 2, "EOSE")?;
            RelayMessage::Eose(string_at(array, 1, "EOSE subscription id")?)
        }
        "CLOSED" => {
            require_len(array, 2, "CLOSED")?;
            let subscription_id = string_at(array, 1, "CLOSED subscription id")?;
            let reason = match array.get(2) {
                Some(_) => string_at(array, 2, "CLOSED message text")?,
                None => String::new(),
            };
            RelayMessage::Closed(subscription_id, reason)
        }
        "NOTICE" => {
            require_len(array, 2, "NOTICE")?;
            RelayMessage::Notice(string_at(array, 1, "NOTICE message text")?)
        }
        "AUTH" => {
            require_len(array, 2, "AUTH")?;
            RelayMessage::Auth(string_at(array, 1, "AUTH challenge")?)
        }
        "COUNT" => {
            require_len(array, 3, "COUNT")?;
            let subscription_id = string_at(array, 1, "COUNT subscription id")?;
            let count = array[2]
                .get("count")
                .and_then(Value::as_u64)
                .ok_or_else(|| ClientError::Protocol("invalid COUNT payload".to_string()))?;
            RelayMessage::Count(subscription_id, count)
        }
        "NEG-MSG" => {
            require_len(array, 3, "NEG-MSG")?;
            RelayMessage::NegMsg(
                string_at(array, 1, "NEG-MSG subscription id")?,
                string_at(array, 2, "NEG-MSG payload")?,
            )
        }
        "NEG-ERR" => {
            require_len(array, 3, "NEG-ERR")?;
            RelayMessage::NegErr(
                string_at(array, 1, "NEG-ERR subscription id")?,
                string_at(array, 2, "NEG-ERR reason")?,
            )
        }
        _ => return Ok(None),
    };

    Ok(Some(message))
}
