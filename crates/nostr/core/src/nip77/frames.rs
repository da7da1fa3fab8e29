use serde_json::{Value, json};

use super::error::{Nip77Error, Result};
use crate::filter::Filter;

fn frame_elements<'a>(value: &'a Value, label: &str, len: usize) -> Result<&'a [Value]> {
    let arr = value
        .as_array()
        .ok_or_else(|| Nip77Error::InvalidFrame("not an array".to_string()))?;

    if arr.len() != len {
        return Err(Nip77Error::InvalidFrame(format!(
            "expected {} elements, got {}",
            len,
            arr.len()
        )));
    }

    let msg_type = arr[0]
        .as_str()
        .ok_or_else(|| Nip77Error::InvalidFrame("message type not a string".to_string()))?;

    if msg_type != label {
        return Err(Nip77Error::InvalidFrame(format!(
            "expected {}, got {}",
            label, msg_type
        )));
    }

    Ok(arr)
}

fn string_element(value: &Value, field: &str) -> Result<String> {
    value
        .as_str()
        .map(str::to_owned)
        .ok_or_else(|| Nip77Error::InvalidFrame(format!("{field} not a string")))
}

/// Nostr NEG-OPEN message (client to relay)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegOpen {
    pub subscription_id: String,
    pub filter: Filter,
    /// Initial Negentropy message (hex-encoded)
    pub initial_message: String,
}

impl NegOpen {
    pub fn new(subscription_id: impl Into<String>, filter: Filter, message: &[u8]) -> Self {
        Self {
            subscription_id: subscription_id.into(),
            filter,
            initial_message: hex::encode(message),
        }
    }

    pub fn to_json(&self) -> Value {
        json!([
            "NEG-OPEN",
            self.subscription_id,
            self.filter,
            self.initial_message
        ])
    }

    pub fn from_json(value: &Value) -> Result<Self> {
        let arr = frame_elements(value, "NEG-OPEN", 4)?;
        let filter = serde_json::from_value(arr[2].clone())
            .map_err(|e| Nip77Error::InvalidFrame(format!("invalid filter: {e}")))?;

        Ok(Self {
            subscription_id: string_element(&arr[1], "subscription ID")?,
            filter,
            initial_message: string_element(&arr[3], "initial message")?,
        })
    }
}

/// Nostr NEG-MSG message (bidirectional)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegMsg {
    pub subscription_id: String,
    /// Negentropy message (hex-encoded)
    pub message: String,
}

impl NegMsg {
    pub fn new(subscription_id: impl Into<String>, message: &[u8]) -> Self {
        Self {
            subscription_id: subscription_id.into(),
            message: hex::encode(message),
        }
    }

    pub fn to_json(&self) -> Value {
        json!(["NEG-MSG", self.subscription_id, self.message])
    }

    pub fn from_json(value: &Value) -> Result<Self> {
        let arr = frame_elements(value, "NEG-MSG", 3)?;
        Ok(Self {
            subscription_id: string_element(&arr[1], "subscription ID")?,
            message: string_element(&arr[2], "message")?,
        })
    }
}

/// Nostr NEG-ERR message (relay to client)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegErr {
    pub subscription_id: String,
    /// Error reason code
    pub reason: String,
}

impl NegErr {
    pub fn new(subscription_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            subscription_id: subscription_id.into(),
            reason: reason.into(),
        }
    }

    pub fn blocked(subscription_id: impl Into<String>, message: &str) -> Self {
        Self::new(subscription_id, format!("blocked: {}", message))
    }

    pub fn closed(subscription_id: impl Into<String>, message: &str) -> Self {
        Self::new(subscription_id, format!("closed: {}", message))
    }

    pub fn to_json(&self) -> Value {
        json!(["NEG-ERR", self.subscription_id, self.reason])
    }

    pub fn from_json(value: &Value) -> Result<Self> {
        let arr = frame_elements(value, "NEG-ERR", 3)?;
        Ok(Self {
            subscription_id: string_element(&arr[1], "subscription ID")?,
            reason: string_element(&arr[2], "reason")?,
        })
    }
}

/// Nostr NEG-CLOSE message (client to relay)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegClose {
    pub subscription_id: String,
}

impl NegClose {
    pub fn new(subscription_id: impl Into<String>) -> Self {
        Self {
            subscription_id: subscription_id.into(),
        }
    }

    pub fn to_json(&self) -> Value {
        json!(["NEG-CLOSE", self.subscription_id])
    }

    pub fn from_json(value: &Value) -> Result<Self> {
        let arr = frame_elements(value, "NEG-CLOSE", 2)?;
        Ok(Self {
            subscription_id: string_element(&arr[1], "subscription ID")?,
        })
    }
}
