//! NIP-01: basic event model, kind classes and coordinates.

use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::tag_parsing::find_tag_value;

/// Tag holding the identifier of an addressable event.
pub const IDENTIFIER_TAG: &str = "d";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Nip01Error {
    #[error("invalid event id: {0}")]
    InvalidId(String),

    #[error("invalid coordinate: {0}")]
    InvalidCoordinate(String),
}

/// A signed Nostr event.
///
/// Events are immutable once created; an update is a new event.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub pubkey: String,
    pub created_at: u64,
    pub kind: u16,
    pub tags: Vec<Vec<String>>,
    pub content: String,
    pub sig: String,
}

impl Event {
    /// The id decoded to raw bytes.
    pub fn id_bytes(&self) -> Result<[u8; 32], Nip01Error> {
        let bytes = hex::decode(&self.id).map_err(|_| Nip01Error::InvalidId(self.id.clone()))?;
        bytes
            .try_into()
            .map_err(|_| Nip01Error::InvalidId(self.id.clone()))
    }

    pub fn classification(&self) -> KindClassification {
        classify_kind(self.kind)
    }

    /// Value of the first `d` tag, or the empty string.
    pub fn identifier(&self) -> &str {
        find_tag_value(&self.tags, IDENTIFIER_TAG).unwrap_or_default()
    }

    pub fn coordinate(&self) -> Option<Coordinate> {
        Coordinate::from_event(self)
    }
}

/// An event before it has been signed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnsignedEvent {
    pub pubkey: String,
    pub created_at: u64,
    pub kind: u16,
    pub tags: Vec<Vec<String>>,
    pub content: String,
}

/// Content-derived event id: sha256 of `[0, pubkey, created_at, kind, tags, content]`.
pub fn get_event_hash(event: &UnsignedEvent) -> String {
    let serialized = serde_json::json!([
        0,
        event.pubkey,
        event.created_at,
        event.kind,
        event.tags,
        event.content
    ])
    .to_string();
    hex::encode(Sha256::digest(serialized.as_bytes()))
}

/// Storage behavior derived from an event kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KindClassification {
    /// Every event is kept.
    Regular,
    /// One event per `(kind, pubkey)`.
    Replaceable,
    /// Never stored.
    Ephemeral,
    /// One event per `(kind, pubkey, d tag)`.
    Addressable,
}

pub fn classify_kind(kind: u16) -> KindClassification {
    match kind {
        0 | 3 | 10_000..20_000 => KindClassification::Replaceable,
        20_000..30_000 => KindClassification::Ephemeral,
        30_000..40_000 => KindClassification::Addressable,
        _ => KindClassification::Regular,
    }
}

/// Key of a replaceable or addressable event.
///
/// Rendered as `kind:pubkey:identifier`, the form used by `a` tags. The
/// identifier is empty for replaceable kinds.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Coordinate {
    pub kind: u16,
    pub pubkey: String,
    pub identifier: String,
}

impl Coordinate {
    pub fn new(kind: u16, pubkey: impl Into<String>, identifier: impl Into<String>) -> Self {
        Self {
            kind,
            pubkey: pubkey.into(),
            identifier: identifier.into(),
        }
    }

    pub fn from_event(event: &Event) -> Option<Self> {
        Self::with_classification(event, event.classification())
    }

    /// Coordinate of `event` when its kind behaves as `classification`.
    pub fn with_classification(event: &Event, classification: KindClassification) -> Option<Self> {
        match classification {
            KindClassification::Replaceable => Some(Self::new(event.kind, &event.pubkey, "")),
            KindClassification::Addressable => {
                Some(Self::new(event.kind, &event.pubkey, event.identifier()))
            }
            KindClassification::Regular | KindClassification::Ephemeral => None,
        }
    }
}

impl fmt::Display for Coordinate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.kind, self.pubkey, self.identifier)
    }
}

impl FromStr for Coordinate {
    type Err = Nip01Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let mut parts = value.splitn(3, ':');
        let kind = parts
            .next()
            .and_then(|kind| kind.parse::<u16>().ok())
            .ok_or_else(|| Nip01Error::InvalidCoordinate(value.to_string()))?;
        let pubkey = parts
            .next()
            .filter(|pubkey| is_hex_id(pubkey))
            .ok_or_else(|| Nip01Error::InvalidCoordinate(value.to_string()))?;
        let identifier = parts.next().unwrap_or_default();

        Ok(Self::new(kind, pubkey, identifier))
    }
}

/// True when `a` replaces `b` under the same coordinate: newer wins, equal
/// timestamps keep the lexicographically smaller id.
pub fn supersedes(a: &Event, b: &Event) -> bool {
    a.created_at > b.created_at || (a.created_at == b.created_at && a.id < b.id)
}

/// True for 64-character lowercase hex strings (ids and pubkeys).
pub fn is_hex_id(value: &str) -> bool {
    value.len() == 64
        && value
            .bytes()
            .all(|byte| byte.is_ascii_digit() || (b'a'..=b'f').contains(&byte))
}

/// Current unix time in seconds.
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or_default()
}
