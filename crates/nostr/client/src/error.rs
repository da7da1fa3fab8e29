//! Client error types.

use nostr::{DatabaseError, Nip77Error};
use thiserror::Error;

/// Client error type.
///
/// Relay policy decisions are not errors: a rejected publish is a
/// `PublishConfirmation` with `accepted == false` and a relay-closed
/// subscription ends with `SubscriptionItem::Closed`.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("URL parse error: {0}")]
    UrlParse(#[from] url::ParseError),

    #[error("relay error: {0}")]
    RelayError(String),

    #[error("timeout error: {0}")]
    Timeout(String),

    #[error("not connected")]
    NotConnected,

    #[error("already connected")]
    AlreadyConnected,

    #[error("no relays available")]
    NoRelays,

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("negentropy error: {0}")]
    Negentropy(#[from] Nip77Error),

    #[error("database error: {0}")]
    Database(#[from] DatabaseError),
}

impl ClientError {
    /// Transport failures that a retry may fix.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::WebSocket(_)
                | Self::Connection(_)
                | Self::Io(_)
                | Self::Timeout(_)
                | Self::NotConnected
        )
    }
}

/// Client result type.
pub type Result<T> = std::result::Result<T, ClientError>;
