//! Nostr relay client transport.
//!
//! - one multiplexed WebSocket session per relay, with background reconnect
//! - multi-relay pool with merged, deduplicated streams and per-relay results
//! - NIP-77 negentropy sync against any `EventDatabase`

pub mod config;
pub mod error;
pub mod message;
mod negentropy;
pub mod pool;
pub mod relay;
pub mod subscription;

pub use config::{BackoffConfig, ConfigError, PoolConfig, RelayConfig};
pub use error::{ClientError, Result};
pub use message::{ClientMessage, RelayMessage, parse_relay_message};
pub use pool::{
    PoolItem, PoolSubscription, RelayPool, RelayResult, RelaySyncReport, RequestOptions,
    SyncDirection, SyncOptions, SyncSummary,
};
pub use relay::{
    ConnectionState, PublishConfirmation, RelayConnection, RelayNotification, SubscribeOptions,
};
pub use subscription::{Subscription, SubscriptionItem};
