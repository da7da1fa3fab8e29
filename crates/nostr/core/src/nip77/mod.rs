//! NIP-77: Negentropy Syncing
//!
//! Range-Based Set Reconciliation (RBSR) between a local [`StorageVector`] and a
//! remote peer's vector for the same filter. Both sides exchange ranges of the
//! `(timestamp, id)` space; equal fingerprints end a range, small ranges are
//! answered with explicit id lists and large ones are split by count into
//! [`BUCKETS`] sub-ranges for the next round.
//!
//! Internal module boundaries:
//! - `error`: shared protocol error and result types
//! - `codec`: varint codec primitives
//! - `model`: bounds, ranges and message encoding with per-message delta state
//! - `storage`: sealed storage vector and fingerprint accumulator
//! - `negentropy`: stateful range reconciliation algorithm
//! - `session`: async driver running an initiator against a transport
//! - `frames`: NEG-OPEN / NEG-MSG / NEG-ERR / NEG-CLOSE relay frames
//! - `tests`: codec/model/reconciliation coverage
//!
//! # Protocol Flow
//!
//! ```text
//! Client                                  Relay
//!   |                                       |
//!   |  NEG-OPEN (filter, initial msg) ---→ |
//!   |                                       | (compute fingerprints)
//!   | ←--- NEG-MSG (ranges with fps)       |
//!   |                                       |
//!   | (compare fingerprints)                |
//!   |  NEG-MSG (refined ranges) ---------→ |
//!   |                                       |
//!   | ←--- NEG-MSG (more refined)          |
//!   |  ...continues until complete...      |
//!   |                                       |
//!   |  NEG-CLOSE ------------------------→ |
//! ```
//!
//! After sync completes, client knows:
//! - IDs it has that relay needs (upload with EVENT)
//! - IDs relay has that it needs (download with REQ)
//!
//! # References
//!
//! - NIP-77: <https://github.com/nostr-protocol/nips/blob/master/77.md>
//! - Negentropy Protocol: <https://github.com/hoytech/negentropy>

mod codec;
mod error;
mod frames;
mod model;
mod negentropy;
mod session;
mod storage;

pub use codec::{decode_varint, encode_varint, write_varint};
pub use error::{Nip77Error, Result};
pub use frames::{NegClose, NegErr, NegMsg, NegOpen};
pub use model::{
    Bound, EventId, FINGERPRINT_SIZE, Fingerprint, ID_SIZE, NegentropyMessage, PROTOCOL_VERSION_1,
    Range, RangeMode, RangePayload, TIMESTAMP_INFINITY, decode_message_hex,
};
pub use negentropy::{
    BUCKETS, DEFAULT_FRAME_SIZE_LIMIT, ID_LIST_THRESHOLD, MIN_FRAME_SIZE_LIMIT, Negentropy,
};
pub use session::{ReconcileOutcome, ReconcileSession, RoundUpdate, reconcile};
pub use storage::{Item, StorageVector, calculate_fingerprint, decode_id};

#[cfg(test)]
mod tests;
