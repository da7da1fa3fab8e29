//! Nostr protocol primitives: events, filters, deletion and expiration rules,
//! and the NIP-77 negentropy reconciliation engine.

pub mod database;
pub mod filter;
pub mod nip01;
pub mod nip09;
pub mod nip40;
pub mod nip77;
mod tag_parsing;

pub use database::{DatabaseError, EventDatabase};
pub use filter::{Filter, FilterError, filters_signature};
pub use nip01::{
    Coordinate, Event, KindClassification, Nip01Error, UnsignedEvent, classify_kind,
    get_event_hash, is_hex_id, supersedes, unix_now,
};
pub use nip09::{DELETION_REQUEST_KIND, DeletionRequest, Nip09Error};
pub use nip40::{expiration, is_expired};
pub use nip77::{
    DEFAULT_FRAME_SIZE_LIMIT, EventId, Negentropy, Nip77Error, ReconcileOutcome, ReconcileSession,
    RoundUpdate, StorageVector, reconcile,
};
