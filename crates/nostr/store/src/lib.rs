//! In-memory Nostr event index.
//!
//! [`EventIndex`] holds the versioning rules (replaceable and addressable
//! kinds, NIP-09 tombstones, NIP-40 expiration) and the secondary indices used
//! for query planning. [`Store`] shares an index across tasks and adds live
//! queries whose results are recomputed once per mutation and fanned out to
//! every subscriber of the same selector.

pub mod config;
pub mod error;
pub mod index;
pub mod live;
mod store;

pub use config::{Clock, ManualClock, StoreConfig, SystemClock};
pub use error::{Result, StoreError};
pub use index::{AddOutcome, EventIndex, RejectReason};
pub use live::{EventStream, LiveQuery, Selector, Snapshot};
pub use store::Store;
