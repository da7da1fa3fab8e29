//! Storage seam shared by the relay pool and local event stores.

use async_trait::async_trait;
use thiserror::Error;

use crate::filter::{Filter, FilterError};
use crate::nip01::Event;
use crate::nip77::{Nip77Error, StorageVector};

#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("backend error: {0}")]
    Backend(String),

    #[error("invalid filter: {0}")]
    InvalidFilter(#[from] FilterError),

    #[error("negentropy error: {0}")]
    Negentropy(#[from] Nip77Error),
}

/// Event storage the networking layer can write into and sync against.
#[async_trait]
pub trait EventDatabase: Send + Sync {
    /// Store `event`. Returns `true` when the event was not known before.
    async fn save_event(&self, event: &Event) -> Result<bool, DatabaseError>;

    async fn has_event(&self, id: &str) -> Result<bool, DatabaseError>;

    async fn event_by_id(&self, id: &str) -> Result<Option<Event>, DatabaseError>;

    /// Sealed `(created_at, id)` vector of the stored events matching `filter`.
    async fn negentropy_items(&self, filter: &Filter) -> Result<StorageVector, DatabaseError>;
}
