//! Store error types.

use nostr::{DatabaseError, FilterError, Nip09Error, Nip77Error};
use thiserror::Error;

/// Store error type.
///
/// Ordinary rejections (duplicates, superseded versions, tombstoned or expired
/// events) are reported through `AddOutcome`, not as errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("invalid filter: {0}")]
    InvalidFilter(#[from] FilterError),

    #[error("invalid event: {0}")]
    InvalidEvent(String),

    #[error("invalid deletion request: {0}")]
    InvalidDeletion(Nip09Error),

    #[error("cross-author deletion: {author} cannot delete {target}")]
    CrossAuthorDeletion { author: String, target: String },

    #[error("negentropy error: {0}")]
    Negentropy(#[from] Nip77Error),
}

impl From<Nip09Error> for StoreError {
    fn from(error: Nip09Error) -> Self {
        match error {
            Nip09Error::CrossAuthor { author, target } => {
                Self::CrossAuthorDeletion { author, target }
            }
            other => Self::InvalidDeletion(other),
        }
    }
}

impl From<StoreError> for DatabaseError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::InvalidFilter(error) => Self::InvalidFilter(error),
            StoreError::Negentropy(error) => Self::Negentropy(error),
            other => Self::Backend(other.to_string()),
        }
    }
}

/// Store result type.
pub type Result<T> = std::result::Result<T, StoreError>;
