use thiserror::Error;

/// NIP-77 error types
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Nip77Error {
    #[error("empty negentropy message")]
    EmptyMessage,

    #[error("Invalid protocol version: {0:#04x}")]
    InvalidProtocolVersion(u8),

    #[error("unsupported negentropy protocol version requested: {0:#04x}")]
    UnsupportedProtocolVersion(u8),

    #[error("Invalid mode: {0}")]
    InvalidMode(u64),

    #[error("Invalid hex encoding: {0}")]
    InvalidHex(String),

    #[error("Varint decode error: {0}")]
    VarintDecode(String),

    #[error("Invalid bound: {0}")]
    InvalidBound(String),

    #[error("Invalid range: {0}")]
    InvalidRange(String),

    #[error("Invalid ID length: expected 32, got {0}")]
    InvalidIdLength(usize),

    #[error("duplicate id in storage vector: {0}")]
    DuplicateId(String),

    #[error("storage vector is sealed")]
    Sealed,

    #[error("storage vector is not sealed")]
    NotSealed,

    #[error("frame size limit too small: {0} (minimum 4096)")]
    FrameSizeLimitTooSmall(u64),

    #[error("negentropy instance already initiated")]
    AlreadyInitiated,

    #[error("operation requires the initiator role")]
    NotInitiator,

    #[error("operation requires the responder role")]
    NotResponder,

    #[error("Invalid frame: {0}")]
    InvalidFrame(String),
}

pub type Result<T> = std::result::Result<T, Nip77Error>;
