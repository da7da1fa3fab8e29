use std::cmp::Ordering;

use super::codec::{decode_varint, write_varint};
use super::error::{Nip77Error, Result};

/// Negentropy Protocol Version 1
pub const PROTOCOL_VERSION_1: u8 = 0x61;

/// Special infinity timestamp value
pub const TIMESTAMP_INFINITY: u64 = u64::MAX;

/// Size of an event id in bytes.
pub const ID_SIZE: usize = 32;

/// Size of a range fingerprint in bytes.
pub const FINGERPRINT_SIZE: usize = 16;

/// A 256-bit event ID
pub type EventId = [u8; ID_SIZE];

/// Truncated digest summarizing a range of records.
pub type Fingerprint = [u8; FINGERPRINT_SIZE];

/// A timestamp and ID prefix bound for ranges
///
/// Bounds order by timestamp, then by the id prefix zero-padded to 32 bytes, so
/// a bound sorts before every record it does not exclude.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Bound {
    /// The timestamp (u64::MAX for infinity)
    pub timestamp: u64,
    /// The ID prefix (0-32 bytes)
    pub id_prefix: Vec<u8>,
}

impl Bound {
    /// Create a new bound
    pub fn new(timestamp: u64, id_prefix: Vec<u8>) -> Result<Self> {
        if id_prefix.len() > ID_SIZE {
            return Err(Nip77Error::InvalidBound(format!(
                "ID prefix too long: {} bytes (max 32)",
                id_prefix.len()
            )));
        }
        Ok(Self {
            timestamp,
            id_prefix,
        })
    }

    /// Create a bound at timestamp 0 with empty ID
    pub fn zero() -> Self {
        Self::with_timestamp(0)
    }

    /// Create an infinity bound
    pub fn infinity() -> Self {
        Self::with_timestamp(TIMESTAMP_INFINITY)
    }

    pub fn with_timestamp(timestamp: u64) -> Self {
        Self {
            timestamp,
            id_prefix: Vec::new(),
        }
    }

    /// Bound that excludes everything strictly before `(timestamp, id)`.
    pub fn from_record(timestamp: u64, id: &EventId) -> Self {
        Self {
            timestamp,
            id_prefix: id.to_vec(),
        }
    }

    pub fn is_infinity(&self) -> bool {
        self.timestamp == TIMESTAMP_INFINITY
    }

    /// The id prefix zero-padded to a full id.
    pub fn padded_id(&self) -> EventId {
        let mut id = [0u8; ID_SIZE];
        let len = self.id_prefix.len().min(ID_SIZE);
        id[..len].copy_from_slice(&self.id_prefix[..len]);
        id
    }
}

impl Ord for Bound {
    fn cmp(&self, other: &Self) -> Ordering {
        self.timestamp
            .cmp(&other.timestamp)
            .then_with(|| self.padded_id().cmp(&other.padded_id()))
    }
}

impl PartialOrd for Bound {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Range mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeMode {
    /// Skip this range (mode 0)
    Skip = 0,
    /// Fingerprint mode (mode 1)
    Fingerprint = 1,
    /// ID list mode (mode 2)
    IdList = 2,
}

impl TryFrom<u64> for RangeMode {
    type Error = Nip77Error;

    fn try_from(value: u64) -> Result<Self> {
        match value {
            0 => Ok(Self::Skip),
            1 => Ok(Self::Fingerprint),
            2 => Ok(Self::IdList),
            _ => Err(Nip77Error::InvalidMode(value)),
        }
    }
}

/// Range payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RangePayload {
    /// No payload for skip mode
    Skip,
    /// 16-byte fingerprint
    Fingerprint(Fingerprint),
    /// List of event IDs
    IdList(Vec<EventId>),
}

impl RangePayload {
    pub fn mode(&self) -> RangeMode {
        match self {
            Self::Skip => RangeMode::Skip,
            Self::Fingerprint(_) => RangeMode::Fingerprint,
            Self::IdList(_) => RangeMode::IdList,
        }
    }
}

/// A range in the Negentropy protocol
///
/// The lower bound is implied by the previous range in the message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Range {
    /// Exclusive upper bound of this range
    pub upper_bound: Bound,
    /// The mode and payload
    pub payload: RangePayload,
}

impl Range {
    pub fn new(upper_bound: Bound, payload: RangePayload) -> Self {
        Self {
            upper_bound,
            payload,
        }
    }

    pub fn skip(upper_bound: Bound) -> Self {
        Self::new(upper_bound, RangePayload::Skip)
    }

    pub fn fingerprint(upper_bound: Bound, fingerprint: Fingerprint) -> Self {
        Self::new(upper_bound, RangePayload::Fingerprint(fingerprint))
    }

    pub fn id_list(upper_bound: Bound, ids: Vec<EventId>) -> Self {
        Self::new(upper_bound, RangePayload::IdList(ids))
    }
}

/// A decoded Negentropy protocol message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegentropyMessage {
    /// Protocol version (0x61 for V1)
    pub version: u8,
    /// Ordered list of ranges
    pub ranges: Vec<Range>,
}

impl NegentropyMessage {
    /// Create a new message with protocol version 1
    pub fn new(ranges: Vec<Range>) -> Self {
        Self {
            version: PROTOCOL_VERSION_1,
            ranges,
        }
    }

    /// Encode message to bytes
    pub fn encode(&self) -> Vec<u8> {
        let mut writer = MessageWriter::new(self.version);
        for range in &self.ranges {
            writer.write_bound(&range.upper_bound);
            writer.write_mode(range.payload.mode());
            match &range.payload {
                RangePayload::Skip => {}
                RangePayload::Fingerprint(fingerprint) => writer.write_bytes(fingerprint),
                RangePayload::IdList(ids) => {
                    writer.write_varint(ids.len() as u64);
                    for id in ids {
                        writer.write_bytes(id);
                    }
                }
            }
        }
        writer.into_bytes()
    }

    /// Encode message to hex string
    pub fn encode_hex(&self) -> String {
        hex::encode(self.encode())
    }

    /// Decode and validate a complete message.
    ///
    /// Every range is decoded before the message is accepted: truncated payloads,
    /// unknown modes, oversized id prefixes and descending bounds are errors.
    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut reader = MessageReader::new(data);
        let version = reader.read_byte()?;
        if !(0x60..=0x6F).contains(&version) {
            return Err(Nip77Error::InvalidProtocolVersion(version));
        }
        if version != PROTOCOL_VERSION_1 {
            return Err(Nip77Error::UnsupportedProtocolVersion(version));
        }

        let mut ranges: Vec<Range> = Vec::new();
        while !reader.is_empty() {
            let upper_bound = reader.read_bound()?;
            if let Some(previous) = ranges.last() {
                if upper_bound < previous.upper_bound {
                    return Err(Nip77Error::InvalidBound(
                        "range bounds are not in ascending order".to_string(),
                    ));
                }
            }

            let payload = match RangeMode::try_from(reader.read_varint()?)? {
                RangeMode::Skip => RangePayload::Skip,
                RangeMode::Fingerprint => {
                    let mut fingerprint = [0u8; FINGERPRINT_SIZE];
                    fingerprint.copy_from_slice(reader.read_bytes(FINGERPRINT_SIZE)?);
                    RangePayload::Fingerprint(fingerprint)
                }
                RangeMode::IdList => {
                    let count = reader.read_varint()?;
                    if count > (reader.remaining() / ID_SIZE) as u64 {
                        return Err(Nip77Error::InvalidRange(format!(
                            "id list claims {count} ids but only {} bytes remain",
                            reader.remaining()
                        )));
                    }
                    let mut ids = Vec::with_capacity(count as usize);
                    for _ in 0..count {
                        let mut id = [0u8; ID_SIZE];
                        id.copy_from_slice(reader.read_bytes(ID_SIZE)?);
                        ids.push(id);
                    }
                    RangePayload::IdList(ids)
                }
            };

            ranges.push(Range::new(upper_bound, payload));
        }

        Ok(Self { version, ranges })
    }

    /// Decode message from hex string
    pub fn decode_hex(hex_str: &str) -> Result<Self> {
        Self::decode(&decode_message_hex(hex_str)?)
    }
}

pub fn decode_message_hex(hex_str: &str) -> Result<Vec<u8>> {
    hex::decode(hex_str).map_err(|e| Nip77Error::InvalidHex(e.to_string()))
}

/// Position in a [`MessageWriter`] that output can be rolled back to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Checkpoint {
    len: usize,
    last_timestamp: u64,
}

impl Checkpoint {
    pub(crate) fn len(self) -> usize {
        self.len
    }
}

/// Output buffer carrying the timestamp delta state of one message.
#[derive(Debug)]
pub(crate) struct MessageWriter {
    buf: Vec<u8>,
    last_timestamp: u64,
}

impl MessageWriter {
    pub(crate) fn new(version: u8) -> Self {
        Self {
            buf: vec![version],
            last_timestamp: 0,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.buf.len()
    }

    pub(crate) fn checkpoint(&self) -> Checkpoint {
        Checkpoint {
            len: self.buf.len(),
            last_timestamp: self.last_timestamp,
        }
    }

    pub(crate) fn truncate(&mut self, checkpoint: Checkpoint) {
        self.buf.truncate(checkpoint.len);
        self.last_timestamp = checkpoint.last_timestamp;
    }

    pub(crate) fn write_varint(&mut self, value: u64) {
        write_varint(&mut self.buf, value);
    }

    pub(crate) fn write_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub(crate) fn write_mode(&mut self, mode: RangeMode) {
        self.write_varint(mode as u64);
    }

    fn write_timestamp(&mut self, timestamp: u64) {
        if timestamp == TIMESTAMP_INFINITY {
            self.last_timestamp = TIMESTAMP_INFINITY;
            self.write_varint(0);
            return;
        }
        let delta = timestamp.saturating_sub(self.last_timestamp);
        self.last_timestamp = timestamp;
        self.write_varint(delta + 1);
    }

    pub(crate) fn write_bound(&mut self, bound: &Bound) {
        self.write_timestamp(bound.timestamp);
        self.write_varint(bound.id_prefix.len() as u64);
        self.buf.extend_from_slice(&bound.id_prefix);
    }

    pub(crate) fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

/// Input cursor carrying the timestamp delta state of one message.
#[derive(Debug)]
pub(crate) struct MessageReader<'a> {
    data: &'a [u8],
    offset: usize,
    last_timestamp: u64,
}

impl<'a> MessageReader<'a> {
    pub(crate) fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            offset: 0,
            last_timestamp: 0,
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.offset >= self.data.len()
    }

    pub(crate) fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.offset)
    }

    pub(crate) fn read_byte(&mut self) -> Result<u8> {
        let byte = *self
            .data
            .get(self.offset)
            .ok_or(Nip77Error::EmptyMessage)?;
        self.offset += 1;
        Ok(byte)
    }

    pub(crate) fn read_varint(&mut self) -> Result<u64> {
        let (value, len) = decode_varint(&self.data[self.offset..])?;
        self.offset += len;
        Ok(value)
    }

    pub(crate) fn read_bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        if len > self.remaining() {
            return Err(Nip77Error::InvalidRange(format!(
                "expected {len} bytes, {} remain",
                self.remaining()
            )));
        }
        let bytes = &self.data[self.offset..self.offset + len];
        self.offset += len;
        Ok(bytes)
    }

    fn read_timestamp(&mut self) -> Result<u64> {
        let encoded = self.read_varint()?;
        if encoded == 0 || self.last_timestamp == TIMESTAMP_INFINITY {
            self.last_timestamp = TIMESTAMP_INFINITY;
            return Ok(TIMESTAMP_INFINITY);
        }
        let timestamp = self
            .last_timestamp
            .checked_add(encoded - 1)
            .ok_or_else(|| Nip77Error::InvalidBound("timestamp overflow".to_string()))?;
        self.last_timestamp = timestamp;
        Ok(timestamp)
    }

    pub(crate) fn read_bound(&mut self) -> Result<Bound> {
        let timestamp = self.read_timestamp()?;
        let len = self.read_varint()?;
        if len > ID_SIZE as u64 {
            return Err(Nip77Error::InvalidBound(format!(
                "ID prefix length too long: {len}"
            )));
        }
        let id_prefix = self.read_bytes(len as usize)?.to_vec();
        Ok(Bound {
            timestamp,
            id_prefix,
        })
    }
}
