use std::cmp::Ordering;
use std::collections::HashSet;

use sha2::{Digest, Sha256};

use super::codec::write_varint;
use super::error::{Nip77Error, Result};
use super::model::{Bound, EventId, FINGERPRINT_SIZE, Fingerprint, ID_SIZE};

/// A record in the Negentropy protocol (timestamp + ID)
///
/// Records sort by timestamp, then by id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Item {
    pub timestamp: u64,
    pub id: EventId,
}

impl Item {
    pub fn new(timestamp: u64, id: EventId) -> Self {
        Self { timestamp, id }
    }

    fn cmp_bound(&self, bound: &Bound) -> Ordering {
        self.timestamp
            .cmp(&bound.timestamp)
            .then_with(|| self.id.cmp(&bound.padded_id()))
    }
}

/// Sorted `(timestamp, id)` vector used as reconciliation input.
///
/// Records are inserted in any order and become readable once [`seal`](Self::seal)
/// has sorted them and verified that no id occurs twice.
#[derive(Debug, Clone, Default)]
pub struct StorageVector {
    items: Vec<Item>,
    sealed: bool,
}

impl StorageVector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, timestamp: u64, id: EventId) -> Result<()> {
        if self.sealed {
            return Err(Nip77Error::Sealed);
        }
        self.items.push(Item::new(timestamp, id));
        Ok(())
    }

    /// Insert a record whose id is a 64-character hex string.
    pub fn insert_hex(&mut self, timestamp: u64, id: &str) -> Result<()> {
        self.insert(timestamp, decode_id(id)?)
    }

    pub fn seal(&mut self) -> Result<()> {
        if self.sealed {
            return Err(Nip77Error::Sealed);
        }
        let mut seen = HashSet::with_capacity(self.items.len());
        for item in &self.items {
            if !seen.insert(item.id) {
                return Err(Nip77Error::DuplicateId(hex::encode(item.id)));
            }
        }
        self.items.sort_unstable();
        self.sealed = true;
        Ok(())
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Item> {
        self.items.get(index)
    }

    pub fn items(&self) -> &[Item] {
        &self.items
    }

    pub(crate) fn range(&self, begin: usize, end: usize) -> &[Item] {
        &self.items[begin..end]
    }

    /// Index of the first record in `begin..end` that is not below `bound`.
    pub fn find_lower_bound(&self, begin: usize, end: usize, bound: &Bound) -> usize {
        begin
            + self.items[begin..end]
                .partition_point(|item| item.cmp_bound(bound) == Ordering::Less)
    }

    pub fn fingerprint(&self, begin: usize, end: usize) -> Fingerprint {
        let mut accumulator = Accumulator::default();
        for item in &self.items[begin..end] {
            accumulator.add(&item.id);
        }
        accumulator.fingerprint(end - begin)
    }
}

/// Running sum of ids as little-endian 256-bit integers, modulo 2^256.
#[derive(Debug, Clone, Default)]
pub(crate) struct Accumulator {
    sum: [u8; ID_SIZE],
}

impl Accumulator {
    pub(crate) fn add(&mut self, id: &EventId) {
        let mut carry = 0u16;
        for (byte, other) in self.sum.iter_mut().zip(id) {
            let total = u16::from(*byte) + u16::from(*other) + carry;
            *byte = total as u8;
            carry = total >> 8;
        }
    }

    pub(crate) fn fingerprint(&self, count: usize) -> Fingerprint {
        let mut input = Vec::with_capacity(ID_SIZE + 10);
        input.extend_from_slice(&self.sum);
        write_varint(&mut input, count as u64);
        let hash = Sha256::digest(&input);
        let mut fingerprint = [0u8; FINGERPRINT_SIZE];
        fingerprint.copy_from_slice(&hash[..FINGERPRINT_SIZE]);
        fingerprint
    }
}

/// Calculate the fingerprint for a set of event IDs
///
/// The fingerprint algorithm:
/// 1. Compute addition mod 2^256 of element IDs (as 32-byte little-endian unsigned integers)
/// 2. Concatenate with the number of elements, encoded as a varint
/// 3. Hash with SHA-256
/// 4. Take the first 16 bytes
///
/// The result does not depend on the order of `ids`.
pub fn calculate_fingerprint(ids: &[EventId]) -> Fingerprint {
    let mut accumulator = Accumulator::default();
    for id in ids {
        accumulator.add(id);
    }
    accumulator.fingerprint(ids.len())
}

pub fn decode_id(id: &str) -> Result<EventId> {
    let bytes = hex::decode(id).map_err(|e| Nip77Error::InvalidHex(e.to_string()))?;
    let len = bytes.len();
    bytes
        .try_into()
        .map_err(|_| Nip77Error::InvalidIdLength(len))
}
