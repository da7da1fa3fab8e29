use std::collections::HashSet;

use super::error::{Nip77Error, Result};
use super::model::{
    Bound, EventId, MessageWriter, NegentropyMessage, PROTOCOL_VERSION_1, RangeMode, RangePayload,
};
use super::storage::{Item, StorageVector};

/// Number of sub-ranges a mismatched range is split into.
pub const BUCKETS: usize = 16;

/// Ranges smaller than this are sent as explicit id lists.
pub const ID_LIST_THRESHOLD: usize = BUCKETS * 2;

/// Smallest accepted non-zero frame size limit.
pub const MIN_FRAME_SIZE_LIMIT: u64 = 4096;

/// Frame size limit used when the caller does not pick one.
pub const DEFAULT_FRAME_SIZE_LIMIT: u64 = 8_192;

/// Headroom kept below the frame size limit for the closing fingerprint.
const FRAME_SIZE_HEADROOM: u64 = 200;

/// One side of a range-based set reconciliation.
///
/// The initiator calls [`initiate`](Self::initiate) and then feeds every reply to
/// [`reconcile_with_ids`](Self::reconcile_with_ids) until it returns `None`. The
/// responder answers each incoming message with [`reconcile`](Self::reconcile).
#[derive(Debug)]
pub struct Negentropy {
    storage: StorageVector,
    frame_size_limit: u64,
    is_initiator: bool,
}

impl Negentropy {
    /// `frame_size_limit` of 0 disables the limit.
    pub fn new(storage: StorageVector, frame_size_limit: u64) -> Result<Self> {
        if !storage.is_sealed() {
            return Err(Nip77Error::NotSealed);
        }
        if frame_size_limit != 0 && frame_size_limit < MIN_FRAME_SIZE_LIMIT {
            return Err(Nip77Error::FrameSizeLimitTooSmall(frame_size_limit));
        }
        Ok(Self {
            storage,
            frame_size_limit,
            is_initiator: false,
        })
    }

    pub fn storage(&self) -> &StorageVector {
        &self.storage
    }

    pub fn is_initiator(&self) -> bool {
        self.is_initiator
    }

    /// Build the opening message covering the whole id space.
    pub fn initiate(&mut self) -> Result<Vec<u8>> {
        if self.is_initiator {
            return Err(Nip77Error::AlreadyInitiated);
        }
        self.is_initiator = true;

        let mut out = MessageWriter::new(PROTOCOL_VERSION_1);
        self.split_range(0, self.storage.len(), &Bound::infinity(), &mut out);
        Ok(out.into_bytes())
    }

    /// Answer an initiator's message.
    pub fn reconcile(&mut self, query: &[u8]) -> Result<Vec<u8>> {
        if self.is_initiator {
            return Err(Nip77Error::NotResponder);
        }
        let mut have = Vec::new();
        let mut need = Vec::new();
        let out = self.reconcile_aux(query, &mut have, &mut need)?;
        Ok(out.into_bytes())
    }

    /// Process a responder's reply.
    ///
    /// Ids present only locally are appended to `have`, ids present only on the
    /// peer to `need`. Returns the next message, or `None` once reconciliation
    /// is complete. A range can be resolved more than once when a frame was
    /// truncated, so callers that accumulate across rounds should deduplicate.
    pub fn reconcile_with_ids(
        &mut self,
        query: &[u8],
        have: &mut Vec<EventId>,
        need: &mut Vec<EventId>,
    ) -> Result<Option<Vec<u8>>> {
        if !self.is_initiator {
            return Err(Nip77Error::NotInitiator);
        }
        let out = self.reconcile_aux(query, have, need)?;
        if out.len() == 1 {
            return Ok(None);
        }
        Ok(Some(out.into_bytes()))
    }

    fn reconcile_aux(
        &self,
        query: &[u8],
        have: &mut Vec<EventId>,
        need: &mut Vec<EventId>,
    ) -> Result<MessageWriter> {
        let version = *query.first().ok_or(Nip77Error::EmptyMessage)?;
        if !(0x60..=0x6F).contains(&version) {
            return Err(Nip77Error::InvalidProtocolVersion(version));
        }
        if version != PROTOCOL_VERSION_1 {
            if self.is_initiator {
                return Err(Nip77Error::UnsupportedProtocolVersion(version));
            }
            return Ok(MessageWriter::new(PROTOCOL_VERSION_1));
        }

        let message = NegentropyMessage::decode(query)?;

        let mut out = MessageWriter::new(PROTOCOL_VERSION_1);
        let storage_size = self.storage.len();
        let mut prev_bound = Bound::zero();
        let mut prev_index = 0;
        let mut skip = false;
        // Index of the first record not covered by what `out` already holds.
        let mut written_index = 0;

        for range in message.ranges {
            let mut committed = out.checkpoint();
            let lower = prev_index;
            let mut upper = self
                .storage
                .find_lower_bound(prev_index, storage_size, &range.upper_bound);

            match range.payload {
                RangePayload::Skip => skip = true,
                RangePayload::Fingerprint(theirs) => {
                    if theirs == self.storage.fingerprint(lower, upper) {
                        skip = true;
                    } else {
                        flush_skip(&mut out, &mut skip, &prev_bound);
                        self.split_range(lower, upper, &range.upper_bound, &mut out);
                    }
                }
                RangePayload::IdList(theirs) => {
                    if self.is_initiator {
                        skip = true;
                        let ours = self.storage.range(lower, upper);
                        let their_ids: HashSet<&EventId> = theirs.iter().collect();
                        let our_ids: HashSet<&EventId> = ours.iter().map(|item| &item.id).collect();
                        have.extend(
                            ours.iter()
                                .filter(|item| !their_ids.contains(&item.id))
                                .map(|item| item.id),
                        );
                        need.extend(theirs.iter().filter(|id| !our_ids.contains(id)).copied());
                    } else {
                        flush_skip(&mut out, &mut skip, &prev_bound);

                        let mut end_bound = range.upper_bound.clone();
                        let mut response: Vec<EventId> = Vec::new();
                        for (offset, item) in self.storage.range(lower, upper).iter().enumerate() {
                            if self.exceeded(out.len() + response.len() * item.id.len()) {
                                end_bound = Bound::from_record(item.timestamp, &item.id);
                                upper = lower + offset;
                                break;
                            }
                            response.push(item.id);
                        }

                        out.write_bound(&end_bound);
                        out.write_mode(RangeMode::IdList);
                        out.write_varint(response.len() as u64);
                        for id in &response {
                            out.write_bytes(id);
                        }
                        committed = out.checkpoint();
                        written_index = upper;
                    }
                }
            }

            if self.exceeded(out.len()) {
                out.truncate(committed);
                let remaining = self.storage.fingerprint(written_index, storage_size);
                out.write_bound(&Bound::infinity());
                out.write_mode(RangeMode::Fingerprint);
                out.write_bytes(&remaining);
                break;
            }

            if out.len() > committed.len() {
                written_index = upper;
            }
            prev_index = upper;
            prev_bound = range.upper_bound;
        }

        Ok(out)
    }

    fn split_range(&self, lower: usize, upper: usize, upper_bound: &Bound, out: &mut MessageWriter) {
        let count = upper - lower;

        if count < ID_LIST_THRESHOLD {
            out.write_bound(upper_bound);
            out.write_mode(RangeMode::IdList);
            out.write_varint(count as u64);
            for item in self.storage.range(lower, upper) {
                out.write_bytes(&item.id);
            }
            return;
        }

        let per_bucket = count / BUCKETS;
        let with_extra = count % BUCKETS;
        let mut current = lower;

        for bucket in 0..BUCKETS {
            let size = per_bucket + usize::from(bucket < with_extra);
            let fingerprint = self.storage.fingerprint(current, current + size);
            current += size;

            let next_bound = if current == upper {
                upper_bound.clone()
            } else {
                let items = self.storage.items();
                minimal_bound(&items[current - 1], &items[current])
            };

            out.write_bound(&next_bound);
            out.write_mode(RangeMode::Fingerprint);
            out.write_bytes(&fingerprint);
        }
    }

    fn exceeded(&self, len: usize) -> bool {
        self.frame_size_limit != 0
            && len as u64 > self.frame_size_limit.saturating_sub(FRAME_SIZE_HEADROOM)
    }
}

fn flush_skip(out: &mut MessageWriter, skip: &mut bool, prev_bound: &Bound) {
    if *skip {
        *skip = false;
        out.write_bound(prev_bound);
        out.write_mode(RangeMode::Skip);
    }
}

/// Shortest bound that separates `prev` from `curr`.
fn minimal_bound(prev: &Item, curr: &Item) -> Bound {
    if curr.timestamp != prev.timestamp {
        return Bound::with_timestamp(curr.timestamp);
    }
    let shared = curr
        .id
        .iter()
        .zip(prev.id.iter())
        .take_while(|(a, b)| a == b)
        .count();
    let len = (shared + 1).min(curr.id.len());
    Bound {
        timestamp: curr.timestamp,
        id_prefix: curr.id[..len].to_vec(),
    }
}
