use std::collections::{BTreeSet, HashSet};

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::*;

fn id(first: u8) -> EventId {
    let mut id = [0u8; 32];
    id[0] = first;
    id
}

fn sealed(records: &[(u64, EventId)]) -> StorageVector {
    let mut storage = StorageVector::new();
    for (timestamp, id) in records {
        storage.insert(*timestamp, *id).unwrap();
    }
    storage.seal().unwrap();
    storage
}

struct SyncResult {
    have: HashSet<EventId>,
    need: HashSet<EventId>,
    rounds: usize,
}

fn run_sync(local: StorageVector, remote: StorageVector, frame_size_limit: u64) -> SyncResult {
    let mut initiator = Negentropy::new(local, frame_size_limit).unwrap();
    let mut responder = Negentropy::new(remote, frame_size_limit).unwrap();

    let mut have = Vec::new();
    let mut need = Vec::new();
    let mut rounds = 0;
    let mut message = initiator.initiate().unwrap();

    loop {
        if frame_size_limit != 0 {
            assert!(message.len() as u64 <= frame_size_limit);
        }
        let reply = responder.reconcile(&message).unwrap();
        if frame_size_limit != 0 {
            assert!(reply.len() as u64 <= frame_size_limit);
        }
        rounds += 1;
        match initiator
            .reconcile_with_ids(&reply, &mut have, &mut need)
            .unwrap()
        {
            Some(next) => message = next,
            None => break,
        }
        assert!(rounds < 100, "reconciliation did not terminate");
    }

    SyncResult {
        have: have.into_iter().collect(),
        need: need.into_iter().collect(),
        rounds,
    }
}

fn random_records(rng: &mut StdRng, count: usize, timestamps: std::ops::Range<u64>) -> Vec<(u64, EventId)> {
    (0..count)
        .map(|_| {
            let mut id = [0u8; 32];
            rng.fill(&mut id[..]);
            (rng.random_range(timestamps.clone()), id)
        })
        .collect()
}

/// Splits `records` into two overlapping sets and checks the reconciled
/// difference against a direct set computation.
fn assert_reconciles(
    records: &[(u64, EventId)],
    rng: &mut StdRng,
    only_local: f64,
    only_remote: f64,
    frame_size_limit: u64,
) {
    let mut local = Vec::new();
    let mut remote = Vec::new();
    for record in records {
        let roll: f64 = rng.random();
        if roll < only_local {
            local.push(*record);
        } else if roll < only_local + only_remote {
            remote.push(*record);
        } else {
            local.push(*record);
            remote.push(*record);
        }
    }

    let local_ids: HashSet<EventId> = local.iter().map(|(_, id)| *id).collect();
    let remote_ids: HashSet<EventId> = remote.iter().map(|(_, id)| *id).collect();
    let expected_have: HashSet<EventId> = local_ids.difference(&remote_ids).copied().collect();
    let expected_need: HashSet<EventId> = remote_ids.difference(&local_ids).copied().collect();

    let result = run_sync(sealed(&local), sealed(&remote), frame_size_limit);
    assert_eq!(result.have, expected_have);
    assert_eq!(result.need, expected_need);
}

// === Varint ===

#[test]
fn test_varint_encode_zero() {
    assert_eq!(encode_varint(0), vec![0]);
}

#[test]
fn test_varint_encode_multi_byte() {
    assert_eq!(encode_varint(127), vec![127]);
    assert_eq!(encode_varint(128), vec![0x81, 0x00]);
    assert_eq!(encode_varint(300), vec![0x82, 0x2C]);
}

#[test]
fn test_varint_boundary_values() {
    for value in [0, 1, 127, 128, 16383, 16384, 1u64 << 63, u64::MAX] {
        let encoded = encode_varint(value);
        let (decoded, len) = decode_varint(&encoded).unwrap();
        assert_eq!(decoded, value);
        assert_eq!(len, encoded.len());
    }
    assert_eq!(encode_varint(u64::MAX).len(), 10);
}

#[test]
fn test_varint_decode_consumes_only_first_value() {
    let mut data = encode_varint(300);
    data.extend_from_slice(&encode_varint(5));
    assert_eq!(decode_varint(&data).unwrap(), (300, 2));
}

#[test]
fn test_varint_decode_errors() {
    assert!(matches!(decode_varint(&[]), Err(Nip77Error::VarintDecode(_))));
    assert!(matches!(
        decode_varint(&[0x80, 0x80]),
        Err(Nip77Error::VarintDecode(_))
    ));
    assert!(matches!(
        decode_varint(&[0xFF; 11]),
        Err(Nip77Error::VarintDecode(_))
    ));
}

// === Message model ===

#[test]
fn test_bound_ordering_pads_prefix() {
    let short = Bound::new(100, vec![0x01]).unwrap();
    let long = Bound::new(100, vec![0x01, 0x00, 0x00]).unwrap();
    let later = Bound::new(100, vec![0x01, 0x01]).unwrap();

    assert_eq!(short.cmp(&long), std::cmp::Ordering::Equal);
    assert!(short < later);
    assert!(later < Bound::with_timestamp(101));
    assert!(Bound::with_timestamp(101) < Bound::infinity());
    assert!(Bound::new(1, vec![0; 33]).is_err());
}

#[test]
fn test_message_encodes_delta_timestamps() {
    let message = NegentropyMessage::new(vec![
        Range::skip(Bound::with_timestamp(100)),
        Range::fingerprint(Bound::new(150, vec![0xAB]).unwrap(), [0xCD; 16]),
        Range::id_list(Bound::infinity(), vec![id(1), id(2)]),
    ]);

    let encoded = message.encode();
    assert_eq!(encoded[0], PROTOCOL_VERSION_1);
    // 100 is encoded as 101, then 150 as 1 + 50.
    assert_eq!(&encoded[1..4], &[0x65, 0x00, 0x00]);
    assert_eq!(&encoded[4..7], &[0x33, 0x01, 0xAB]);

    let decoded = NegentropyMessage::decode_hex(&message.encode_hex()).unwrap();
    assert_eq!(decoded, message);
}

#[test]
fn test_decode_rejects_malformed_messages() {
    struct Case {
        name: &'static str,
        input: Vec<u8>,
    }

    let cases = vec![
        Case {
            name: "empty",
            input: vec![],
        },
        Case {
            name: "version outside range",
            input: vec![0x10],
        },
        Case {
            name: "unknown mode",
            input: vec![0x61, 0x00, 0x00, 0x03],
        },
        Case {
            name: "truncated fingerprint",
            input: vec![0x61, 0x00, 0x00, 0x01, 0xAA, 0xBB],
        },
        Case {
            name: "id list longer than payload",
            input: vec![0x61, 0x00, 0x00, 0x02, 0x05, 0x00],
        },
        Case {
            name: "prefix longer than an id",
            input: vec![0x61, 0x02, 0x21],
        },
        Case {
            name: "incomplete varint",
            input: vec![0x61, 0x80],
        },
        Case {
            name: "descending bounds",
            input: vec![0x61, 0x0B, 0x01, 0x05, 0x00, 0x01, 0x01, 0x01, 0x00],
        },
    ];

    for case in cases {
        assert!(
            NegentropyMessage::decode(&case.input).is_err(),
            "{} should fail to decode",
            case.name
        );
    }
}

#[test]
fn test_descending_bounds_reported_as_invalid_bound() {
    let mut descending = vec![0x61];
    descending.extend_from_slice(&[0x0B, 0x01, 0x05, 0x00]);
    descending.extend_from_slice(&[0x01, 0x01, 0x01, 0x00]);
    assert!(matches!(
        NegentropyMessage::decode(&descending),
        Err(Nip77Error::InvalidBound(_))
    ));
}

// === Frames ===

#[test]
fn test_neg_open_json() {
    let filter = crate::Filter::new().kind(1).limit(10);
    let neg_open = NegOpen::new("sub1", filter.clone(), &[0x61]);

    let json = neg_open.to_json();
    assert_eq!(json[0], "NEG-OPEN");
    assert_eq!(json[3], "61");

    let parsed = NegOpen::from_json(&json).unwrap();
    assert_eq!(parsed, neg_open);
    assert_eq!(parsed.filter, filter);
}

#[test]
fn test_neg_frames_reject_wrong_shape() {
    let json = serde_json::json!(["NEG-MSG", "sub1"]);
    assert!(matches!(
        NegMsg::from_json(&json),
        Err(Nip77Error::InvalidFrame(_))
    ));

    let json = serde_json::json!(["NEG-ERR", "sub1", "blocked: too big"]);
    assert!(NegMsg::from_json(&json).is_err());
    let err = NegErr::from_json(&json).unwrap();
    assert_eq!(err, NegErr::blocked("sub1", "too big"));

    let close = NegClose::new("sub1");
    assert_eq!(NegClose::from_json(&close.to_json()).unwrap(), close);
}

// === Fingerprint and storage ===

#[test]
fn test_fingerprint_is_order_independent() {
    let ids = vec![[0x01; 32], [0x02; 32], [0x03; 32]];
    let reversed = vec![[0x03; 32], [0x02; 32], [0x01; 32]];
    assert_eq!(calculate_fingerprint(&ids), calculate_fingerprint(&reversed));
}

#[test]
fn test_fingerprint_different_counts() {
    let fp1 = calculate_fingerprint(&[[0x01; 32]]);
    let fp2 = calculate_fingerprint(&[[0x01; 32], [0x01; 32]]);
    assert_ne!(fp1, fp2);
}

#[test]
fn test_fingerprint_sum_wraps_modulo_2_256() {
    // 0xFF..FF + 1 wraps to zero, the same sum as the empty set, but counts differ.
    let mut one = [0u8; 32];
    one[0] = 1;
    let wrapped = calculate_fingerprint(&[[0xFF; 32], one]);
    assert_ne!(wrapped, calculate_fingerprint(&[]));
    assert_eq!(wrapped, calculate_fingerprint(&[one, [0xFF; 32]]));
}

#[test]
fn test_storage_fingerprint_matches_calculate() {
    let storage = sealed(&[(300, id(3)), (100, id(1)), (200, id(2))]);
    assert_eq!(
        storage.fingerprint(0, 3),
        calculate_fingerprint(&[id(1), id(2), id(3)])
    );
    assert_eq!(storage.fingerprint(1, 1), calculate_fingerprint(&[]));
}

#[test]
fn test_storage_vector_sorts_on_seal() {
    let storage = sealed(&[
        (100, [0x03; 32]),
        (50, [0x01; 32]),
        (100, [0x00; 32]),
        (200, [0x02; 32]),
    ]);

    let order: Vec<(u64, u8)> = storage
        .items()
        .iter()
        .map(|item| (item.timestamp, item.id[0]))
        .collect();
    assert_eq!(order, vec![(50, 0x01), (100, 0x00), (100, 0x03), (200, 0x02)]);
}

#[test]
fn test_storage_vector_rejects_duplicate_ids() {
    let mut storage = StorageVector::new();
    storage.insert(100, id(1)).unwrap();
    storage.insert(200, id(1)).unwrap();
    assert!(matches!(storage.seal(), Err(Nip77Error::DuplicateId(_))));
}

#[test]
fn test_storage_vector_is_immutable_after_seal() {
    let mut storage = sealed(&[(1, id(1))]);
    assert_eq!(storage.insert(2, id(2)), Err(Nip77Error::Sealed));
    assert_eq!(storage.seal(), Err(Nip77Error::Sealed));
}

#[test]
fn test_storage_vector_insert_hex() {
    let mut storage = StorageVector::new();
    storage.insert_hex(5, &hex::encode([0xAA; 32])).unwrap();
    assert!(matches!(
        storage.insert_hex(5, "abcd"),
        Err(Nip77Error::InvalidIdLength(2))
    ));
    assert!(matches!(
        storage.insert_hex(5, "zz"),
        Err(Nip77Error::InvalidHex(_))
    ));
}

#[test]
fn test_find_lower_bound() {
    let storage = sealed(&[(100, id(1)), (100, id(5)), (200, id(2))]);
    assert_eq!(storage.find_lower_bound(0, 3, &Bound::zero()), 0);
    assert_eq!(storage.find_lower_bound(0, 3, &Bound::new(100, vec![2]).unwrap()), 1);
    assert_eq!(storage.find_lower_bound(0, 3, &Bound::with_timestamp(150)), 2);
    assert_eq!(storage.find_lower_bound(0, 3, &Bound::infinity()), 3);
}

// === Engine ===

#[test]
fn test_engine_requires_sealed_storage_and_valid_limit() {
    assert!(matches!(
        Negentropy::new(StorageVector::new(), 0),
        Err(Nip77Error::NotSealed)
    ));
    assert!(matches!(
        Negentropy::new(sealed(&[]), 1024),
        Err(Nip77Error::FrameSizeLimitTooSmall(1024))
    ));
    assert!(Negentropy::new(sealed(&[]), MIN_FRAME_SIZE_LIMIT).is_ok());
}

#[test]
fn test_engine_roles() {
    let mut initiator = Negentropy::new(sealed(&[]), 0).unwrap();
    let message = initiator.initiate().unwrap();
    assert_eq!(initiator.initiate(), Err(Nip77Error::AlreadyInitiated));
    assert_eq!(initiator.reconcile(&message), Err(Nip77Error::NotResponder));

    let mut responder = Negentropy::new(sealed(&[]), 0).unwrap();
    let mut have = Vec::new();
    let mut need = Vec::new();
    assert_eq!(
        responder.reconcile_with_ids(&message, &mut have, &mut need),
        Err(Nip77Error::NotInitiator)
    );
}

#[test]
fn test_small_set_initiates_with_id_list() {
    let mut initiator = Negentropy::new(sealed(&[(1, id(1)), (2, id(2))]), 0).unwrap();
    let message = NegentropyMessage::decode(&initiator.initiate().unwrap()).unwrap();

    assert_eq!(
        message.ranges,
        vec![Range::id_list(Bound::infinity(), vec![id(1), id(2)])]
    );
}

#[test]
fn test_large_set_initiates_with_bucket_fingerprints() {
    let records: Vec<(u64, EventId)> = (0..100u8).map(|n| (u64::from(n), id(n))).collect();
    let mut initiator = Negentropy::new(sealed(&records), 0).unwrap();
    let message = NegentropyMessage::decode(&initiator.initiate().unwrap()).unwrap();

    assert_eq!(message.ranges.len(), BUCKETS);
    assert!(
        message
            .ranges
            .iter()
            .all(|range| range.payload.mode() == RangeMode::Fingerprint)
    );
    // 100 items over 16 buckets: the first four carry 7, the rest 6.
    assert_eq!(message.ranges[0].upper_bound, Bound::with_timestamp(7));
    assert_eq!(message.ranges[BUCKETS - 1].upper_bound, Bound::infinity());
}

#[test]
fn test_minimal_bound_uses_shared_prefix_for_equal_timestamps() {
    let mut records = Vec::new();
    for n in 0..40u8 {
        let mut item_id = [0xAB; 32];
        item_id[1] = n;
        records.push((500, item_id));
    }
    let mut initiator = Negentropy::new(sealed(&records), 0).unwrap();
    let message = NegentropyMessage::decode(&initiator.initiate().unwrap()).unwrap();

    // 40 items: buckets of 3 for the first 8, then 2.
    assert_eq!(message.ranges[0].upper_bound.timestamp, 500);
    assert_eq!(message.ranges[0].upper_bound.id_prefix, vec![0xAB, 3]);
}

#[test]
fn test_scenario_single_difference_each_side() {
    let local = sealed(&[(100, id(b'a')), (200, id(b'b')), (300, id(b'c'))]);
    let remote = sealed(&[(100, id(b'a')), (250, id(b'd')), (300, id(b'c'))]);

    let result = run_sync(local, remote, DEFAULT_FRAME_SIZE_LIMIT);
    assert_eq!(result.have, HashSet::from([id(b'b')]));
    assert_eq!(result.need, HashSet::from([id(b'd')]));
    assert_eq!(result.rounds, 1);
}

#[test]
fn test_identical_sets_finish_in_one_round() {
    let records: Vec<(u64, EventId)> = (0..200u8).map(|n| (u64::from(n) * 3, id(n))).collect();
    let result = run_sync(sealed(&records), sealed(&records), 0);
    assert!(result.have.is_empty());
    assert!(result.need.is_empty());
    assert_eq!(result.rounds, 1);
}

#[test]
fn test_empty_sides() {
    let records: Vec<(u64, EventId)> = (0..50u8).map(|n| (u64::from(n), id(n))).collect();
    let all: HashSet<EventId> = records.iter().map(|(_, id)| *id).collect();

    let result = run_sync(sealed(&records), sealed(&[]), 0);
    assert_eq!(result.have, all);
    assert!(result.need.is_empty());

    let result = run_sync(sealed(&[]), sealed(&records), 0);
    assert!(result.have.is_empty());
    assert_eq!(result.need, all);

    let result = run_sync(sealed(&[]), sealed(&[]), 0);
    assert!(result.have.is_empty() && result.need.is_empty());
}

#[test]
fn test_random_sets_match_naive_difference() {
    let mut rng = StdRng::seed_from_u64(0x6E65_6774);
    for (count, only_local, only_remote) in [
        (10, 0.3, 0.3),
        (500, 0.05, 0.05),
        (2_000, 0.5, 0.0),
        (2_000, 0.0, 0.5),
        (10_000, 0.01, 0.01),
        (10_000, 0.2, 0.2),
    ] {
        let records = random_records(&mut rng, count, 1_000..1_000_000);
        assert_reconciles(&records, &mut rng, only_local, only_remote, 0);
        assert_reconciles(
            &records,
            &mut rng,
            only_local,
            only_remote,
            DEFAULT_FRAME_SIZE_LIMIT,
        );
    }
}

#[test]
fn test_skewed_timestamps() {
    let mut rng = StdRng::seed_from_u64(7);

    // Every record shares one timestamp: bounds are split by id prefix alone.
    let records = random_records(&mut rng, 5_000, 1_700_000_000..1_700_000_001);
    assert_reconciles(&records, &mut rng, 0.1, 0.1, DEFAULT_FRAME_SIZE_LIMIT);

    // Heavy clustering in a handful of seconds plus a long sparse tail.
    let mut records = random_records(&mut rng, 5_000, 10..14);
    records.extend(random_records(&mut rng, 200, 0..u64::from(u32::MAX)));
    assert_reconciles(&records, &mut rng, 0.05, 0.05, 0);

    // Ids sharing long prefixes.
    let mut records = Vec::new();
    for n in 0..3_000u32 {
        let mut item_id = [0x42; 32];
        item_id[28..].copy_from_slice(&n.to_be_bytes());
        records.push((99, item_id));
    }
    assert_reconciles(&records, &mut rng, 0.1, 0.1, DEFAULT_FRAME_SIZE_LIMIT);
}

#[test]
fn test_rounds_grow_logarithmically() {
    let mut rng = StdRng::seed_from_u64(42);
    let records = random_records(&mut rng, 10_000, 0..10_000_000);
    let mut remote = records.clone();
    let dropped = remote.remove(5_000);

    let result = run_sync(sealed(&records), sealed(&remote), 0);
    assert_eq!(result.have, HashSet::from([dropped.1]));
    assert!(result.need.is_empty());
    // log16(10_000) rounds of splitting, then one id list exchange.
    assert!(result.rounds <= 4, "took {} rounds", result.rounds);
}

#[test]
fn test_frame_limit_defers_ranges_to_later_rounds() {
    let mut rng = StdRng::seed_from_u64(9);
    let records = random_records(&mut rng, 3_000, 0..100_000);
    let (local, remote): (Vec<_>, Vec<_>) = records.into_iter().partition(|(ts, _)| ts % 2 == 0);

    let unlimited = run_sync(sealed(&local), sealed(&remote), 0);
    let limited = run_sync(sealed(&local), sealed(&remote), MIN_FRAME_SIZE_LIMIT);

    assert_eq!(limited.have, unlimited.have);
    assert_eq!(limited.need, unlimited.need);
    assert!(limited.rounds > unlimited.rounds);
}

#[test]
fn test_unsupported_version() {
    let mut responder = Negentropy::new(sealed(&[(1, id(1))]), 0).unwrap();
    assert_eq!(responder.reconcile(&[0x62, 0x00]).unwrap(), vec![PROTOCOL_VERSION_1]);
    assert_eq!(
        responder.reconcile(&[0x05]),
        Err(Nip77Error::InvalidProtocolVersion(0x05))
    );

    let mut initiator = Negentropy::new(sealed(&[]), 0).unwrap();
    initiator.initiate().unwrap();
    let mut have = Vec::new();
    let mut need = Vec::new();
    assert_eq!(
        initiator.reconcile_with_ids(&[0x62], &mut have, &mut need),
        Err(Nip77Error::UnsupportedProtocolVersion(0x62))
    );
}

#[test]
fn test_malformed_reply_is_protocol_error() {
    let mut initiator = Negentropy::new(sealed(&[(1, id(1))]), 0).unwrap();
    initiator.initiate().unwrap();
    let mut have = Vec::new();
    let mut need = Vec::new();

    let result = initiator.reconcile_with_ids(&[0x61, 0x00, 0x00, 0x07], &mut have, &mut need);
    assert_eq!(result, Err(Nip77Error::InvalidMode(7)));
    assert!(have.is_empty() && need.is_empty());
}

// === Session driver ===

struct LocalResponder {
    engine: Negentropy,
    corrupt_after: Option<usize>,
    sent: usize,
    closed: bool,
}

impl LocalResponder {
    fn new(records: &[(u64, EventId)]) -> Self {
        Self {
            engine: Negentropy::new(sealed(records), 0).unwrap(),
            corrupt_after: None,
            sent: 0,
            closed: false,
        }
    }

    fn answer(&mut self, message: &[u8]) -> Result<Vec<u8>> {
        self.sent += 1;
        if self.corrupt_after.is_some_and(|limit| self.sent > limit) {
            return Ok(vec![0x61, 0x00, 0x00, 0x09]);
        }
        self.engine.reconcile(message)
    }
}

#[async_trait]
impl ReconcileSession for LocalResponder {
    type Error = Nip77Error;

    async fn open(&mut self, initial: Vec<u8>) -> Result<Vec<u8>> {
        self.answer(&initial)
    }

    async fn send(&mut self, message: Vec<u8>) -> Result<Vec<u8>> {
        self.answer(&message)
    }

    async fn close(&mut self) -> Result<()> {
        self.closed = true;
        Ok(())
    }
}

#[tokio::test]
async fn test_reconcile_driver_reports_rounds() {
    let records: Vec<(u64, EventId)> = (0..=250u8).map(|n| (u64::from(n) * 10, id(n))).collect();
    let local: Vec<_> = records.iter().filter(|(_, id)| id[0] % 7 != 0).copied().collect();
    let remote: Vec<_> = records.iter().filter(|(_, id)| id[0] % 5 != 0).copied().collect();

    let mut session = LocalResponder::new(&remote);
    let mut updates = Vec::new();
    let outcome = reconcile(sealed(&local), &mut session, 0, |update: RoundUpdate<'_>| {
        updates.push((update.round, update.new_have.len(), update.have.len()));
    })
    .await
    .unwrap();

    let expected_have: BTreeSet<u8> = (0..=250u8).filter(|n| n % 5 == 0 && n % 7 != 0).collect();
    let expected_need: BTreeSet<u8> = (0..=250u8).filter(|n| n % 7 == 0 && n % 5 != 0).collect();
    let have: BTreeSet<u8> = outcome.have.iter().map(|id| id[0]).collect();
    let need: BTreeSet<u8> = outcome.need.iter().map(|id| id[0]).collect();

    assert_eq!(have, expected_have);
    assert_eq!(need, expected_need);
    assert_eq!(outcome.have.len(), have.len());
    assert_eq!(updates.len(), outcome.rounds);
    assert_eq!(updates.last().map(|u| u.2), Some(outcome.have.len()));
    assert_eq!(updates.iter().map(|u| u.1).sum::<usize>(), outcome.have.len());
    assert!(session.closed);
}

#[tokio::test]
async fn test_reconcile_driver_closes_session_on_protocol_error() {
    let records: Vec<(u64, EventId)> = (0..100u8).map(|n| (u64::from(n), id(n))).collect();
    let mut session = LocalResponder::new(&records[..60]);
    session.corrupt_after = Some(0);

    let result = reconcile(sealed(&records), &mut session, 0, |_| {}).await;
    assert_eq!(result, Err(Nip77Error::InvalidMode(9)));
    assert!(session.closed);
}
