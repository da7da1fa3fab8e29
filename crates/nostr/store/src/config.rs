//! Store configuration and time source.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use nostr::KindClassification;

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Superseded versions kept per coordinate.
    pub history_limit: usize,
    /// Accept events whose expiration already passed. They are still hidden
    /// from queries.
    pub keep_expired: bool,
    /// Per-kind classification that replaces the NIP-01 kind ranges.
    pub kind_overrides: HashMap<u16, KindClassification>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            history_limit: 8,
            keep_expired: false,
            kind_overrides: HashMap::new(),
        }
    }
}

impl StoreConfig {
    pub fn with_kind_override(mut self, kind: u16, classification: KindClassification) -> Self {
        self.kind_overrides.insert(kind, classification);
        self
    }

    pub fn classify(&self, kind: u16) -> KindClassification {
        self.kind_overrides
            .get(&kind)
            .copied()
            .unwrap_or_else(|| nostr::classify_kind(kind))
    }
}

/// Source of the current unix time in seconds.
pub trait Clock: fmt::Debug + Send + Sync {
    fn now(&self) -> u64;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> u64 {
        nostr::unix_now()
    }
}

/// Clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn new(now: u64) -> Self {
        Self {
            now: AtomicU64::new(now),
        }
    }

    pub fn set(&self, now: u64) {
        self.now.store(now, Ordering::SeqCst);
    }

    pub fn advance(&self, seconds: u64) {
        self.now.fetch_add(seconds, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}
