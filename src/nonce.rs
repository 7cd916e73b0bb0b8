use std::collections::HashMap;

use parking_lot::Mutex;

use crate::types::{UnixMillis, DEFAULT_NONCE_CAPACITY};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    Recorded,
    Reused,
    Saturated,
}

pub trait NonceStore: Send + Sync {
    fn has(&self, nonce: &str, now: UnixMillis) -> bool;
    fn record(&self, nonce: &str, expires_at: UnixMillis);
    fn try_record(&self, nonce: &str, expires_at: UnixMillis, now: UnixMillis) -> RecordOutcome;
    fn purge_expired(&self, now: UnixMillis) -> usize;
    fn len(&self) -> usize;
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// In-memory ledger where each nonce lives until its envelope could no longer
/// pass the freshness check.
#[derive(Debug)]
pub struct NonceLedger {
    expiry_by_nonce: Mutex<HashMap<String, UnixMillis>>,
    capacity: usize,
}

impl NonceLedger {
    pub fn new(capacity: usize) -> Self {
        Self {
            expiry_by_nonce: Mutex::new(HashMap::new()),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for NonceLedger {
    fn default() -> Self {
        Self::new(DEFAULT_NONCE_CAPACITY)
    }
}

impl NonceStore for NonceLedger {
    fn has(&self, nonce: &str, now: UnixMillis) -> bool {
        self.expiry_by_nonce
            .lock()
            .get(nonce)
            .is_some_and(|exp| *exp >= now)
    }

    fn record(&self, nonce: &str, expires_at: UnixMillis) {
        let mut map = self.expiry_by_nonce.lock();
        let entry = map.entry(nonce.to_string()).or_insert(expires_at);
        *entry = (*entry).max(expires_at);
    }

    fn try_record(&self, nonce: &str, expires_at: UnixMillis, now: UnixMillis) -> RecordOutcome {
        let mut map = self.expiry_by_nonce.lock();

        if let Some(exp) = map.get(nonce) {
            if *exp >= now {
                return RecordOutcome::Reused;
            }
        }

        if map.len() >= self.capacity && !map.contains_key(nonce) {
            map.retain(|_, exp| *exp >= now);
            if map.len() >= self.capacity {
                return RecordOutcome::Saturated;
            }
        }

        map.insert(nonce.to_string(), expires_at);
        RecordOutcome::Recorded
    }

    fn purge_expired(&self, now: UnixMillis) -> usize {
        let mut map = self.expiry_by_nonce.lock();
        let before = map.len();
        map.retain(|_, exp| *exp >= now);
        before - map.len()
    }

    fn len(&self) -> usize {
        self.expiry_by_nonce.lock().len()
    }
}
