// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Retry Ledger
//!
//! Per correlation key attempt counters. Records are created on the first attempt
//! and removed as soon as the key reaches a terminal outcome, so the ledger only
//! ever holds messages that are still being retried.
//!
//! The map is split into independently locked shards: operations on keys that
//! land in different shards never contend, and every operation on one key runs
//! under that key's shard lock, so concurrent redeliveries cannot lose increments.

use parking_lot::Mutex;
use std::{
    collections::{hash_map::DefaultHasher, HashMap},
    hash::{Hash, Hasher},
    time::{Duration, Instant},
};

const DEFAULT_SHARDS: usize = 16;

/// Attempt bookkeeping for one correlation key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryRecord {
    pub correlation_key: String,
    pub attempts: u32,
    pub first_seen_at: Instant,
}

/// Concurrency-safe store of `RetryRecord`s keyed by correlation key.
#[derive(Debug)]
pub struct RetryLedger {
    shards: Vec<Mutex<HashMap<String, RetryRecord>>>,
}

impl Default for RetryLedger {
    fn default() -> Self {
        RetryLedger::with_shards(DEFAULT_SHARDS)
    }
}

impl RetryLedger {
    pub fn new() -> RetryLedger {
        RetryLedger::default()
    }

    /// Creates a ledger with `shards` lock stripes (at least one).
    pub fn with_shards(shards: usize) -> RetryLedger {
        RetryLedger {
            shards: (0..shards.max(1))
                .map(|_| Mutex::new(HashMap::new()))
                .collect(),
        }
    }

    fn shard(&self, key: &str) -> &Mutex<HashMap<String, RetryRecord>> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        let idx = (hasher.finish() % self.shards.len() as u64) as usize;
        &self.shards[idx]
    }

    /// Increments and returns the attempt count for `key`, starting at 1.
    pub fn record_attempt(&self, key: &str) -> u32 {
        let mut shard = self.shard(key).lock();

        let record = shard
            .entry(key.to_owned())
            .or_insert_with(|| RetryRecord {
                correlation_key: key.to_owned(),
                attempts: 0,
                first_seen_at: Instant::now(),
            });
        record.attempts = record.attempts.saturating_add(1);
        record.attempts
    }

    /// Attempts recorded so far for `key`, 0 when absent.
    pub fn attempts_so_far(&self, key: &str) -> u32 {
        self.shard(key)
            .lock()
            .get(key)
            .map(|record| record.attempts)
            .unwrap_or_default()
    }

    /// Snapshot of the record for `key`.
    pub fn record(&self, key: &str) -> Option<RetryRecord> {
        self.shard(key).lock().get(key).cloned()
    }

    /// Removes the record for `key`. Clearing an absent key is a no-op.
    pub fn clear(&self, key: &str) {
        self.shard(key).lock().remove(key);
    }

    /// Drops records first seen more than `ttl` ago; returns how many were dropped.
    pub fn expire_older_than(&self, ttl: Duration) -> usize {
        self.expire_at(Instant::now(), ttl)
    }

    pub(crate) fn expire_at(&self, now: Instant, ttl: Duration) -> usize {
        let mut expired = 0;

        for shard in &self.shards {
            let mut shard = shard.lock();
            let before = shard.len();
            shard.retain(|_, record| now.saturating_duration_since(record.first_seen_at) <= ttl);
            expired += before - shard.len();
        }

        expired
    }

    /// Number of keys currently being retried.
    pub fn len(&self) -> usize {
        self.shards.iter().map(|shard| shard.lock().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn record_attempt_is_monotonic() {
        let ledger = RetryLedger::new();

        let seen: Vec<u32> = (0..5).map(|_| ledger.record_attempt("k")).collect();

        assert_eq!(seen, vec![1, 2, 3, 4, 5]);
        assert_eq!(ledger.attempts_so_far("k"), 5);
    }

    #[test]
    fn absent_key_reads_as_zero() {
        let ledger = RetryLedger::new();

        assert_eq!(ledger.attempts_so_far("missing"), 0);
        assert!(ledger.record("missing").is_none());
        assert!(ledger.is_empty());
    }

    #[test]
    fn clear_is_idempotent() {
        let ledger = RetryLedger::new();
        ledger.record_attempt("k");

        ledger.clear("k");
        ledger.clear("k");

        assert_eq!(ledger.attempts_so_far("k"), 0);
        assert_eq!(ledger.record_attempt("k"), 1);
    }

    #[test]
    fn keys_are_counted_independently() {
        let ledger = RetryLedger::with_shards(1);

        ledger.record_attempt("a");
        ledger.record_attempt("a");
        ledger.record_attempt("b");

        assert_eq!(ledger.attempts_so_far("a"), 2);
        assert_eq!(ledger.attempts_so_far("b"), 1);
        assert_eq!(ledger.len(), 2);
    }

    #[test]
    fn concurrent_increments_are_not_lost() {
        let ledger = Arc::new(RetryLedger::new());

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let ledger = ledger.clone();
                std::thread::spawn(move || {
                    for _ in 0..250 {
                        ledger.record_attempt("hot");
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(ledger.attempts_so_far("hot"), 2000);
    }

    #[test]
    fn expire_drops_only_old_records() {
        let ledger = RetryLedger::new();
        ledger.record_attempt("old");
        let first_seen = ledger.record("old").unwrap().first_seen_at;

        let expired = ledger.expire_at(first_seen + Duration::from_secs(60), Duration::from_secs(30));

        assert_eq!(expired, 1);
        assert!(ledger.is_empty());

        ledger.record_attempt("fresh");
        assert_eq!(ledger.expire_older_than(Duration::from_secs(3600)), 0);
        assert_eq!(ledger.len(), 1);
    }
}
