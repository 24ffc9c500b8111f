//! TTL countdown queue and outbound TTL decrement.
//!
//! One min-heap of pending expirations per area. Entries are never updated
//! in place: value and TTL updates enqueue fresh entries, and an entry is
//! live only while the map still holds the exact
//! (key, version, originator, ttl_version) it was scheduled for. Stale
//! entries are discarded at the heap head.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::time::Instant;

use kestrel_proto::{Publication, VersionedValue};

use crate::merge::KeyValueMap;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TtlQueueEntry {
    pub expires_at: Instant,
    pub key: String,
    pub version: i64,
    pub originator_id: String,
    pub ttl_version: i64,
}

impl Ord for TtlQueueEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.expires_at
            .cmp(&other.expires_at)
            .then_with(|| self.key.cmp(&other.key))
            .then_with(|| self.ttl_version.cmp(&other.ttl_version))
    }
}

impl PartialOrd for TtlQueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Min-heap of pending expirations ordered by expiry instant.
#[derive(Debug, Default)]
pub struct TtlQueue {
    heap: BinaryHeap<Reverse<TtlQueueEntry>>,
}

impl TtlQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue an expiration for `value` at `expires_at`. Infinite-ttl
    /// records must not be scheduled; callers skip them.
    pub fn schedule(&mut self, key: &str, value: &VersionedValue, expires_at: Instant) {
        self.heap.push(Reverse(TtlQueueEntry {
            expires_at,
            key: key.to_string(),
            version: value.version,
            originator_id: value.originator_id.clone(),
            ttl_version: value.ttl_version,
        }));
    }

    /// Earliest pending expiry, if any.
    pub fn next_expiry(&self) -> Option<Instant> {
        self.heap.peek().map(|Reverse(e)| e.expires_at)
    }

    /// Pop all entries due at or before `now`. Each live entry deletes its
    /// record from the map and contributes its key to the returned list;
    /// stale entries are silently discarded.
    pub fn evict_expired(&mut self, now: Instant, map: &mut KeyValueMap) -> Vec<String> {
        let mut expired = Vec::new();
        while let Some(Reverse(top)) = self.heap.peek() {
            if top.expires_at > now {
                break;
            }
            let Reverse(top) = self.heap.pop().expect("peeked entry exists");
            let live = map.get(&top.key).is_some_and(|entry| {
                entry.value.version == top.version
                    && entry.value.originator_id == top.originator_id
                    && entry.value.ttl_version == top.ttl_version
            });
            if live {
                map.remove(&top.key);
                expired.push(top.key);
            }
        }
        expired
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

/// Remaining lifetime in whole milliseconds, rounded up.
pub fn remaining_ttl_ms(expires_at: Instant, now: Instant) -> i64 {
    let micros = expires_at.saturating_duration_since(now).as_micros();
    micros.div_ceil(1000) as i64
}

/// Apply the outbound hop rule to a publication about to leave this node:
/// every finite ttl is reduced by `decrement_ms`, and records whose
/// remaining ttl falls at or below the decrement are removed. Remaining
/// lifetimes are read from the live map records.
pub fn decrement_publication_ttl(
    publication: &mut Publication,
    map: &KeyValueMap,
    now: Instant,
    decrement_ms: i64,
) {
    publication.key_vals.retain(|key, value| {
        if value.is_infinite_ttl() {
            return true;
        }
        let remaining = match map.get(key).and_then(|e| e.expires_at) {
            Some(expires_at) => remaining_ttl_ms(expires_at, now),
            // Not in the map (already evicted, or a transit-only record):
            // fall back to the carried ttl.
            None => value.ttl_ms,
        };
        let outbound = remaining - decrement_ms;
        if outbound <= 0 {
            return false;
        }
        value.ttl_ms = outbound;
        true
    });
}
