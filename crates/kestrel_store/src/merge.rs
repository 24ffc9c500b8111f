//! Conflict resolution and dump helpers for the per-area key-value map.
//!
//! `merge_key_values` is pure: it compares incoming records against the map
//! and returns the set of accepted changes; the caller applies the delta and
//! schedules expirations.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::time::Instant;

use kestrel_proto::{Publication, VersionedValue};

use crate::filter::KeyFilters;

/// A stored record: the replicated value plus its local expiry instant
/// (derived at ingress; `None` for infinite TTL).
#[derive(Debug, Clone)]
pub struct KeyEntry {
    pub value: VersionedValue,
    pub expires_at: Option<Instant>,
}

/// The per-area source of truth.
pub type KeyValueMap = BTreeMap<String, KeyEntry>;

/// Outcome of merging one incoming publication against the map.
#[derive(Debug, Default)]
pub struct MergeResult {
    /// Accepted records, as they should be stored: full replacements for
    /// value updates, the current record with advanced ttl fields for
    /// TTL-only updates.
    pub delta: BTreeMap<String, VersionedValue>,
    /// Keys dropped by the ingress filter.
    pub filtered: u64,
    /// Keys dropped as stale, invalid, or no-op.
    pub dropped: u64,
}

/// Reconcile `incoming` against `map` under the tuple order
/// (version desc, originator_id desc, payload desc).
///
/// Value-less records are TTL refreshes: they only apply when they name the
/// exact live (version, originator) and carry a higher ttl_version.
pub fn merge_key_values(
    map: &KeyValueMap,
    incoming: &BTreeMap<String, VersionedValue>,
    filters: Option<&KeyFilters>,
) -> MergeResult {
    let mut result = MergeResult::default();

    for (key, rcvd) in incoming {
        if let Some(f) = filters {
            if !f.matches(key, rcvd) {
                result.filtered += 1;
                continue;
            }
        }
        if !rcvd.is_infinite_ttl() && rcvd.ttl_ms <= 0 {
            result.dropped += 1;
            continue;
        }

        let current = map.get(key).map(|e| &e.value);
        match current {
            None => {
                // TTL refresh for a key we never learned carries nothing.
                if rcvd.payload.is_some() {
                    let mut accepted = rcvd.clone();
                    accepted.ensure_hash();
                    result.delta.insert(key.clone(), accepted);
                } else {
                    result.dropped += 1;
                }
            }
            Some(cur) => {
                if rcvd.payload.is_some() {
                    match rcvd.tuple_cmp(cur) {
                        Ordering::Greater => {
                            let mut accepted = rcvd.clone();
                            accepted.ensure_hash();
                            result.delta.insert(key.clone(), accepted);
                        }
                        Ordering::Equal if rcvd.ttl_version > cur.ttl_version => {
                            result
                                .delta
                                .insert(key.clone(), ttl_refreshed(cur, rcvd));
                        }
                        _ => result.dropped += 1,
                    }
                } else if rcvd.version == cur.version
                    && rcvd.originator_id == cur.originator_id
                    && rcvd.ttl_version > cur.ttl_version
                {
                    result
                        .delta
                        .insert(key.clone(), ttl_refreshed(cur, rcvd));
                } else {
                    result.dropped += 1;
                }
            }
        }
    }

    result
}

fn ttl_refreshed(current: &VersionedValue, rcvd: &VersionedValue) -> VersionedValue {
    let mut refreshed = current.clone();
    refreshed.ttl_ms = rcvd.ttl_ms;
    refreshed.ttl_version = rcvd.ttl_version;
    refreshed
}

// ── Value comparison for full-sync dumps ─────────────────────────────────

/// Relation of a local record to a peer's (possibly hash-only) record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueCompare {
    /// The local record wins.
    Newer,
    /// The peer's record wins.
    Older,
    /// Identical content and ttl_version.
    Tied,
    /// Content cannot be compared (no payloads, hashes absent or unequal).
    Unknown,
}

/// Compare a local record against a peer record using the merge tuple order.
/// On hash-equal content the tie breaks on ttl_version.
pub fn compare_values(mine: &VersionedValue, theirs: &VersionedValue) -> ValueCompare {
    match mine.version.cmp(&theirs.version) {
        Ordering::Greater => return ValueCompare::Newer,
        Ordering::Less => return ValueCompare::Older,
        Ordering::Equal => {}
    }
    match mine.originator_id.cmp(&theirs.originator_id) {
        Ordering::Greater => return ValueCompare::Newer,
        Ordering::Less => return ValueCompare::Older,
        Ordering::Equal => {}
    }
    if let (Some(a), Some(b)) = (&mine.payload, &theirs.payload) {
        return match a.cmp(b) {
            Ordering::Greater => ValueCompare::Newer,
            Ordering::Less => ValueCompare::Older,
            Ordering::Equal => ttl_version_compare(mine, theirs),
        };
    }
    match (mine.content_hash, theirs.content_hash) {
        (Some(a), Some(b)) if a == b => ttl_version_compare(mine, theirs),
        _ => ValueCompare::Unknown,
    }
}

fn ttl_version_compare(mine: &VersionedValue, theirs: &VersionedValue) -> ValueCompare {
    match mine.ttl_version.cmp(&theirs.ttl_version) {
        Ordering::Greater => ValueCompare::Newer,
        Ordering::Less => ValueCompare::Older,
        Ordering::Equal => ValueCompare::Tied,
    }
}

// ── Dump helpers ─────────────────────────────────────────────────────────

/// Dump all records passing `filters`. With `strip_payload`, payloads are
/// omitted while hash and ttl metadata are kept.
pub fn dump_all_with_filters(
    area: &str,
    map: &KeyValueMap,
    filters: &KeyFilters,
    strip_payload: bool,
) -> Publication {
    let mut publication = Publication::new(area);
    for (key, entry) in map {
        if !filters.matches(key, &entry.value) {
            continue;
        }
        let mut value = entry.value.clone();
        if strip_payload {
            value.payload = None;
        }
        publication.key_vals.insert(key.clone(), value);
    }
    publication
}

/// Dump key metadata only (payload omitted), prefix-filtered.
pub fn dump_hashes_with_filters(area: &str, map: &KeyValueMap, filters: &KeyFilters) -> Publication {
    let mut publication = Publication::new(area);
    for (key, entry) in map {
        if !filters.matches_key(key) {
            continue;
        }
        let mut value = entry.value.clone();
        value.payload = None;
        publication.key_vals.insert(key.clone(), value);
    }
    publication
}

/// The responder side of a full-sync: given my full dump and the peer's
/// hash set, return the records the peer is missing or holds stale copies
/// of, and list the keys where the peer's copy wins in `tobe_updated_keys`.
pub fn dump_difference(
    area: &str,
    mine: BTreeMap<String, VersionedValue>,
    peer_hashes: &BTreeMap<String, VersionedValue>,
) -> Publication {
    let mut publication = Publication::new(area);
    let mut tobe_updated = Vec::new();

    for (key, my_value) in &mine {
        match peer_hashes.get(key) {
            None => {
                publication.key_vals.insert(key.clone(), my_value.clone());
            }
            Some(their_value) => match compare_values(my_value, their_value) {
                ValueCompare::Newer | ValueCompare::Unknown => {
                    publication.key_vals.insert(key.clone(), my_value.clone());
                }
                ValueCompare::Older => tobe_updated.push(key.clone()),
                ValueCompare::Tied => {}
            },
        }
    }
    for key in peer_hashes.keys() {
        if !mine.contains_key(key) {
            tobe_updated.push(key.clone());
        }
    }

    if !tobe_updated.is_empty() {
        tobe_updated.sort();
        publication.tobe_updated_keys = Some(tobe_updated);
    }
    publication
}
