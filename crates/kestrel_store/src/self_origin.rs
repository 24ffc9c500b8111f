//! Cached state for keys this node originates.
//!
//! The area database persists, refreshes, and unsets these keys; the cache
//! entry tracks the authoritative value and the two pacing backoffs (key
//! re-advertisement and TTL refresh).

use std::time::Duration;

use kestrel_common::backoff::ExponentialBackoff;
use kestrel_common::constants;
use kestrel_proto::VersionedValue;

/// One cached self-originated key.
#[derive(Debug, Clone)]
pub struct SelfOriginatedEntry {
    /// The authoritative record, always value-bearing.
    pub value: VersionedValue,
    /// Paces repeated advertisements of the same key.
    pub key_backoff: ExponentialBackoff,
    /// Paces TTL refreshes: ready roughly every ttl/4, so a value gets
    /// several refresh attempts before it could expire.
    pub ttl_backoff: ExponentialBackoff,
}

impl SelfOriginatedEntry {
    pub fn new(value: VersionedValue, key_ttl_ms: i64) -> Self {
        Self {
            value,
            key_backoff: ExponentialBackoff::new(
                constants::INITIAL_BACKOFF,
                constants::MAX_BACKOFF,
            ),
            ttl_backoff: ttl_refresh_backoff(key_ttl_ms),
        }
    }

    /// Reset the advertisement backoff (used when a key is re-persisted).
    pub fn reset_key_backoff(&mut self) {
        self.key_backoff =
            ExponentialBackoff::new(constants::INITIAL_BACKOFF, constants::MAX_BACKOFF);
    }

    /// Re-arm the TTL refresh pacing for a (possibly changed) ttl. When
    /// `delay_first` is set the first refresh is pushed out one period,
    /// since the value itself was just advertised.
    pub fn reschedule_ttl_refresh(&mut self, key_ttl_ms: i64, delay_first: bool) {
        self.ttl_backoff = ttl_refresh_backoff(key_ttl_ms);
        if delay_first {
            self.ttl_backoff.report_error();
        }
    }
}

/// Backoff with both bounds pinned near ttl/4: every `report_error` yields
/// the same quarter-lifetime period.
fn ttl_refresh_backoff(key_ttl_ms: i64) -> ExponentialBackoff {
    let quarter = (key_ttl_ms / 4).max(1) as u64;
    ExponentialBackoff::new(
        Duration::from_millis(quarter),
        Duration::from_millis(quarter + 1),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_entry_ready_to_advertise() {
        let entry = SelfOriginatedEntry::new(
            VersionedValue::new(1, "self", Some(b"v".to_vec()), 40_000),
            40_000,
        );
        assert!(entry.key_backoff.can_try_now());
        assert!(entry.ttl_backoff.can_try_now());
    }

    #[test]
    fn test_ttl_backoff_period_is_quarter_ttl() {
        let entry = SelfOriginatedEntry::new(
            VersionedValue::new(1, "self", Some(b"v".to_vec()), 40_000),
            40_000,
        );
        assert_eq!(
            entry.ttl_backoff.initial_backoff(),
            Duration::from_millis(10_000)
        );
        assert_eq!(
            entry.ttl_backoff.max_backoff(),
            Duration::from_millis(10_001)
        );
    }

    #[test]
    fn test_delayed_first_refresh() {
        let mut entry = SelfOriginatedEntry::new(
            VersionedValue::new(1, "self", Some(b"v".to_vec()), 40_000),
            40_000,
        );
        entry.reschedule_ttl_refresh(40_000, true);
        assert!(!entry.ttl_backoff.can_try_now());
    }
}
