//! Protocol-wide timer and limit constants.

use std::time::Duration;

/// Initial per-peer retry backoff after a transport failure.
pub const INITIAL_BACKOFF: Duration = Duration::from_millis(64);

/// Ceiling for per-peer retry backoff.
pub const MAX_BACKOFF: Duration = Duration::from_millis(8_192);

/// Number of peers allowed in SYNCING at startup. Doubles on each
/// successful full-sync up to [`PARALLEL_SYNC_LIMIT_MAX`].
pub const PARALLEL_SYNC_LIMIT_INITIAL: u32 = 2;

/// Ceiling for the parallel full-sync cap.
pub const PARALLEL_SYNC_LIMIT_MAX: u32 = 32;

/// Delay before a rate-limited flood buffer is drained.
pub const FLOOD_BUFFER_DRAIN_DELAY: Duration = Duration::from_millis(100);

/// Batching window for self-originated key advertisements.
pub const SELF_ADVERTISE_THROTTLE: Duration = Duration::from_millis(100);

/// Batching window for self-originated key unset tombstones. A key persisted
/// and unset within the same window resolves in favor of the persist.
pub const UNSET_THROTTLE: Duration = Duration::from_millis(100);

/// Upper bound between two TTL-refresh scans when no per-key backoff is due
/// sooner.
pub const MAX_TTL_UPDATE_INTERVAL: Duration = Duration::from_secs(300);

/// Base interval between keep-alive status probes to an idle peer.
/// Each probe is scheduled with [`KEEP_ALIVE_JITTER_PCT`] percent jitter.
pub const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(20);

/// Jitter applied to keep-alive probe scheduling, in percent of the interval.
pub const KEEP_ALIVE_JITTER_PCT: u64 = 20;
