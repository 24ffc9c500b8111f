//! Per-peer records and the peer sync state machine.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use tracing::error;

use kestrel_common::backoff::ExponentialBackoff;
use kestrel_common::constants;
use kestrel_proto::{PeerSpec, PeerState};

use crate::transport::PeerClient;

/// Events driving the peer state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum PeerSyncEvent {
    /// Peer added (or re-added) and a full-sync is being dispatched.
    PeerAdd = 0,
    /// Full-sync response received and merged.
    SyncResponseReceived = 1,
    /// Outbound RPC to the peer failed or timed out.
    TransportError = 2,
}

/// Transition table, rows indexed by state, columns by event. `None` cells
/// are undefined transitions.
const STATE_TABLE: [[Option<PeerState>; 3]; 3] = [
    // IDLE
    [
        Some(PeerState::Syncing),
        None,
        Some(PeerState::Idle),
    ],
    // SYNCING
    [
        None,
        Some(PeerState::Initialized),
        Some(PeerState::Idle),
    ],
    // INITIALIZED
    [
        None,
        Some(PeerState::Initialized),
        Some(PeerState::Idle),
    ],
];

/// Look up the next state. An undefined transition is a programming error:
/// it aborts in debug builds and is clamped to IDLE (with an error log) in
/// release builds.
pub fn next_state(current: PeerState, event: PeerSyncEvent) -> PeerState {
    match STATE_TABLE[current as usize][event as usize] {
        Some(next) => next,
        None => {
            debug_assert!(
                false,
                "undefined peer state transition: {current} on {event:?}"
            );
            error!(%current, ?event, "undefined peer state transition, clamping to IDLE");
            PeerState::Idle
        }
    }
}

/// Everything the area database tracks about one peer. Owned exclusively by
/// the area's peer table; the client handle dies with the record.
pub struct PeerRecord {
    pub spec: PeerSpec,
    /// Absent until a connection attempt succeeds, reset on failure.
    pub client: Option<Arc<dyn PeerClient>>,
    pub backoff: ExponentialBackoff,
    /// Transport failures observed for this peer. Any non-zero count marks
    /// the peer "done trying" for the initial-sync barrier.
    pub api_error_count: u64,
    /// Keys that changed while the peer had not reached INITIALIZED; they
    /// ride the finalize-sync leg once it has.
    pub pending_keys: BTreeSet<String>,
    /// Next keep-alive probe deadline.
    pub keep_alive_at: Instant,
}

impl PeerRecord {
    pub fn new(mut spec: PeerSpec, now: Instant) -> Self {
        spec.state = PeerState::Idle;
        Self {
            spec,
            client: None,
            backoff: ExponentialBackoff::new(constants::INITIAL_BACKOFF, constants::MAX_BACKOFF),
            api_error_count: 0,
            pending_keys: BTreeSet::new(),
            keep_alive_at: now + jittered_keep_alive(),
        }
    }

    /// Apply `event` and return `(old_state, new_state)` for logging.
    pub fn transition(&mut self, event: PeerSyncEvent) -> (PeerState, PeerState) {
        let old = self.spec.state;
        self.spec.state = next_state(old, event);
        (old, self.spec.state)
    }

    /// Schedule the next keep-alive probe.
    pub fn schedule_keep_alive(&mut self, now: Instant) {
        self.keep_alive_at = now + jittered_keep_alive();
    }
}

/// Keep-alive interval with ±[`constants::KEEP_ALIVE_JITTER_PCT`]% jitter so
/// probes across peers spread out.
fn jittered_keep_alive() -> Duration {
    let base = constants::KEEP_ALIVE_INTERVAL.as_millis() as u64;
    let spread = base * constants::KEEP_ALIVE_JITTER_PCT / 100;
    let low = base - spread;
    let high = base + spread;
    Duration::from_millis(rand::thread_rng().gen_range(low..=high))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_idle_peer_add_starts_sync() {
        assert_eq!(
            next_state(PeerState::Idle, PeerSyncEvent::PeerAdd),
            PeerState::Syncing
        );
    }

    #[test]
    fn test_syncing_response_initializes() {
        assert_eq!(
            next_state(PeerState::Syncing, PeerSyncEvent::SyncResponseReceived),
            PeerState::Initialized
        );
    }

    #[test]
    fn test_initialized_response_is_stable() {
        assert_eq!(
            next_state(PeerState::Initialized, PeerSyncEvent::SyncResponseReceived),
            PeerState::Initialized
        );
    }

    #[test]
    fn test_transport_error_always_idles() {
        for state in [PeerState::Idle, PeerState::Syncing, PeerState::Initialized] {
            assert_eq!(
                next_state(state, PeerSyncEvent::TransportError),
                PeerState::Idle
            );
        }
    }

    #[test]
    #[should_panic]
    #[cfg(debug_assertions)]
    fn test_undefined_transition_panics_in_debug() {
        next_state(PeerState::Syncing, PeerSyncEvent::PeerAdd);
    }

    #[test]
    fn test_record_transition_reports_pair() {
        let now = Instant::now();
        let mut rec = PeerRecord::new(PeerSpec::new("10.0.0.2", 6262), now);
        let (old, new) = rec.transition(PeerSyncEvent::PeerAdd);
        assert_eq!(old, PeerState::Idle);
        assert_eq!(new, PeerState::Syncing);
        assert_eq!(rec.spec.state, PeerState::Syncing);
    }

    #[test]
    fn test_keep_alive_jitter_within_bounds() {
        for _ in 0..32 {
            let d = jittered_keep_alive();
            let base = constants::KEEP_ALIVE_INTERVAL.as_millis() as u64;
            let spread = base * constants::KEEP_ALIVE_JITTER_PCT / 100;
            assert!(d.as_millis() as u64 >= base - spread);
            assert!(d.as_millis() as u64 <= base + spread);
        }
    }
}
