//! Replicated key–value store used as the control-plane gossip substrate of
//! the kestrel routing daemon.
//!
//! Architecture:
//! - One [`Store`] per process, one `AreaDb` actor per configured area.
//! - All mutation of an area's key-value map, peer table, and TTL queue runs
//!   on that area's actor task; RPC handlers hop onto the actor via a
//!   command channel, so none of these structures need locks.
//! - Peers converge through pairwise 3-way full-sync on connection and
//!   rate-limited incremental flooding afterwards.
//! - Conflict resolution is a deterministic tuple order
//!   (version, originator id, payload); every accepted update is a monotone
//!   advance, which makes convergence order-independent.
//! - Self-originated keys are cached and re-advertised: value updates under
//!   a per-key backoff, TTL refreshes at roughly a quarter of the lifetime.
//! - Expired keys are published to in-process subscribers only; each peer
//!   runs its own TTL clock, and every outbound hop decrements finite TTLs
//!   so nothing survives forever in a loop.

pub mod area;
pub mod events;
pub mod filter;
pub mod merge;
pub mod metrics;
pub mod peer;
pub mod self_origin;
pub mod store;
pub mod token_bucket;
pub mod transport;
pub mod ttl;

pub use events::{InitializationEvent, KvStorePublication, KvStoreSyncEvent};
pub use filter::KeyFilters;
pub use merge::{KeyEntry, KeyValueMap, MergeResult};
pub use metrics::{AreaMetrics, AreaMetricsSnapshot};
pub use store::{AreaPeerUpdate, PeerEvent, Store};
pub use transport::{InProcessNetwork, PeerClient, PeerClientFactory};
