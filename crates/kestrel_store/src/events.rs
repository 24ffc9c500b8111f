//! Outbound event types consumed by downstream modules of this process.

use kestrel_proto::Publication;

/// Events on the store's publication channel.
#[derive(Debug, Clone)]
pub enum KvStorePublication {
    /// A normal delta or an expiry notification.
    Publication(Publication),
    /// Lifecycle signal; see [`InitializationEvent`].
    InitializationEvent(InitializationEvent),
}

/// Process-lifecycle signals gating downstream modules.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitializationEvent {
    /// Every configured area finished its initial sync. Emitted exactly
    /// once per process lifetime.
    KvStoreSynced,
}

/// Fired on every SYNCING → INITIALIZED transition of a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvStoreSyncEvent {
    pub peer_name: String,
    pub area: String,
}
