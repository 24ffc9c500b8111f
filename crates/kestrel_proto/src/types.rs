//! Semantic wire records for the KvStore peering protocol.
//!
//! Field tags noted on each struct are the interop contract (see the codec).

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

use sha2::{Digest, Sha256};

/// Sentinel ttl meaning "do not expire". Any other non-positive ttl is
/// rejected on ingress.
pub const TTL_INFINITE: i64 = i64::MIN;

// ── Message type ids ─────────────────────────────────────────────────────

pub const MSG_GET_KV: u8 = 0x01;
pub const MSG_DUMP_KV: u8 = 0x02;
pub const MSG_DUMP_HASHES: u8 = 0x03;
pub const MSG_SET_KV: u8 = 0x04;
pub const MSG_GET_PEERS: u8 = 0x05;
pub const MSG_ADD_PEERS: u8 = 0x06;
pub const MSG_DEL_PEERS: u8 = 0x07;
pub const MSG_AREA_SUMMARY: u8 = 0x08;
pub const MSG_STATUS: u8 = 0x09;

pub const MSG_PUBLICATION_REPLY: u8 = 0x81;
pub const MSG_PEERS_REPLY: u8 = 0x82;
pub const MSG_SUMMARY_REPLY: u8 = 0x83;
pub const MSG_ACK: u8 = 0x84;
pub const MSG_ERROR_REPLY: u8 = 0x85;

/// Frame header: `[msg_type: u8][length: u32 LE]`.
pub const FRAME_HEADER_SIZE: usize = 5;

/// Maximum frame payload size (64 MiB).
pub const MAX_FRAME_SIZE: u32 = 64 * 1024 * 1024;

// ── VersionedValue ───────────────────────────────────────────────────────

/// The unit of replication.
///
/// Tags: 1 version(i64), 2 payload(optional bytes), 3 originator_id(string),
/// 4 ttl_ms(i64), 5 ttl_version(i64, default 0), 6 content_hash(optional i64).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionedValue {
    /// Monotonic per-key per-originator. >= 1 for any value-bearing update;
    /// 0 is reserved for "not yet originated".
    pub version: i64,
    /// Absent means this record is only a TTL refresh in transit.
    pub payload: Option<Vec<u8>>,
    pub originator_id: String,
    /// [`TTL_INFINITE`] or a positive remaining lifetime in milliseconds.
    pub ttl_ms: i64,
    /// Monotonic per (key, version, originator). Resets to 0 whenever
    /// `version` advances.
    pub ttl_version: i64,
    /// Hash over (version, originator_id, payload). Filled on ingress.
    pub content_hash: Option<i64>,
}

impl VersionedValue {
    pub fn new(
        version: i64,
        originator_id: impl Into<String>,
        payload: Option<Vec<u8>>,
        ttl_ms: i64,
    ) -> Self {
        Self {
            version,
            payload,
            originator_id: originator_id.into(),
            ttl_ms,
            ttl_version: 0,
            content_hash: None,
        }
    }

    pub fn is_infinite_ttl(&self) -> bool {
        self.ttl_ms == TTL_INFINITE
    }

    /// Wire-stable hash over (version, originator_id, payload). Equal hashes
    /// on two records imply equal content, across heterogeneous nodes.
    pub fn compute_hash(&self) -> i64 {
        let mut h = Sha256::new();
        h.update(self.version.to_be_bytes());
        h.update((self.originator_id.len() as u64).to_be_bytes());
        h.update(self.originator_id.as_bytes());
        match &self.payload {
            Some(p) => {
                h.update([1u8]);
                h.update(p);
            }
            None => h.update([0u8]),
        }
        let digest = h.finalize();
        let mut first = [0u8; 8];
        first.copy_from_slice(&digest[..8]);
        i64::from_be_bytes(first)
    }

    /// Fill `content_hash` if absent.
    pub fn ensure_hash(&mut self) {
        if self.content_hash.is_none() {
            self.content_hash = Some(self.compute_hash());
        }
    }

    /// The conflict-resolution tuple order: version, then originator_id,
    /// then payload, all descending-wins. `Greater` means `self` wins.
    pub fn tuple_cmp(&self, other: &VersionedValue) -> Ordering {
        self.version
            .cmp(&other.version)
            .then_with(|| self.originator_id.cmp(&other.originator_id))
            .then_with(|| self.payload.cmp(&other.payload))
    }
}

// ── Peers ────────────────────────────────────────────────────────────────

/// Peer sync lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PeerState {
    Idle = 0,
    Syncing = 1,
    Initialized = 2,
}

impl PeerState {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(PeerState::Idle),
            1 => Some(PeerState::Syncing),
            2 => Some(PeerState::Initialized),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PeerState::Idle => "IDLE",
            PeerState::Syncing => "SYNCING",
            PeerState::Initialized => "INITIALIZED",
        }
    }
}

impl std::fmt::Display for PeerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tags: 1 peer_addr(string), 4 ctrl_port(i32), 5 state(enum).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerSpec {
    pub peer_addr: String,
    pub ctrl_port: i32,
    pub state: PeerState,
}

impl PeerSpec {
    pub fn new(peer_addr: impl Into<String>, ctrl_port: i32) -> Self {
        Self {
            peer_addr: peer_addr.into(),
            ctrl_port,
            state: PeerState::Idle,
        }
    }

    /// `host:port` endpoint for the peer's control-plane listener.
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.peer_addr, self.ctrl_port)
    }
}

// ── Filters ──────────────────────────────────────────────────────────────

/// How multiple dump filters combine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FilterOperator {
    /// A key matches if any filter matches.
    Or = 1,
    /// A key must match all filters.
    And = 2,
}

impl FilterOperator {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(FilterOperator::Or),
            2 => Some(FilterOperator::And),
            _ => None,
        }
    }
}

// ── RPC params ───────────────────────────────────────────────────────────

/// Write request parameters.
///
/// Tags: 2 key_vals(map), 5 node_path(optional list), 7 timestamp_ms
/// (optional i64), 8 sender_id(optional string).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeySetParams {
    pub key_vals: BTreeMap<String, VersionedValue>,
    /// Ordered list of nodes this publication has already traversed.
    pub node_path: Option<Vec<String>>,
    pub timestamp_ms: Option<i64>,
    pub sender_id: Option<String>,
}

/// Read request parameters.
///
/// Tags: 1 prefix(string, deprecated), 2 key_val_hashes(optional map),
/// 3 originator_ids(set), 4 oper(optional enum), 5 keys(optional list),
/// 6 ignore_ttl(bool, default true), 7 do_not_publish_value(bool, default
/// false), 8 sender_id(optional string).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyDumpParams {
    /// Comma-joined prefix list, kept for backwards compatibility. The
    /// `keys` list takes precedence when present.
    pub prefix: String,
    /// When present, the dump behaves as the responder side of a full-sync:
    /// only differing keys are returned and `tobe_updated_keys` is filled.
    pub key_val_hashes: Option<BTreeMap<String, VersionedValue>>,
    pub originator_ids: BTreeSet<String>,
    pub oper: Option<FilterOperator>,
    pub keys: Option<Vec<String>>,
    pub ignore_ttl: bool,
    pub do_not_publish_value: bool,
    pub sender_id: Option<String>,
}

impl Default for KeyDumpParams {
    fn default() -> Self {
        Self {
            prefix: String::new(),
            key_val_hashes: None,
            originator_ids: BTreeSet::new(),
            oper: None,
            keys: None,
            ignore_ttl: true,
            do_not_publish_value: false,
            sender_id: None,
        }
    }
}

// ── Publication ──────────────────────────────────────────────────────────

/// A delta message: key-value updates plus expired keys, with the traversal
/// path used for loop suppression.
///
/// Tags: 2 key_vals(map), 3 expired_keys(list), 4 node_path(optional list),
/// 5 tobe_updated_keys(optional list), 7 area(string), 8 timestamp_ms
/// (optional i64).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publication {
    pub key_vals: BTreeMap<String, VersionedValue>,
    pub expired_keys: Vec<String>,
    pub node_path: Option<Vec<String>>,
    /// Keys the requester holds a newer record for; filled only on
    /// full-sync responses.
    pub tobe_updated_keys: Option<Vec<String>>,
    pub area: String,
    pub timestamp_ms: Option<i64>,
}

impl Publication {
    pub fn new(area: impl Into<String>) -> Self {
        Self {
            key_vals: BTreeMap::new(),
            expired_keys: Vec::new(),
            node_path: None,
            tobe_updated_keys: None,
            area: area.into(),
            timestamp_ms: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.key_vals.is_empty() && self.expired_keys.is_empty()
    }
}

// ── Area summary ─────────────────────────────────────────────────────────

/// Operator-facing per-area summary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AreaSummary {
    pub area: String,
    pub peers: BTreeMap<String, PeerSpec>,
    pub key_count: i64,
    pub total_bytes: i64,
}

// ── Messages ─────────────────────────────────────────────────────────────

/// A framed protocol message: requests carry their area explicitly; replies
/// mirror the store's RPC surface.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    GetKeyVals {
        area: String,
        keys: Vec<String>,
    },
    DumpKeyVals {
        area: String,
        params: KeyDumpParams,
    },
    DumpHashes {
        area: String,
        params: KeyDumpParams,
    },
    SetKeyVals {
        area: String,
        params: KeySetParams,
    },
    GetPeers {
        area: String,
    },
    AddPeers {
        area: String,
        peers: BTreeMap<String, PeerSpec>,
    },
    DelPeers {
        area: String,
        peers: Vec<String>,
    },
    /// Empty `areas` means all configured areas.
    AreaSummary {
        areas: Vec<String>,
    },
    /// Keep-alive probe.
    Status,

    PublicationReply(Publication),
    PeersReply(BTreeMap<String, PeerSpec>),
    SummaryReply(Vec<AreaSummary>),
    Ack,
    ErrorReply {
        message: String,
    },
}

impl Message {
    pub fn msg_type(&self) -> u8 {
        match self {
            Message::GetKeyVals { .. } => MSG_GET_KV,
            Message::DumpKeyVals { .. } => MSG_DUMP_KV,
            Message::DumpHashes { .. } => MSG_DUMP_HASHES,
            Message::SetKeyVals { .. } => MSG_SET_KV,
            Message::GetPeers { .. } => MSG_GET_PEERS,
            Message::AddPeers { .. } => MSG_ADD_PEERS,
            Message::DelPeers { .. } => MSG_DEL_PEERS,
            Message::AreaSummary { .. } => MSG_AREA_SUMMARY,
            Message::Status => MSG_STATUS,
            Message::PublicationReply(_) => MSG_PUBLICATION_REPLY,
            Message::PeersReply(_) => MSG_PEERS_REPLY,
            Message::SummaryReply(_) => MSG_SUMMARY_REPLY,
            Message::Ack => MSG_ACK,
            Message::ErrorReply { .. } => MSG_ERROR_REPLY,
        }
    }
}
