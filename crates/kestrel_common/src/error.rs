use thiserror::Error;

/// Convenience alias for `Result<T, KvStoreError>`.
pub type KvStoreResult<T> = Result<T, KvStoreError>;

/// Error classification for handling decisions.
///
/// - `UserError`   — bad request from the RPC caller; surfaced as-is
/// - `Recoverable` — transport-level failure; absorbed by backoff + retry
/// - `Silent`      — expected drop (filter, loop, stale callback); telemetry only
/// - `InternalBug` — should never happen; logged loudly
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    UserError,
    Recoverable,
    Silent,
    InternalBug,
}

/// Top-level error type for the KvStore. No variant is fatal to the process:
/// failures are either user-visible at the RPC boundary or absorbed locally.
#[derive(Error, Debug, Clone)]
pub enum KvStoreError {
    /// Request references an area not configured on this node.
    #[error("invalid area: {0}")]
    InvalidArea(String),

    /// Malformed request params (empty peer map, non-positive finite ttl, ...).
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    /// Outbound peer RPC failed or timed out. Drives the peer state machine
    /// back to IDLE and advances its backoff.
    #[error("peer transport error ({peer}): {reason}")]
    PeerTransport { peer: String, reason: String },

    /// A callback fired for a peer that has been deleted or reset to IDLE.
    #[error("stale response from peer {peer}")]
    StaleResponse { peer: String },

    /// Incoming key dropped by the configured ingress filter.
    #[error("key rejected by filter: {key}")]
    FilterRejected { key: String },

    /// Incoming publication whose node path already contains this node.
    #[error("loop detected in publication path")]
    LoopDetected,

    /// Wire-level decode/encode failure.
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl KvStoreError {
    /// Classify this error for handling decisions.
    pub fn class(&self) -> ErrorClass {
        match self {
            KvStoreError::InvalidArea(_) => ErrorClass::UserError,
            KvStoreError::InvalidPayload(_) => ErrorClass::UserError,
            KvStoreError::Protocol(_) => ErrorClass::UserError,
            KvStoreError::PeerTransport { .. } => ErrorClass::Recoverable,
            KvStoreError::StaleResponse { .. } => ErrorClass::Silent,
            KvStoreError::FilterRejected { .. } => ErrorClass::Silent,
            KvStoreError::LoopDetected => ErrorClass::Silent,
            KvStoreError::Internal(_) => ErrorClass::InternalBug,
        }
    }

    /// Returns true if the error should be surfaced to the RPC caller.
    pub fn is_user_error(&self) -> bool {
        matches!(self.class(), ErrorClass::UserError)
    }

    /// Returns true if the error is absorbed by backoff and retry.
    pub fn is_recoverable(&self) -> bool {
        matches!(self.class(), ErrorClass::Recoverable)
    }

    /// Returns true if the error is an expected drop recorded only in
    /// telemetry.
    pub fn is_silent(&self) -> bool {
        matches!(self.class(), ErrorClass::Silent)
    }

    /// Construct a transport error for a named peer.
    pub fn transport(peer: impl Into<String>, reason: impl Into<String>) -> Self {
        KvStoreError::PeerTransport {
            peer: peer.into(),
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_area_is_user_error() {
        let e = KvStoreError::InvalidArea("9".into());
        assert_eq!(e.class(), ErrorClass::UserError);
        assert!(e.is_user_error());
        assert!(!e.is_recoverable());
    }

    #[test]
    fn test_invalid_payload_is_user_error() {
        let e = KvStoreError::InvalidPayload("empty peer map".into());
        assert_eq!(e.class(), ErrorClass::UserError);
    }

    #[test]
    fn test_transport_is_recoverable() {
        let e = KvStoreError::transport("node-b", "connect timeout");
        assert_eq!(e.class(), ErrorClass::Recoverable);
        assert!(e.is_recoverable());
        assert!(e.to_string().contains("node-b"));
    }

    #[test]
    fn test_stale_response_is_silent() {
        let e = KvStoreError::StaleResponse {
            peer: "node-b".into(),
        };
        assert_eq!(e.class(), ErrorClass::Silent);
        assert!(e.is_silent());
    }

    #[test]
    fn test_filter_and_loop_are_silent() {
        assert!(KvStoreError::FilterRejected { key: "k".into() }.is_silent());
        assert!(KvStoreError::LoopDetected.is_silent());
    }

    #[test]
    fn test_internal_is_bug() {
        let e = KvStoreError::Internal("area actor gone".into());
        assert_eq!(e.class(), ErrorClass::InternalBug);
    }
}
