//! Wire format for the kestrel KvStore peering protocol.
//!
//! Every message is framed as `[msg_type: u8][length: u32 LE][payload]`.
//! Structured records inside the payload are encoded as field-tagged
//! sequences: each present field is `[tag: u8][field bytes]`, terminated by
//! a 0 tag. Field tags are part of the interop contract and must remain
//! stable; optional fields are simply omitted.

pub mod codec;
pub mod error;
pub mod types;

pub use codec::{decode_message, encode_message};
pub use error::ProtoError;
pub use types::{
    AreaSummary, FilterOperator, KeyDumpParams, KeySetParams, Message, PeerSpec, PeerState,
    Publication, VersionedValue, TTL_INFINITE,
};

use kestrel_common::error::KvStoreError;

impl From<ProtoError> for KvStoreError {
    fn from(e: ProtoError) -> Self {
        KvStoreError::Protocol(e.to_string())
    }
}
