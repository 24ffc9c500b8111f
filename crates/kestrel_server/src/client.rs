//! TCP peer client.
//!
//! One `NetClient` per peer record. The connection is cached behind an
//! async mutex and re-established lazily; any transport error invalidates
//! it so the next call reconnects. Holding the mutex across a full
//! request/response exchange serializes in-flight calls, which is what
//! gives the per-peer ordered delivery the flood path relies on.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::debug;

use kestrel_common::config::KvStoreConfig;
use kestrel_common::error::{KvStoreError, KvStoreResult};
use kestrel_proto::types::{FRAME_HEADER_SIZE, MAX_FRAME_SIZE};
use kestrel_proto::{
    decode_message, encode_message, AreaSummary, KeyDumpParams, KeySetParams, Message, PeerSpec,
    Publication,
};
use kestrel_store::{PeerClient, PeerClientFactory};

pub struct NetClient {
    peer_name: String,
    endpoint: String,
    connect_timeout: Duration,
    request_timeout: Duration,
    ip_tos: Option<u32>,
    conn: Mutex<Option<TcpStream>>,
}

impl NetClient {
    pub fn new(
        peer_name: impl Into<String>,
        endpoint: impl Into<String>,
        connect_timeout: Duration,
        request_timeout: Duration,
        ip_tos: Option<u32>,
    ) -> Self {
        Self {
            peer_name: peer_name.into(),
            endpoint: endpoint.into(),
            connect_timeout,
            request_timeout,
            ip_tos,
            conn: Mutex::new(None),
        }
    }

    fn transport_err(&self, reason: impl Into<String>) -> KvStoreError {
        KvStoreError::transport(&self.peer_name, reason)
    }

    async fn connect(&self) -> KvStoreResult<TcpStream> {
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(&self.endpoint))
            .await
            .map_err(|_| self.transport_err("connect timeout"))?
            .map_err(|e| self.transport_err(format!("connect: {e}")))?;
        stream
            .set_nodelay(true)
            .map_err(|e| self.transport_err(format!("nodelay: {e}")))?;
        if let Some(tos) = self.ip_tos {
            // Mark control-plane traffic so it survives congestion.
            let sock = socket2::SockRef::from(&stream);
            if let Err(e) = sock.set_tos(tos) {
                debug!(peer = %self.peer_name, error = %e, "failed to set IP_TOS");
            }
        }
        debug!(peer = %self.peer_name, endpoint = %self.endpoint, "peer connection established");
        Ok(stream)
    }

    async fn exchange(&self, stream: &mut TcpStream, request: &Message) -> KvStoreResult<Message> {
        let frame = encode_message(request);
        stream
            .write_all(&frame)
            .await
            .map_err(|e| self.transport_err(format!("write: {e}")))?;

        let mut header = [0u8; FRAME_HEADER_SIZE];
        stream
            .read_exact(&mut header)
            .await
            .map_err(|e| self.transport_err(format!("read header: {e}")))?;
        let length = u32::from_le_bytes([header[1], header[2], header[3], header[4]]);
        if length > MAX_FRAME_SIZE {
            return Err(self.transport_err(format!("oversized reply frame: {length} bytes")));
        }

        let mut buf = vec![0u8; FRAME_HEADER_SIZE + length as usize];
        buf[..FRAME_HEADER_SIZE].copy_from_slice(&header);
        stream
            .read_exact(&mut buf[FRAME_HEADER_SIZE..])
            .await
            .map_err(|e| self.transport_err(format!("read payload: {e}")))?;

        let (reply, _) =
            decode_message(&buf).map_err(|e| self.transport_err(format!("decode: {e}")))?;
        Ok(reply)
    }

    /// Send one request and await its reply, reconnecting if needed. The
    /// cached connection is dropped on any failure.
    async fn roundtrip(&self, request: Message) -> KvStoreResult<Message> {
        let mut guard = self.conn.lock().await;
        if guard.is_none() {
            *guard = Some(self.connect().await?);
        }
        let stream = guard.as_mut().expect("connected above");
        let result = tokio::time::timeout(self.request_timeout, self.exchange(stream, &request))
            .await
            .unwrap_or_else(|_| Err(self.transport_err("request timeout")));
        match result {
            Ok(reply) => Ok(reply),
            Err(e) => {
                *guard = None;
                Err(e)
            }
        }
    }

    fn expect_publication(&self, reply: Message) -> KvStoreResult<Publication> {
        match reply {
            Message::PublicationReply(publication) => Ok(publication),
            Message::ErrorReply { message } => Err(self.transport_err(message)),
            other => Err(self.transport_err(format!(
                "unexpected reply type 0x{:02x}",
                other.msg_type()
            ))),
        }
    }

    fn expect_ack(&self, reply: Message) -> KvStoreResult<()> {
        match reply {
            Message::Ack => Ok(()),
            Message::ErrorReply { message } => Err(self.transport_err(message)),
            other => Err(self.transport_err(format!(
                "unexpected reply type 0x{:02x}",
                other.msg_type()
            ))),
        }
    }

    // ── Operator surface ─────────────────────────────────────────────────

    /// Values for specific keys (operator `get`).
    pub async fn get_keys(&self, area: &str, keys: Vec<String>) -> KvStoreResult<Publication> {
        let reply = self
            .roundtrip(Message::GetKeyVals {
                area: area.to_string(),
                keys,
            })
            .await?;
        self.expect_publication(reply)
    }

    /// Keys and metadata only (operator `hashes`).
    pub async fn dump_hashes(
        &self,
        area: &str,
        params: KeyDumpParams,
    ) -> KvStoreResult<Publication> {
        let reply = self
            .roundtrip(Message::DumpHashes {
                area: area.to_string(),
                params,
            })
            .await?;
        self.expect_publication(reply)
    }

    pub async fn get_peers(&self, area: &str) -> KvStoreResult<BTreeMap<String, PeerSpec>> {
        let reply = self
            .roundtrip(Message::GetPeers {
                area: area.to_string(),
            })
            .await?;
        match reply {
            Message::PeersReply(peers) => Ok(peers),
            Message::ErrorReply { message } => Err(self.transport_err(message)),
            other => Err(self.transport_err(format!(
                "unexpected reply type 0x{:02x}",
                other.msg_type()
            ))),
        }
    }

    pub async fn add_peers(
        &self,
        area: &str,
        peers: BTreeMap<String, PeerSpec>,
    ) -> KvStoreResult<()> {
        let reply = self
            .roundtrip(Message::AddPeers {
                area: area.to_string(),
                peers,
            })
            .await?;
        self.expect_ack(reply)
    }

    pub async fn del_peers(&self, area: &str, peers: Vec<String>) -> KvStoreResult<()> {
        let reply = self
            .roundtrip(Message::DelPeers {
                area: area.to_string(),
                peers,
            })
            .await?;
        self.expect_ack(reply)
    }

    /// Per-area summaries; an empty list means all areas.
    pub async fn area_summary(&self, areas: Vec<String>) -> KvStoreResult<Vec<AreaSummary>> {
        let reply = self.roundtrip(Message::AreaSummary { areas }).await?;
        match reply {
            Message::SummaryReply(summaries) => Ok(summaries),
            Message::ErrorReply { message } => Err(self.transport_err(message)),
            other => Err(self.transport_err(format!(
                "unexpected reply type 0x{:02x}",
                other.msg_type()
            ))),
        }
    }
}

#[async_trait]
impl PeerClient for NetClient {
    async fn get_kv(&self, area: &str, params: KeyDumpParams) -> KvStoreResult<Publication> {
        let reply = self
            .roundtrip(Message::DumpKeyVals {
                area: area.to_string(),
                params,
            })
            .await?;
        self.expect_publication(reply)
    }

    async fn set_kv(&self, area: &str, params: KeySetParams) -> KvStoreResult<()> {
        let reply = self
            .roundtrip(Message::SetKeyVals {
                area: area.to_string(),
                params,
            })
            .await?;
        self.expect_ack(reply)
    }

    async fn get_status(&self) -> KvStoreResult<()> {
        let reply = self.roundtrip(Message::Status).await?;
        self.expect_ack(reply)
    }
}

/// Builds [`NetClient`]s from peer specs using the store's sync tunables.
pub struct NetClientFactory {
    connect_timeout: Duration,
    request_timeout: Duration,
    ip_tos: Option<u32>,
}

impl NetClientFactory {
    pub fn new(connect_timeout: Duration, request_timeout: Duration, ip_tos: Option<u32>) -> Self {
        Self {
            connect_timeout,
            request_timeout,
            ip_tos,
        }
    }

    pub fn from_config(cfg: &KvStoreConfig) -> Self {
        Self::new(
            Duration::from_millis(cfg.sync.connect_timeout_ms),
            Duration::from_millis(cfg.sync.request_timeout_ms),
            cfg.ip_tos,
        )
    }
}

impl PeerClientFactory for NetClientFactory {
    fn create(&self, peer_name: &str, spec: &PeerSpec) -> KvStoreResult<Arc<dyn PeerClient>> {
        Ok(Arc::new(NetClient::new(
            peer_name,
            spec.endpoint(),
            self.connect_timeout,
            self.request_timeout,
            self.ip_tos,
        )))
    }
}
