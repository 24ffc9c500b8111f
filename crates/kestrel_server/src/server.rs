//! Control-plane TCP server.
//!
//! Accepts peer and operator connections, reads framed requests, hops onto
//! the store, and writes framed replies. One task per connection; a
//! session registry tracks who is connected for logs and the area summary
//! surface.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use kestrel_proto::types::{FRAME_HEADER_SIZE, MAX_FRAME_SIZE};
use kestrel_proto::{decode_message, encode_message, Message};
use kestrel_store::Store;

/// Live-connection bookkeeping.
#[derive(Debug)]
pub struct SessionInfo {
    pub peer_addr: SocketAddr,
    pub connected_at: Instant,
    pub requests: AtomicU64,
}

pub struct KvServer {
    store: Arc<Store>,
    sessions: Arc<DashMap<u64, Arc<SessionInfo>>>,
    next_session_id: AtomicU64,
}

impl KvServer {
    pub fn new(store: Arc<Store>) -> Arc<Self> {
        Arc::new(Self {
            store,
            sessions: Arc::new(DashMap::new()),
            next_session_id: AtomicU64::new(1),
        })
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Accept loop. Runs until the listener errors or the task is dropped.
    pub async fn run(self: Arc<Self>, listener: TcpListener) -> std::io::Result<()> {
        let local = listener.local_addr()?;
        info!(addr = %local, "kvstore rpc listener started");
        loop {
            let (stream, peer_addr) = listener.accept().await?;
            let session_id = self.next_session_id.fetch_add(1, Ordering::Relaxed);
            let session = Arc::new(SessionInfo {
                peer_addr,
                connected_at: Instant::now(),
                requests: AtomicU64::new(0),
            });
            self.sessions.insert(session_id, Arc::clone(&session));
            debug!(session_id, peer = %peer_addr, "connection accepted");

            let server = Arc::clone(&self);
            tokio::spawn(async move {
                if let Err(e) = server.handle_connection(stream, &session).await {
                    debug!(session_id, peer = %peer_addr, error = %e, "connection closed");
                }
                server.sessions.remove(&session_id);
            });
        }
    }

    async fn handle_connection(
        &self,
        mut stream: TcpStream,
        session: &SessionInfo,
    ) -> std::io::Result<()> {
        stream.set_nodelay(true)?;
        loop {
            let mut header = [0u8; FRAME_HEADER_SIZE];
            match stream.read_exact(&mut header).await {
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
                Err(e) => return Err(e),
            }
            let length = u32::from_le_bytes([header[1], header[2], header[3], header[4]]);
            if length > MAX_FRAME_SIZE {
                warn!(peer = %session.peer_addr, length, "oversized request frame, closing");
                return Ok(());
            }
            let mut frame = vec![0u8; FRAME_HEADER_SIZE + length as usize];
            frame[..FRAME_HEADER_SIZE].copy_from_slice(&header);
            stream.read_exact(&mut frame[FRAME_HEADER_SIZE..]).await?;

            session.requests.fetch_add(1, Ordering::Relaxed);
            let reply = match decode_message(&frame) {
                Ok((request, _)) => self.dispatch(request).await,
                Err(e) => {
                    warn!(peer = %session.peer_addr, error = %e, "undecodable request");
                    Message::ErrorReply {
                        message: format!("protocol error: {e}"),
                    }
                }
            };
            stream.write_all(&encode_message(&reply)).await?;
        }
    }

    async fn dispatch(&self, request: Message) -> Message {
        match request {
            Message::GetKeyVals { area, keys } => {
                reply_publication(self.store.get_key_vals(&area, keys).await)
            }
            Message::DumpKeyVals { area, params } => {
                reply_publication(self.store.dump_key_vals(&area, params).await)
            }
            Message::DumpHashes { area, params } => {
                reply_publication(self.store.dump_hashes(&area, params).await)
            }
            Message::SetKeyVals { area, params } => {
                reply_ack(self.store.set_key_vals(&area, params).await)
            }
            Message::GetPeers { area } => match self.store.get_peers(&area).await {
                Ok(peers) => Message::PeersReply(peers),
                Err(e) => error_reply(e),
            },
            Message::AddPeers { area, peers } => {
                reply_ack(self.store.add_peers(&area, peers).await)
            }
            Message::DelPeers { area, peers } => {
                reply_ack(self.store.del_peers(&area, peers).await)
            }
            Message::AreaSummary { areas } => match self.store.area_summaries(areas).await {
                Ok(summaries) => Message::SummaryReply(summaries),
                Err(e) => error_reply(e),
            },
            Message::Status => Message::Ack,
            other => Message::ErrorReply {
                message: format!("unexpected message type 0x{:02x}", other.msg_type()),
            },
        }
    }
}

fn reply_publication(
    result: Result<kestrel_proto::Publication, kestrel_common::error::KvStoreError>,
) -> Message {
    match result {
        Ok(publication) => Message::PublicationReply(publication),
        Err(e) => error_reply(e),
    }
}

fn reply_ack(result: Result<(), kestrel_common::error::KvStoreError>) -> Message {
    match result {
        Ok(()) => Message::Ack,
        Err(e) => error_reply(e),
    }
}

fn error_reply(e: kestrel_common::error::KvStoreError) -> Message {
    Message::ErrorReply {
        message: e.to_string(),
    }
}
