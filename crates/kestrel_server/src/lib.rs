//! Network surface of the kestrel KvStore: the TCP RPC server and the peer
//! client used by area databases to reach their neighbors.

pub mod client;
pub mod config;
pub mod server;

pub use client::{NetClient, NetClientFactory};
pub use config::DaemonConfig;
pub use server::KvServer;
