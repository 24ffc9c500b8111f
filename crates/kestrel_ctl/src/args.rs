use clap::{Parser, Subcommand};

/// kestrelctl — operator client for a running kestreld
#[derive(Debug, Parser)]
#[command(name = "kestrelctl", about = "kestrel KvStore operator client", version)]
pub struct Args {
    /// Daemon host
    #[arg(short = 'H', long, default_value = "127.0.0.1")]
    pub host: String,

    /// Daemon control port
    #[arg(short = 'p', long, default_value_t = 6262)]
    pub port: u16,

    /// Area to operate on ("0" falls back to the node's sole area)
    #[arg(short = 'a', long, default_value = "0")]
    pub area: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Fetch specific keys
    Get {
        #[arg(required = true)]
        keys: Vec<String>,
    },

    /// Dump key-values, optionally filtered by prefix and originator
    Dump {
        /// Key prefix filter (repeatable)
        #[arg(long)]
        prefix: Vec<String>,
        /// Originator-id filter (repeatable)
        #[arg(long)]
        originator: Vec<String>,
        /// Require every filter set to match instead of any
        #[arg(long)]
        match_all: bool,
    },

    /// Dump keys and metadata only, payloads omitted
    Hashes {
        #[arg(long)]
        prefix: Vec<String>,
    },

    /// Inject a key-value into the store
    Set {
        key: String,
        value: String,
        #[arg(long, default_value_t = 1)]
        version: i64,
        #[arg(long, default_value_t = 300_000)]
        ttl_ms: i64,
        #[arg(long, default_value = "kestrelctl")]
        originator: String,
    },

    /// List peers and their sync state
    Peers,

    /// Announce a peer to the store
    AddPeer {
        name: String,
        addr: String,
        #[arg(long, default_value_t = 6262)]
        port: i32,
    },

    /// Remove peers from the store
    DelPeer {
        #[arg(required = true)]
        names: Vec<String>,
    },

    /// Per-area peer, key, and size summary (no areas = all)
    Summary { areas: Vec<String> },

    /// Liveness probe
    Status,
}
