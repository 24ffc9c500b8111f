//! kestrelctl — operator client for a running kestreld.

mod args;
mod format;

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;

use args::{Args, Command};
use kestrel_proto::{FilterOperator, KeyDumpParams, KeySetParams, PeerSpec, VersionedValue};
use kestrel_server::client::NetClient;
use kestrel_store::PeerClient;

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("kestrelctl: error: {e:#}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let endpoint = format!("{}:{}", args.host, args.port);
    let client = NetClient::new(
        "kestrelctl",
        endpoint.clone(),
        Duration::from_secs(1),
        Duration::from_secs(10),
        None,
    );
    let area = args.area.as_str();

    match args.command {
        Command::Get { keys } => {
            let publication = client
                .get_keys(area, keys)
                .await
                .with_context(|| format!("get from {endpoint}"))?;
            format::print_publication(&publication);
        }
        Command::Dump {
            prefix,
            originator,
            match_all,
        } => {
            let params = KeyDumpParams {
                keys: if prefix.is_empty() {
                    None
                } else {
                    Some(prefix)
                },
                originator_ids: originator.into_iter().collect(),
                oper: match_all.then_some(FilterOperator::And),
                sender_id: Some("kestrelctl".to_string()),
                ..Default::default()
            };
            let publication = client
                .get_kv(area, params)
                .await
                .with_context(|| format!("dump from {endpoint}"))?;
            format::print_publication(&publication);
        }
        Command::Hashes { prefix } => {
            let params = KeyDumpParams {
                keys: if prefix.is_empty() {
                    None
                } else {
                    Some(prefix)
                },
                sender_id: Some("kestrelctl".to_string()),
                ..Default::default()
            };
            let publication = client
                .dump_hashes(area, params)
                .await
                .with_context(|| format!("hash dump from {endpoint}"))?;
            format::print_publication(&publication);
        }
        Command::Set {
            key,
            value,
            version,
            ttl_ms,
            originator,
        } => {
            let mut key_vals = BTreeMap::new();
            key_vals.insert(
                key.clone(),
                VersionedValue::new(version, originator, Some(value.into_bytes()), ttl_ms),
            );
            client
                .set_kv(
                    area,
                    KeySetParams {
                        key_vals,
                        sender_id: Some("kestrelctl".to_string()),
                        ..Default::default()
                    },
                )
                .await
                .with_context(|| format!("set on {endpoint}"))?;
            println!("set {key}");
        }
        Command::Peers => {
            let peers = client
                .get_peers(area)
                .await
                .with_context(|| format!("peers from {endpoint}"))?;
            format::print_peers(&peers);
        }
        Command::AddPeer { name, addr, port } => {
            let mut peers = BTreeMap::new();
            peers.insert(name.clone(), PeerSpec::new(addr, port));
            client
                .add_peers(area, peers)
                .await
                .with_context(|| format!("add-peer on {endpoint}"))?;
            println!("added peer {name}");
        }
        Command::DelPeer { names } => {
            client
                .del_peers(area, names.clone())
                .await
                .with_context(|| format!("del-peer on {endpoint}"))?;
            println!("deleted {}", names.join(", "));
        }
        Command::Summary { areas } => {
            let summaries = client
                .area_summary(areas)
                .await
                .with_context(|| format!("summary from {endpoint}"))?;
            format::print_summaries(&summaries);
        }
        Command::Status => {
            client
                .get_status()
                .await
                .with_context(|| format!("status probe to {endpoint}"))?;
            println!("{endpoint}: alive");
        }
    }
    Ok(())
}
