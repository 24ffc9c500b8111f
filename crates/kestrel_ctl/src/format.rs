//! Human-readable output for kestrelctl.

use std::collections::BTreeMap;

use kestrel_proto::{AreaSummary, PeerSpec, Publication, VersionedValue, TTL_INFINITE};

fn ttl_display(ttl_ms: i64) -> String {
    if ttl_ms == TTL_INFINITE {
        "inf".to_string()
    } else {
        format!("{ttl_ms}ms")
    }
}

fn payload_display(value: &VersionedValue) -> String {
    match &value.payload {
        None => "<no value>".to_string(),
        Some(bytes) => match std::str::from_utf8(bytes) {
            Ok(text) if !text.contains(char::is_control) => text.to_string(),
            _ => format!("<{} bytes>", bytes.len()),
        },
    }
}

pub fn print_publication(publication: &Publication) {
    if publication.key_vals.is_empty() && publication.expired_keys.is_empty() {
        println!("(empty)");
        return;
    }
    let key_width = publication
        .key_vals
        .keys()
        .map(String::len)
        .max()
        .unwrap_or(3)
        .max(3);
    println!(
        "{:<key_width$}  {:>7}  {:<16}  {:>10}  {:>6}  value",
        "key", "version", "originator", "ttl", "ttl-v",
    );
    for (key, value) in &publication.key_vals {
        println!(
            "{:<key_width$}  {:>7}  {:<16}  {:>10}  {:>6}  {}",
            key,
            value.version,
            value.originator_id,
            ttl_display(value.ttl_ms),
            value.ttl_version,
            payload_display(value),
        );
    }
    for key in &publication.expired_keys {
        println!("{key:<key_width$}  (expired)");
    }
    println!("\n{} key(s)", publication.key_vals.len());
}

pub fn print_peers(peers: &BTreeMap<String, PeerSpec>) {
    if peers.is_empty() {
        println!("no peers");
        return;
    }
    let name_width = peers.keys().map(String::len).max().unwrap_or(4).max(4);
    println!("{:<name_width$}  {:<22}  state", "peer", "address");
    for (name, spec) in peers {
        println!("{:<name_width$}  {:<22}  {}", name, spec.endpoint(), spec.state);
    }
}

pub fn print_summaries(summaries: &[AreaSummary]) {
    println!("{:<8}  {:>6}  {:>12}  peers", "area", "keys", "bytes");
    for summary in summaries {
        let peers: Vec<String> = summary
            .peers
            .iter()
            .map(|(name, spec)| format!("{name}({})", spec.state))
            .collect();
        println!(
            "{:<8}  {:>6}  {:>12}  {}",
            summary.area,
            summary.key_count,
            summary.total_bytes,
            peers.join(", "),
        );
    }
}
