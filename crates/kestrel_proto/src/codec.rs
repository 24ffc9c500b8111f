//! Encode/decode for the kestrel KvStore peering protocol.
//!
//! All multi-byte integers are little-endian. Every message is framed as
//! `[msg_type: u8][length: u32 LE][payload: length bytes]`. Records inside
//! a payload encode each present field as `[tag: u8][field bytes]` and end
//! with a 0 tag; unknown tags are a decode error, absent optional fields
//! take their documented defaults.

use std::collections::{BTreeMap, BTreeSet};

use bytes::{BufMut, BytesMut};

use crate::error::ProtoError;
use crate::types::*;

type Result<T> = std::result::Result<T, ProtoError>;

const END_TAG: u8 = 0;

// ── Helper: read/write primitives ────────────────────────────────────────

fn ensure(buf: &[u8], need: usize) -> Result<()> {
    if buf.len() < need {
        return Err(ProtoError::Truncated {
            expected: need,
            actual: buf.len(),
        });
    }
    Ok(())
}

fn read_u8(buf: &mut &[u8]) -> Result<u8> {
    ensure(buf, 1)?;
    let v = buf[0];
    *buf = &buf[1..];
    Ok(v)
}

fn read_u16(buf: &mut &[u8]) -> Result<u16> {
    ensure(buf, 2)?;
    let v = u16::from_le_bytes([buf[0], buf[1]]);
    *buf = &buf[2..];
    Ok(v)
}

fn read_u32(buf: &mut &[u8]) -> Result<u32> {
    ensure(buf, 4)?;
    let v = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
    *buf = &buf[4..];
    Ok(v)
}

fn read_i32(buf: &mut &[u8]) -> Result<i32> {
    ensure(buf, 4)?;
    let v = i32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
    *buf = &buf[4..];
    Ok(v)
}

fn read_i64(buf: &mut &[u8]) -> Result<i64> {
    ensure(buf, 8)?;
    let mut arr = [0u8; 8];
    arr.copy_from_slice(&buf[..8]);
    *buf = &buf[8..];
    Ok(i64::from_le_bytes(arr))
}

fn read_bool(buf: &mut &[u8]) -> Result<bool> {
    Ok(read_u8(buf)? != 0)
}

fn read_bytes(buf: &mut &[u8], n: usize) -> Result<Vec<u8>> {
    ensure(buf, n)?;
    let v = buf[..n].to_vec();
    *buf = &buf[n..];
    Ok(v)
}

fn read_bytes_u32(buf: &mut &[u8]) -> Result<Vec<u8>> {
    let n = read_u32(buf)? as usize;
    read_bytes(buf, n)
}

fn read_string_u16(buf: &mut &[u8], field: &'static str) -> Result<String> {
    let len = read_u16(buf)? as usize;
    let bytes = read_bytes(buf, len)?;
    String::from_utf8(bytes).map_err(|e| ProtoError::InvalidUtf8 { field, source: e })
}

fn write_string_u16(out: &mut BytesMut, s: &str) {
    out.put_u16_le(s.len() as u16);
    out.put_slice(s.as_bytes());
}

fn write_bytes_u32(out: &mut BytesMut, b: &[u8]) {
    out.put_u32_le(b.len() as u32);
    out.put_slice(b);
}

// ── String collections ───────────────────────────────────────────────────

fn write_string_list(out: &mut BytesMut, items: &[String]) {
    out.put_u32_le(items.len() as u32);
    for s in items {
        write_string_u16(out, s);
    }
}

fn read_string_list(buf: &mut &[u8], field: &'static str) -> Result<Vec<String>> {
    let n = read_u32(buf)? as usize;
    let mut items = Vec::with_capacity(n.min(65_536));
    for _ in 0..n {
        items.push(read_string_u16(buf, field)?);
    }
    Ok(items)
}

fn write_string_set(out: &mut BytesMut, items: &BTreeSet<String>) {
    out.put_u32_le(items.len() as u32);
    for s in items {
        write_string_u16(out, s);
    }
}

fn read_string_set(buf: &mut &[u8], field: &'static str) -> Result<BTreeSet<String>> {
    let n = read_u32(buf)? as usize;
    let mut items = BTreeSet::new();
    for _ in 0..n {
        items.insert(read_string_u16(buf, field)?);
    }
    Ok(items)
}

// ── VersionedValue ───────────────────────────────────────────────────────

fn encode_versioned_value(out: &mut BytesMut, v: &VersionedValue) {
    out.put_u8(1);
    out.put_i64_le(v.version);
    if let Some(payload) = &v.payload {
        out.put_u8(2);
        write_bytes_u32(out, payload);
    }
    out.put_u8(3);
    write_string_u16(out, &v.originator_id);
    out.put_u8(4);
    out.put_i64_le(v.ttl_ms);
    if v.ttl_version != 0 {
        out.put_u8(5);
        out.put_i64_le(v.ttl_version);
    }
    if let Some(hash) = v.content_hash {
        out.put_u8(6);
        out.put_i64_le(hash);
    }
    out.put_u8(END_TAG);
}

fn decode_versioned_value(buf: &mut &[u8]) -> Result<VersionedValue> {
    const RECORD: &str = "VersionedValue";
    let mut version: Option<i64> = None;
    let mut payload: Option<Vec<u8>> = None;
    let mut originator_id: Option<String> = None;
    let mut ttl_ms: Option<i64> = None;
    let mut ttl_version: i64 = 0;
    let mut content_hash: Option<i64> = None;

    loop {
        match read_u8(buf)? {
            END_TAG => break,
            1 => version = Some(read_i64(buf)?),
            2 => payload = Some(read_bytes_u32(buf)?),
            3 => originator_id = Some(read_string_u16(buf, "originator_id")?),
            4 => ttl_ms = Some(read_i64(buf)?),
            5 => ttl_version = read_i64(buf)?,
            6 => content_hash = Some(read_i64(buf)?),
            tag => return Err(ProtoError::UnknownFieldTag { record: RECORD, tag }),
        }
    }

    Ok(VersionedValue {
        version: version.ok_or(ProtoError::MissingField {
            record: RECORD,
            field: "version",
        })?,
        payload,
        originator_id: originator_id.ok_or(ProtoError::MissingField {
            record: RECORD,
            field: "originator_id",
        })?,
        ttl_ms: ttl_ms.ok_or(ProtoError::MissingField {
            record: RECORD,
            field: "ttl_ms",
        })?,
        ttl_version,
        content_hash,
    })
}

fn write_key_vals(out: &mut BytesMut, key_vals: &BTreeMap<String, VersionedValue>) {
    out.put_u32_le(key_vals.len() as u32);
    for (key, value) in key_vals {
        write_string_u16(out, key);
        encode_versioned_value(out, value);
    }
}

fn read_key_vals(buf: &mut &[u8]) -> Result<BTreeMap<String, VersionedValue>> {
    let n = read_u32(buf)? as usize;
    let mut map = BTreeMap::new();
    for _ in 0..n {
        let key = read_string_u16(buf, "key")?;
        let value = decode_versioned_value(buf)?;
        map.insert(key, value);
    }
    Ok(map)
}

// ── PeerSpec ─────────────────────────────────────────────────────────────

fn encode_peer_spec(out: &mut BytesMut, spec: &PeerSpec) {
    out.put_u8(1);
    write_string_u16(out, &spec.peer_addr);
    out.put_u8(4);
    out.put_i32_le(spec.ctrl_port);
    out.put_u8(5);
    out.put_u8(spec.state as u8);
    out.put_u8(END_TAG);
}

fn decode_peer_spec(buf: &mut &[u8]) -> Result<PeerSpec> {
    const RECORD: &str = "PeerSpec";
    let mut peer_addr: Option<String> = None;
    let mut ctrl_port: Option<i32> = None;
    let mut state = PeerState::Idle;

    loop {
        match read_u8(buf)? {
            END_TAG => break,
            1 => peer_addr = Some(read_string_u16(buf, "peer_addr")?),
            4 => ctrl_port = Some(read_i32(buf)?),
            5 => {
                let raw = read_u8(buf)?;
                state = PeerState::from_u8(raw)
                    .ok_or_else(|| ProtoError::Corruption(format!("bad peer state: {raw}")))?;
            }
            tag => return Err(ProtoError::UnknownFieldTag { record: RECORD, tag }),
        }
    }

    Ok(PeerSpec {
        peer_addr: peer_addr.ok_or(ProtoError::MissingField {
            record: RECORD,
            field: "peer_addr",
        })?,
        ctrl_port: ctrl_port.ok_or(ProtoError::MissingField {
            record: RECORD,
            field: "ctrl_port",
        })?,
        state,
    })
}

fn write_peer_map(out: &mut BytesMut, peers: &BTreeMap<String, PeerSpec>) {
    out.put_u32_le(peers.len() as u32);
    for (name, spec) in peers {
        write_string_u16(out, name);
        encode_peer_spec(out, spec);
    }
}

fn read_peer_map(buf: &mut &[u8]) -> Result<BTreeMap<String, PeerSpec>> {
    let n = read_u32(buf)? as usize;
    let mut map = BTreeMap::new();
    for _ in 0..n {
        let name = read_string_u16(buf, "peer_name")?;
        map.insert(name, decode_peer_spec(buf)?);
    }
    Ok(map)
}

// ── KeySetParams ─────────────────────────────────────────────────────────

fn encode_key_set_params(out: &mut BytesMut, params: &KeySetParams) {
    out.put_u8(2);
    write_key_vals(out, &params.key_vals);
    if let Some(path) = &params.node_path {
        out.put_u8(5);
        write_string_list(out, path);
    }
    if let Some(ts) = params.timestamp_ms {
        out.put_u8(7);
        out.put_i64_le(ts);
    }
    if let Some(sender) = &params.sender_id {
        out.put_u8(8);
        write_string_u16(out, sender);
    }
    out.put_u8(END_TAG);
}

fn decode_key_set_params(buf: &mut &[u8]) -> Result<KeySetParams> {
    const RECORD: &str = "KeySetParams";
    let mut params = KeySetParams::default();
    loop {
        match read_u8(buf)? {
            END_TAG => break,
            2 => params.key_vals = read_key_vals(buf)?,
            5 => params.node_path = Some(read_string_list(buf, "node_path")?),
            7 => params.timestamp_ms = Some(read_i64(buf)?),
            8 => params.sender_id = Some(read_string_u16(buf, "sender_id")?),
            tag => return Err(ProtoError::UnknownFieldTag { record: RECORD, tag }),
        }
    }
    Ok(params)
}

// ── KeyDumpParams ────────────────────────────────────────────────────────

fn encode_key_dump_params(out: &mut BytesMut, params: &KeyDumpParams) {
    if !params.prefix.is_empty() {
        out.put_u8(1);
        write_string_u16(out, &params.prefix);
    }
    if let Some(hashes) = &params.key_val_hashes {
        out.put_u8(2);
        write_key_vals(out, hashes);
    }
    if !params.originator_ids.is_empty() {
        out.put_u8(3);
        write_string_set(out, &params.originator_ids);
    }
    if let Some(oper) = params.oper {
        out.put_u8(4);
        out.put_u8(oper as u8);
    }
    if let Some(keys) = &params.keys {
        out.put_u8(5);
        write_string_list(out, keys);
    }
    if !params.ignore_ttl {
        out.put_u8(6);
        out.put_u8(0);
    }
    if params.do_not_publish_value {
        out.put_u8(7);
        out.put_u8(1);
    }
    if let Some(sender) = &params.sender_id {
        out.put_u8(8);
        write_string_u16(out, sender);
    }
    out.put_u8(END_TAG);
}

fn decode_key_dump_params(buf: &mut &[u8]) -> Result<KeyDumpParams> {
    const RECORD: &str = "KeyDumpParams";
    let mut params = KeyDumpParams::default();
    loop {
        match read_u8(buf)? {
            END_TAG => break,
            1 => params.prefix = read_string_u16(buf, "prefix")?,
            2 => params.key_val_hashes = Some(read_key_vals(buf)?),
            3 => params.originator_ids = read_string_set(buf, "originator_ids")?,
            4 => {
                let raw = read_u8(buf)?;
                params.oper = Some(
                    FilterOperator::from_u8(raw).ok_or_else(|| {
                        ProtoError::Corruption(format!("bad filter operator: {raw}"))
                    })?,
                );
            }
            5 => params.keys = Some(read_string_list(buf, "keys")?),
            6 => params.ignore_ttl = read_bool(buf)?,
            7 => params.do_not_publish_value = read_bool(buf)?,
            8 => params.sender_id = Some(read_string_u16(buf, "sender_id")?),
            tag => return Err(ProtoError::UnknownFieldTag { record: RECORD, tag }),
        }
    }
    Ok(params)
}

// ── Publication ──────────────────────────────────────────────────────────

fn encode_publication(out: &mut BytesMut, publication: &Publication) {
    out.put_u8(2);
    write_key_vals(out, &publication.key_vals);
    if !publication.expired_keys.is_empty() {
        out.put_u8(3);
        write_string_list(out, &publication.expired_keys);
    }
    if let Some(path) = &publication.node_path {
        out.put_u8(4);
        write_string_list(out, path);
    }
    if let Some(keys) = &publication.tobe_updated_keys {
        out.put_u8(5);
        write_string_list(out, keys);
    }
    out.put_u8(7);
    write_string_u16(out, &publication.area);
    if let Some(ts) = publication.timestamp_ms {
        out.put_u8(8);
        out.put_i64_le(ts);
    }
    out.put_u8(END_TAG);
}

fn decode_publication(buf: &mut &[u8]) -> Result<Publication> {
    const RECORD: &str = "Publication";
    let mut publication = Publication::new("");
    loop {
        match read_u8(buf)? {
            END_TAG => break,
            2 => publication.key_vals = read_key_vals(buf)?,
            3 => publication.expired_keys = read_string_list(buf, "expired_keys")?,
            4 => publication.node_path = Some(read_string_list(buf, "node_path")?),
            5 => publication.tobe_updated_keys = Some(read_string_list(buf, "tobe_updated_keys")?),
            7 => publication.area = read_string_u16(buf, "area")?,
            8 => publication.timestamp_ms = Some(read_i64(buf)?),
            tag => return Err(ProtoError::UnknownFieldTag { record: RECORD, tag }),
        }
    }
    Ok(publication)
}

// ── AreaSummary ──────────────────────────────────────────────────────────

fn encode_area_summary(out: &mut BytesMut, summary: &AreaSummary) {
    out.put_u8(1);
    write_string_u16(out, &summary.area);
    out.put_u8(2);
    write_peer_map(out, &summary.peers);
    out.put_u8(3);
    out.put_i64_le(summary.key_count);
    out.put_u8(4);
    out.put_i64_le(summary.total_bytes);
    out.put_u8(END_TAG);
}

fn decode_area_summary(buf: &mut &[u8]) -> Result<AreaSummary> {
    const RECORD: &str = "AreaSummary";
    let mut area = String::new();
    let mut peers = BTreeMap::new();
    let mut key_count = 0;
    let mut total_bytes = 0;
    loop {
        match read_u8(buf)? {
            END_TAG => break,
            1 => area = read_string_u16(buf, "area")?,
            2 => peers = read_peer_map(buf)?,
            3 => key_count = read_i64(buf)?,
            4 => total_bytes = read_i64(buf)?,
            tag => return Err(ProtoError::UnknownFieldTag { record: RECORD, tag }),
        }
    }
    Ok(AreaSummary {
        area,
        peers,
        key_count,
        total_bytes,
    })
}

// ── Message encode ───────────────────────────────────────────────────────

fn encode_payload(msg: &Message) -> BytesMut {
    let mut out = BytesMut::with_capacity(256);
    match msg {
        Message::GetKeyVals { area, keys } => {
            write_string_u16(&mut out, area);
            write_string_list(&mut out, keys);
        }
        Message::DumpKeyVals { area, params } | Message::DumpHashes { area, params } => {
            write_string_u16(&mut out, area);
            encode_key_dump_params(&mut out, params);
        }
        Message::SetKeyVals { area, params } => {
            write_string_u16(&mut out, area);
            encode_key_set_params(&mut out, params);
        }
        Message::GetPeers { area } => {
            write_string_u16(&mut out, area);
        }
        Message::AddPeers { area, peers } => {
            write_string_u16(&mut out, area);
            write_peer_map(&mut out, peers);
        }
        Message::DelPeers { area, peers } => {
            write_string_u16(&mut out, area);
            write_string_list(&mut out, peers);
        }
        Message::AreaSummary { areas } => {
            write_string_list(&mut out, areas);
        }
        Message::Status | Message::Ack => {}
        Message::PublicationReply(publication) => {
            encode_publication(&mut out, publication);
        }
        Message::PeersReply(peers) => {
            write_peer_map(&mut out, peers);
        }
        Message::SummaryReply(summaries) => {
            out.put_u32_le(summaries.len() as u32);
            for summary in summaries {
                encode_area_summary(&mut out, summary);
            }
        }
        Message::ErrorReply { message } => {
            write_string_u16(&mut out, message);
        }
    }
    out
}

/// Encode a `Message` into a framed byte buffer (header + payload).
pub fn encode_message(msg: &Message) -> BytesMut {
    let payload = encode_payload(msg);
    let mut frame = BytesMut::with_capacity(FRAME_HEADER_SIZE + payload.len());
    frame.put_u8(msg.msg_type());
    frame.put_u32_le(payload.len() as u32);
    frame.put_slice(&payload);
    frame
}

/// Decode a `Message` from a framed byte buffer. The input must contain the
/// full frame. Returns `(message, bytes_consumed)`.
pub fn decode_message(input: &[u8]) -> Result<(Message, usize)> {
    if input.len() < FRAME_HEADER_SIZE {
        return Err(ProtoError::Truncated {
            expected: FRAME_HEADER_SIZE,
            actual: input.len(),
        });
    }

    let msg_type = input[0];
    let length = u32::from_le_bytes([input[1], input[2], input[3], input[4]]);
    if length > MAX_FRAME_SIZE {
        return Err(ProtoError::FrameTooLarge {
            size: length,
            max: MAX_FRAME_SIZE,
        });
    }

    let total = FRAME_HEADER_SIZE + length as usize;
    if input.len() < total {
        return Err(ProtoError::Truncated {
            expected: total,
            actual: input.len(),
        });
    }

    let payload = &input[FRAME_HEADER_SIZE..total];
    let mut buf: &[u8] = payload;

    let msg = match msg_type {
        MSG_GET_KV => {
            let area = read_string_u16(&mut buf, "area")?;
            let keys = read_string_list(&mut buf, "keys")?;
            Message::GetKeyVals { area, keys }
        }
        MSG_DUMP_KV => {
            let area = read_string_u16(&mut buf, "area")?;
            let params = decode_key_dump_params(&mut buf)?;
            Message::DumpKeyVals { area, params }
        }
        MSG_DUMP_HASHES => {
            let area = read_string_u16(&mut buf, "area")?;
            let params = decode_key_dump_params(&mut buf)?;
            Message::DumpHashes { area, params }
        }
        MSG_SET_KV => {
            let area = read_string_u16(&mut buf, "area")?;
            let params = decode_key_set_params(&mut buf)?;
            Message::SetKeyVals { area, params }
        }
        MSG_GET_PEERS => {
            let area = read_string_u16(&mut buf, "area")?;
            Message::GetPeers { area }
        }
        MSG_ADD_PEERS => {
            let area = read_string_u16(&mut buf, "area")?;
            let peers = read_peer_map(&mut buf)?;
            Message::AddPeers { area, peers }
        }
        MSG_DEL_PEERS => {
            let area = read_string_u16(&mut buf, "area")?;
            let peers = read_string_list(&mut buf, "peers")?;
            Message::DelPeers { area, peers }
        }
        MSG_AREA_SUMMARY => {
            let areas = read_string_list(&mut buf, "areas")?;
            Message::AreaSummary { areas }
        }
        MSG_STATUS => Message::Status,
        MSG_PUBLICATION_REPLY => Message::PublicationReply(decode_publication(&mut buf)?),
        MSG_PEERS_REPLY => Message::PeersReply(read_peer_map(&mut buf)?),
        MSG_SUMMARY_REPLY => {
            let n = read_u32(&mut buf)? as usize;
            let mut summaries = Vec::with_capacity(n.min(1024));
            for _ in 0..n {
                summaries.push(decode_area_summary(&mut buf)?);
            }
            Message::SummaryReply(summaries)
        }
        MSG_ACK => Message::Ack,
        MSG_ERROR_REPLY => Message::ErrorReply {
            message: read_string_u16(&mut buf, "error_message")?,
        },
        other => return Err(ProtoError::UnknownMessageType(other)),
    };

    Ok((msg, total))
}

// ── Tests ────────────────────────────────────────────────────────────────
