//! The message envelope (§3.4/§6.2): a fixed header followed by
//! `update_count` record payloads (§3.4 "Record payload", implemented by
//! [`crate::record::Record::read`]/[`write`](crate::record::Record::write)).
//! All multi-byte integers are network byte order; reduced headers omit
//! originator and domain, inferring them from the transport's own
//! identity instead.

use std::convert::TryInto;

use crate::error::{KnowledgeError, Result};
use crate::record::Record;

const FULL_TAG: &[u8; 4] = b"KaRL";
const REDUCED_TAG: &[u8; 4] = b"KaRl";

#[derive(Debug, Clone)]
pub struct MessageHeader {
    pub reduced: bool,
    pub originator: String,
    pub domain: String,
    pub clock: u64,
    pub ttl: u8,
    pub update_count: u32,
    pub timestamp_nanos: u64,
}

#[derive(Debug, Clone)]
pub struct Message {
    pub header: MessageHeader,
    pub records: Vec<(String, Record)>,
}

pub fn encode(message: &Message) -> Vec<u8> {
    let mut records_buf = Vec::new();
    for (name, record) in &message.records {
        record.write(name, &mut records_buf);
    }

    let mut out = Vec::new();
    out.extend_from_slice(if message.header.reduced { REDUCED_TAG } else { FULL_TAG });
    out.extend_from_slice(&(records_buf.len() as u64).to_be_bytes());
    if !message.header.reduced {
        out.extend_from_slice(&(message.header.originator.len() as u32).to_be_bytes());
        out.extend_from_slice(message.header.originator.as_bytes());
        out.extend_from_slice(&(message.header.domain.len() as u32).to_be_bytes());
        out.extend_from_slice(message.header.domain.as_bytes());
    }
    out.extend_from_slice(&message.header.clock.to_be_bytes());
    out.push(message.header.ttl);
    out.extend_from_slice(&message.header.update_count.to_be_bytes());
    out.extend_from_slice(&message.header.timestamp_nanos.to_be_bytes());
    out.extend_from_slice(&records_buf);
    out
}

/// `inferred_originator`/`inferred_domain` back-fill a reduced header,
/// which carries neither field on the wire (§3.4).
pub fn decode(buf: &[u8], inferred_originator: &str, inferred_domain: &str) -> Result<Message> {
    if buf.len() < 4 {
        return Err(KnowledgeError::Parse("message shorter than tag".into()));
    }
    let tag = &buf[0..4];
    let reduced = if tag == FULL_TAG {
        false
    } else if tag == REDUCED_TAG {
        true
    } else {
        return Err(KnowledgeError::Parse("unrecognized message tag".into()));
    };
    let mut pos = 4;

    let payload_size = read_u64(buf, pos)? as usize;
    pos += 8;

    let (originator, domain) = if reduced {
        (inferred_originator.to_string(), inferred_domain.to_string())
    } else {
        let orig_len = read_u32(buf, pos)? as usize;
        pos += 4;
        let originator = read_str(buf, pos, orig_len)?;
        pos += orig_len;

        let domain_len = read_u32(buf, pos)? as usize;
        pos += 4;
        let domain = read_str(buf, pos, domain_len)?;
        pos += domain_len;
        (originator, domain)
    };

    let clock = read_u64(buf, pos)?;
    pos += 8;
    let ttl = *buf.get(pos).ok_or_else(|| KnowledgeError::Parse("truncated ttl".into()))?;
    pos += 1;
    let update_count = read_u32(buf, pos)?;
    pos += 4;
    let timestamp_nanos = read_u64(buf, pos)?;
    pos += 8;

    if buf.len() < pos + payload_size {
        return Err(KnowledgeError::Parse("message payload shorter than declared size".into()));
    }

    let mut records = Vec::with_capacity(update_count as usize);
    for _ in 0..update_count {
        let (name, record, next) = Record::read(buf, pos)?;
        records.push((name, record));
        pos = next;
    }

    Ok(Message {
        header: MessageHeader { reduced, originator, domain, clock, ttl, update_count, timestamp_nanos },
        records,
    })
}

fn read_u32(buf: &[u8], pos: usize) -> Result<u32> {
    buf.get(pos..pos + 4)
        .and_then(|s| s.try_into().ok())
        .map(u32::from_be_bytes)
        .ok_or_else(|| KnowledgeError::Parse("truncated u32 in header".into()))
}

fn read_u64(buf: &[u8], pos: usize) -> Result<u64> {
    buf.get(pos..pos + 8)
        .and_then(|s| s.try_into().ok())
        .map(u64::from_be_bytes)
        .ok_or_else(|| KnowledgeError::Parse("truncated u64 in header".into()))
}

fn read_str(buf: &[u8], pos: usize, len: usize) -> Result<String> {
    buf.get(pos..pos + len)
        .map(|s| String::from_utf8_lossy(s).into_owned())
        .ok_or_else(|| KnowledgeError::Parse("truncated string in header".into()))
}
