//! Fragmentation and reassembly (§4.5) for messages that exceed
//! `max_fragment_size`. Reassembly-table eviction follows Design Note §9:
//! an explicit per-message TTL plus a total-memory cap, evicted oldest
//! first-arrival first, since the source left this unspecified.

use std::collections::HashMap;
use std::convert::TryInto;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use rand::Rng;

use crate::error::{KnowledgeError, Result};

const FRAGMENT_TAG: &[u8; 4] = b"KFRG";
const FRAGMENT_HEADER_VERSION: u8 = 1;
/// tag(4) + version(1) + message id(8) + total(4) + index(4)
const HEADER_LEN: usize = 4 + 1 + 8 + 4 + 4;

struct PartialMessage {
    total: u32,
    received: HashMap<u32, Vec<u8>>,
    bytes: usize,
    first_seen: Instant,
}

pub struct Fragmenter {
    max_fragment_size: usize,
    reassembly_ttl: Duration,
    reassembly_memory_cap: usize,
    table: Mutex<HashMap<(String, u64), PartialMessage>>,
}

impl Fragmenter {
    pub fn new(max_fragment_size: usize) -> Self {
        Self {
            max_fragment_size,
            reassembly_ttl: Duration::from_secs(30),
            reassembly_memory_cap: 64 * 1024 * 1024,
            table: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_reassembly_limits(mut self, ttl: Duration, memory_cap: usize) -> Self {
        self.reassembly_ttl = ttl;
        self.reassembly_memory_cap = memory_cap;
        self
    }

    pub fn needs_fragmentation(&self, payload_len: usize) -> bool {
        payload_len > self.max_fragment_size
    }

    /// Splits `payload` into framed `KFRG` fragments: `ceil(len / frag_size)`
    /// pieces sharing one random 64-bit message id.
    pub fn split(&self, payload: &[u8]) -> Vec<Vec<u8>> {
        let frag_size = self.max_fragment_size.max(1);
        let total = payload.len().div_ceil(frag_size).max(1) as u32;
        let message_id: u64 = rand::thread_rng().gen();

        (0..total)
            .map(|index| {
                let start = index as usize * frag_size;
                let end = (start + frag_size).min(payload.len());
                let slice = &payload[start..end];
                let mut framed = Vec::with_capacity(HEADER_LEN + slice.len());
                framed.extend_from_slice(FRAGMENT_TAG);
                framed.push(FRAGMENT_HEADER_VERSION);
                framed.extend_from_slice(&message_id.to_be_bytes());
                framed.extend_from_slice(&total.to_be_bytes());
                framed.extend_from_slice(&index.to_be_bytes());
                framed.extend_from_slice(slice);
                framed
            })
            .collect()
    }

    pub fn is_fragment(buf: &[u8]) -> bool {
        buf.len() >= 4 && &buf[0..4] == FRAGMENT_TAG
    }

    /// Accepts one fragment from `originator`. Returns the reassembled
    /// payload once every piece of its message has arrived.
    pub fn accept(&self, originator: &str, buf: &[u8]) -> Result<Option<Vec<u8>>> {
        if buf.len() < HEADER_LEN || &buf[0..4] != FRAGMENT_TAG {
            return Err(KnowledgeError::Parse("not a fragment header".into()));
        }
        let version = buf[4];
        if version != FRAGMENT_HEADER_VERSION {
            return Err(KnowledgeError::Parse(format!("unsupported fragment header version {version}")));
        }
        let message_id = u64::from_be_bytes(buf[5..13].try_into().unwrap());
        let total = u32::from_be_bytes(buf[13..17].try_into().unwrap());
        let index = u32::from_be_bytes(buf[17..21].try_into().unwrap());
        let slice = buf[HEADER_LEN..].to_vec();

        let mut table = self.table.lock().unwrap();
        self.evict_locked(&mut table);

        let key = (originator.to_string(), message_id);
        let entry = table.entry(key.clone()).or_insert_with(|| PartialMessage {
            total,
            received: HashMap::new(),
            bytes: 0,
            first_seen: Instant::now(),
        });
        if !entry.received.contains_key(&index) {
            entry.bytes += slice.len();
            entry.received.insert(index, slice);
        }

        if entry.received.len() as u32 >= entry.total {
            let entry = table.remove(&key).unwrap();
            let mut out = Vec::new();
            for i in 0..entry.total {
                match entry.received.get(&i) {
                    Some(piece) => out.extend_from_slice(piece),
                    None => return Err(KnowledgeError::Parse("reassembly completed with a gap".into())),
                }
            }
            Ok(Some(out))
        } else {
            Ok(None)
        }
    }

    fn evict_locked(&self, table: &mut HashMap<(String, u64), PartialMessage>) {
        let now = Instant::now();
        table.retain(|_, v| now.duration_since(v.first_seen) < self.reassembly_ttl);

        let mut total_bytes: usize = table.values().map(|v| v.bytes).sum();
        if total_bytes <= self.reassembly_memory_cap {
            return;
        }
        let mut keys_by_age: Vec<_> = table.iter().map(|(k, v)| (k.clone(), v.first_seen)).collect();
        keys_by_age.sort_by_key(|(_, first_seen)| *first_seen);
        for (key, _) in keys_by_age {
            if total_bytes <= self.reassembly_memory_cap {
                break;
            }
            if let Some(removed) = table.remove(&key) {
                total_bytes -= removed.bytes;
            }
        }
    }
}
