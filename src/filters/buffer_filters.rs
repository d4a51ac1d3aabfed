//! The buffer filter chain (§4.4/§3.4): an ordered transform over
//! serialized bytes, each stage prepending a 4-byte id + 32-bit version +
//! 64-bit post-filter size header. Decode walks the chain in reverse and
//! fails closed if a header's id isn't registered.
//!
//! Two concrete filters are supplied, grounded in the madara buffer
//! filters (`LZ4BufferFilter.cpp`, `AESBufferFilter.cpp`) but using the
//! crates an idiomatic Rust service reaches for: `flate2` for
//! compression, `aes-gcm` for authenticated encryption.

use std::collections::HashMap;
use std::sync::Arc;

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use flate2::read::{DeflateDecoder, DeflateEncoder};
use flate2::Compression;
use std::io::Read;

use crate::error::{KnowledgeError, Result};

pub trait BufferFilter: Send + Sync {
    fn id(&self) -> [u8; 4];
    fn version(&self) -> u32;
    fn encode(&self, data: &[u8]) -> Result<Vec<u8>>;
    fn decode(&self, data: &[u8]) -> Result<Vec<u8>>;
}

/// Receive-side lookup table: a decoder only trusts a header whose id is
/// registered here, closing the decode path against filters it doesn't
/// recognize (§7 "filter-buffer mismatch").
#[derive(Default)]
pub struct BufferFilterRegistry {
    filters: HashMap<[u8; 4], Arc<dyn BufferFilter>>,
}

impl BufferFilterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, filter: Arc<dyn BufferFilter>) {
        self.filters.insert(filter.id(), filter);
    }

    pub fn get(&self, id: &[u8; 4]) -> Option<&Arc<dyn BufferFilter>> {
        self.filters.get(id)
    }
}

const HEADER_LEN: usize = 4 + 4 + 8;

/// The encode-ordered chain. Encoding applies `filters[0], filters[1], …`
/// in order; decoding applies the reverse order, consulting `registry` to
/// validate each header's id before trusting its payload.
pub struct BufferFilterChain {
    filters: Vec<Arc<dyn BufferFilter>>,
    registry: BufferFilterRegistry,
}

impl BufferFilterChain {
    pub fn new() -> Self {
        Self { filters: Vec::new(), registry: BufferFilterRegistry::new() }
    }

    pub fn push(&mut self, filter: Arc<dyn BufferFilter>) {
        self.registry.register(filter.clone());
        self.filters.push(filter);
    }

    pub fn encode(&self, data: &[u8], queue_length: usize) -> Result<Vec<u8>> {
        let mut buf = data.to_vec();
        for filter in &self.filters {
            let transformed = filter.encode(&buf)?;
            if transformed.len() + HEADER_LEN > queue_length {
                return Err(KnowledgeError::Memory { size: transformed.len() + HEADER_LEN, limit: queue_length });
            }
            let mut framed = Vec::with_capacity(HEADER_LEN + transformed.len());
            framed.extend_from_slice(&filter.id());
            framed.extend_from_slice(&filter.version().to_be_bytes());
            framed.extend_from_slice(&(transformed.len() as u64).to_be_bytes());
            framed.extend_from_slice(&transformed);
            buf = framed;
        }
        Ok(buf)
    }

    pub fn decode(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut buf = data.to_vec();
        for filter in self.filters.iter().rev() {
            if buf.len() < HEADER_LEN {
                return Err(KnowledgeError::Parse("buffer filter header truncated".into()));
            }
            let mut id = [0u8; 4];
            id.copy_from_slice(&buf[0..4]);
            let size = u64::from_be_bytes(buf[8..16].try_into().unwrap()) as usize;

            let registered = self.registry.get(&id).ok_or(KnowledgeError::FilterMismatch(id))?;
            if registered.id() != filter.id() {
                return Err(KnowledgeError::FilterMismatch(id));
            }
            if buf.len() < HEADER_LEN + size {
                return Err(KnowledgeError::Parse("buffer filter payload truncated".into()));
            }
            let payload = &buf[HEADER_LEN..HEADER_LEN + size];
            buf = filter.decode(payload)?;
        }
        Ok(buf)
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }
}

impl Default for BufferFilterChain {
    fn default() -> Self {
        Self::new()
    }
}

/// DEFLATE compression, keyed by a fixed filter id so a decode header can
/// be validated against it.
pub struct DeflateBufferFilter {
    level: Compression,
}

impl DeflateBufferFilter {
    pub fn new(level: u32) -> Self {
        Self { level: Compression::new(level) }
    }
}

impl Default for DeflateBufferFilter {
    fn default() -> Self {
        Self::new(6)
    }
}

impl BufferFilter for DeflateBufferFilter {
    fn id(&self) -> [u8; 4] {
        *b"DFLT"
    }

    fn version(&self) -> u32 {
        1
    }

    fn encode(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut encoder = DeflateEncoder::new(data, self.level);
        let mut out = Vec::new();
        encoder.read_to_end(&mut out).map_err(KnowledgeError::Io)?;
        Ok(out)
    }

    fn decode(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut decoder = DeflateDecoder::new(data);
        let mut out = Vec::new();
        decoder.read_to_end(&mut out).map_err(KnowledgeError::Io)?;
        Ok(out)
    }
}

/// AES-256-GCM authenticated encryption, keyed from a configured 32-byte
/// secret. Each encode draws a fresh random 96-bit nonce and prepends it
/// to the ciphertext.
pub struct AesGcmBufferFilter {
    cipher: Aes256Gcm,
}

impl AesGcmBufferFilter {
    pub fn new(key: &[u8; 32]) -> Self {
        Self { cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key)) }
    }
}

impl BufferFilter for AesGcmBufferFilter {
    fn id(&self) -> [u8; 4] {
        *b"AES1"
    }

    fn version(&self) -> u32 {
        1
    }

    fn encode(&self, data: &[u8]) -> Result<Vec<u8>> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, data)
            .map_err(|e| KnowledgeError::Transport(format!("AES-GCM encrypt failed: {e}")))?;
        let mut out = Vec::with_capacity(nonce.len() + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    fn decode(&self, data: &[u8]) -> Result<Vec<u8>> {
        if data.len() < 12 {
            return Err(KnowledgeError::Parse("AES-GCM payload missing nonce".into()));
        }
        let (nonce_bytes, ciphertext) = data.split_at(12);
        let nonce = Nonce::from_slice(nonce_bytes);
        self.cipher
            .decrypt(nonce, ciphertext)
            .map_err(|e| KnowledgeError::Transport(format!("AES-GCM decrypt failed: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deflate_round_trips() {
        let filter = DeflateBufferFilter::default();
        let data = b"the quick brown fox jumps over the lazy dog".repeat(4);
        let encoded = filter.encode(&data).unwrap();
        let decoded = filter.decode(&encoded).unwrap();
        assert_eq!(decoded, data);
    }

    #[test]
    fn aes_gcm_round_trips() {
        let key = [7u8; 32];
        let filter = AesGcmBufferFilter::new(&key);
        let data = b"top secret knowledge payload";
        let encoded = filter.encode(data).unwrap();
        let decoded = filter.decode(&encoded).unwrap();
        assert_eq!(decoded, data);
    }

    #[test]
    fn chain_round_trips_through_both_filters() {
        let mut chain = BufferFilterChain::new();
        chain.push(Arc::new(DeflateBufferFilter::default()));
        chain.push(Arc::new(AesGcmBufferFilter::new(&[3u8; 32])));

        let data = b"hello distributed knowledge base".repeat(8);
        let encoded = chain.encode(&data, 1 << 20).unwrap();
        let decoded = chain.decode(&encoded).unwrap();
        assert_eq!(decoded, data);
    }

    #[test]
    fn unregistered_filter_id_fails_closed() {
        let mut sender = BufferFilterChain::new();
        sender.push(Arc::new(DeflateBufferFilter::default()));
        let encoded = sender.encode(b"payload", 1 << 20).unwrap();

        let mut receiver = BufferFilterChain::new();
        receiver.push(Arc::new(AesGcmBufferFilter::new(&[1u8; 32])));
        assert!(receiver.decode(&encoded).is_err());
    }

    #[test]
    fn memory_cap_rejects_oversize_encode() {
        let mut chain = BufferFilterChain::new();
        chain.push(Arc::new(DeflateBufferFilter::new(0)));
        let data = vec![0xABu8; 4096];
        assert!(chain.encode(&data, 8).is_err());
    }
}
