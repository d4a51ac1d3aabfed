//! Centralized peer discovery (§6.1 registry carrier), grounded in
//! madara's `UdpRegistryServer.cpp`/`UdpRegistryClient.cpp`: clients send
//! periodic heartbeats to a well-known server; the server replies with the
//! full membership list minus the sender.
//!
//! Design Note §9 Open Question ("registry-restart behavior"): resolved
//! here as "clients are the source of truth on every heartbeat" — a
//! restarted server starts with an empty table and rebuilds it within one
//! heartbeat interval per client, rather than persisting membership
//! across restarts. A client that never hears back keeps using its last
//! known peer list.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Mutex;
use std::time::{Duration, Instant};

const HEARTBEAT_TAG: &[u8; 4] = b"KRGH";
const PEER_LIST_TAG: &[u8; 4] = b"KRGP";
const MEMBERSHIP_TTL: Duration = Duration::from_secs(30);

pub struct RegistryServer {
    peers: Mutex<HashMap<String, (SocketAddr, Instant)>>,
}

impl RegistryServer {
    pub fn new() -> Self {
        Self { peers: Mutex::new(HashMap::new()) }
    }

    /// Handles one inbound packet addressed to the registry server.
    /// Returns the peer-list reply to send back to `from`, if the packet
    /// was a recognized heartbeat.
    pub fn handle_packet(&self, from: SocketAddr, payload: &[u8]) -> Option<Vec<u8>> {
        if payload.len() < 8 || &payload[0..4] != HEARTBEAT_TAG {
            return None;
        }
        let id_len = u32::from_be_bytes(payload[4..8].try_into().ok()?) as usize;
        let id = String::from_utf8_lossy(payload.get(8..8 + id_len)?).into_owned();

        let mut peers = self.peers.lock().unwrap();
        let now = Instant::now();
        peers.insert(id.clone(), (from, now));
        peers.retain(|_, (_, seen)| now.duration_since(*seen) < MEMBERSHIP_TTL);

        Some(encode_peer_list(peers.iter().filter(|(k, _)| **k != id).map(|(k, (addr, _))| (k.clone(), *addr))))
    }

    pub fn snapshot(&self) -> Vec<SocketAddr> {
        self.peers.lock().unwrap().values().map(|(addr, _)| *addr).collect()
    }
}

impl Default for RegistryServer {
    fn default() -> Self {
        Self::new()
    }
}

pub struct RegistryClient {
    server_addr: SocketAddr,
    self_id: String,
    known: Mutex<HashMap<String, SocketAddr>>,
}

impl RegistryClient {
    pub fn new(server_addr: SocketAddr, self_id: String) -> Self {
        Self { server_addr, self_id, known: Mutex::new(HashMap::new()) }
    }

    pub fn server_addr(&self) -> SocketAddr {
        self.server_addr
    }

    pub fn announce_packet(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(HEARTBEAT_TAG);
        out.extend_from_slice(&(self.self_id.len() as u32).to_be_bytes());
        out.extend_from_slice(self.self_id.as_bytes());
        out
    }

    pub fn handle_packet(&self, payload: &[u8]) {
        if let Some(entries) = decode_peer_list(payload) {
            let mut known = self.known.lock().unwrap();
            known.clear();
            known.extend(entries);
        }
    }

    pub fn known_peers(&self) -> Vec<SocketAddr> {
        self.known.lock().unwrap().values().copied().collect()
    }
}

fn encode_peer_list(entries: impl Iterator<Item = (String, SocketAddr)>) -> Vec<u8> {
    let entries: Vec<_> = entries.collect();
    let mut out = Vec::new();
    out.extend_from_slice(PEER_LIST_TAG);
    out.extend_from_slice(&(entries.len() as u32).to_be_bytes());
    for (id, addr) in entries {
        out.extend_from_slice(&(id.len() as u32).to_be_bytes());
        out.extend_from_slice(id.as_bytes());
        let addr_str = addr.to_string();
        out.extend_from_slice(&(addr_str.len() as u32).to_be_bytes());
        out.extend_from_slice(addr_str.as_bytes());
    }
    out
}

fn decode_peer_list(buf: &[u8]) -> Option<Vec<(String, SocketAddr)>> {
    if buf.len() < 8 || &buf[0..4] != PEER_LIST_TAG {
        return None;
    }
    let count = u32::from_be_bytes(buf[4..8].try_into().ok()?);
    let mut pos = 8;
    let mut out = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let id_len = u32::from_be_bytes(buf.get(pos..pos + 4)?.try_into().ok()?) as usize;
        pos += 4;
        let id = String::from_utf8_lossy(buf.get(pos..pos + id_len)?).into_owned();
        pos += id_len;
        let addr_len = u32::from_be_bytes(buf.get(pos..pos + 4)?.try_into().ok()?) as usize;
        pos += 4;
        let addr_str = String::from_utf8_lossy(buf.get(pos..pos + addr_len)?).into_owned();
        pos += addr_len;
        out.push((id, addr_str.parse().ok()?));
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_replies_with_membership_minus_sender() {
        let server = RegistryServer::new();
        let a: SocketAddr = "127.0.0.1:4001".parse().unwrap();
        let b: SocketAddr = "127.0.0.1:4002".parse().unwrap();

        let client_a = RegistryClient::new("127.0.0.1:4000".parse().unwrap(), "a".to_string());
        let client_b = RegistryClient::new("127.0.0.1:4000".parse().unwrap(), "b".to_string());

        let reply_a = server.handle_packet(a, &client_a.announce_packet()).unwrap();
        assert!(decode_peer_list(&reply_a).unwrap().is_empty());

        let reply_b = server.handle_packet(b, &client_b.announce_packet()).unwrap();
        let peers_seen_by_b = decode_peer_list(&reply_b).unwrap();
        assert_eq!(peers_seen_by_b, vec![("a".to_string(), a)]);

        assert_eq!(server.snapshot().len(), 2);
    }

    #[test]
    fn client_replaces_known_peers_on_each_reply() {
        let client = RegistryClient::new("127.0.0.1:4000".parse().unwrap(), "self".to_string());
        let reply = encode_peer_list(vec![("peer-1".to_string(), "127.0.0.1:5001".parse().unwrap())].into_iter());
        client.handle_packet(&reply);
        assert_eq!(client.known_peers(), vec!["127.0.0.1:5001".parse::<SocketAddr>().unwrap()]);
    }
}
