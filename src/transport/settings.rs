//! Transport configuration (§4.6). A plain `serde`-derived struct loaded
//! the way the rest of the crate's config is loaded (§6.4), with
//! `$(VAR)`/`${VAR}` environment expansion applied to string fields after
//! parsing.

use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CarrierType {
    None,
    Multicast,
    Broadcast,
    Udp,
    RegistryServer,
    RegistryClient,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Reliability {
    BestEffort,
    Reliable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PacketDropType {
    Probabilistic,
    Deterministic,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportSettings {
    pub carrier_type: CarrierType,
    /// Endpoint addresses in carrier-specific form (§6.1); for `Udp`,
    /// index 0 is the local bind.
    pub hosts: Vec<String>,
    /// Integer slot in the sending process's own fleet view (§4.6 `id`).
    pub id: u32,
    /// String identity carried in the full message header (§3.4
    /// "originator id"); ambient field the abstract settings list left
    /// implicit.
    pub originator_id: String,
    pub domain: String,
    pub queue_length: usize,
    pub read_threads: usize,
    pub read_thread_hertz: f64,
    pub max_fragment_size: usize,
    pub slack_time: Duration,
    pub resend_attempts: u32,
    pub reliability: Reliability,
    pub send_reduced_message_header: bool,
    pub rebroadcast_ttl: u8,
    pub participant_rebroadcast_ttl: u8,
    /// Bytes/sec; `-1` means unlimited.
    pub max_send_bandwidth: i64,
    pub max_total_bandwidth: i64,
    /// Records older than `now - deadline` on receive are dropped.
    pub deadline_secs: f64,
    pub packet_drop_rate: f64,
    pub packet_drop_type: PacketDropType,
    pub packet_drop_burst: u32,
    pub trusted_peers: Vec<String>,
    pub banned_peers: Vec<String>,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            carrier_type: CarrierType::Udp,
            hosts: vec!["127.0.0.1:30000".to_string()],
            id: 0,
            originator_id: "node-0".to_string(),
            domain: "default".to_string(),
            queue_length: 1 << 20,
            read_threads: 1,
            read_thread_hertz: 0.0,
            max_fragment_size: 60_000,
            slack_time: Duration::from_millis(0),
            resend_attempts: 3,
            reliability: Reliability::BestEffort,
            send_reduced_message_header: false,
            rebroadcast_ttl: 0,
            participant_rebroadcast_ttl: 8,
            max_send_bandwidth: -1,
            max_total_bandwidth: -1,
            deadline_secs: -1.0,
            packet_drop_rate: 0.0,
            packet_drop_type: PacketDropType::Probabilistic,
            packet_drop_burst: 1,
            trusted_peers: Vec::new(),
            banned_peers: Vec::new(),
        }
    }
}

/// Expands `$(VAR)` and `${VAR}` references in `value` against the
/// process environment (§6.4), leaving unresolvable references untouched.
pub fn expand_env(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let chars: Vec<char> = value.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        let (open, close) = (chars.get(i), chars.get(i + 1));
        if open == Some(&'$') && matches!(close, Some('(') | Some('{')) {
            let closing = if close == Some(&'(') { ')' } else { '}' };
            if let Some(end_offset) = chars[i + 2..].iter().position(|c| *c == closing) {
                let name: String = chars[i + 2..i + 2 + end_offset].iter().collect();
                if let Ok(val) = std::env::var(&name) {
                    out.push_str(&val);
                    i += 2 + end_offset + 1;
                    continue;
                }
            }
        }
        out.push(chars[i]);
        i += 1;
    }
    out
}
