//! The replicating transport pipeline (§4.6): filters, serialization,
//! buffer filters, and fragmentation on the way out; the reverse plus
//! store merge and optional rebroadcast on the way in.

pub mod carrier;
pub mod receive;
pub mod registry;
pub mod send;
pub mod settings;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use log::{debug, warn};
use tokio::time::{sleep, Duration};

use crate::error::Result;
use crate::filters::buffer_filters::BufferFilterChain;
use crate::filters::FilterChain;
use crate::fragment::Fragmenter;
use crate::record::Record;
use crate::store::Store;
use crate::wire::{self, Message, MessageHeader};

use carrier::Carrier;
use send::{BandwidthMonitor, DropPolicy};
use settings::TransportSettings;

/// Owns one carrier and drives both the send path (`send_modifieds`) and
/// a background receive loop (`spawn_receive_loop`) against a shared
/// store.
pub struct Transport {
    settings: TransportSettings,
    carrier: Carrier,
    store: Arc<Store>,
    send_filters: FilterChain,
    receive_filters: FilterChain,
    rebroadcast_filters: FilterChain,
    buffer_filters: BufferFilterChain,
    fragmenter: Fragmenter,
    send_bandwidth: BandwidthMonitor,
    total_bandwidth: BandwidthMonitor,
    drop_policy: DropPolicy,
}

/// The filter chains a transport is wired up with; grouped so
/// construction doesn't take five positional arguments.
#[derive(Default)]
pub struct TransportFilters {
    pub send: FilterChain,
    pub receive: FilterChain,
    pub rebroadcast: FilterChain,
    pub buffer: BufferFilterChain,
}

impl Transport {
    pub async fn new(settings: TransportSettings, store: Arc<Store>, filters: TransportFilters) -> Result<Self> {
        let carrier = Carrier::bind(&settings).await?;
        let drop_policy = DropPolicy::new(settings.packet_drop_rate, settings.packet_drop_type, settings.packet_drop_burst);
        let fragmenter = Fragmenter::new(settings.max_fragment_size);
        Ok(Self {
            settings,
            carrier,
            store,
            send_filters: filters.send,
            receive_filters: filters.receive,
            rebroadcast_filters: filters.rebroadcast,
            buffer_filters: filters.buffer,
            fragmenter,
            send_bandwidth: BandwidthMonitor::new(),
            total_bandwidth: BandwidthMonitor::new(),
            drop_policy,
        })
    }

    /// Builds and transmits one message carrying `records`, applying send
    /// filters, the buffer filter chain, and fragmentation as needed
    /// (§4.6). Retries up to `resend_attempts` times on a transient send
    /// failure.
    pub async fn send_modifieds(&self, records: HashMap<String, Record>) -> Result<()> {
        let filtered = self.send_filters.apply(records);
        if filtered.is_empty() {
            return Ok(());
        }

        let header = MessageHeader {
            reduced: self.settings.send_reduced_message_header,
            originator: self.settings.originator_id.clone(),
            domain: self.settings.domain.clone(),
            clock: self.store.current_clock().await,
            ttl: self.settings.rebroadcast_ttl,
            update_count: filtered.len() as u32,
            timestamp_nanos: now_nanos(),
        };
        let message = Message { header, records: filtered.into_iter().collect() };
        let wire_bytes = wire::encode(&message);
        let encoded = if self.buffer_filters.is_empty() {
            wire_bytes
        } else {
            self.buffer_filters.encode(&wire_bytes, self.settings.queue_length)?
        };

        let frames: Vec<Vec<u8>> = if self.fragmenter.needs_fragmentation(encoded.len()) {
            self.fragmenter.split(&encoded)
        } else {
            vec![encoded]
        };

        for frame in frames {
            self.send_frame(&frame).await?;
        }
        Ok(())
    }

    async fn send_frame(&self, frame: &[u8]) -> Result<()> {
        if self.drop_policy.should_drop() {
            debug!("synthetic packet drop engaged, frame not sent");
            return Ok(());
        }
        if self.send_bandwidth.would_exceed(self.settings.max_send_bandwidth, frame.len())
            || self.total_bandwidth.would_exceed(self.settings.max_total_bandwidth, frame.len())
        {
            warn!("bandwidth cap reached, dropping frame of {} bytes", frame.len());
            return Ok(());
        }

        let mut attempts = 0;
        loop {
            match self.carrier.send_to_all(frame).await {
                Ok(sent) => {
                    self.send_bandwidth.record(sent);
                    self.total_bandwidth.record(sent);
                    return Ok(());
                }
                Err(e) if attempts < self.settings.resend_attempts => {
                    attempts += 1;
                    warn!("send attempt {attempts} failed: {e}, retrying");
                    sleep(Duration::from_millis(20)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Receives and applies one inbound frame, rebroadcasting it if the
    /// ttl budget allows. Returns `Ok(None)` for a frame still awaiting
    /// the rest of its fragments.
    pub async fn receive_once(&self) -> Result<Option<Message>> {
        let mut buf = vec![0u8; 65536];
        let (len, from) = self.carrier.recv_from(&mut buf).await?;
        buf.truncate(len);

        let payload = if Fragmenter::is_fragment(&buf) {
            match self.fragmenter.accept(&from.to_string(), &buf)? {
                Some(reassembled) => reassembled,
                None => return Ok(None),
            }
        } else {
            buf
        };

        let decoded = if self.buffer_filters.is_empty() {
            payload
        } else {
            self.buffer_filters.decode(&payload)?
        };

        let message = wire::decode(&decoded, &from.to_string(), &self.settings.domain)?;
        if message.header.domain != self.settings.domain {
            return Ok(None);
        }
        if !receive::accept(&self.settings, &message.header.originator, message.header.timestamp_nanos, now_nanos()) {
            return Ok(None);
        }

        let records: HashMap<String, Record> = message.records.iter().cloned().collect();
        let accepted = self.receive_filters.apply(records);
        for (name, record) in &accepted {
            self.store.apply(name, record).await;
        }

        if let Some(ttl) = receive::next_rebroadcast_ttl(message.header.ttl) {
            if ttl > 0 || self.settings.participant_rebroadcast_ttl > 0 {
                let rebroadcast_set = self.rebroadcast_filters.apply(accepted.clone());
                if !rebroadcast_set.is_empty() {
                    let header = MessageHeader { ttl, ..message.header.clone() };
                    let rebroadcast = Message { header, records: rebroadcast_set.into_iter().collect() };
                    let _ = self.send_raw(&rebroadcast).await;
                }
            }
        }

        Ok(Some(message))
    }

    async fn send_raw(&self, message: &Message) -> Result<()> {
        let wire_bytes = wire::encode(message);
        let encoded = if self.buffer_filters.is_empty() {
            wire_bytes
        } else {
            self.buffer_filters.encode(&wire_bytes, self.settings.queue_length)?
        };
        for frame in if self.fragmenter.needs_fragmentation(encoded.len()) { self.fragmenter.split(&encoded) } else { vec![encoded] } {
            self.send_frame(&frame).await?;
        }
        Ok(())
    }

    /// Runs the receive loop until the socket errors out, applying
    /// inbound messages to the store. `read_thread_hertz` of `0` means
    /// "as fast as packets arrive"; otherwise the loop paces itself.
    pub async fn run_receive_loop(self: Arc<Self>) {
        let pacing = if self.settings.read_thread_hertz > 0.0 {
            Some(Duration::from_secs_f64(1.0 / self.settings.read_thread_hertz))
        } else {
            None
        };
        loop {
            match self.receive_once().await {
                Ok(_) => {}
                Err(e) => warn!("transport receive error: {e}"),
            }
            if let Some(delay) = pacing {
                sleep(delay).await;
            }
        }
    }

    /// Re-announces to a registry server; a no-op for every other carrier.
    pub async fn heartbeat(&self) -> Result<()> {
        self.carrier.heartbeat().await
    }

    pub fn settings(&self) -> &TransportSettings {
        &self.settings
    }
}

fn now_nanos() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_nanos() as u64).unwrap_or(0)
}
