//! Send-side throttling (§4.6): a sliding-window bandwidth monitor and a
//! synthetic packet-drop policy for testing lossy-network behavior.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use rand::Rng;

use super::settings::PacketDropType;

/// Tracks bytes sent over a trailing one-second window to enforce
/// `max_send_bandwidth`/`max_total_bandwidth`.
pub struct BandwidthMonitor {
    window: Duration,
    samples: Mutex<VecDeque<(Instant, usize)>>,
}

impl BandwidthMonitor {
    pub fn new() -> Self {
        Self { window: Duration::from_secs(1), samples: Mutex::new(VecDeque::new()) }
    }

    pub fn record(&self, bytes: usize) {
        let mut samples = self.samples.lock().unwrap();
        let now = Instant::now();
        samples.push_back((now, bytes));
        while let Some((ts, _)) = samples.front() {
            if now.duration_since(*ts) > self.window {
                samples.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn current_bytes_per_sec(&self) -> f64 {
        let mut samples = self.samples.lock().unwrap();
        let now = Instant::now();
        while let Some((ts, _)) = samples.front() {
            if now.duration_since(*ts) > self.window {
                samples.pop_front();
            } else {
                break;
            }
        }
        samples.iter().map(|(_, n)| *n as f64).sum()
    }

    /// `limit < 0` means unlimited (§4.6 convention).
    pub fn would_exceed(&self, limit: i64, additional_bytes: usize) -> bool {
        if limit < 0 {
            return false;
        }
        self.current_bytes_per_sec() + additional_bytes as f64 > limit as f64
    }
}

impl Default for BandwidthMonitor {
    fn default() -> Self {
        Self::new()
    }
}

/// Synthetic loss for exercising retry/reliability behavior without a real
/// flaky network (§4.6 `packet_drop_rate`/`packet_drop_type`/`packet_drop_burst`).
pub struct DropPolicy {
    rate: f64,
    kind: PacketDropType,
    burst: u32,
    counter: AtomicU64,
}

impl DropPolicy {
    pub fn new(rate: f64, kind: PacketDropType, burst: u32) -> Self {
        Self { rate, kind, burst: burst.max(1), counter: AtomicU64::new(0) }
    }

    pub fn should_drop(&self) -> bool {
        if self.rate <= 0.0 {
            return false;
        }
        match self.kind {
            PacketDropType::Probabilistic => rand::thread_rng().gen::<f64>() < self.rate,
            PacketDropType::Deterministic => {
                let interval = (1.0 / self.rate).round().max(1.0) as u64;
                let n = self.counter.fetch_add(1, Ordering::Relaxed);
                (n % interval) < self.burst as u64
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bandwidth_monitor_sums_recent_samples() {
        let monitor = BandwidthMonitor::new();
        monitor.record(100);
        monitor.record(200);
        assert_eq!(monitor.current_bytes_per_sec(), 300.0);
    }

    #[test]
    fn unlimited_bandwidth_never_exceeds() {
        let monitor = BandwidthMonitor::new();
        monitor.record(1_000_000);
        assert!(!monitor.would_exceed(-1, 1_000_000));
    }

    #[test]
    fn deterministic_drop_follows_burst_pattern() {
        let policy = DropPolicy::new(0.5, PacketDropType::Deterministic, 1);
        let pattern: Vec<bool> = (0..4).map(|_| policy.should_drop()).collect();
        assert_eq!(pattern, vec![true, false, true, false]);
    }

    #[test]
    fn zero_rate_never_drops() {
        let policy = DropPolicy::new(0.0, PacketDropType::Probabilistic, 1);
        for _ in 0..20 {
            assert!(!policy.should_drop());
        }
    }
}
