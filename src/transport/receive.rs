//! Receive-side gating: loop suppression, trust/ban lists, and deadline
//! filtering (§4.6/§7 "stale or untrusted packets are dropped silently").

use super::settings::TransportSettings;

/// A packet whose originator is our own id is our own rebroadcast or
/// multicast echo; dropping it here is the loop-suppression rule (§4.6).
pub fn is_self_originated(settings: &TransportSettings, originator: &str) -> bool {
    originator == settings.originator_id
}

pub fn is_banned(settings: &TransportSettings, originator: &str) -> bool {
    settings.banned_peers.iter().any(|p| p == originator)
}

/// When a trust list is configured, only its members are accepted; an
/// empty list means "trust everyone not banned".
pub fn is_trusted(settings: &TransportSettings, originator: &str) -> bool {
    settings.trusted_peers.is_empty() || settings.trusted_peers.iter().any(|p| p == originator)
}

/// A negative deadline means "no deadline" (§4.6 convention).
pub fn is_expired(settings: &TransportSettings, timestamp_nanos: u64, now_nanos: u64) -> bool {
    if settings.deadline_secs < 0.0 {
        return false;
    }
    let age_nanos = now_nanos.saturating_sub(timestamp_nanos);
    age_nanos as f64 / 1_000_000_000.0 > settings.deadline_secs
}

/// Whether a received message should be rebroadcast, and with what ttl.
/// `None` once the ttl budget is exhausted.
pub fn next_rebroadcast_ttl(received_ttl: u8) -> Option<u8> {
    received_ttl.checked_sub(1).filter(|ttl| *ttl > 0).or(if received_ttl > 0 { Some(0) } else { None })
}

pub fn accept(settings: &TransportSettings, originator: &str, timestamp_nanos: u64, now_nanos: u64) -> bool {
    !is_self_originated(settings, originator)
        && !is_banned(settings, originator)
        && is_trusted(settings, originator)
        && !is_expired(settings, timestamp_nanos, now_nanos)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> TransportSettings {
        TransportSettings { originator_id: "self".to_string(), ..TransportSettings::default() }
    }

    #[test]
    fn drops_self_originated_packets() {
        let s = settings();
        assert!(!accept(&s, "self", 0, 0));
        assert!(accept(&s, "peer", 0, 0));
    }

    #[test]
    fn drops_banned_peers() {
        let mut s = settings();
        s.banned_peers.push("bad".to_string());
        assert!(!accept(&s, "bad", 0, 0));
    }

    #[test]
    fn trust_list_restricts_acceptance() {
        let mut s = settings();
        s.trusted_peers.push("good".to_string());
        assert!(accept(&s, "good", 0, 0));
        assert!(!accept(&s, "stranger", 0, 0));
    }

    #[test]
    fn deadline_drops_stale_timestamps() {
        let mut s = settings();
        s.deadline_secs = 1.0;
        let now = 5_000_000_000u64;
        assert!(accept(&s, "peer", now, now));
        assert!(!accept(&s, "peer", 0, now));
    }

    #[test]
    fn ttl_decrements_then_stops() {
        assert_eq!(next_rebroadcast_ttl(3), Some(2));
        assert_eq!(next_rebroadcast_ttl(1), Some(0));
        assert_eq!(next_rebroadcast_ttl(0), None);
    }
}
