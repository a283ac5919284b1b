//! Per-upstream rate and utilization bookkeeping.
//!
//! The data plane adds bytes into per-upstream atomic counters; a
//! once-per-second roll moves them into a ring of one-second samples.
//! Rates are time-weighted exponential means over a caller-chosen
//! window, which also feeds the scheduler's headroom gate.

use common::{Direction, Proto};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Seconds of history kept per upstream.
const RING_SECONDS: usize = 60;

#[derive(Debug, Clone, Copy)]
struct RateSample {
    at: Instant,
    up_bytes: u64,
    down_bytes: u64,
}

struct RateEntry {
    cur_up: AtomicU64,
    cur_down: AtomicU64,
    ring: Mutex<VecDeque<RateSample>>,
}

impl RateEntry {
    fn new() -> Self {
        Self {
            cur_up: AtomicU64::new(0),
            cur_down: AtomicU64::new(0),
            ring: Mutex::new(VecDeque::with_capacity(RING_SECONDS)),
        }
    }
}

/// Byte-rate book over all upstreams.
pub struct RateBook {
    entries: RwLock<HashMap<String, Arc<RateEntry>>>,
}

impl RateBook {
    pub fn new(tags: impl IntoIterator<Item = String>) -> Self {
        let entries = tags
            .into_iter()
            .map(|tag| (tag, Arc::new(RateEntry::new())))
            .collect();
        Self {
            entries: RwLock::new(entries),
        }
    }

    /// Hot path: counter add only. The protocol tag is part of the §6.3
    /// interface; accounting is per direction.
    pub fn add_bytes(&self, tag: &str, n: u64, _proto: Proto, direction: Direction) {
        let entry = self.entries.read().get(tag).cloned();
        if let Some(entry) = entry {
            match direction {
                Direction::Up => entry.cur_up.fetch_add(n, Ordering::Relaxed),
                Direction::Down => entry.cur_down.fetch_add(n, Ordering::Relaxed),
            };
        }
    }

    /// Move the current counters into the ring. Call once per second.
    pub fn roll(&self, now: Instant) {
        let entries: Vec<Arc<RateEntry>> = self.entries.read().values().cloned().collect();
        for entry in entries {
            let up = entry.cur_up.swap(0, Ordering::Relaxed);
            let down = entry.cur_down.swap(0, Ordering::Relaxed);
            let mut ring = entry.ring.lock();
            ring.push_back(RateSample {
                at: now,
                up_bytes: up,
                down_bytes: down,
            });
            while ring.len() > RING_SECONDS {
                ring.pop_front();
            }
        }
    }

    /// Time-weighted exponential mean rate over `window`, bits/second,
    /// per direction.
    pub fn rate_bps(&self, tag: &str, window: Duration, now: Instant) -> (f64, f64) {
        let entry = self.entries.read().get(tag).cloned();
        match entry {
            Some(entry) => weighted_rate(&entry.ring.lock(), window, now),
            None => (0.0, 0.0),
        }
    }

    /// Sum of both directions across all upstreams, for the headroom gate.
    pub fn aggregate_rate_bps(&self, window: Duration, now: Instant) -> f64 {
        let entries: Vec<Arc<RateEntry>> = self.entries.read().values().cloned().collect();
        entries
            .iter()
            .map(|e| {
                let (up, down) = weighted_rate(&e.ring.lock(), window, now);
                up + down
            })
            .sum()
    }

    /// `max(up/cap_up, down/cap_down)`, clamped to [0, 1]. Zero capacity
    /// in a direction skips that direction.
    pub fn utilization(
        &self,
        tag: &str,
        cap_up_bps: f64,
        cap_down_bps: f64,
        window: Duration,
        now: Instant,
    ) -> f64 {
        let (up, down) = self.rate_bps(tag, window, now);
        let mut utilization: f64 = 0.0;
        if cap_up_bps > 0.0 {
            utilization = utilization.max(up / cap_up_bps);
        }
        if cap_down_bps > 0.0 {
            utilization = utilization.max(down / cap_down_bps);
        }
        utilization.clamp(0.0, 1.0)
    }
}

fn weighted_rate(ring: &VecDeque<RateSample>, window: Duration, now: Instant) -> (f64, f64) {
    let tau = window.as_secs_f64().max(1.0);
    let mut weight_sum = 0.0;
    let mut up = 0.0;
    let mut down = 0.0;
    for sample in ring.iter() {
        let age = now.saturating_duration_since(sample.at).as_secs_f64();
        let weight = (-age / tau).exp();
        weight_sum += weight;
        up += weight * sample.up_bytes as f64;
        down += weight * sample.down_bytes as f64;
    }
    if weight_sum <= 0.0 {
        return (0.0, 0.0);
    }
    // Each sample covers one second, so weighted bytes/weight is bytes/s.
    (up * 8.0 / weight_sum, down * 8.0 / weight_sum)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn book() -> RateBook {
        RateBook::new(["a".to_string(), "b".to_string()])
    }

    #[test]
    fn test_unknown_tag_is_zero() {
        let book = book();
        let (up, down) = book.rate_bps("nope", Duration::from_secs(5), Instant::now());
        assert_eq!((up, down), (0.0, 0.0));
    }

    #[test]
    fn test_steady_rate() {
        let book = book();
        let mut now = Instant::now();
        // 1 MB/s up for 10 seconds.
        for _ in 0..10 {
            book.add_bytes("a", 1_000_000, Proto::Tcp, Direction::Up);
            now += Duration::from_secs(1);
            book.roll(now);
        }
        let (up, down) = book.rate_bps("a", Duration::from_secs(5), now);
        assert!((up - 8_000_000.0).abs() / 8_000_000.0 < 0.05, "up {}", up);
        assert_eq!(down, 0.0);
    }

    #[test]
    fn test_recent_traffic_dominates() {
        let book = book();
        let mut now = Instant::now();
        // Old burst, then silence.
        book.add_bytes("a", 10_000_000, Proto::Tcp, Direction::Down);
        now += Duration::from_secs(1);
        book.roll(now);
        for _ in 0..20 {
            now += Duration::from_secs(1);
            book.roll(now);
        }
        let (_, down) = book.rate_bps("a", Duration::from_secs(5), now);
        // The burst is 20 samples old against a 5 s window.
        assert!(down < 8_000_000.0, "stale burst still dominates: {}", down);
    }

    #[test]
    fn test_aggregate_sums_upstreams() {
        let book = book();
        let mut now = Instant::now();
        for _ in 0..5 {
            book.add_bytes("a", 500_000, Proto::Tcp, Direction::Up);
            book.add_bytes("b", 500_000, Proto::Udp, Direction::Down);
            now += Duration::from_secs(1);
            book.roll(now);
        }
        let total = book.aggregate_rate_bps(Duration::from_secs(5), now);
        assert!((total - 8_000_000.0).abs() / 8_000_000.0 < 0.1, "total {}", total);
    }

    #[test]
    fn test_utilization() {
        let book = book();
        let mut now = Instant::now();
        for _ in 0..10 {
            book.add_bytes("a", 1_000_000, Proto::Tcp, Direction::Up);
            now += Duration::from_secs(1);
            book.roll(now);
        }
        // ~8 Mbit/s up against 16 Mbit/s capacity.
        let u = book.utilization("a", 16_000_000.0, 100_000_000.0, Duration::from_secs(5), now);
        assert!((u - 0.5).abs() < 0.1, "utilization {}", u);
        // Zero caps clamp rather than divide.
        assert_eq!(
            book.utilization("a", 0.0, 0.0, Duration::from_secs(5), now),
            0.0
        );
    }
}
