//! The measurement scheduler.
//!
//! Keeps at most one queued entry per (upstream, protocol), jitters each
//! entry's due time, and gates dequeues on inter-upstream spacing and
//! link headroom. A due entry that fails its gates is pushed back by the
//! retry delay and counted as skipped.

use crate::config::MeasurementConfig;
use common::Proto;
use parking_lot::Mutex;
use rand::Rng;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// One queued measurement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueEntry {
    pub tag: String,
    pub proto: Proto,
    pub due_at: Instant,
}

struct Inner {
    /// Sorted by `due_at`, earliest first.
    queue: Vec<QueueEntry>,
    last_run: HashMap<(String, Proto), Instant>,
    /// Inter-upstream spacing gate.
    next_available: Option<Instant>,
    skipped: u64,
}

pub struct MeasurementScheduler {
    cfg: MeasurementConfig,
    inner: Mutex<Inner>,
}

impl MeasurementScheduler {
    pub fn new(cfg: MeasurementConfig) -> Self {
        Self {
            cfg,
            inner: Mutex::new(Inner {
                queue: Vec::new(),
                last_run: HashMap::new(),
                next_available: None,
                skipped: 0,
            }),
        }
    }

    /// Enqueue every (upstream, protocol) that is neither queued nor
    /// freshly run. Called once per tick.
    pub fn tick(&self, tags: &[String], now: Instant) {
        let min = Duration::from_secs(self.cfg.min_interval_secs);
        let mut inner = self.inner.lock();
        for tag in tags {
            for proto in [Proto::Tcp, Proto::Udp] {
                let queued = inner
                    .queue
                    .iter()
                    .any(|e| e.tag == *tag && e.proto == proto);
                if queued {
                    continue;
                }
                let ran_recently = inner
                    .last_run
                    .get(&(tag.clone(), proto))
                    .is_some_and(|at| now.duration_since(*at) < min);
                if ran_recently {
                    continue;
                }
                let due_at = now + self.jitter();
                inner.queue.push(QueueEntry {
                    tag: tag.clone(),
                    proto,
                    due_at,
                });
            }
        }
        inner.queue.sort_by_key(|e| e.due_at);
    }

    fn jitter(&self) -> Duration {
        let min = self.cfg.min_interval_secs as f64;
        let max = self.cfg.max_interval_secs as f64;
        let secs = if max > min {
            rand::thread_rng().gen_range(min..=max)
        } else {
            min
        };
        Duration::from_secs_f64(secs)
    }

    /// Dequeue the head entry if it is due, the spacing gate is open and
    /// the headroom check passes. A due entry failing a gate is pushed
    /// back by the retry delay and counted as skipped.
    pub fn next_ready(
        &self,
        now: Instant,
        current_rate_bps: f64,
        aggregate_capacity_bps: f64,
    ) -> Option<QueueEntry> {
        let mut inner = self.inner.lock();
        let head = inner.queue.first()?.clone();
        if now < head.due_at {
            return None;
        }

        let spacing_open = inner.next_available.map_or(true, |at| now >= at);
        let probe_bps = match head.proto {
            Proto::Tcp => self.cfg.tcp.max_target_bps(),
            Proto::Udp => self.cfg.udp.max_target_bps(),
        };
        let headroom_ok = current_rate_bps + probe_bps + self.cfg.required_free_bandwidth_bps
            <= self.cfg.max_link_utilization * aggregate_capacity_bps;

        if !spacing_open || !headroom_ok {
            let retry = Duration::from_secs(self.cfg.retry_delay_secs);
            inner.queue[0].due_at = now + retry;
            inner.skipped += 1;
            inner.queue.sort_by_key(|e| e.due_at);
            tracing::debug!(
                "measurement {}/{} deferred {}s (spacing open: {}, headroom ok: {})",
                head.tag,
                head.proto.as_str(),
                retry.as_secs(),
                spacing_open,
                headroom_ok
            );
            return None;
        }

        inner.queue.remove(0);
        inner.next_available =
            Some(now + Duration::from_secs(self.cfg.inter_upstream_gap_secs));
        Some(head)
    }

    /// Record a successful run.
    pub fn mark_run(&self, tag: &str, proto: Proto, now: Instant) {
        let mut inner = self.inner.lock();
        inner.last_run.insert((tag.to_string(), proto), now);
    }

    /// Put a failed entry back with a delay.
    pub fn requeue(&self, entry: QueueEntry, delay: Duration, now: Instant) {
        let mut inner = self.inner.lock();
        let queued = inner
            .queue
            .iter()
            .any(|e| e.tag == entry.tag && e.proto == entry.proto);
        if queued {
            return;
        }
        inner.queue.push(QueueEntry {
            due_at: now + delay,
            ..entry
        });
        inner.queue.sort_by_key(|e| e.due_at);
    }

    pub fn skipped(&self) -> u64 {
        self.inner.lock().skipped
    }

    pub fn queue_len(&self) -> usize {
        self.inner.lock().queue.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MeasurementConfig;

    fn cfg() -> MeasurementConfig {
        MeasurementConfig {
            min_interval_secs: 30,
            max_interval_secs: 60,
            inter_upstream_gap_secs: 5,
            retry_delay_secs: 30,
            required_free_bandwidth_bps: 10_000_000.0,
            max_link_utilization: 0.8,
            ..MeasurementConfig::default()
        }
    }

    /// Capacity generous enough that the headroom gate always passes.
    const BIG_CAPACITY: f64 = 10_000_000_000.0;

    fn tags() -> Vec<String> {
        vec!["a".to_string(), "b".to_string()]
    }

    #[test]
    fn test_tick_deduplicates() {
        let sched = MeasurementScheduler::new(cfg());
        let now = Instant::now();
        sched.tick(&tags(), now);
        assert_eq!(sched.queue_len(), 4); // 2 upstreams x 2 protocols
        sched.tick(&tags(), now);
        sched.tick(&tags(), now + Duration::from_secs(1));
        assert_eq!(sched.queue_len(), 4);
    }

    #[test]
    fn test_jitter_within_bounds() {
        let sched = MeasurementScheduler::new(cfg());
        let now = Instant::now();
        sched.tick(&tags(), now);
        // Entries are not ready before min_interval.
        assert!(sched.next_ready(now, 0.0, BIG_CAPACITY).is_none());
        assert!(sched
            .next_ready(now + Duration::from_secs(29), 0.0, BIG_CAPACITY)
            .is_none());
        // All entries are due by max_interval.
        let mut dequeued = 0;
        let mut at = now + Duration::from_secs(61);
        while let Some(_) = sched.next_ready(at, 0.0, BIG_CAPACITY) {
            dequeued += 1;
            at += Duration::from_secs(6); // clear the spacing gate
        }
        assert_eq!(dequeued, 4);
    }

    #[test]
    fn test_min_interval_after_run() {
        let sched = MeasurementScheduler::new(cfg());
        let now = Instant::now();
        sched.mark_run("a", Proto::Tcp, now);
        sched.tick(&tags(), now + Duration::from_secs(10));
        // a/tcp ran 10 s ago, inside min_interval: only 3 entries queue.
        assert_eq!(sched.queue_len(), 3);
        sched.tick(&tags(), now + Duration::from_secs(31));
        assert_eq!(sched.queue_len(), 4);
    }

    #[test]
    fn test_spacing_gate_defers_and_counts_skip() {
        let sched = MeasurementScheduler::new(cfg());
        let now = Instant::now();
        sched.tick(&["a".to_string()], now);
        assert_eq!(sched.queue_len(), 2);

        let at = now + Duration::from_secs(61);
        let first = sched.next_ready(at, 0.0, BIG_CAPACITY).expect("first entry");
        // Second dequeue inside the 5 s gap: deferred by retry_delay.
        assert!(sched.next_ready(at + Duration::from_secs(1), 0.0, BIG_CAPACITY).is_none());
        assert_eq!(sched.skipped(), 1);
        // The deferred entry moved a full retry_delay out, so it is not
        // ready right after the gap opens either.
        assert!(sched.next_ready(at + Duration::from_secs(6), 0.0, BIG_CAPACITY).is_none());
        let second = sched
            .next_ready(at + Duration::from_secs(32), 0.0, BIG_CAPACITY)
            .expect("deferred entry after retry delay");
        assert_eq!(second.tag, first.tag);
        assert_ne!(second.proto, first.proto);
    }

    #[test]
    fn test_headroom_gate() {
        let sched = MeasurementScheduler::new(cfg());
        let now = Instant::now();
        sched.tick(&["a".to_string()], now);
        let at = now + Duration::from_secs(61);

        // capacity 300 Mbit/s, 80% usable = 240; current 200 + probe
        // (50 or 200) + required 10 > 240 for either protocol: blocked.
        assert!(sched.next_ready(at, 200_000_000.0, 300_000_000.0).is_none());
        let skipped = sched.skipped();
        assert!(skipped >= 1);

        // With an idle link the same entry passes after the retry delay.
        let later = at + Duration::from_secs(31);
        assert!(sched.next_ready(later, 0.0, 300_000_000.0).is_some());
        // The skip counter only ever grows.
        assert!(sched.skipped() >= skipped);
    }

    #[test]
    fn test_requeue_restores_entry_once() {
        let sched = MeasurementScheduler::new(cfg());
        let now = Instant::now();
        sched.tick(&["a".to_string()], now);
        let at = now + Duration::from_secs(61);
        let entry = sched.next_ready(at, 0.0, BIG_CAPACITY).unwrap();
        assert_eq!(sched.queue_len(), 1);

        sched.requeue(entry.clone(), Duration::from_secs(30), at);
        sched.requeue(entry.clone(), Duration::from_secs(30), at);
        assert_eq!(sched.queue_len(), 2);
        assert!(sched.next_ready(at + Duration::from_secs(10), 0.0, BIG_CAPACITY).is_none());
        assert!(sched
            .next_ready(at + Duration::from_secs(31), 0.0, BIG_CAPACITY)
            .is_some());
    }
}
