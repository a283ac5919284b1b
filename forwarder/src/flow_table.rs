//! The flow table.
//!
//! Every live flow is keyed by its 5-tuple and pinned to the upstream
//! tag observed at creation; the pin never changes for the flow's
//! lifetime. Closing is signal-based: the table flips a per-flow watch
//! channel and the owning task tears the sockets down and removes the
//! entry.

use crate::error::{ForwarderError, Result};
use common::{FlowSnapshot, Proto};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;

/// 5-tuple identity of a flow (the listener side supplies `dst`).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FlowKey {
    pub proto: Proto,
    pub client: SocketAddr,
    pub dst: SocketAddr,
}

struct FlowEntry {
    upstream_tag: String,
    bytes_up: Arc<AtomicU64>,
    bytes_down: Arc<AtomicU64>,
    created_ms: u64,
    last_activity_ms: Arc<AtomicU64>,
    close_tx: watch::Sender<bool>,
}

/// Handle held by the task owning a flow's sockets.
#[derive(Debug)]
pub struct FlowHandle {
    pub key: FlowKey,
    pub upstream_tag: String,
    pub close_rx: watch::Receiver<bool>,
    bytes_up: Arc<AtomicU64>,
    bytes_down: Arc<AtomicU64>,
    last_activity_ms: Arc<AtomicU64>,
}

impl FlowHandle {
    pub fn add_up(&self, n: u64) {
        self.bytes_up.fetch_add(n, Ordering::Relaxed);
        self.touch();
    }

    pub fn add_down(&self, n: u64) {
        self.bytes_down.fetch_add(n, Ordering::Relaxed);
        self.touch();
    }

    pub fn touch(&self) {
        self.last_activity_ms
            .store(bwprobe::now_ms(), Ordering::Relaxed);
    }
}

/// Registry of live flows.
pub struct FlowTable {
    flows: Mutex<HashMap<FlowKey, FlowEntry>>,
    max_flows: usize,
}

impl FlowTable {
    pub fn new(max_flows: usize) -> Self {
        Self {
            flows: Mutex::new(HashMap::new()),
            max_flows,
        }
    }

    /// Create a flow pinned to `upstream_tag`. Fails at capacity. A
    /// leftover entry under the same key (a reused 5-tuple) is closed
    /// and replaced.
    pub fn register(&self, key: FlowKey, upstream_tag: &str) -> Result<FlowHandle> {
        let now_ms = bwprobe::now_ms();
        let mut flows = self.flows.lock();
        if let Some(old) = flows.remove(&key) {
            tracing::debug!("flow {:?} re-registered, closing stale entry", key);
            let _ = old.close_tx.send(true);
        }
        if flows.len() >= self.max_flows {
            return Err(ForwarderError::FlowLimit(self.max_flows));
        }

        let (close_tx, close_rx) = watch::channel(false);
        let bytes_up = Arc::new(AtomicU64::new(0));
        let bytes_down = Arc::new(AtomicU64::new(0));
        let last_activity_ms = Arc::new(AtomicU64::new(now_ms));
        flows.insert(
            key.clone(),
            FlowEntry {
                upstream_tag: upstream_tag.to_string(),
                bytes_up: bytes_up.clone(),
                bytes_down: bytes_down.clone(),
                created_ms: now_ms,
                last_activity_ms: last_activity_ms.clone(),
                close_tx,
            },
        );

        Ok(FlowHandle {
            key,
            upstream_tag: upstream_tag.to_string(),
            close_rx,
            bytes_up,
            bytes_down,
            last_activity_ms,
        })
    }

    pub fn remove(&self, key: &FlowKey) {
        self.flows.lock().remove(key);
    }

    /// The pinned tag, while the flow lives.
    pub fn pinned_tag(&self, key: &FlowKey) -> Option<String> {
        self.flows.lock().get(key).map(|e| e.upstream_tag.clone())
    }

    /// Signal close to every flow pinned to `tag`. Returns how many were
    /// signaled; the owning tasks remove the entries.
    pub fn close_by_upstream(&self, tag: &str) -> usize {
        let flows = self.flows.lock();
        let mut closed = 0;
        for entry in flows.values() {
            if entry.upstream_tag == tag {
                let _ = entry.close_tx.send(true);
                closed += 1;
            }
        }
        closed
    }

    /// Signal close to flows idle past their protocol's timeout.
    pub fn expire_idle(&self, now_ms: u64, tcp_idle_ms: u64, udp_idle_ms: u64) -> usize {
        let flows = self.flows.lock();
        let mut expired = 0;
        for (key, entry) in flows.iter() {
            let idle_ms = now_ms.saturating_sub(entry.last_activity_ms.load(Ordering::Relaxed));
            let limit = match key.proto {
                Proto::Tcp => tcp_idle_ms,
                Proto::Udp => udp_idle_ms,
            };
            if limit > 0 && idle_ms > limit {
                tracing::debug!("flow {:?} idle {}ms, expiring", key, idle_ms);
                let _ = entry.close_tx.send(true);
                expired += 1;
            }
        }
        expired
    }

    pub fn len(&self) -> usize {
        self.flows.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.flows.lock().is_empty()
    }

    /// `(tcp, udp)` flow counts.
    pub fn counts(&self) -> (usize, usize) {
        let flows = self.flows.lock();
        let tcp = flows.keys().filter(|k| k.proto == Proto::Tcp).count();
        (tcp, flows.len() - tcp)
    }

    pub fn snapshot(&self) -> Vec<FlowSnapshot> {
        let now_ms = bwprobe::now_ms();
        let flows = self.flows.lock();
        flows
            .iter()
            .map(|(key, entry)| FlowSnapshot {
                proto: key.proto,
                client: key.client.to_string(),
                dst: key.dst.to_string(),
                upstream_tag: entry.upstream_tag.clone(),
                bytes_up: entry.bytes_up.load(Ordering::Relaxed),
                bytes_down: entry.bytes_down.load(Ordering::Relaxed),
                age_secs: now_ms.saturating_sub(entry.created_ms) / 1000,
                idle_secs: now_ms
                    .saturating_sub(entry.last_activity_ms.load(Ordering::Relaxed))
                    / 1000,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(proto: Proto, client_port: u16) -> FlowKey {
        FlowKey {
            proto,
            client: format!("192.0.2.10:{}", client_port).parse().unwrap(),
            dst: "192.0.2.1:8000".parse().unwrap(),
        }
    }

    #[test]
    fn test_pin_is_immutable_across_switches() {
        let table = FlowTable::new(64);
        let mut handles = Vec::new();
        for port in 0..10 {
            handles.push(table.register(key(Proto::Tcp, 40000 + port), "a").unwrap());
        }
        // A switch elsewhere changes nothing for registered flows.
        for port in 0..10 {
            assert_eq!(
                table.pinned_tag(&key(Proto::Tcp, 40000 + port)).as_deref(),
                Some("a")
            );
        }
        assert_eq!(table.counts(), (10, 0));
    }

    #[test]
    fn test_flow_limit() {
        let table = FlowTable::new(2);
        table.register(key(Proto::Tcp, 1), "a").unwrap();
        table.register(key(Proto::Tcp, 2), "a").unwrap();
        let err = table.register(key(Proto::Tcp, 3), "a").unwrap_err();
        assert!(matches!(err, ForwarderError::FlowLimit(2)));

        table.remove(&key(Proto::Tcp, 1));
        assert!(table.register(key(Proto::Tcp, 3), "a").is_ok());
    }

    #[test]
    fn test_close_by_upstream_signals_only_matching() {
        let table = FlowTable::new(64);
        let on_a = table.register(key(Proto::Tcp, 1), "a").unwrap();
        let on_b = table.register(key(Proto::Tcp, 2), "b").unwrap();
        let udp_on_a = table.register(key(Proto::Udp, 3), "a").unwrap();

        assert_eq!(table.close_by_upstream("a"), 2);
        assert!(*on_a.close_rx.borrow());
        assert!(*udp_on_a.close_rx.borrow());
        assert!(!*on_b.close_rx.borrow());
    }

    #[test]
    fn test_idle_expiry_by_protocol() {
        let table = FlowTable::new(64);
        let tcp = table.register(key(Proto::Tcp, 1), "a").unwrap();
        let udp = table.register(key(Proto::Udp, 2), "a").unwrap();

        let now_ms = bwprobe::now_ms();
        // Nothing is idle yet.
        assert_eq!(table.expire_idle(now_ms, 300_000, 60_000), 0);

        // 90 s later only the UDP flow (60 s timeout) expires.
        let later = now_ms + 90_000;
        assert_eq!(table.expire_idle(later, 300_000, 60_000), 1);
        assert!(*udp.close_rx.borrow());
        assert!(!*tcp.close_rx.borrow());

        // Activity resets the clock.
        udp.touch();
        assert_eq!(table.expire_idle(bwprobe::now_ms() + 1000, 300_000, 60_000), 0);
    }

    #[test]
    fn test_counters_via_handle() {
        let table = FlowTable::new(64);
        let handle = table.register(key(Proto::Tcp, 1), "a").unwrap();
        handle.add_up(1000);
        handle.add_down(250);
        handle.add_up(24);
        let snap = table.snapshot();
        assert_eq!(snap.len(), 1);
        assert_eq!(snap[0].bytes_up, 1024);
        assert_eq!(snap[0].bytes_down, 250);
        assert_eq!(snap[0].upstream_tag, "a");
    }
}
