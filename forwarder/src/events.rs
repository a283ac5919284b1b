//! Observer event bus.
//!
//! Core components publish [`Event`]s; the status API and any embedded
//! observers subscribe. A bounded ring of recent events backs
//! `GET /api/events`.

use common::Event;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::broadcast;

/// Events retained for the API.
const RECENT_CAPACITY: usize = 128;

struct Inner {
    tx: broadcast::Sender<Event>,
    recent: Mutex<VecDeque<Event>>,
}

/// Cheaply cloneable handle to the bus.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Inner>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(256);
        Self {
            inner: Arc::new(Inner {
                tx,
                recent: Mutex::new(VecDeque::with_capacity(RECENT_CAPACITY)),
            }),
        }
    }

    pub fn publish(&self, event: Event) {
        tracing::debug!("event: {:?}", event);
        {
            let mut recent = self.inner.recent.lock();
            if recent.len() == RECENT_CAPACITY {
                recent.pop_front();
            }
            recent.push_back(event.clone());
        }
        // No subscribers is fine.
        let _ = self.inner.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.inner.tx.subscribe()
    }

    pub fn recent(&self) -> Vec<Event> {
        self.inner.recent.lock().iter().cloned().collect()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_and_subscribe() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.publish(Event::UpstreamStateChange {
            tag: "a".to_string(),
            usable: false,
        });
        match rx.recv().await.unwrap() {
            Event::UpstreamStateChange { tag, usable } => {
                assert_eq!(tag, "a");
                assert!(!usable);
            }
            other => panic!("unexpected event: {:?}", other),
        }
        assert_eq!(bus.recent().len(), 1);
    }

    #[test]
    fn test_recent_ring_bounded() {
        let bus = EventBus::new();
        for i in 0..300 {
            bus.publish(Event::UpstreamSwitch {
                old_tag: None,
                new_tag: format!("u{}", i),
            });
        }
        assert_eq!(bus.recent().len(), RECENT_CAPACITY);
    }
}
