//! In-process fan-out of committed transcript records
//!
//! The bus is owned by the entry point and injected into both the proxy
//! engine (publisher) and the UI server (subscribers). Delivery is advisory:
//! publication never blocks, and a subscriber that falls behind loses events
//! rather than exerting back-pressure on proxied traffic.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::Stream;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::record::TranscriptRecord;

/// Per-subscriber channel capacity.
const SUBSCRIBER_CAPACITY: usize = 32;

#[derive(Default)]
struct Registry {
    next_id: u64,
    subscribers: HashMap<u64, mpsc::Sender<Arc<TranscriptRecord>>>,
}

/// Broadcaster of committed records.
#[derive(Default)]
pub struct EventBus {
    registry: Mutex<Registry>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver `record` to every live subscriber. Full channels are skipped.
    pub fn publish(&self, record: Arc<TranscriptRecord>) {
        let registry = self.registry.lock();
        for (id, tx) in registry.subscribers.iter() {
            match tx.try_send(record.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::debug!("subscriber {} is full, dropping event", id);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {}
            }
        }
    }

    /// Register a new subscriber. Dropping the returned handle removes it.
    pub fn subscribe(self: &Arc<Self>) -> Subscription {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_CAPACITY);
        let id = {
            let mut registry = self.registry.lock();
            let id = registry.next_id;
            registry.next_id += 1;
            registry.subscribers.insert(id, tx);
            id
        };
        Subscription {
            id,
            rx,
            bus: self.clone(),
        }
    }

    #[cfg(test)]
    fn subscriber_count(&self) -> usize {
        self.registry.lock().subscribers.len()
    }
}

/// A live subscriber channel; also a `Stream` of records for the SSE feed.
pub struct Subscription {
    id: u64,
    rx: mpsc::Receiver<Arc<TranscriptRecord>>,
    bus: Arc<EventBus>,
}

impl Subscription {
    pub async fn recv(&mut self) -> Option<Arc<TranscriptRecord>> {
        self.rx.recv().await
    }
}

impl Stream for Subscription {
    type Item = Arc<TranscriptRecord>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().rx.poll_recv(cx)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.bus.registry.lock().subscribers.remove(&self.id);
    }
}
