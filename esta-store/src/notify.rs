//! The process-wide change bus.
//!
//! Publishers are the ingest paths (SMTP, SendMail); subscribers are
//! suspended Ping handlers. Registration and removal are O(1) map
//! operations; a broadcast walks the registration table once, which is
//! fine because subscribers per event are typically one device.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub user: String,
    pub collection_id: String,
}

struct Registration {
    user: String,
    collections: Vec<String>,
    tx: mpsc::UnboundedSender<ChangeEvent>,
}

#[derive(Default)]
pub struct ChangeBus {
    subs: Mutex<HashMap<u64, Registration>>,
    next_id: AtomicU64,
}

impl ChangeBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn subscribe(self: &Arc<Self>, user: &str, collections: &[String]) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subs.lock().unwrap().insert(
            id,
            Registration {
                user: user.to_string(),
                collections: collections.to_vec(),
                tx,
            },
        );
        Subscription {
            id,
            bus: self.clone(),
            rx,
        }
    }

    pub fn publish(&self, user: &str, collection_id: &str) {
        let subs = self.subs.lock().unwrap();
        for reg in subs.values() {
            if reg.user == user && reg.collections.iter().any(|c| c == collection_id) {
                // A closed receiver is cleaned up by Subscription::drop.
                let _ = reg.tx.send(ChangeEvent {
                    user: user.to_string(),
                    collection_id: collection_id.to_string(),
                });
            }
        }
    }

    #[cfg(test)]
    fn subscriber_count(&self) -> usize {
        self.subs.lock().unwrap().len()
    }
}

/// Unregisters on drop, so an abandoned Ping handler releases its slot the
/// moment hyper drops the request future.
pub struct Subscription {
    id: u64,
    bus: Arc<ChangeBus>,
    rx: mpsc::UnboundedReceiver<ChangeEvent>,
}

impl Subscription {
    pub async fn recv(&mut self) -> Option<ChangeEvent> {
        self.rx.recv().await
    }

    /// Non-blocking drain, for coalescing events that queued up while the
    /// subscriber was busy.
    pub fn try_recv(&mut self) -> Option<ChangeEvent> {
        self.rx.try_recv().ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.bus.subs.lock().unwrap().remove(&self.id);
    }
}
