//! Per-run fan-out of progress events to live listeners.
//!
//! Publishing never blocks and never fails: a listener whose receiving end
//! is gone is dropped from the registry on the next publish. Events for a
//! run reach each listener in publish order.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::task::{Context, Poll};

use devteam_core::{ProgressEvent, RunId};
use futures_util::Stream;
use tokio::sync::mpsc;
use tracing::debug;

struct Listener {
    id: u64,
    tx: mpsc::UnboundedSender<ProgressEvent>,
}

/// Registry of listeners keyed by run.
#[derive(Default)]
pub struct ProgressBroadcast {
    listeners: Mutex<HashMap<RunId, Vec<Listener>>>,
    next_id: AtomicU64,
}

impl ProgressBroadcast {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<RunId, Vec<Listener>>> {
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a listener for `run_id`.
    pub fn subscribe(self: &Arc<Self>, run_id: &RunId) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock()
            .entry(run_id.clone())
            .or_default()
            .push(Listener { id, tx });
        debug!(run_id = %run_id, listener_id = id, "Listener subscribed");

        Subscription {
            run_id: run_id.clone(),
            id,
            rx,
            registry: Arc::downgrade(self),
        }
    }

    /// Deliver `event` to every listener of its run. Returns how many
    /// listeners received it; zero listeners is a no-op.
    pub fn publish(&self, event: ProgressEvent) -> usize {
        let mut listeners = self.lock();
        let Some(list) = listeners.get_mut(&event.run_id) else {
            return 0;
        };

        let run_id = event.run_id.clone();
        list.retain(|listener| {
            let delivered = listener.tx.send(event.clone()).is_ok();
            if !delivered {
                debug!(run_id = %run_id, listener_id = listener.id, "Dropping disconnected listener");
            }
            delivered
        });
        let delivered = list.len();
        if list.is_empty() {
            listeners.remove(&run_id);
        }
        delivered
    }

    /// Remove one listener. Unknown handles are ignored.
    pub fn unsubscribe(&self, run_id: &RunId, listener_id: u64) {
        let mut listeners = self.lock();
        if let Some(list) = listeners.get_mut(run_id) {
            list.retain(|l| l.id != listener_id);
            if list.is_empty() {
                listeners.remove(run_id);
            }
        }
    }

    /// Listeners registered for one run.
    pub fn listeners_for(&self, run_id: &RunId) -> usize {
        self.lock().get(run_id).map_or(0, Vec::len)
    }

    /// Listeners across all runs.
    pub fn listener_count(&self) -> usize {
        self.lock().values().map(Vec::len).sum()
    }
}

/// A listener handle. Dropping it unsubscribes.
pub struct Subscription {
    run_id: RunId,
    id: u64,
    rx: mpsc::UnboundedReceiver<ProgressEvent>,
    registry: Weak<ProgressBroadcast>,
}

impl Subscription {
    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Next event, or `None` once the registry is gone.
    pub async fn recv(&mut self) -> Option<ProgressEvent> {
        self.rx.recv().await
    }

    /// Next event if one is already queued.
    pub fn try_recv(&mut self) -> Option<ProgressEvent> {
        self.rx.try_recv().ok()
    }
}

impl Stream for Subscription {
    type Item = ProgressEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().rx.poll_recv(cx)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.unsubscribe(&self.run_id, self.id);
        }
    }
}
