//! Acknowledgment tracking for QoS 1/2 publishes and subscriptions
//!
//! rumqttc assigns packet ids inside the event loop, so waiters are queued in
//! request order and bound to a packet id when the matching outgoing event is
//! observed. Callers must hold the session's request lock while registering a
//! waiter and handing the request to the client, otherwise the queue order and
//! the event loop order can diverge.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::{oneshot, watch};
use tracing::warn;

/// Outcome delivered to a subscribe waiter
pub type SubscribeOutcome = Result<(), String>;

#[derive(Default)]
struct Pending {
    queued_publishes: VecDeque<oneshot::Sender<()>>,
    publishes: HashMap<u16, oneshot::Sender<()>>,
    queued_subscribes: VecDeque<oneshot::Sender<SubscribeOutcome>>,
    subscribes: HashMap<u16, oneshot::Sender<SubscribeOutcome>>,
}

impl Pending {
    fn inflight_publishes(&self) -> usize {
        self.queued_publishes.len() + self.publishes.len()
    }
}

/// Shared between the session handle and its event loop task
pub struct AckTracker {
    pending: Mutex<Pending>,
    inflight_tx: watch::Sender<usize>,
}

impl Default for AckTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl AckTracker {
    pub fn new() -> Self {
        let (inflight_tx, _) = watch::channel(0);
        Self {
            pending: Mutex::new(Pending::default()),
            inflight_tx,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Pending> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish_inflight(&self, pending: &Pending) {
        self.inflight_tx.send_replace(pending.inflight_publishes());
    }

    /// Queue a waiter for the next QoS 1/2 publish
    pub fn expect_publish(&self) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        let mut pending = self.lock();
        pending.queued_publishes.push_back(tx);
        self.publish_inflight(&pending);
        rx
    }

    /// Drop the most recently queued publish waiter after a failed hand-off
    pub fn cancel_last_publish(&self) {
        let mut pending = self.lock();
        pending.queued_publishes.pop_back();
        self.publish_inflight(&pending);
    }

    /// Queue a waiter for the next SUBACK
    pub fn expect_subscribe(&self) -> oneshot::Receiver<SubscribeOutcome> {
        let (tx, rx) = oneshot::channel();
        self.lock().queued_subscribes.push_back(tx);
        rx
    }

    pub fn cancel_last_subscribe(&self) {
        self.lock().queued_subscribes.pop_back();
    }

    /// Bind the oldest queued publish waiter to the packet id rumqttc assigned
    pub fn publish_sent(&self, packet_id: u16) {
        if packet_id == 0 {
            return;
        }
        let mut pending = self.lock();
        match pending.queued_publishes.pop_front() {
            Some(waiter) => {
                pending.publishes.insert(packet_id, waiter);
            }
            None => warn!(packet_id, "Outgoing publish with no queued waiter"),
        }
    }

    pub fn publish_acknowledged(&self, packet_id: u16) {
        let mut pending = self.lock();
        if let Some(waiter) = pending.publishes.remove(&packet_id) {
            let _ = waiter.send(());
        }
        self.publish_inflight(&pending);
    }

    pub fn subscribe_sent(&self, packet_id: u16) {
        let mut pending = self.lock();
        match pending.queued_subscribes.pop_front() {
            Some(waiter) => {
                pending.subscribes.insert(packet_id, waiter);
            }
            None => warn!(packet_id, "Outgoing subscribe with no queued waiter"),
        }
    }

    pub fn subscribe_acknowledged(&self, packet_id: u16, granted: bool) {
        if let Some(waiter) = self.lock().subscribes.remove(&packet_id) {
            let outcome = if granted {
                Ok(())
            } else {
                Err(format!("broker refused subscription (packet {packet_id})"))
            };
            let _ = waiter.send(outcome);
        }
    }

    /// Number of publishes still waiting for their final acknowledgment
    pub fn inflight(&self) -> usize {
        *self.inflight_tx.borrow()
    }

    /// Resolve once no publish is waiting for an acknowledgment
    pub async fn wait_idle(&self) {
        let mut rx = self.inflight_tx.subscribe();
        let _ = rx.wait_for(|count| *count == 0).await;
    }

    /// Drop every waiter; their receivers observe a closed channel
    pub fn fail_all(&self) {
        let mut pending = self.lock();
        *pending = Pending::default();
        self.publish_inflight(&pending);
    }
}
