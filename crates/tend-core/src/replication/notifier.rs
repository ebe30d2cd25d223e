//! Live fan-out of accepted writes to pull-following subscribers.
//!
//! Every subscriber owns a bounded queue. Publishing never waits: a
//! subscriber whose queue is full is dropped from the fan-out and, once it has
//! drained what was already queued, receives a single
//! [`PullStreamItem::Resync`] before its subscription ends.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tokio::sync::mpsc::{self, error::TrySendError};

use crate::models::{PullStreamItem, ReplicationEvent};

/// Default per-subscriber queue capacity
pub const DEFAULT_SUBSCRIBER_CAPACITY: usize = 256;

#[derive(Clone)]
pub struct LiveNotifier {
    inner: Arc<Mutex<NotifierState>>,
}

struct NotifierState {
    subscribers: BTreeMap<u64, SubscriberState>,
    next_subscriber_id: u64,
    capacity: usize,
    closed: bool,
}

struct SubscriberState {
    sender: mpsc::Sender<ReplicationEvent>,
    lagged: Arc<AtomicBool>,
}

impl LiveNotifier {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(NotifierState {
                subscribers: BTreeMap::new(),
                next_subscriber_id: 0,
                capacity: capacity.max(1),
                closed: false,
            })),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, NotifierState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a new subscriber. Subscribing after [`close`](Self::close)
    /// returns a subscription that is already finished.
    pub fn subscribe(&self) -> Subscription {
        let mut state = self.lock_state();
        let (sender, receiver) = mpsc::channel(state.capacity);
        let lagged = Arc::new(AtomicBool::new(false));
        let id = state.next_subscriber_id;
        state.next_subscriber_id = state.next_subscriber_id.saturating_add(1);

        if !state.closed {
            state.subscribers.insert(
                id,
                SubscriberState {
                    sender,
                    lagged: Arc::clone(&lagged),
                },
            );
        }

        Subscription {
            id,
            receiver,
            lagged,
            resync_sent: false,
            notifier: Arc::downgrade(&self.inner),
        }
    }

    /// Fan an event out to every subscriber, in call order.
    pub fn publish(&self, event: &ReplicationEvent) {
        let mut state = self.lock_state();
        if state.closed {
            return;
        }

        state.subscribers.retain(|id, subscriber| {
            match subscriber.sender.try_send(event.clone()) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    subscriber.lagged.store(true, Ordering::Release);
                    tracing::warn!(subscriber = id, "Dropping lagged live subscriber");
                    false
                }
                Err(TrySendError::Closed(_)) => false,
            }
        });
    }

    /// Number of live subscribers
    pub fn subscriber_count(&self) -> usize {
        self.lock_state().subscribers.len()
    }

    pub fn is_closed(&self) -> bool {
        self.lock_state().closed
    }

    /// End every subscription and refuse new ones.
    pub fn close(&self) {
        let mut state = self.lock_state();
        state.closed = true;
        state.subscribers.clear();
    }
}

impl Default for LiveNotifier {
    fn default() -> Self {
        Self::new(DEFAULT_SUBSCRIBER_CAPACITY)
    }
}

/// A handle on the live feed. Dropping it unsubscribes.
pub struct Subscription {
    id: u64,
    receiver: mpsc::Receiver<ReplicationEvent>,
    lagged: Arc<AtomicBool>,
    resync_sent: bool,
    notifier: Weak<Mutex<NotifierState>>,
}

impl Subscription {
    /// Next item, or `None` once the subscription has ended.
    pub async fn recv(&mut self) -> Option<PullStreamItem> {
        match self.receiver.recv().await {
            Some(event) => Some(PullStreamItem::Event(event)),
            None => self.finish(),
        }
    }

    /// Non-blocking variant of [`recv`](Self::recv); `None` when nothing is queued.
    pub fn try_recv(&mut self) -> Option<PullStreamItem> {
        match self.receiver.try_recv() {
            Ok(event) => Some(PullStreamItem::Event(event)),
            Err(mpsc::error::TryRecvError::Empty) => None,
            Err(mpsc::error::TryRecvError::Disconnected) => self.finish(),
        }
    }

    fn finish(&mut self) -> Option<PullStreamItem> {
        if self.lagged.load(Ordering::Acquire) && !self.resync_sent {
            self.resync_sent = true;
            return Some(PullStreamItem::Resync);
        }
        None
    }

    /// Stop receiving events. Safe to call more than once.
    pub fn unsubscribe(&mut self) {
        if let Some(inner) = self.notifier.upgrade() {
            inner
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .subscribers
                .remove(&self.id);
        }
        self.notifier = Weak::new();
        self.receiver.close();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}
