//! Fan-out hub.
//!
//! The hub consumes one [`LogicalSequence`] exactly once and multiplexes it to
//! any number of subscriptions. Every item passes through the shared
//! [`ReplayBuffer`] before being broadcast, so a subscription that joins late
//! first receives the buffered window and then every later item.
//!
//! Each subscription delays every item independently (see [`crate::delay`]).
//! Delivery to one subscription therefore follows presentation order (replay
//! first, then live) only up to that jitter: two items may reach the same
//! subscriber out of their original relative order.
//!
//! ```text
//! LogicalSequence ──▶ attach loop ──▶ ReplayBuffer
//!                          │
//!                          ├──▶ subscription 1 ──▶ delay ──▶ deliver
//!                          └──▶ subscription N ──▶ delay ──▶ deliver
//! ```

use crate::delay::{DelayConfig, DelayPolicy, RandomDelay};
use crate::item::Item;
use crate::replay::{ReplayBuffer, DEFAULT_REPLAY_CAPACITY};
use crate::source::LogicalSequence;
use dashmap::DashMap;
use futures_util::StreamExt;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

/// A subscription identifier, unique per hub.
pub type SubscriptionId = u64;

/// Hub errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HubError {
    /// The upstream sequence has already been attached.
    #[error("Hub is already attached to its upstream")]
    AlreadyAttached,

    /// The hub has been closed.
    #[error("Hub is closed")]
    Closed,
}

/// Errors reported by a delivery callback.
#[derive(Debug, Error)]
pub enum DeliveryError {
    /// The downstream connection is gone.
    #[error("Subscriber connection closed")]
    Closed,

    /// The item could not be delivered.
    #[error("Delivery failed: {0}")]
    Failed(String),
}

/// Hub lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HubState {
    /// Constructed, upstream not yet consumed.
    Unattached,
    /// Consuming the upstream.
    Attached,
    /// Terminal.
    Closed,
}

impl HubState {
    /// Lowercase name, for logs and health reports.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            HubState::Unattached => "unattached",
            HubState::Attached => "attached",
            HubState::Closed => "closed",
        }
    }
}

impl fmt::Display for HubState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Receives items for one subscription.
///
/// Called from a timer task once the item's delay has elapsed. The callback
/// must not call back into the hub.
pub trait Deliver: Send + Sync + 'static {
    /// Deliver one item downstream.
    fn deliver(&self, item: Arc<Item>) -> Result<(), DeliveryError>;
}

impl<F> Deliver for F
where
    F: Fn(Arc<Item>) -> Result<(), DeliveryError> + Send + Sync + 'static,
{
    fn deliver(&self, item: Arc<Item>) -> Result<(), DeliveryError> {
        self(item)
    }
}

/// Hub configuration.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Replay window size.
    pub replay_capacity: usize,
    /// Per-item delivery delay.
    pub delay: DelayConfig,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            replay_capacity: DEFAULT_REPLAY_CAPACITY,
            delay: DelayConfig::default(),
        }
    }
}

/// Handle held by the downstream transport to cancel its subscription.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    id: SubscriptionId,
}

impl SubscriptionHandle {
    /// The subscription ID.
    #[must_use]
    pub fn id(&self) -> SubscriptionId {
        self.id
    }
}

/// Hub statistics.
#[derive(Debug, Clone)]
pub struct HubStats {
    /// Current lifecycle state.
    pub state: HubState,
    /// Number of live subscriptions.
    pub subscribers: usize,
    /// Items pulled from the upstream so far.
    pub items_received: u64,
    /// Items currently held for replay.
    pub replay_len: usize,
}

/// Delivery side of a subscription, shared with its timer tasks.
struct Subscriber {
    id: SubscriptionId,
    delivery: Box<dyn Deliver>,
    live: Mutex<bool>,
}

impl Subscriber {
    /// Invoke the callback unless the subscription has been cancelled.
    ///
    /// The live flag stays locked for the duration of the callback, so once
    /// [`Subscriber::cancel`] returns no further invocation can start.
    fn deliver(&self, item: Arc<Item>) {
        let live = self.live.lock().unwrap_or_else(PoisonError::into_inner);
        if !*live {
            return;
        }
        let item_id = item.id;
        match self.delivery.deliver(item) {
            Ok(()) => trace!(subscription = self.id, item = item_id, "Delivered"),
            Err(e) => warn!(subscription = self.id, item = item_id, error = %e, "Delivery failed"),
        }
    }

    /// Deliver without waiting, containing a panicking callback.
    ///
    /// Returns `false` if the callback panicked.
    fn deliver_now(&self, item: Arc<Item>) -> bool {
        panic::catch_unwind(AssertUnwindSafe(|| self.deliver(item))).is_ok()
    }

    fn cancel(&self) {
        *self.live.lock().unwrap_or_else(PoisonError::into_inner) = false;
    }
}

/// Registry entry for a live subscription.
struct SubscriberEntry {
    subscriber: Arc<Subscriber>,
    sender: mpsc::UnboundedSender<Arc<Item>>,
    token: CancellationToken,
}

impl SubscriberEntry {
    fn cancel(&self) {
        self.token.cancel();
        self.subscriber.cancel();
    }
}

/// State shared between the hub, its attach loop and its subscriptions.
struct Shared {
    /// Lifecycle state. Also serializes broadcast against subscribe so a new
    /// subscription never misses or duplicates an item.
    state: Mutex<HubState>,
    replay: ReplayBuffer,
    subscribers: DashMap<SubscriptionId, SubscriberEntry>,
    shutdown: CancellationToken,
    next_id: AtomicU64,
    items_received: AtomicU64,
}

impl Shared {
    fn lock_state(&self) -> MutexGuard<'_, HubState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Buffer an item and hand it to every live subscription.
    ///
    /// Returns the number of subscriptions that received it.
    fn publish(&self, item: Arc<Item>) -> usize {
        let state = self.lock_state();
        if *state == HubState::Closed {
            return 0;
        }

        self.items_received.fetch_add(1, Ordering::Relaxed);
        self.replay.push(Arc::clone(&item));

        let recipients = self
            .subscribers
            .iter()
            .filter(|entry| entry.sender.send(Arc::clone(&item)).is_ok())
            .count();
        drop(state);

        trace!(item = item.id, recipients, "Broadcast item");
        recipients
    }

    /// Remove a subscription whose callback panicked.
    fn evict(&self, id: SubscriptionId) {
        if let Some((_, entry)) = self.subscribers.remove(&id) {
            entry.cancel();
        }
    }

    fn close(&self) {
        {
            let mut state = self.lock_state();
            if *state == HubState::Closed {
                return;
            }
            *state = HubState::Closed;
        }

        self.shutdown.cancel();

        let ids: Vec<SubscriptionId> = self.subscribers.iter().map(|e| *e.key()).collect();
        for id in &ids {
            if let Some((_, entry)) = self.subscribers.remove(id) {
                entry.cancel();
            }
        }

        info!(cancelled = ids.len(), "Hub closed");
    }
}

/// Single-upstream, multi-subscriber broadcast coordinator.
pub struct Hub {
    shared: Arc<Shared>,
    sequence: Mutex<Option<LogicalSequence>>,
    config: HubConfig,
}

impl Hub {
    /// Create a hub over `sequence` with default configuration.
    #[must_use]
    pub fn new(sequence: LogicalSequence) -> Self {
        Self::with_config(sequence, HubConfig::default())
    }

    /// Create a hub with custom configuration.
    #[must_use]
    pub fn with_config(sequence: LogicalSequence, config: HubConfig) -> Self {
        info!("Creating hub with config: {:?}", config);
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(HubState::Unattached),
                replay: ReplayBuffer::with_capacity(config.replay_capacity),
                subscribers: DashMap::new(),
                shutdown: CancellationToken::new(),
                next_id: AtomicU64::new(1),
                items_received: AtomicU64::new(0),
            }),
            sequence: Mutex::new(Some(sequence)),
            config,
        }
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> HubState {
        *self.shared.lock_state()
    }

    /// Number of live subscriptions.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.shared.subscribers.len()
    }

    /// Get hub statistics.
    #[must_use]
    pub fn stats(&self) -> HubStats {
        HubStats {
            state: self.state(),
            subscribers: self.subscriber_count(),
            items_received: self.shared.items_received.load(Ordering::Relaxed),
            replay_len: self.shared.replay.len(),
        }
    }

    /// Start consuming the upstream sequence.
    ///
    /// Spawns the attach loop on the current Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::AlreadyAttached`] if called more than once, or
    /// [`HubError::Closed`] on a closed hub. Neither changes any state.
    pub fn attach(&self) -> Result<(), HubError> {
        let mut state = self.shared.lock_state();
        match *state {
            HubState::Closed => return Err(HubError::Closed),
            HubState::Attached => return Err(HubError::AlreadyAttached),
            HubState::Unattached => {}
        }

        let sequence = self
            .sequence
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(HubError::AlreadyAttached)?;

        *state = HubState::Attached;
        drop(state);

        tokio::spawn(run_upstream(Arc::clone(&self.shared), sequence));
        info!("Hub attached");
        Ok(())
    }

    /// Register a new subscription.
    ///
    /// The subscription first receives the current replay window, then every
    /// item broadcast after this call. Delivery is asynchronous and delayed
    /// per item. Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::Closed`] if the hub has been closed.
    pub fn subscribe(&self, delivery: impl Deliver) -> Result<SubscriptionHandle, HubError> {
        let state = self.shared.lock_state();
        if *state == HubState::Closed {
            return Err(HubError::Closed);
        }

        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = mpsc::unbounded_channel();

        let backlog = self.shared.replay.snapshot();
        let replayed = backlog.len();
        for item in backlog {
            // The receiver is still in hand, so this cannot fail
            let _ = sender.send(item);
        }

        let subscriber = Arc::new(Subscriber {
            id,
            delivery: Box::new(delivery),
            live: Mutex::new(true),
        });
        let token = self.shared.shutdown.child_token();

        self.shared.subscribers.insert(
            id,
            SubscriberEntry {
                subscriber: Arc::clone(&subscriber),
                sender,
                token: token.clone(),
            },
        );
        drop(state);

        tokio::spawn(run_subscription(
            Arc::downgrade(&self.shared),
            subscriber,
            receiver,
            self.config.delay.build(),
            token,
        ));

        debug!(
            subscription = id,
            replayed,
            subscribers = self.subscriber_count(),
            "Subscribed"
        );

        Ok(SubscriptionHandle { id })
    }

    /// Cancel a subscription.
    ///
    /// Pending delayed deliveries are discarded; once this returns the
    /// subscription's callback is never invoked again. Returns `true` if the
    /// subscription was live, `false` on repeated calls.
    pub fn unsubscribe(&self, handle: &SubscriptionHandle) -> bool {
        match self.shared.subscribers.remove(&handle.id) {
            Some((_, entry)) => {
                entry.cancel();
                debug!(
                    subscription = handle.id,
                    subscribers = self.subscriber_count(),
                    "Unsubscribed"
                );
                true
            }
            None => false,
        }
    }

    /// Close the hub, stopping upstream consumption and cancelling every
    /// subscription. Idempotent.
    pub fn close(&self) {
        self.shared.close();
        self.sequence
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}

impl Drop for Hub {
    fn drop(&mut self) {
        self.shared.close();
    }
}

impl fmt::Debug for Hub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hub")
            .field("state", &self.state())
            .field("subscribers", &self.subscriber_count())
            .field("config", &self.config)
            .finish()
    }
}

/// The single upstream consumption loop.
async fn run_upstream(shared: Arc<Shared>, mut sequence: LogicalSequence) {
    loop {
        let next = tokio::select! {
            biased;
            _ = shared.shutdown.cancelled() => break,
            next = sequence.next() => next,
        };

        match next {
            Some(Ok(item)) => {
                shared.publish(Arc::new(item));
            }
            Some(Err(e)) => {
                error!(error = %e, "Upstream failed, closing hub");
                shared.close();
                break;
            }
            None => {
                info!("Upstream ended");
                break;
            }
        }
    }
}

/// Per-subscription task: draws a delay for each presented item and
/// schedules its delivery.
///
/// A callback that panics ends the subscription and removes it from the
/// registry.
async fn run_subscription(
    registry: Weak<Shared>,
    subscriber: Arc<Subscriber>,
    mut receiver: mpsc::UnboundedReceiver<Arc<Item>>,
    mut delay: RandomDelay,
    token: CancellationToken,
) {
    let mut pending = JoinSet::new();
    let mut panicked = false;

    loop {
        tokio::select! {
            biased;

            _ = token.cancelled() => break,

            Some(result) = pending.join_next(), if !pending.is_empty() => {
                if let Err(e) = result {
                    if e.is_panic() {
                        panicked = true;
                        break;
                    }
                }
            }

            item = receiver.recv() => match item {
                Some(item) => {
                    let wait = delay.next_delay();
                    if wait.is_zero() {
                        if !subscriber.deliver_now(item) {
                            panicked = true;
                            break;
                        }
                    } else {
                        let subscriber = Arc::clone(&subscriber);
                        pending.spawn(async move {
                            tokio::time::sleep(wait).await;
                            subscriber.deliver(item);
                        });
                    }
                }
                None => {
                    // Sender gone without cancellation: let scheduled deliveries fire
                    tokio::select! {
                        _ = token.cancelled() => {}
                        _ = async { while pending.join_next().await.is_some() {} } => {}
                    }
                    break;
                }
            },
        }
    }

    // Dropping the set aborts every delivery still waiting on its delay
    drop(pending);

    if panicked {
        error!(
            subscription = subscriber.id,
            "Delivery callback panicked, dropping subscription"
        );
        if let Some(shared) = registry.upgrade() {
            shared.evict(subscriber.id);
        }
    }
    trace!(subscription = subscriber.id, "Subscription task finished");
}
