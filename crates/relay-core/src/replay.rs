//! Replay window for late subscribers.
//!
//! The buffer holds the most recent items seen by the hub. A subscriber that
//! joins late receives a snapshot of the window before any live item.

use crate::item::Item;
use std::collections::VecDeque;
use std::sync::{Arc, PoisonError, RwLock};

/// Default number of items kept for replay.
pub const DEFAULT_REPLAY_CAPACITY: usize = 10;

/// A bounded FIFO window over the most recent items.
#[derive(Debug)]
pub struct ReplayBuffer {
    items: RwLock<VecDeque<Arc<Item>>>,
    capacity: usize,
}

impl ReplayBuffer {
    /// Create a buffer with the default capacity.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_REPLAY_CAPACITY)
    }

    /// Create a buffer with a specific capacity (at least one).
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            items: RwLock::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    /// Append an item, evicting the oldest one when full.
    pub fn push(&self, item: Arc<Item>) {
        let mut items = self.items.write().unwrap_or_else(PoisonError::into_inner);
        if items.len() == self.capacity {
            items.pop_front();
        }
        items.push_back(item);
    }

    /// Copy of the current window in arrival order.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Arc<Item>> {
        self.items
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    /// Number of buffered items.
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Check if the buffer is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Maximum number of buffered items.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for ReplayBuffer {
    fn default() -> Self {
        Self::new()
    }
}
