//! Items flowing through the relay.
//!
//! An item wraps one upstream record (a post, or anything else the upstream
//! search returns). The relay never looks inside the payload.

use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// A process-unique item identifier.
pub type ItemId = u64;

/// Monotonic counter for item IDs.
static ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Generate a unique item ID.
#[must_use]
pub fn generate_item_id() -> ItemId {
    ID_COUNTER.fetch_add(1, Ordering::Relaxed)
}

/// Current wall-clock time in milliseconds since the Unix epoch.
#[must_use]
pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// An opaque record produced by the upstream.
#[derive(Debug, Clone, PartialEq)]
pub struct Item {
    /// Unique item identifier, assigned on receipt.
    pub id: ItemId,
    /// The upstream record (shared for zero-copy fan-out).
    pub payload: Arc<Value>,
    /// When the relay received the record, in milliseconds.
    pub received_at: u64,
}

impl Item {
    /// Create a new item from an upstream record.
    #[must_use]
    pub fn new(payload: impl Into<Value>) -> Self {
        Self {
            id: generate_item_id(),
            payload: Arc::new(payload.into()),
            received_at: now_millis(),
        }
    }

    /// Get the payload.
    #[must_use]
    pub fn payload(&self) -> &Value {
        &self.payload
    }

    /// The upstream's own identifier for the record, if it carries one.
    #[must_use]
    pub fn upstream_id(&self) -> Option<&str> {
        self.payload.get("id_str").and_then(Value::as_str)
    }
}

impl From<Value> for Item {
    fn from(value: Value) -> Self {
        Self::new(value)
    }
}
