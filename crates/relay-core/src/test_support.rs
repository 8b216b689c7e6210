//! Fakes shared by the unit tests.

use crate::cache::{Profile, ProfileSource};
use crate::hub::{DeliveryError, Deliver};
use crate::item::Item;
use crate::source::{LiveStream, SourceError, Upstream};
use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::ops::Range;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

pub(crate) type LiveSender = mpsc::UnboundedSender<Result<Item, SourceError>>;

/// Records `{"n": k}` for each `k` in the range.
pub(crate) fn numbered(range: Range<u64>) -> Vec<Value> {
    range.map(|n| json!({ "n": n })).collect()
}

/// Turn a receiver into a live stream.
pub(crate) fn channel_stream(
    rx: mpsc::UnboundedReceiver<Result<Item, SourceError>>,
) -> LiveStream {
    stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|item| (item, rx))
    })
    .boxed()
}

/// Scriptable upstream.
pub(crate) struct FakeUpstream {
    history: Result<Vec<Value>, SourceError>,
    live: Mutex<Option<mpsc::UnboundedReceiver<Result<Item, SourceError>>>>,
    live_error: Option<SourceError>,
    query: Mutex<Option<String>>,
    pub searches: AtomicUsize,
    pub opens: AtomicUsize,
}

impl FakeUpstream {
    pub(crate) fn new(history: Vec<Value>) -> (Arc<Self>, LiveSender) {
        let (tx, rx) = mpsc::unbounded_channel();
        let upstream = Self {
            history: Ok(history),
            live: Mutex::new(Some(rx)),
            live_error: None,
            query: Mutex::new(None),
            searches: AtomicUsize::new(0),
            opens: AtomicUsize::new(0),
        };
        (Arc::new(upstream), tx)
    }

    pub(crate) fn failing_search(error: SourceError) -> Arc<Self> {
        let (upstream, _tx) = Self::new(Vec::new());
        let mut upstream = Arc::into_inner(upstream).expect("fresh upstream");
        upstream.history = Err(error);
        Arc::new(upstream)
    }

    pub(crate) fn failing_live(history: Vec<Value>, error: SourceError) -> Arc<Self> {
        let (upstream, _tx) = Self::new(history);
        let mut upstream = Arc::into_inner(upstream).expect("fresh upstream");
        upstream.live_error = Some(error);
        Arc::new(upstream)
    }

    pub(crate) fn last_query(&self) -> Option<String> {
        self.query.lock().unwrap().clone()
    }
}

#[async_trait]
impl Upstream for FakeUpstream {
    async fn historical_search(&self, query: &str) -> Result<Vec<Item>, SourceError> {
        self.searches.fetch_add(1, Ordering::SeqCst);
        *self.query.lock().unwrap() = Some(query.to_string());
        self.history
            .clone()
            .map(|records| records.into_iter().map(Item::new).collect())
    }

    async fn open_live_stream(&self, _query: &str) -> Result<LiveStream, SourceError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = &self.live_error {
            return Err(error.clone());
        }
        let rx = self
            .live
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| SourceError::Unavailable("live stream already opened".into()))?;
        Ok(channel_stream(rx))
    }
}

/// Collects everything delivered to a subscriber.
#[derive(Clone, Default)]
pub(crate) struct Recorder {
    items: Arc<Mutex<Vec<Arc<Item>>>>,
}

impl Recorder {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn delivery(&self) -> impl Deliver {
        let items = Arc::clone(&self.items);
        move |item: Arc<Item>| -> Result<(), DeliveryError> {
            items.lock().unwrap().push(item);
            Ok(())
        }
    }

    pub(crate) fn count(&self) -> usize {
        self.items.lock().unwrap().len()
    }

    /// The `n` field of each delivered record, in delivery order.
    pub(crate) fn numbers(&self) -> Vec<u64> {
        self.items
            .lock()
            .unwrap()
            .iter()
            .map(|item| item.payload()["n"].as_u64().unwrap())
            .collect()
    }
}

/// Profile source backed by a map, counting fetches.
#[derive(Default)]
pub(crate) struct FakeProfiles {
    profiles: HashMap<String, Value>,
    pub fetches: AtomicUsize,
}

impl FakeProfiles {
    pub(crate) fn with(names: &[&str]) -> Arc<Self> {
        let profiles = names
            .iter()
            .map(|name| (name.to_string(), json!({ "screen_name": name })))
            .collect();
        Arc::new(Self {
            profiles,
            fetches: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl ProfileSource for FakeProfiles {
    async fn fetch_profile(&self, screen_name: &str) -> Result<Profile, SourceError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        self.profiles
            .get(screen_name)
            .cloned()
            .map(Profile::new)
            .ok_or_else(|| SourceError::NotFound(screen_name.to_string()))
    }
}
