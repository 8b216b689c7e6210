//! HTTP and WebSocket handlers for the relay server.
//!
//! Every WebSocket connection becomes one hub subscription: it receives the
//! replay window, then every later item, each after its own random delay.
//! Clients never send anything meaningful; the socket is read only to notice
//! when it closes.

use crate::config::Config;
use crate::metrics::{self, ConnectionMetricsGuard};
use crate::upstream::TwitterClient;
use anyhow::{bail, Context, Result};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    http::{HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use relay_core::{
    DeliveryError, Hub, HubConfig, HubState, Item, ItemSource, LogicalSequence, ProfileCache,
    ProfileLookup, ProfileSource, SourceError,
};
use relay_protocol::Encoded;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tracing::{debug, error, info, warn};

/// How often hub and cache counters are exported.
const STATS_INTERVAL: Duration = Duration::from_secs(15);

/// Shared server state.
pub struct AppState {
    /// The stream fan-out hub.
    pub hub: Hub,
    /// Cached profile lookups.
    pub profiles: ProfileLookup,
    /// Server configuration.
    pub config: Config,
}

impl AppState {
    /// Create new app state. The hub is not attached yet.
    #[must_use]
    pub fn new(
        config: Config,
        sequence: LogicalSequence,
        profiles: Arc<dyn ProfileSource>,
    ) -> Self {
        let hub_config = HubConfig {
            replay_capacity: config.stream.replay_capacity,
            delay: config.stream.delay,
        };
        let cache = ProfileCache::new(config.cache.capacity, config.cache.max_age());

        Self {
            hub: Hub::with_config(sequence, hub_config),
            profiles: ProfileLookup::new(profiles, cache),
            config,
        }
    }
}

/// Build the CORS layer admitting the configured origin.
///
/// # Errors
///
/// Returns an error if the origin is not a valid header value.
pub fn cors_layer(origin: &str) -> Result<CorsLayer> {
    let allow_origin = if origin == "*" {
        AllowOrigin::from(Any)
    } else {
        let value = HeaderValue::from_str(origin)
            .with_context(|| format!("Invalid allowed origin: {}", origin))?;
        AllowOrigin::exact(value)
    };

    Ok(CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([Method::GET]))
}

/// Check that the WebSocket path can be routed next to the fixed endpoints.
///
/// # Errors
///
/// Returns an error if the path is not absolute, contains route parameters,
/// or overlaps `/health` or `/user/`.
pub fn validate_websocket_path(path: &str) -> Result<()> {
    if !path.starts_with('/') {
        bail!("WebSocket path must start with '/': {:?}", path);
    }
    if path.contains([':', '*']) {
        bail!("WebSocket path must be a literal path: {:?}", path);
    }
    if path == "/health" || path == "/user" || path.starts_with("/user/") {
        bail!("WebSocket path collides with a built-in route: {:?}", path);
    }
    Ok(())
}

/// Build the application router.
///
/// # Errors
///
/// Returns an error if the CORS origin or the WebSocket path is invalid.
pub fn app(state: Arc<AppState>) -> Result<Router> {
    let cors = cors_layer(&state.config.transport.allowed_origin)?;
    validate_websocket_path(&state.config.transport.websocket_path)?;

    Ok(Router::new()
        .route(&state.config.transport.websocket_path, get(ws_handler))
        .route("/user/:screen_name", get(user_handler))
        .route("/health", get(health_handler))
        .layer(cors)
        .with_state(state))
}

/// Run the HTTP/WebSocket server.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(config: Config) -> Result<()> {
    // Start metrics server if enabled
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    let client = Arc::new(
        TwitterClient::new(config.upstream.clone()).context("Failed to build upstream client")?,
    );
    let sequence = ItemSource::new(client.clone()).open(config.stream.query.clone());
    let state = Arc::new(AppState::new(config.clone(), sequence, client));

    let router = app(Arc::clone(&state))?;

    // Bind before attaching so a bad address fails without touching the upstream
    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    state.hub.attach()?;
    tokio::spawn(report_stats(Arc::clone(&state)));

    info!("Relay server listening on {}", addr);
    info!(
        "WebSocket endpoint: ws://{}{}",
        addr, config.transport.websocket_path
    );
    info!(query = %config.stream.query, "Relaying upstream stream");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    state.hub.close();
    info!("Relay server stopped");

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

/// Periodically export hub and cache counters until the hub closes.
async fn report_stats(state: Arc<AppState>) {
    let mut interval = tokio::time::interval(STATS_INTERVAL);
    loop {
        interval.tick().await;
        let stats = state.hub.stats();
        metrics::record_hub_stats(&stats);
        metrics::record_cache_stats(&state.profiles.cache().stats());
        debug!(
            state = %stats.state,
            subscribers = stats.subscribers,
            items = stats.items_received,
            "Hub stats"
        );
        if stats.state == HubState::Closed {
            break;
        }
    }
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let stats = state.hub.stats();
    let cache = state.profiles.cache().stats();
    let status = if stats.state == HubState::Attached {
        "ok"
    } else {
        "degraded"
    };

    Json(json!({
        "status": status,
        "version": env!("CARGO_PKG_VERSION"),
        "hub": {
            "state": stats.state.as_str(),
            "subscribers": stats.subscribers,
            "items_received": stats.items_received,
            "replay_len": stats.replay_len,
        },
        "profile_cache": {
            "len": cache.len,
            "hits": cache.hits,
            "misses": cache.misses,
        },
    }))
}

/// Profile lookup handler.
async fn user_handler(
    Path(screen_name): Path<String>,
    State(state): State<Arc<AppState>>,
) -> Response {
    match state.profiles.retrieve(&screen_name).await {
        Ok(profile) => Json(&profile.0).into_response(),
        Err(SourceError::NotFound(_)) => {
            debug!(screen_name = %screen_name, "Profile not found");
            (
                StatusCode::NOT_FOUND,
                Json(json!({ "error": format!("No such user: {}", screen_name) })),
            )
                .into_response()
        }
        Err(e) => {
            warn!(screen_name = %screen_name, error = %e, "Profile lookup failed");
            metrics::record_error("profile");
            (
                StatusCode::BAD_GATEWAY,
                Json(json!({ "error": e.to_string() })),
            )
                .into_response()
        }
    }
}

/// WebSocket upgrade handler.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_websocket(socket, state))
}

/// Handle a WebSocket connection.
async fn handle_websocket(socket: WebSocket, state: Arc<AppState>) {
    // Record connection metrics
    let _metrics_guard = ConnectionMetricsGuard::new();

    let (mut sender, mut receiver) = socket.split();

    // Encoded items from the hub's delivery tasks
    let (tx, mut rx) = mpsc::unbounded_channel::<Encoded>();
    let encoding = state.config.transport.encoding;

    let subscribed = state.hub.subscribe(move |item: Arc<Item>| -> Result<(), DeliveryError> {
        let encoded = encoding
            .encode(item.payload())
            .map_err(|e| DeliveryError::Failed(e.to_string()))?;
        tx.send(encoded).map_err(|_| DeliveryError::Closed)
    });

    let handle = match subscribed {
        Ok(handle) => handle,
        Err(e) => {
            warn!(error = %e, "Rejecting WebSocket connection");
            metrics::record_error("subscribe");
            let _ = sender.send(Message::Close(None)).await;
            return;
        }
    };
    let subscription = handle.id();

    debug!(subscription, %encoding, "WebSocket connected");

    loop {
        tokio::select! {
            biased;

            // Items delivered by the hub
            encoded = rx.recv() => {
                let Some(encoded) = encoded else {
                    debug!(subscription, "Hub closed, dropping connection");
                    let _ = sender.send(Message::Close(None)).await;
                    break;
                };
                metrics::record_delivery(encoded.len(), encoding.as_str());
                let message = match encoded {
                    Encoded::Text(text) => Message::Text(text),
                    Encoded::Binary(data) => Message::Binary(data.into()),
                };
                if sender.send(message).await.is_err() {
                    break;
                }
            }

            // Receive from WebSocket
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) => {
                        debug!(subscription, "Received close frame");
                        break;
                    }
                    Some(Ok(_)) => {
                        // Clients only listen
                    }
                    Some(Err(e)) => {
                        warn!(subscription, error = %e, "WebSocket error");
                        metrics::record_error("websocket");
                        break;
                    }
                    None => {
                        debug!(subscription, "WebSocket stream ended");
                        break;
                    }
                }
            }
        }
    }

    // Cleanup: drop pending deliveries for this client
    state.hub.unsubscribe(&handle);
    metrics::record_hub_stats(&state.hub.stats());

    debug!(subscription, "WebSocket disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::to_bytes;
    use futures_util::stream;
    use relay_core::{DelayConfig, Profile};
    use serde_json::Value;
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};

    const WAIT: Duration = Duration::from_secs(5);

    struct StaticProfiles {
        fetches: AtomicUsize,
    }

    #[async_trait]
    impl ProfileSource for StaticProfiles {
        async fn fetch_profile(&self, screen_name: &str) -> Result<Profile, SourceError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            match screen_name {
                "down" => Err(SourceError::Unavailable("503 Service Unavailable".into())),
                "alice" => Ok(Profile::new(json!({ "screen_name": "alice", "followers": 7 }))),
                other => Err(SourceError::NotFound(other.to_string())),
            }
        }
    }

    fn state() -> (Arc<AppState>, Arc<StaticProfiles>) {
        let profiles = Arc::new(StaticProfiles {
            fetches: AtomicUsize::new(0),
        });
        let sequence = LogicalSequence::from_stream(stream::pending::<Result<Item, SourceError>>());
        let state = Arc::new(AppState::new(Config::default(), sequence, profiles.clone()));
        (state, profiles)
    }

    /// State over a channel-fed upstream with immediate delivery.
    fn live_state() -> (Arc<AppState>, mpsc::UnboundedSender<Item>) {
        let (tx, rx) = mpsc::unbounded_channel::<Item>();
        let sequence = LogicalSequence::from_stream(stream::unfold(rx, |mut rx| async move {
            rx.recv()
                .await
                .map(|item| (Ok::<_, SourceError>(item), rx))
        }));

        let mut config = Config::default();
        config.stream.delay = DelayConfig::fixed(Duration::ZERO);
        config.transport.websocket_path = "/stream".to_string();

        let profiles = Arc::new(StaticProfiles {
            fetches: AtomicUsize::new(0),
        });
        (Arc::new(AppState::new(config, sequence, profiles)), tx)
    }

    async fn serve(state: Arc<AppState>) -> SocketAddr {
        let router = app(state).unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, router).await });
        addr
    }

    /// Poll until `condition` holds or the wait runs out.
    async fn wait_until(mut condition: impl FnMut() -> bool) {
        tokio::time::timeout(WAIT, async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    async fn body_json(response: Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_user_found_and_cached() {
        let (state, profiles) = state();

        for _ in 0..2 {
            let response =
                user_handler(Path("alice".to_string()), State(Arc::clone(&state))).await;
            assert_eq!(response.status(), StatusCode::OK);
            let body = body_json(response).await;
            assert_eq!(body["screen_name"], "alice");
            assert_eq!(body["followers"], 7);
        }
        assert_eq!(profiles.fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_user_not_found() {
        let (state, _) = state();
        let response = user_handler(Path("ghost".to_string()), State(state)).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body = body_json(response).await;
        assert!(body["error"].as_str().unwrap().contains("ghost"));
    }

    #[tokio::test]
    async fn test_user_upstream_failure() {
        let (state, _) = state();
        let response = user_handler(Path("down".to_string()), State(state)).await;
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn test_health_reports_hub_state() {
        let (state, _) = state();

        let response = health_handler(State(Arc::clone(&state)))
            .await
            .into_response();
        let body = body_json(response).await;
        assert_eq!(body["status"], "degraded");
        assert_eq!(body["hub"]["state"], "unattached");

        state.hub.attach().unwrap();
        let response = health_handler(State(Arc::clone(&state)))
            .await
            .into_response();
        let body = body_json(response).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["hub"]["state"], "attached");
        assert_eq!(body["hub"]["subscribers"], 0);
    }

    #[test]
    fn test_cors_origin_validation() {
        assert!(cors_layer("twitter-stream.dev").is_ok());
        assert!(cors_layer("*").is_ok());
        assert!(cors_layer("bad\norigin").is_err());
    }

    #[tokio::test]
    async fn test_app_builds_with_default_config() {
        let (state, _) = state();
        assert!(app(state).is_ok());
    }

    #[test]
    fn test_websocket_path_validation() {
        assert!(validate_websocket_path("/").is_ok());
        assert!(validate_websocket_path("/stream").is_ok());
        assert!(validate_websocket_path("ws").is_err());
        assert!(validate_websocket_path("").is_err());
        assert!(validate_websocket_path("/health").is_err());
        assert!(validate_websocket_path("/user/feed").is_err());
        assert!(validate_websocket_path("/:room").is_err());
    }

    #[tokio::test]
    async fn test_app_rejects_colliding_websocket_path() {
        let (state, _) = state();
        let mut config = state.config.clone();
        config.transport.websocket_path = "/health".to_string();
        let sequence = LogicalSequence::from_stream(stream::pending::<Result<Item, SourceError>>());
        let profiles = Arc::new(StaticProfiles {
            fetches: AtomicUsize::new(0),
        });
        let colliding = Arc::new(AppState::new(config, sequence, profiles));
        assert!(app(colliding).is_err());
    }

    #[tokio::test]
    async fn test_websocket_replays_then_unsubscribes_on_disconnect() {
        let (state, upstream) = live_state();
        state.hub.attach().unwrap();
        for n in 1..=2 {
            upstream
                .send(Item::new(json!({ "id_str": n.to_string(), "text": format!("item {}", n) })))
                .unwrap();
        }
        wait_until(|| state.hub.stats().replay_len == 2).await;

        let addr = serve(Arc::clone(&state)).await;
        let (mut ws, _) = connect_async(format!("ws://{}/stream", addr)).await.unwrap();

        for n in 1..=2 {
            let frame = tokio::time::timeout(WAIT, ws.next()).await.unwrap().unwrap().unwrap();
            assert!(frame.is_text(), "expected a text frame, got {:?}", frame);
            let value: Value = serde_json::from_str(frame.to_text().unwrap()).unwrap();
            assert_eq!(value["id_str"], n.to_string());
        }
        assert_eq!(state.hub.subscriber_count(), 1);

        // Live items follow the replay window on the same socket
        upstream
            .send(Item::new(json!({ "id_str": "3", "text": "item 3" })))
            .unwrap();
        let frame = tokio::time::timeout(WAIT, ws.next()).await.unwrap().unwrap().unwrap();
        let value: Value = serde_json::from_str(frame.to_text().unwrap()).unwrap();
        assert_eq!(value["id_str"], "3");

        ws.send(WsMessage::Ping(vec![7])).await.unwrap();
        let pong = tokio::time::timeout(WAIT, async {
            loop {
                match ws.next().await {
                    Some(Ok(WsMessage::Pong(data))) => break data,
                    Some(Ok(_)) => continue,
                    other => panic!("socket ended before pong: {:?}", other),
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(pong, vec![7]);

        ws.close(None).await.unwrap();
        drop(ws);
        wait_until(|| state.hub.subscriber_count() == 0).await;
        assert_eq!(state.hub.stats().subscribers, 0);
    }

    #[tokio::test]
    async fn test_hub_close_closes_websocket() {
        let (state, _upstream) = live_state();
        state.hub.attach().unwrap();

        let addr = serve(Arc::clone(&state)).await;
        let (mut ws, _) = connect_async(format!("ws://{}/stream", addr)).await.unwrap();
        wait_until(|| state.hub.subscriber_count() == 1).await;

        state.hub.close();

        let closed = tokio::time::timeout(WAIT, async {
            loop {
                match ws.next().await {
                    Some(Ok(WsMessage::Close(_))) | None | Some(Err(_)) => break true,
                    Some(Ok(_)) => continue,
                }
            }
        })
        .await
        .unwrap();
        assert!(closed);
        assert_eq!(state.hub.subscriber_count(), 0);
    }
}
