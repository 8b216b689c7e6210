//! HTTP client for the upstream search, stream and profile endpoints.
//!
//! Requests are signed with OAuth 1.0a user-context credentials when they
//! are configured, otherwise they carry the bearer token if there is one.
//! Search and profile lookups are bounded by the request timeout; the live
//! stream is a long-lived newline-delimited JSON response and is not.

use crate::config::UpstreamConfig;
use crate::oauth;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures_util::stream::{self, Stream, StreamExt};
use relay_core::{Item, LiveStream, Profile, ProfileSource, SourceError, Upstream};
use relay_protocol::{codec, ProtocolError};
use reqwest::header::AUTHORIZATION;
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use std::fmt::Display;
use std::time::Duration;
use tracing::{debug, info, warn};

const SEARCH_PATH: &str = "search/tweets.json";
const FILTER_PATH: &str = "statuses/filter.json";
const PROFILE_PATH: &str = "users/show.json";

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    statuses: Vec<Value>,
}

/// Client for the upstream REST and streaming APIs.
pub struct TwitterClient {
    http: reqwest::Client,
    config: UpstreamConfig,
}

impl TwitterClient {
    /// Create a client.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(config: UpstreamConfig) -> Result<Self, reqwest::Error> {
        if config.oauth.is_some() {
            info!("Signing upstream requests with OAuth 1.0a credentials");
        } else if config.bearer_token.is_none() {
            warn!("No upstream credentials configured, requests will be unauthenticated");
        }
        let http = reqwest::Client::builder()
            .user_agent(concat!("relay/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { http, config })
    }

    /// Build a request carrying `params` in its query string, signed or
    /// authorized with whichever credentials are configured.
    fn request(
        &self,
        method: Method,
        url: &str,
        params: &[(&str, &str)],
    ) -> Result<RequestBuilder, SourceError> {
        let request = self.http.request(method.clone(), url).query(params);

        if let Some(credentials) = &self.config.oauth {
            let header = oauth::authorization_header(credentials, method.as_str(), url, params)
                .map_err(|e| SourceError::Unavailable(format!("OAuth signing failed: {}", e)))?;
            return Ok(request.header(AUTHORIZATION, header));
        }

        Ok(match &self.config.bearer_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        })
    }

    async fn send(
        &self,
        method: Method,
        url: &str,
        params: &[(&str, &str)],
        timeout: Option<Duration>,
    ) -> Result<Response, SourceError> {
        let mut request = self.request(method, url, params)?;
        if let Some(timeout) = timeout {
            request = request.timeout(timeout);
        }

        let response = request
            .send()
            .await
            .map_err(|e| SourceError::Unavailable(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(status_error(status, response.url().path()));
        }
        Ok(response)
    }
}

/// Join a base URL and a relative path.
fn endpoint(base: &str, path: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), path)
}

fn status_error(status: StatusCode, path: &str) -> SourceError {
    if status == StatusCode::NOT_FOUND {
        SourceError::NotFound(path.to_string())
    } else {
        SourceError::Unavailable(format!("{} returned {}", path, status))
    }
}

#[async_trait]
impl Upstream for TwitterClient {
    async fn historical_search(&self, query: &str) -> Result<Vec<Item>, SourceError> {
        let url = endpoint(&self.config.api_base, SEARCH_PATH);
        debug!(%url, query, "Searching upstream");

        let timeout = Some(self.config.request_timeout());
        let body: SearchResponse = self
            .send(Method::GET, &url, &[("q", query)], timeout)
            .await
            .map_err(SourceError::into_unavailable)?
            .json()
            .await
            .map_err(|e| SourceError::Decode(e.to_string()))?;

        debug!(results = body.statuses.len(), "Search complete");
        Ok(body.statuses.into_iter().map(Item::new).collect())
    }

    async fn open_live_stream(&self, query: &str) -> Result<LiveStream, SourceError> {
        let url = endpoint(&self.config.stream_base, FILTER_PATH);
        let response = self
            .send(Method::POST, &url, &[("track", query)], None)
            .await
            .map_err(SourceError::into_unavailable)?;

        info!(%url, query, "Live stream connected");
        Ok(decode_live(response.bytes_stream().boxed()))
    }
}

#[async_trait]
impl ProfileSource for TwitterClient {
    async fn fetch_profile(&self, screen_name: &str) -> Result<Profile, SourceError> {
        let url = endpoint(&self.config.api_base, PROFILE_PATH);
        let timeout = Some(self.config.request_timeout());

        let record: Value = match self
            .send(Method::GET, &url, &[("screen_name", screen_name)], timeout)
            .await
        {
            Ok(response) => response
                .json()
                .await
                .map_err(|e| SourceError::Decode(e.to_string()))?,
            Err(SourceError::NotFound(_)) => {
                return Err(SourceError::NotFound(screen_name.to_string()))
            }
            Err(e) => return Err(e),
        };
        Ok(Profile::new(record))
    }
}

struct LiveDecoder<S> {
    body: S,
    buf: BytesMut,
    done: bool,
}

/// Turn a chunked newline-delimited JSON body into a stream of items.
///
/// Keep-alive lines are skipped. A malformed record is logged and dropped;
/// a transport error or an oversized record ends the stream with an error.
fn decode_live<S, E>(body: S) -> LiveStream
where
    S: Stream<Item = Result<Bytes, E>> + Send + Unpin + 'static,
    E: Display + Send + 'static,
{
    let state = LiveDecoder {
        body,
        buf: BytesMut::new(),
        done: false,
    };

    stream::unfold(state, |mut state| async move {
        loop {
            if state.done {
                return None;
            }

            match codec::decode_from(&mut state.buf) {
                Ok(Some(record)) => return Some((Ok(Item::new(record)), state)),
                Ok(None) => {}
                Err(ProtocolError::Decode(e)) => {
                    warn!(error = %e, "Skipping malformed upstream record");
                    continue;
                }
                Err(e) => {
                    state.done = true;
                    return Some((Err(SourceError::Decode(e.to_string())), state));
                }
            }

            match state.body.next().await {
                Some(Ok(chunk)) => state.buf.extend_from_slice(&chunk),
                Some(Err(e)) => {
                    state.done = true;
                    return Some((Err(SourceError::Unavailable(e.to_string())), state));
                }
                None => {
                    state.done = true;
                    match codec::decode_eof(&mut state.buf) {
                        Ok(Some(record)) => return Some((Ok(Item::new(record)), state)),
                        Ok(None) => return None,
                        Err(e) => {
                            warn!(error = %e, "Discarding truncated upstream record");
                            return None;
                        }
                    }
                }
            }
        }
    })
    .boxed()
}
