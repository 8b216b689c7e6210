//! OAuth 1.0a user-context request signing (HMAC-SHA1).
//!
//! Both the query parameters and the protocol parameters go into the
//! signature base string, so callers pass the exact parameters the request
//! will carry.

use crate::config::OAuthCredentials;
use base64::{engine::general_purpose, Engine as _};
use hmac::{digest::InvalidLength, Hmac, Mac};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use rand::{distr::Alphanumeric, Rng};
use sha1::Sha1;
use std::time::{SystemTime, UNIX_EPOCH};

/// Everything except the RFC 3986 unreserved characters is escaped.
const UNRESERVED: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

const NONCE_LEN: usize = 32;

fn encode(value: &str) -> String {
    utf8_percent_encode(value, UNRESERVED).to_string()
}

/// Build the `Authorization` header value for one request.
///
/// `url` is the request URL without its query string; `params` are the
/// query (or form) parameters sent with it.
///
/// # Errors
///
/// Returns an error if the signing key is rejected by the MAC.
pub fn authorization_header(
    credentials: &OAuthCredentials,
    method: &str,
    url: &str,
    params: &[(&str, &str)],
) -> Result<String, InvalidLength> {
    let nonce: String = rand::rng()
        .sample_iter(Alphanumeric)
        .take(NONCE_LEN)
        .map(char::from)
        .collect();
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default();

    sign(credentials, method, url, params, &nonce, timestamp)
}

fn sign(
    credentials: &OAuthCredentials,
    method: &str,
    url: &str,
    params: &[(&str, &str)],
    nonce: &str,
    timestamp: u64,
) -> Result<String, InvalidLength> {
    let timestamp = timestamp.to_string();
    let mut protocol = vec![
        ("oauth_consumer_key", credentials.consumer_key.as_str()),
        ("oauth_nonce", nonce),
        ("oauth_signature_method", "HMAC-SHA1"),
        ("oauth_timestamp", timestamp.as_str()),
        ("oauth_token", credentials.access_token_key.as_str()),
        ("oauth_version", "1.0"),
    ];

    let all: Vec<(&str, &str)> = params.iter().chain(protocol.iter()).copied().collect();
    let signature = signature(credentials, method, url, &all)?;
    protocol.push(("oauth_signature", signature.as_str()));
    protocol.sort_unstable_by_key(|(key, _)| *key);

    let fields: Vec<String> = protocol
        .iter()
        .map(|(key, value)| format!("{}=\"{}\"", encode(key), encode(value)))
        .collect();
    Ok(format!("OAuth {}", fields.join(", ")))
}

fn signature(
    credentials: &OAuthCredentials,
    method: &str,
    url: &str,
    params: &[(&str, &str)],
) -> Result<String, InvalidLength> {
    let mut encoded: Vec<(String, String)> = params
        .iter()
        .map(|(key, value)| (encode(key), encode(value)))
        .collect();
    encoded.sort();

    let parameters = encoded
        .iter()
        .map(|(key, value)| format!("{}={}", key, value))
        .collect::<Vec<_>>()
        .join("&");
    let base = format!(
        "{}&{}&{}",
        method.to_ascii_uppercase(),
        encode(url),
        encode(&parameters)
    );
    let key = format!(
        "{}&{}",
        encode(&credentials.consumer_secret),
        encode(&credentials.access_token_secret)
    );

    let mut mac = Hmac::<Sha1>::new_from_slice(key.as_bytes())?;
    mac.update(base.as_bytes());
    Ok(general_purpose::STANDARD.encode(mac.finalize().into_bytes()))
}
