//! Client identity derivation
//!
//! One rule serves both authorization and rate limiting: first non-empty of
//! the preferred sandbox identity header, the legacy track header, then the
//! first `X-Forwarded-For` entry. Consumer endpoints additionally require
//! one of the two headers (the IP fallback exists only so unauthenticated
//! junk still lands in a rate-limit bucket).

use actix_web::http::header::HeaderMap;

/// Preferred consumer identity header
pub const HEADER_SANDBOX_ID: &str = "X-Instruqt-Sandbox-ID";
/// Legacy consumer identity header
pub const HEADER_TRACK_ID: &str = "X-Track-ID";
/// Optional analytics tag stored as `track_name`
pub const HEADER_TRACK_NAME: &str = "X-Instruqt-Track-ID";
/// Optional claim-time candidate filter
pub const HEADER_NAME_PREFIX: &str = "X-Sandbox-Name-Prefix";

pub fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(String::from)
}

/// Identity required by consumer endpoints; `None` maps to 400
pub fn consumer_identity(headers: &HeaderMap) -> Option<String> {
    header_value(headers, HEADER_SANDBOX_ID).or_else(|| header_value(headers, HEADER_TRACK_ID))
}

/// Identity for rate limiting; falls back to the forwarded-for chain and
/// then the transport peer address
pub fn rate_limit_identity(headers: &HeaderMap, peer_addr: Option<&str>) -> String {
    if let Some(id) = consumer_identity(headers) {
        return id;
    }
    if let Some(forwarded) = header_value(headers, "X-Forwarded-For") {
        if let Some(first) = forwarded.split(',').next() {
            let first = first.trim();
            if !first.is_empty() {
                return first.to_string();
            }
        }
    }
    peer_addr.unwrap_or("unknown").to_string()
}
