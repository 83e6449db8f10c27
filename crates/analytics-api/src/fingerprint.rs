//! Actor fingerprints
//!
//! Callers are identified by a keyed one-way hash of their apparent network
//! address. The fingerprint is a stable pseudonymous join key for dedup and
//! distinct counting; the address itself is never stored.
//!
//! Forwarded headers are only honoured when the direct peer is a configured
//! trusted proxy, otherwise any client could pick its own fingerprint.

use axum::http::HeaderMap;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::net::IpAddr;
use toolpulse_analytics_core::{AnalyticsError, Result};
use tracing::{debug, warn};

type HmacSha256 = Hmac<Sha256>;

/// Length of the hex fingerprint kept after truncation
pub const FINGERPRINT_LEN: usize = 16;

/// Address used when neither a peer address nor a trusted header is available
const UNKNOWN_IP: &str = "unknown";

/// Fingerprint of the caller, attached to each request by middleware
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Actor(pub String);

/// hex(HMAC-SHA256(secret, ip)) truncated to [`FINGERPRINT_LEN`] characters
pub fn actor_fingerprint(secret: &str, ip: &str) -> Result<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| AnalyticsError::Other(format!("invalid fingerprint key: {}", e)))?;
    mac.update(ip.as_bytes());
    let mut digest = hex::encode(mac.finalize().into_bytes());
    digest.truncate(FINGERPRINT_LEN);
    Ok(digest)
}

fn header_value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

/// Resolve the caller's address.
///
/// When `peer` is a trusted proxy, `cf-connecting-ip` is preferred, then the
/// first `x-forwarded-for` entry, then `x-real-ip`. Otherwise the peer
/// address is used as is.
pub fn client_ip(headers: &HeaderMap, peer: Option<IpAddr>, trusted_proxies: &[String]) -> String {
    let Some(peer_ip) = peer else {
        return UNKNOWN_IP.to_string();
    };
    let peer_ip_str = peer_ip.to_string();

    if trusted_proxies.iter().any(|p| *p == peer_ip_str) {
        if let Some(ip) = header_value(headers, "cf-connecting-ip") {
            return ip.to_string();
        }

        if let Some(forwarded) = header_value(headers, "x-forwarded-for") {
            if let Some(client_ip) = forwarded.split(',').next() {
                let client_ip = client_ip.trim();
                if !client_ip.is_empty() {
                    debug!(client_ip, peer_ip = %peer_ip_str, "Extracted IP from X-Forwarded-For");
                    return client_ip.to_string();
                }
            }
        }

        if let Some(ip) = header_value(headers, "x-real-ip") {
            return ip.to_string();
        }
    } else if headers.contains_key("x-forwarded-for") {
        warn!(
            peer_ip = %peer_ip_str,
            "Request not from trusted proxy, ignoring forwarded headers"
        );
    }

    peer_ip_str
}
