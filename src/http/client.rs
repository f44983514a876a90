//! Client identification and header sanitation.

use axum::extract::{ConnectInfo, FromRequestParts};
use axum::http::request::Parts;
use axum::http::HeaderMap;
use std::convert::Infallible;
use std::net::{IpAddr, SocketAddr};

/// Longest header value kept for logging, in bytes.
pub const MAX_INPUT_LEN: usize = 500;

/// Identifier used when no address can be determined.
pub const UNKNOWN_CLIENT: &str = "unknown";

/// The caller's IP address as a rate limiting key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIp(pub String);

impl<S> FromRequestParts<S> for ClientIp
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let peer = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| *addr);
        Ok(ClientIp(extract_client_ip(&parts.headers, peer)))
    }
}

/// Resolve the client address.
///
/// Precedence: first `X-Forwarded-For` entry, then `X-Real-IP`, then the
/// peer socket address. Header values that do not parse as an IP address
/// are ignored.
pub fn extract_client_ip(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|xff| xff.split(',').next())
        .and_then(parse_ip);
    if let Some(ip) = forwarded {
        return ip.to_string();
    }

    let real_ip = headers
        .get("x-real-ip")
        .and_then(|v| v.to_str().ok())
        .and_then(parse_ip);
    if let Some(ip) = real_ip {
        return ip.to_string();
    }

    peer.map(|addr| addr.ip().to_string())
        .unwrap_or_else(|| UNKNOWN_CLIENT.to_string())
}

fn parse_ip(raw: &str) -> Option<IpAddr> {
    raw.trim().parse().ok()
}

/// Strip line breaks and tabs, then cap the length at [`MAX_INPUT_LEN`] bytes.
pub fn sanitize_input(input: &str) -> String {
    let mut cleaned: String = input
        .chars()
        .filter(|c| !matches!(c, '\n' | '\r' | '\t'))
        .collect();

    if cleaned.len() > MAX_INPUT_LEN {
        let mut cut = MAX_INPUT_LEN;
        while !cleaned.is_char_boundary(cut) {
            cut -= 1;
        }
        cleaned.truncate(cut);
    }
    cleaned
}
