//! HTTP request logging
//!
//! Logs method, path, status, duration and client ip for every request.
//! The client ip is the first `X-Forwarded-For` entry when a proxy sits in
//! front, else the peer address.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use axum::{
    body::Body,
    extract::ConnectInfo,
    http::{HeaderMap, Request},
    middleware::Next,
    response::Response,
};

const SLOW_REQUEST: Duration = Duration::from_secs(1);

pub async fn request_logging_middleware(request: Request<Body>, next: Next) -> Response {
    let start = Instant::now();

    let method = request.method().to_string();
    let uri = request.uri().path().to_string();
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let client_ip = client_ip(request.headers(), peer);
    let user_agent = request
        .headers()
        .get("user-agent")
        .and_then(|h| h.to_str().ok())
        .unwrap_or("")
        .to_string();

    let response = next.run(request).await;

    let elapsed = start.elapsed();
    let status = response.status().as_u16();
    let user_agent = truncate_string(&user_agent, 128);

    if elapsed >= SLOW_REQUEST {
        tracing::warn!(
            "{} {} {} {}ms from {} ({}) slow",
            method,
            uri,
            status,
            elapsed.as_millis(),
            client_ip,
            user_agent
        );
    } else {
        tracing::info!(
            "{} {} {} {}ms from {} ({})",
            method,
            uri,
            status,
            elapsed.as_millis(),
            client_ip,
            user_agent
        );
    }

    response
}

fn client_ip(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|h| h.to_str().ok())
        .and_then(|s| s.split(',').next())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .or_else(|| peer.map(|addr| addr.ip().to_string()))
        .unwrap_or_else(|| "unknown".to_string())
}

/// Truncate a string to max length, adding ... if truncated
fn truncate_string(s: &str, max_len: usize) -> String {
    if s.len() <= max_len {
        return s.to_string();
    }
    let mut end = max_len.saturating_sub(3);
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &s[..end])
}
