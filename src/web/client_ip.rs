// Best-effort client address for logs and per-IP counters.
// Proxy headers are trusted as-is; the value is never used for authorization.

use axum::http::HeaderMap;

pub const UNKNOWN_IP: &str = "unknown";

/// Headers consulted in priority order.
const IP_HEADERS: [&str; 4] = [
    "cf-connecting-ip",
    "x-real-ip",
    "x-forwarded-for",
    "x-client-ip",
];

pub fn client_ip(headers: &HeaderMap) -> String {
    IP_HEADERS
        .iter()
        .find_map(|name| {
            let value = headers.get(*name)?.to_str().ok()?;
            // x-forwarded-for is a chain; the first hop is the client.
            let first = value.split(',').next()?.trim();
            (!first.is_empty()).then(|| first.to_string())
        })
        .unwrap_or_else(|| UNKNOWN_IP.to_string())
}
