// Request screening applied to every route: pattern-based blocking of
// obviously hostile requests, an optional per-IP burst limiter, HTTPS
// redirection behind a proxy, and the static security response headers.

use super::{AppState, client_ip::client_ip, error::ApiError};
use axum::{
    extract::{Request, State},
    http::{HeaderName, HeaderValue, header},
    middleware::Next,
    response::{IntoResponse, Redirect, Response},
};
use dashmap::DashMap;
use regex::Regex;
use std::sync::LazyLock;
use std::time::{Duration, Instant};
use tracing::{info, warn};

pub const BLOCKED_MESSAGE: &str = "Request blocked for security reasons";

static SUSPICIOUS_USER_AGENTS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)bot|crawler|spider|scraper").unwrap());
static ALLOWED_TOOLS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)curl|wget|postman|insomnia").unwrap());
static SQL_INJECTION: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?i)union.*select",
        r"(?i)drop.*table",
        r"(?i)insert.*into",
        r"(?i)delete.*from",
        r"(?i)update.*set",
    ]
    .iter()
    .map(|p| Regex::new(p).unwrap())
    .collect()
});
static XSS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?i)<script",
        r"(?i)javascript:",
        r"(?i)vbscript:",
        r"(?i)on\w+\s*=",
    ]
    .iter()
    .map(|p| Regex::new(p).unwrap())
    .collect()
});

/// Why a request was blocked outright.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockReason {
    SuspiciousUserAgent,
    PathTraversal,
    SqlInjection,
    Xss,
}

impl BlockReason {
    fn as_str(self) -> &'static str {
        match self {
            BlockReason::SuspiciousUserAgent => "Suspicious User-Agent",
            BlockReason::PathTraversal => "Path traversal attempt",
            BlockReason::SqlInjection => "SQL injection attempt",
            BlockReason::Xss => "XSS attempt",
        }
    }
}

/// Screens the user agent, the raw path and the raw query string.
pub fn screen_request(user_agent: &str, path: &str, query: &str) -> Option<BlockReason> {
    if SUSPICIOUS_USER_AGENTS.is_match(user_agent) && !ALLOWED_TOOLS.is_match(user_agent) {
        return Some(BlockReason::SuspiciousUserAgent);
    }
    if path.contains("..") || path.contains('\\') {
        return Some(BlockReason::PathTraversal);
    }
    // Percent-encoded payloads are checked in decoded form as well.
    let decoded_path = urlencoding::decode(path).map(|p| p.into_owned()).unwrap_or_default();
    let decoded_query = urlencoding::decode(&query.replace('+', " "))
        .map(|q| q.into_owned())
        .unwrap_or_default();
    let targets = [path, query, decoded_path.as_str(), decoded_query.as_str()];
    let hits = |patterns: &[Regex]| {
        patterns
            .iter()
            .any(|p| targets.iter().any(|t| p.is_match(t)))
    };
    if hits(SQL_INJECTION.as_slice()) {
        return Some(BlockReason::SqlInjection);
    }
    if hits(XSS.as_slice()) {
        return Some(BlockReason::Xss);
    }
    None
}

pub async fn block_suspicious_requests(request: Request, next: Next) -> Response {
    let user_agent = request
        .headers()
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    let uri = request.uri();
    if let Some(reason) = screen_request(user_agent, uri.path(), uri.query().unwrap_or("")) {
        warn!(
            target: "security",
            event = "request_blocked",
            reason = reason.as_str(),
            ip = %client_ip(request.headers()),
            path = uri.path(),
            "Security block"
        );
        return ApiError::Forbidden(BLOCKED_MESSAGE.to_string()).into_response();
    }
    next.run(request).await
}

/// Per-key fixed window counter.
pub struct IpRateLimiter {
    windows: DashMap<String, (Instant, u32)>,
}

/// Burst budget for a family of paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpLimit {
    pub family: &'static str,
    pub max_requests: u32,
    pub window: Duration,
}

pub fn ip_limit_for(path: &str) -> IpLimit {
    if path.starts_with("/process/") {
        IpLimit {
            family: "process",
            max_requests: 5,
            window: Duration::from_secs(60),
        }
    } else {
        IpLimit {
            family: "default",
            max_requests: 10,
            window: Duration::from_secs(60),
        }
    }
}

impl IpRateLimiter {
    pub fn new() -> Self {
        Self {
            windows: DashMap::new(),
        }
    }

    /// Counts one request for `key`; false when the window is already full.
    pub fn check(&self, key: &str, limit: u32, window: Duration) -> bool {
        self.check_at(key, limit, window, Instant::now())
    }

    fn check_at(&self, key: &str, limit: u32, window: Duration, now: Instant) -> bool {
        let mut entry = self.windows.entry(key.to_string()).or_insert((now, 0));
        let (started, count) = &mut *entry;
        if now.duration_since(*started) >= window {
            *started = now;
            *count = 0;
        }
        if *count >= limit {
            return false;
        }
        *count += 1;
        true
    }

    /// Forgets windows that started more than `max_age` ago.
    pub fn purge_older_than(&self, max_age: Duration) {
        let now = Instant::now();
        self.windows
            .retain(|_, (started, _)| now.duration_since(*started) < max_age);
    }
}

impl Default for IpRateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

pub async fn limit_per_ip(State(state): State<AppState>, request: Request, next: Next) -> Response {
    if let Some(limiter) = &state.ip_limiter {
        let path = request.uri().path();
        let limit = ip_limit_for(path);
        let ip = client_ip(request.headers());
        let key = format!("{}|{}", limit.family, ip);
        if !limiter.check(&key, limit.max_requests, limit.window) {
            warn!(
                target: "security",
                event = "ip_rate_limit_exceeded",
                ip = %ip,
                path = path,
                "Rate limit exceeded"
            );
            return ApiError::TooManyRequests("Rate limit exceeded".to_string()).into_response();
        }
    }
    next.run(request).await
}

pub async fn redirect_to_https(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    if state.settings.force_https {
        let forwarded_proto = request
            .headers()
            .get("x-forwarded-proto")
            .and_then(|v| v.to_str().ok());
        let host = request
            .headers()
            .get(header::HOST)
            .and_then(|v| v.to_str().ok());
        if let (Some("http"), Some(host)) = (forwarded_proto, host) {
            let path_and_query = request
                .uri()
                .path_and_query()
                .map(|pq| pq.as_str())
                .unwrap_or("/");
            let target = format!("https://{}{}", host, path_and_query);
            info!("Redirecting plain HTTP request to {}", target);
            return Redirect::permanent(&target).into_response();
        }
    }
    next.run(request).await
}

/// Static headers set on every response.
pub fn security_headers() -> Vec<(HeaderName, HeaderValue)> {
    vec![
        (header::X_FRAME_OPTIONS, HeaderValue::from_static("DENY")),
        (
            header::X_CONTENT_TYPE_OPTIONS,
            HeaderValue::from_static("nosniff"),
        ),
        (
            header::REFERRER_POLICY,
            HeaderValue::from_static("strict-origin-when-cross-origin"),
        ),
        (
            header::X_XSS_PROTECTION,
            HeaderValue::from_static("1; mode=block"),
        ),
        (
            header::STRICT_TRANSPORT_SECURITY,
            HeaderValue::from_static("max-age=31536000; includeSubDomains"),
        ),
        (
            header::CONTENT_SECURITY_POLICY,
            HeaderValue::from_static(
                "default-src 'none'; img-src 'self' data: https:; object-src 'none'; base-uri 'self'; frame-ancestors 'none'",
            ),
        ),
        (
            HeaderName::from_static("permissions-policy"),
            HeaderValue::from_static("camera=(), microphone=(), geolocation=()"),
        ),
        (
            header::X_DNS_PREFETCH_CONTROL,
            HeaderValue::from_static("off"),
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bot_user_agents() {
        assert_eq!(
            screen_request("Googlebot/2.1", "/", ""),
            Some(BlockReason::SuspiciousUserAgent)
        );
        assert_eq!(screen_request("curl/8.0 (bot-ish)", "/", ""), None);
        assert_eq!(screen_request("Mozilla/5.0", "/", ""), None);
    }

    #[test]
    fn test_path_and_query_patterns() {
        assert_eq!(
            screen_request("ua", "/a/../b", ""),
            Some(BlockReason::PathTraversal)
        );
        assert_eq!(
            screen_request("ua", "/usage", "q=1%20UNION%20SELECT%20*"),
            Some(BlockReason::SqlInjection)
        );
        assert_eq!(
            screen_request("ua", "/usage", "q=%3Cscript%3E"),
            Some(BlockReason::Xss)
        );
        assert_eq!(
            screen_request("ua", "/usage", "x=javascript:alert(1)"),
            Some(BlockReason::Xss)
        );
        assert_eq!(screen_request("ua", "/process/remove", ""), None);
    }

    #[test]
    fn test_fixed_window() {
        let limiter = IpRateLimiter::new();
        let start = Instant::now();
        let window = Duration::from_secs(60);
        for _ in 0..3 {
            assert!(limiter.check_at("1.1.1.1", 3, window, start));
        }
        assert!(!limiter.check_at("1.1.1.1", 3, window, start));
        assert!(limiter.check_at("2.2.2.2", 3, window, start));
        assert!(limiter.check_at("1.1.1.1", 3, window, start + window));
    }

    #[test]
    fn test_limits_per_path() {
        assert_eq!(ip_limit_for("/process/enhance").max_requests, 5);
        assert_eq!(ip_limit_for("/feedback").max_requests, 10);
        assert_ne!(
            ip_limit_for("/process/remove").family,
            ip_limit_for("/usage").family
        );
    }
}
