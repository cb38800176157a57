// Identity resolution against the managed auth service.
// The server never mints or modifies sessions: it only reads the access token
// the browser already carries (bearer header or auth cookie) and asks the auth
// service who it belongs to.

use async_trait::async_trait;
use axum::http::{HeaderMap, StatusCode, header};
use axum_extra::extract::CookieJar;
use base64::prelude::{BASE64_STANDARD, BASE64_URL_SAFE_NO_PAD, Engine as _};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;

/// An authenticated user. `email` is the stable quota key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub user_id: String,
    pub email: String,
}

#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("identity provider is not configured: {0}")]
    NotConfigured(&'static str),
    #[error("identity provider request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("identity provider returned {0}")]
    UnexpectedStatus(StatusCode),
}

#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Resolves the caller's session. `Ok(None)` means anonymous.
    async fn get_session(&self, headers: &HeaderMap) -> Result<Option<Session>, IdentityError>;
}

pub type SharedIdentityProvider = Arc<dyn IdentityProvider>;

/// Used when no auth service is configured. Every lookup is a deployment error.
pub struct UnconfiguredIdentityProvider;

#[async_trait]
impl IdentityProvider for UnconfiguredIdentityProvider {
    async fn get_session(&self, _headers: &HeaderMap) -> Result<Option<Session>, IdentityError> {
        Err(IdentityError::NotConfigured(
            "SUPABASE_URL and SUPABASE_ANON_KEY must be set",
        ))
    }
}

/// Supabase GoTrue client. Validates the access token with `GET /auth/v1/user`.
pub struct SupabaseIdentityProvider {
    client: reqwest::Client,
    base_url: String,
    anon_key: String,
}

#[derive(Deserialize)]
struct SupabaseUser {
    id: String,
    email: Option<String>,
}

impl SupabaseIdentityProvider {
    pub fn new(base_url: &str, anon_key: &str, timeout: Duration) -> Result<Self, IdentityError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            anon_key: anon_key.to_string(),
        })
    }
}

#[async_trait]
impl IdentityProvider for SupabaseIdentityProvider {
    async fn get_session(&self, headers: &HeaderMap) -> Result<Option<Session>, IdentityError> {
        let Some(token) = extract_access_token(headers) else {
            return Ok(None);
        };

        let response = self
            .client
            .get(format!("{}/auth/v1/user", self.base_url))
            .header("apikey", &self.anon_key)
            .bearer_auth(token)
            .send()
            .await?;

        match response.status() {
            StatusCode::OK => {}
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => return Ok(None),
            other => return Err(IdentityError::UnexpectedStatus(other)),
        }

        let user: SupabaseUser = response.json().await?;
        // Quota is keyed by email; accounts without one cannot use the service.
        Ok(user
            .email
            .filter(|e| !e.is_empty())
            .map(|email| Session {
                user_id: user.id,
                email,
            }))
    }
}

/// Finds the access token: `Authorization: Bearer` first, then the
/// `sb-<project>-auth-token` cookie (possibly split into `.0`, `.1`, ... chunks).
pub fn extract_access_token(headers: &HeaderMap) -> Option<String> {
    if let Some(token) = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
    {
        return Some(token.to_string());
    }

    let jar = CookieJar::from_headers(headers);
    let mut chunks: Vec<(String, String)> = jar
        .iter()
        .filter(|c| is_auth_cookie_name(c.name()))
        .map(|c| (c.name().to_string(), c.value().to_string()))
        .collect();
    if chunks.is_empty() {
        return None;
    }
    chunks.sort_by_key(|(name, _)| chunk_index(name));
    let raw: String = chunks.into_iter().map(|(_, value)| value).collect();

    parse_auth_cookie(&raw)
}

fn is_auth_cookie_name(name: &str) -> bool {
    let base = match name.rsplit_once('.') {
        Some((base, idx)) if idx.parse::<u32>().is_ok() => base,
        _ => name,
    };
    base.starts_with("sb-") && base.ends_with("-auth-token")
}

fn chunk_index(name: &str) -> u32 {
    name.rsplit_once('.')
        .and_then(|(_, idx)| idx.parse().ok())
        .unwrap_or(0)
}

fn parse_auth_cookie(raw: &str) -> Option<String> {
    let json = if let Some(encoded) = raw.strip_prefix("base64-") {
        let bytes = BASE64_URL_SAFE_NO_PAD
            .decode(encoded.trim_end_matches('='))
            .or_else(|_| BASE64_STANDARD.decode(encoded))
            .ok()?;
        String::from_utf8(bytes).ok()?
    } else {
        urlencoding::decode(raw).ok()?.into_owned()
    };

    let value: serde_json::Value = serde_json::from_str(&json).ok()?;
    // Current cookie format is a session object; older clients stored an
    // array whose first element is the access token.
    let token = match &value {
        serde_json::Value::Object(map) => map.get("access_token")?.as_str()?,
        serde_json::Value::Array(items) => items.first()?.as_str()?,
        _ => return None,
    };
    Some(token.to_string()).filter(|t| !t.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers_with(name: header::HeaderName, value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(name, HeaderValue::from_str(value).unwrap());
        headers
    }

    #[test]
    fn test_bearer_header_wins() {
        let mut headers = headers_with(header::AUTHORIZATION, "Bearer abc.def");
        headers.insert(
            header::COOKIE,
            HeaderValue::from_static("sb-proj-auth-token=%5B%22other%22%5D"),
        );
        assert_eq!(extract_access_token(&headers).as_deref(), Some("abc.def"));
    }

    #[test]
    fn test_base64_session_cookie() {
        let session = r#"{"access_token":"tok-123","refresh_token":"r"}"#;
        let cookie = format!(
            "other=1; sb-proj-auth-token=base64-{}",
            BASE64_URL_SAFE_NO_PAD.encode(session)
        );
        let headers = headers_with(header::COOKIE, &cookie);
        assert_eq!(extract_access_token(&headers).as_deref(), Some("tok-123"));
    }

    #[test]
    fn test_chunked_cookie_is_reassembled_in_order() {
        let session = r#"{"access_token":"chunked-token"}"#;
        let encoded = format!("base64-{}", BASE64_URL_SAFE_NO_PAD.encode(session));
        let (first, second) = encoded.split_at(12);
        let cookie = format!("sb-proj-auth-token.1={second}; sb-proj-auth-token.0={first}");
        let headers = headers_with(header::COOKIE, &cookie);
        assert_eq!(
            extract_access_token(&headers).as_deref(),
            Some("chunked-token")
        );
    }

    #[test]
    fn test_legacy_array_cookie() {
        let cookie = format!(
            "sb-proj-auth-token={}",
            urlencoding::encode(r#"["legacy-token","refresh"]"#)
        );
        let headers = headers_with(header::COOKIE, &cookie);
        assert_eq!(
            extract_access_token(&headers).as_deref(),
            Some("legacy-token")
        );
    }

    #[test]
    fn test_no_token() {
        assert!(extract_access_token(&HeaderMap::new()).is_none());
        let headers = headers_with(header::COOKIE, "sb-proj-auth-token=not-json");
        assert!(extract_access_token(&headers).is_none());
        let headers = headers_with(header::AUTHORIZATION, "Basic dXNlcg==");
        assert!(extract_access_token(&headers).is_none());
    }

    #[tokio::test]
    async fn test_unconfigured_provider_errors() {
        let result = UnconfiguredIdentityProvider
            .get_session(&HeaderMap::new())
            .await;
        assert!(matches!(result, Err(IdentityError::NotConfigured(_))));
    }
}
