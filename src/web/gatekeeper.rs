// Request admission.
// Cheap header checks run first, in a fixed order, and the identity lookup
// runs last, so nothing expensive happens for a request that is going to be
// turned away anyway. Every rejection is logged as a security event.

use super::client_ip::client_ip;
use super::error::ApiError;
use crate::config::Settings;
use crate::identity::{IdentityError, IdentityProvider, Session};
use axum::{
    extract::Request,
    http::{HeaderMap, header},
};
use headers::HeaderMapExt;
use tracing::{info, warn};

pub const MAX_USER_AGENT_CHARS: usize = 500;

/// What an endpoint accepts.
#[derive(Debug, Clone)]
pub struct EndpointPolicy {
    pub path: &'static str,
    /// Required media type essence, e.g. `multipart/form-data`. `None` skips the check.
    pub content_type: Option<&'static str>,
    pub max_content_length: u64,
    pub require_identity: bool,
}

impl EndpointPolicy {
    pub fn upload(path: &'static str, settings: &Settings) -> Self {
        Self {
            path,
            content_type: Some("multipart/form-data"),
            max_content_length: settings.max_upload_bytes,
            require_identity: true,
        }
    }

    pub fn json(path: &'static str, settings: &Settings) -> Self {
        Self {
            path,
            content_type: Some("application/json"),
            max_content_length: settings.max_json_bytes,
            require_identity: false,
        }
    }

    /// Bodiless, authenticated reads.
    pub fn query(path: &'static str, settings: &Settings) -> Self {
        Self {
            path,
            content_type: None,
            max_content_length: settings.max_json_bytes,
            require_identity: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    InvalidContentType,
    InvalidUserAgent,
    PayloadTooLarge,
    Unauthenticated,
}

impl Rejection {
    fn message(self) -> &'static str {
        match self {
            Rejection::InvalidContentType => "Unsupported Content-Type",
            Rejection::InvalidUserAgent => "Invalid User-Agent",
            Rejection::PayloadTooLarge => "Request body too large",
            Rejection::Unauthenticated => "Not authenticated",
        }
    }

    fn event(self) -> &'static str {
        match self {
            Rejection::Unauthenticated => "unauthorized_access",
            _ => "invalid_headers",
        }
    }
}

impl From<Rejection> for ApiError {
    fn from(rejection: Rejection) -> Self {
        match rejection {
            Rejection::Unauthenticated => ApiError::Unauthorized(rejection.message().into()),
            _ => ApiError::BadRequest(rejection.message().into()),
        }
    }
}

type HeaderRule = fn(&HeaderMap, &EndpointPolicy) -> Result<(), Rejection>;

/// Evaluated in order; the first failure wins.
const HEADER_RULES: [(&str, HeaderRule); 3] = [
    ("content_type", check_content_type),
    ("user_agent", check_user_agent),
    ("content_length", check_content_length),
];

fn check_content_type(headers: &HeaderMap, policy: &EndpointPolicy) -> Result<(), Rejection> {
    let Some(expected) = policy.content_type else {
        return Ok(());
    };
    let mime: mime::Mime = headers
        .typed_get::<headers::ContentType>()
        .ok_or(Rejection::InvalidContentType)?
        .into();
    if mime.essence_str().eq_ignore_ascii_case(expected) {
        Ok(())
    } else {
        Err(Rejection::InvalidContentType)
    }
}

fn check_user_agent(headers: &HeaderMap, _policy: &EndpointPolicy) -> Result<(), Rejection> {
    let user_agent = headers
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .filter(|ua| !ua.is_empty())
        .ok_or(Rejection::InvalidUserAgent)?;
    if user_agent.chars().count() > MAX_USER_AGENT_CHARS {
        return Err(Rejection::InvalidUserAgent);
    }
    Ok(())
}

// Only the declared length is checked here; the body limit layer enforces the
// actual size while streaming.
fn check_content_length(headers: &HeaderMap, policy: &EndpointPolicy) -> Result<(), Rejection> {
    match headers.typed_get::<headers::ContentLength>() {
        Some(headers::ContentLength(len)) if len > policy.max_content_length => {
            Err(Rejection::PayloadTooLarge)
        }
        _ => Ok(()),
    }
}

/// Runs the header rules only.
pub fn check_headers(headers: &HeaderMap, policy: &EndpointPolicy) -> Result<(), Rejection> {
    HEADER_RULES
        .iter()
        .try_for_each(|(_, rule)| rule(headers, policy))
}

/// An admitted request. `request` still owns the unread body.
pub struct Admission {
    pub session: Option<Session>,
    pub client_ip: String,
    pub request: Request,
}

impl Admission {
    /// Identity for endpoints admitted with `require_identity`.
    pub fn identity(&self) -> Result<&Session, ApiError> {
        self.session
            .as_ref()
            .ok_or_else(|| Rejection::Unauthenticated.into())
    }
}

pub async fn admit(
    identity: &dyn IdentityProvider,
    policy: &EndpointPolicy,
    request: Request,
) -> Result<Admission, ApiError> {
    let ip = client_ip(request.headers());

    if let Err(rejection) = check_headers(request.headers(), policy) {
        warn!(
            target: "security",
            event = rejection.event(),
            ip = %ip,
            path = policy.path,
            reason = rejection.message(),
            "Request rejected"
        );
        return Err(rejection.into());
    }

    if !policy.require_identity {
        return Ok(Admission {
            session: None,
            client_ip: ip,
            request,
        });
    }

    let session = match identity.get_session(request.headers()).await {
        Ok(Some(session)) => session,
        Ok(None) => {
            warn!(
                target: "security",
                event = Rejection::Unauthenticated.event(),
                ip = %ip,
                path = policy.path,
                "No session"
            );
            return Err(Rejection::Unauthenticated.into());
        }
        Err(e @ IdentityError::NotConfigured(_)) => {
            return Err(ApiError::Configuration(e.to_string()));
        }
        Err(e) => {
            warn!(
                target: "security",
                event = Rejection::Unauthenticated.event(),
                ip = %ip,
                path = policy.path,
                error = %e,
                "Session lookup failed"
            );
            return Err(Rejection::Unauthenticated.into());
        }
    };

    info!(
        target: "security",
        event = "api_access",
        user = %session.email,
        user_id = %session.user_id,
        ip = %ip,
        path = policy.path,
        "Request admitted"
    );

    Ok(Admission {
        session: Some(session),
        client_ip: ip,
        request,
    })
}
