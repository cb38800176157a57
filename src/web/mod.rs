// Web server module
// Handles the HTTP API: image processing behind the daily quota, usage
// queries, feedback, and the security middleware in front of them.

mod app;
mod client_ip;
mod error;
mod extract_request_data;
mod gatekeeper;
mod handlers;
mod listeners;
mod models;
mod security;

pub use app::create_app;
pub use listeners::create_listener;
pub use security::IpRateLimiter;

use crate::config::Settings;
use crate::identity::SharedIdentityProvider;
use crate::inference::SharedInferenceBackend;
use crate::mail::SharedMailTransport;
use crate::usage_ledger::SharedUsageLedger;
use std::sync::Arc;

/// Everything the handlers share.
#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub identity: SharedIdentityProvider,
    pub ledger: SharedUsageLedger,
    pub backend: SharedInferenceBackend,
    /// `None` when mail is not configured; feedback is then only logged.
    pub mailer: Option<SharedMailTransport>,
    /// `None` disables the per-IP burst limiter.
    pub ip_limiter: Option<Arc<IpRateLimiter>>,
}
