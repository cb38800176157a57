// Main entry point for the kontext-server application.
// Parses configuration, wires the identity provider, inference backend, mail
// transport and usage ledger together, and serves the HTTP API.

mod config;
mod identity;
mod inference;
mod mail;
mod shutdown_signal;
mod usage_ledger;
mod web;

use clap::Parser;
use config::AppConfig;
use identity::{SharedIdentityProvider, SupabaseIdentityProvider, UnconfiguredIdentityProvider};
use inference::{DegradedBackend, ReplicateBackend, SharedInferenceBackend};
use mail::{SharedMailTransport, SmtpMailTransport};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;
use usage_ledger::{InMemoryUsageLedger, SharedUsageLedger};
use web::{AppState, IpRateLimiter};

const PURGE_INTERVAL: Duration = Duration::from_secs(60 * 60);

#[tokio::main]
async fn main() {
    // Parse command line args and environment variables
    let config = AppConfig::parse();

    // Structured logging to stdout. RUST_LOG overrides the default level.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .init();

    tracing::info!("Starting kontext-server...");

    let settings = Arc::new(config.settings());
    tracing::info!("Daily processing limit: {} per user", settings.daily_limit);

    // --- Identity provider ---
    let identity: SharedIdentityProvider = match config.supabase() {
        Some((url, anon_key)) => {
            match SupabaseIdentityProvider::new(url, anon_key, Duration::from_secs(10)) {
                Ok(provider) => {
                    tracing::info!("Resolving sessions against {}", url);
                    Arc::new(provider)
                }
                Err(e) => {
                    tracing::error!("FATAL: Failed to create identity client: {}", e);
                    std::process::exit(1);
                }
            }
        }
        None => {
            tracing::warn!(
                "SUPABASE_URL / SUPABASE_ANON_KEY not set. Authenticated endpoints will fail with a configuration error."
            );
            Arc::new(UnconfiguredIdentityProvider)
        }
    };

    // --- Inference backend ---
    let backend: SharedInferenceBackend = match config.replicate() {
        Some(replicate) => match ReplicateBackend::new(replicate) {
            Ok(backend) => {
                tracing::info!("Using Replicate for image processing");
                Arc::new(backend)
            }
            Err(e) => {
                tracing::error!("FATAL: Failed to create inference client: {}", e);
                std::process::exit(1);
            }
        },
        None => {
            tracing::warn!(
                "REPLICATE_API_TOKEN not set. Running in degraded mode: images are returned unprocessed."
            );
            Arc::new(DegradedBackend::new(Duration::from_millis(config.mock_delay_ms)))
        }
    };

    // --- Mail transport ---
    let mailer: Option<SharedMailTransport> = match config.smtp() {
        Some(smtp) => match SmtpMailTransport::new(&smtp) {
            Ok(transport) => {
                tracing::info!("Feedback mail via {}:{}", smtp.host, smtp.port);
                Some(Arc::new(transport) as SharedMailTransport)
            }
            Err(e) => {
                tracing::warn!("Mail transport disabled, invalid configuration: {}", e);
                None
            }
        },
        None => {
            tracing::info!("Mail transport not configured. Feedback is recorded in the log only.");
            None
        }
    };

    // --- Usage ledger ---
    let ledger: SharedUsageLedger = Arc::new(InMemoryUsageLedger::new());
    usage_ledger::spawn_purge_task(ledger.clone(), PURGE_INTERVAL);

    // --- Per-IP burst limiter ---
    let ip_limiter = config.ip_rate_limit.then(|| {
        tracing::info!("Per-IP rate limiting enabled");
        let limiter = Arc::new(IpRateLimiter::new());
        let sweeper = limiter.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(300));
            loop {
                ticker.tick().await;
                sweeper.purge_older_than(Duration::from_secs(300));
            }
        });
        limiter
    });

    let state = AppState {
        settings,
        identity,
        ledger,
        backend,
        mailer,
        ip_limiter,
    };
    let app = web::create_app(state);
    tracing::info!("Axum router configured.");

    // --- Start HTTP Server ---
    let listener = match web::create_listener(&config.host, config.port).await {
        Ok((addr, listener)) => {
            tracing::info!("Server successfully bound. Listening on {}", addr);
            listener
        }
        Err(e) => {
            tracing::error!("FATAL: Failed to bind server: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal::shutdown_signal())
        .await
    {
        tracing::error!("Server run error: {}", e);
    }

    tracing::info!("kontext-server has shut down.");
}
