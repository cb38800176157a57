use super::{AppState, handlers, security};
use axum::{
    Router,
    extract::DefaultBodyLimit,
    middleware,
    routing::{IntoMakeService, get, post},
};
use tower_http::{
    cors::CorsLayer,
    set_header::SetResponseHeaderLayer,
    trace::{DefaultMakeSpan, TraceLayer},
};
use tracing::Level;

pub fn create_router(state: AppState) -> Router {
    let body_limit = usize::try_from(state.settings.max_upload_bytes).unwrap_or(usize::MAX);

    let mut router = Router::new()
        .route("/process/{action}", post(handlers::process_image))
        .route("/usage", get(handlers::get_usage))
        .route("/feedback", post(handlers::submit_feedback))
        .route("/health", get(handlers::health))
        .fallback(handlers::not_found)
        .method_not_allowed_fallback(handlers::method_not_allowed)
        // Hard cap on bodies read through extractors; the gatekeeper checks declared lengths
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            security::limit_per_ip,
        ))
        .layer(middleware::from_fn(security::block_suspicious_requests))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            security::redirect_to_https,
        ));

    for (name, value) in security::security_headers() {
        router = router.layer(SetResponseHeaderLayer::overriding(name, value));
    }

    router
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http().make_span_with(DefaultMakeSpan::new().level(Level::INFO)))
        .with_state(state)
}

pub fn create_app(state: AppState) -> IntoMakeService<Router> {
    create_router(state).into_make_service()
}
