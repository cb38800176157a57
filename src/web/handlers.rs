// API handlers for the web server

use super::{
    AppState,
    error::ApiError,
    extract_request_data::extract_request_image,
    gatekeeper::{EndpointPolicy, admit},
    models::*,
};
use crate::inference::Action;
use crate::mail::{MailMessage, dispatch_detached, escape_html};
use axum::{
    Json,
    body,
    extract::{Path, Request, State},
    http::{Method, Uri},
};
use chrono::{SecondsFormat, Utc};
use serde_json::Value;
use tracing::{error, info, warn};

pub const QUOTA_EXCEEDED_MESSAGE: &str = "Daily free limit reached";
pub const MAX_FEEDBACK_CHARS: usize = 1000;

// --- POST /process/{action} ---
// Gatekeeper, then upload validation, then one quota slot, then the inference call.
// A slot consumed before a failed inference call is not given back.
pub async fn process_image(
    State(state): State<AppState>,
    Path(action): Path<String>,
    request: Request,
) -> Result<Json<ProcessResponse>, ApiError> {
    let action: Action = action.parse().map_err(ApiError::BadRequest)?;
    let policy = EndpointPolicy::upload("/process/{action}", &state.settings);

    let admission = admit(state.identity.as_ref(), &policy, request).await?;
    let identity = admission.identity()?.email.clone();
    let ip = admission.client_ip;

    let image = extract_request_image(
        admission.request,
        state.settings.max_image_bytes,
        &identity,
        &ip,
    )
    .await?;

    let limit = state.settings.daily_limit;
    let decision = state.ledger.try_consume(&identity, limit).await;
    if !decision.allowed {
        warn!(
            target: "security",
            event = "rate_limit_exceeded",
            user = %identity,
            ip = %ip,
            limit,
            "Daily quota exhausted"
        );
        return Err(ApiError::TooManyRequests(QUOTA_EXCEEDED_MESSAGE.to_string()));
    }

    info!(
        "Processing {} for {} ({} bytes, {} left today)",
        action,
        identity,
        image.bytes.len(),
        decision.remaining
    );

    let result_url = state
        .backend
        .process(action, &image)
        .await
        .inspect_err(|e| {
            error!(
                target: "security",
                event = "api_error",
                user = %identity,
                ip = %ip,
                action = %action,
                error = %e,
                "Inference failed"
            );
        })?;

    info!(
        target: "security",
        event = "image_processed_successfully",
        user = %identity,
        size = image.bytes.len(),
        result = %result_url.chars().take(50).collect::<String>(),
        "Image processed"
    );

    Ok(Json(ProcessResponse {
        result_url,
        remaining: decision.remaining,
    }))
}

// --- GET /usage ---
// Remaining allowance for the signed-in user. Does not consume anything.
pub async fn get_usage(
    State(state): State<AppState>,
    request: Request,
) -> Result<Json<UsageResponse>, ApiError> {
    let policy = EndpointPolicy::query("/usage", &state.settings);
    let admission = admit(state.identity.as_ref(), &policy, request).await?;
    let identity = &admission.identity()?.email;

    let limit = state.settings.daily_limit;
    let remaining = state.ledger.peek(identity, limit).await;
    Ok(Json(UsageResponse { limit, remaining }))
}

/// Checks the feedback text and returns it trimmed.
pub fn validate_feedback(payload: &FeedbackRequest) -> Result<String, ApiError> {
    let text = match &payload.feedback {
        Some(Value::String(text)) => text,
        _ => {
            return Err(ApiError::BadRequest(
                "Feedback content cannot be empty".to_string(),
            ));
        }
    };
    if text.chars().count() > MAX_FEEDBACK_CHARS {
        return Err(ApiError::BadRequest(format!(
            "Feedback content cannot exceed {} characters",
            MAX_FEEDBACK_CHARS
        )));
    }
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err(ApiError::BadRequest(
            "Feedback content cannot be empty".to_string(),
        ));
    }
    Ok(trimmed.to_string())
}

/// Renders a sender detail for the log and the mail. Empty strings, zero,
/// `false`, `null` and nested values fall back to `fallback`.
fn feedback_field(value: Option<&Value>, fallback: &str) -> String {
    match value {
        Some(Value::String(text)) if !text.trim().is_empty() => text.trim().to_string(),
        Some(Value::Number(n)) if n.as_f64() != Some(0.0) => n.to_string(),
        Some(Value::Bool(true)) => "true".to_string(),
        _ => fallback.to_string(),
    }
}

fn feedback_mail(feedback: &str, name: &str, email: &str, received_at: &str) -> MailMessage {
    MailMessage {
        subject: "User Feedback - AI Image Tool".to_string(),
        html_body: format!(
            "<h2>New User Feedback</h2>\
             <p><strong>From:</strong> {}</p>\
             <p><strong>Email:</strong> {}</p>\
             <p><strong>Time:</strong> {}</p>\
             <hr><h3>Feedback:</h3><p>{}</p>",
            escape_html(name),
            escape_html(email),
            escape_html(received_at),
            escape_html(feedback),
        ),
    }
}

// --- POST /feedback ---
// The entry is written to the log before responding; mail goes out afterwards
// on a detached task whose outcome never reaches the client.
pub async fn submit_feedback(
    State(state): State<AppState>,
    request: Request,
) -> Result<Json<FeedbackResponse>, ApiError> {
    let policy = EndpointPolicy::json("/feedback", &state.settings);
    let admission = admit(state.identity.as_ref(), &policy, request).await?;

    let limit = usize::try_from(state.settings.max_json_bytes).unwrap_or(usize::MAX);
    let bytes = body::to_bytes(admission.request.into_body(), limit)
        .await
        .map_err(|e| ApiError::BadRequest(format!("Failed to read request body: {}", e)))?;
    let payload: FeedbackRequest = serde_json::from_slice(&bytes)
        .map_err(|e| ApiError::BadRequest(format!("Invalid JSON body: {}", e)))?;

    let feedback = validate_feedback(&payload)?;
    let user = payload.user.unwrap_or_default();
    let name = feedback_field(user.name.as_ref(), "Anonymous");
    let email = feedback_field(user.email.as_ref(), "N/A");
    let user_id = feedback_field(user.id.as_ref(), "N/A");
    let received_at = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);

    info!(
        target: "feedback",
        name = %name,
        email = %email,
        user_id = %user_id,
        ip = %admission.client_ip,
        received_at = %received_at,
        feedback = %feedback,
        "Feedback received"
    );

    let response = FeedbackResponse {
        message: "Feedback submitted successfully!".to_string(),
        timestamp: received_at.clone(),
    };

    match &state.mailer {
        Some(mailer) => {
            dispatch_detached(
                mailer.clone(),
                feedback_mail(&feedback, &name, &email, &received_at),
                state.settings.mail_timeout,
            );
        }
        None => info!("Mail transport not configured, feedback kept in the log only"),
    }

    Ok(Json(response))
}

// --- GET /health ---
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        degraded: state.backend.is_degraded(),
    })
}

pub async fn not_found(uri: Uri) -> ApiError {
    ApiError::NotFound(format!("No route for {}", uri.path()))
}

pub async fn method_not_allowed(method: Method, uri: Uri) -> ApiError {
    ApiError::MethodNotAllowed(format!("{} is not supported on {}", method, uri.path()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_feedback_field_accepts_loose_values() {
        assert_eq!(feedback_field(Some(&json!(123)), "N/A"), "123");
        assert_eq!(feedback_field(Some(&json!("  Ada ")), "Anonymous"), "Ada");
        assert_eq!(feedback_field(Some(&json!(true)), "N/A"), "true");
    }

    #[test]
    fn test_feedback_field_falls_back_on_empty_values() {
        let empty = [json!(""), json!("   "), json!(0), json!(false), json!(null), json!([1])];
        for value in empty {
            assert_eq!(feedback_field(Some(&value), "N/A"), "N/A");
        }
        assert_eq!(feedback_field(None, "Anonymous"), "Anonymous");
    }

    #[test]
    fn test_feedback_request_with_numeric_user_id_parses() {
        let payload: FeedbackRequest =
            serde_json::from_value(json!({"feedback": "hi", "user": {"id": 123}})).unwrap();
        assert_eq!(validate_feedback(&payload).unwrap(), "hi");
        let user = payload.user.unwrap();
        assert_eq!(feedback_field(user.id.as_ref(), "N/A"), "123");
        assert_eq!(feedback_field(user.email.as_ref(), "N/A"), "N/A");
    }
}
