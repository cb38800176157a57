// API-specific data models for the web server

use serde::{Deserialize, Serialize};

/// Response to a successful processing request
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ProcessResponse {
    pub result_url: String,
    pub remaining: u32,
}

/// Body of POST /feedback.
/// `feedback` is kept loosely typed so a non-string value is reported as a
/// validation error rather than a parse error.
#[derive(Deserialize, Debug, Clone, Default)]
pub struct FeedbackRequest {
    #[serde(default)]
    pub feedback: Option<serde_json::Value>,
    #[serde(default)]
    pub user: Option<FeedbackUser>,
}

/// Whatever the client knows about the sender. Any JSON value is accepted;
/// ids in particular are often numeric.
#[derive(Deserialize, Debug, Clone, Default)]
pub struct FeedbackUser {
    #[serde(default)]
    pub id: Option<serde_json::Value>,
    #[serde(default)]
    pub email: Option<serde_json::Value>,
    #[serde(default)]
    pub name: Option<serde_json::Value>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct FeedbackResponse {
    pub message: String,
    pub timestamp: String,
}

/// Today's allowance for the signed-in user
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct UsageResponse {
    pub limit: u32,
    pub remaining: u32,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct HealthResponse {
    pub status: String,
    pub degraded: bool,
}
