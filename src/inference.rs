// Hosted inference backends.
// `ReplicateBackend` runs the watermark-removal and restoration models on
// Replicate. `DegradedBackend` stands in when no API token is configured and
// hands the input back unchanged as a data URL.

use async_trait::async_trait;
use base64::prelude::{BASE64_STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Processing actions exposed at `/process/{action}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Remove,
    Enhance,
}

impl Action {
    pub fn as_str(self) -> &'static str {
        match self {
            Action::Remove => "remove",
            Action::Enhance => "enhance",
        }
    }

    /// Replicate model version for this action.
    fn model_version(self) -> &'static str {
        match self {
            // flux-kontext-apps/text-removal
            Action::Remove => "e28636410bff2b083e38f4e856a5b2be171c8bb6636f527b1a9e84dff29d1c54",
            // flux-kontext-apps/restore-image
            Action::Enhance => "85ae46551612b8f778348846b6ce1ce1b340e384fe2062399c0c412be29e107d",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Action {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "remove" => Ok(Action::Remove),
            "enhance" => Ok(Action::Enhance),
            other => Err(format!("Unknown action '{}'", other)),
        }
    }
}

/// Image handed to a backend.
#[derive(Debug, Clone)]
pub struct InputImage {
    pub bytes: Vec<u8>,
    pub content_type: String,
}

#[derive(Debug, thiserror::Error)]
pub enum InferenceError {
    #[error("request to inference API failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("failed to create prediction: {status}: {body}")]
    CreateFailed { status: u16, body: String },
    #[error("prediction {id} ended with status '{status}': {detail}")]
    PredictionFailed {
        id: String,
        status: String,
        detail: String,
    },
    #[error("prediction succeeded without a usable output")]
    MissingOutput,
    #[error("inference did not finish within {0:?}")]
    Timeout(Duration),
}

#[async_trait]
pub trait InferenceBackend: Send + Sync {
    /// Runs `action` on `image` and returns a URL to the result.
    async fn process(&self, action: Action, image: &InputImage) -> Result<String, InferenceError>;

    /// True when results are not produced by the hosted model.
    fn is_degraded(&self) -> bool {
        false
    }
}

pub type SharedInferenceBackend = Arc<dyn InferenceBackend>;

pub fn data_url(content_type: &str, bytes: &[u8]) -> String {
    format!("data:{};base64,{}", content_type, BASE64_STANDARD.encode(bytes))
}

/// Returns the original image after an optional simulated delay.
pub struct DegradedBackend {
    delay: Duration,
}

impl DegradedBackend {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

#[async_trait]
impl InferenceBackend for DegradedBackend {
    async fn process(&self, action: Action, image: &InputImage) -> Result<String, InferenceError> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let content_type = if image.content_type.is_empty() {
            "image/png"
        } else {
            image.content_type.as_str()
        };
        info!(
            "Mock {} finished ({} bytes), returning original image",
            action,
            image.bytes.len()
        );
        Ok(data_url(content_type, &image.bytes))
    }

    fn is_degraded(&self) -> bool {
        true
    }
}

#[derive(Debug, Clone)]
pub struct ReplicateConfig {
    pub api_token: String,
    pub base_url: String,
    pub poll_interval: Duration,
    pub timeout: Duration,
}

pub struct ReplicateBackend {
    client: reqwest::Client,
    config: ReplicateConfig,
}

#[derive(Debug, Deserialize)]
struct Prediction {
    id: String,
    status: String,
    #[serde(default)]
    output: serde_json::Value,
    #[serde(default)]
    error: serde_json::Value,
}

impl Prediction {
    fn is_terminal(&self) -> bool {
        matches!(self.status.as_str(), "succeeded" | "failed" | "canceled")
    }
}

impl ReplicateBackend {
    pub fn new(config: ReplicateConfig) -> Result<Self, InferenceError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self { client, config })
    }

    async fn run(&self, action: Action, image: &InputImage) -> Result<String, InferenceError> {
        let api = self.config.base_url.trim_end_matches('/');
        // The models expect a PNG data URL regardless of the uploaded format.
        let body = json!({
            "version": action.model_version(),
            "input": { "input_image": data_url("image/png", &image.bytes) },
        });

        debug!("Creating {} prediction with model {}", action, action.model_version());
        let response = self
            .client
            .post(format!("{}/predictions", api))
            .header("Authorization", format!("Token {}", self.config.api_token))
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(InferenceError::CreateFailed { status, body });
        }

        let mut prediction: Prediction = response.json().await?;
        while !prediction.is_terminal() {
            tokio::time::sleep(self.config.poll_interval).await;
            prediction = self
                .client
                .get(format!("{}/predictions/{}", api, prediction.id))
                .header("Authorization", format!("Token {}", self.config.api_token))
                .send()
                .await?
                .error_for_status()?
                .json()
                .await?;
            debug!("Prediction {} status: {}", prediction.id, prediction.status);
        }

        if prediction.status != "succeeded" {
            let detail = match &prediction.error {
                serde_json::Value::Null => "Unknown error".to_string(),
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            return Err(InferenceError::PredictionFailed {
                id: prediction.id,
                status: prediction.status,
                detail,
            });
        }

        extract_output_url(&prediction.output).ok_or(InferenceError::MissingOutput)
    }
}

/// Some models return a single URL, others a list of URLs.
fn extract_output_url(output: &serde_json::Value) -> Option<String> {
    match output {
        serde_json::Value::String(url) => Some(url.clone()),
        serde_json::Value::Array(items) => items.first()?.as_str().map(str::to_string),
        _ => None,
    }
}

#[async_trait]
impl InferenceBackend for ReplicateBackend {
    async fn process(&self, action: Action, image: &InputImage) -> Result<String, InferenceError> {
        match tokio::time::timeout(self.config.timeout, self.run(action, image)).await {
            Ok(result) => result,
            Err(_) => {
                warn!("{} prediction timed out after {:?}", action, self.config.timeout);
                Err(InferenceError::Timeout(self.config.timeout))
            }
        }
    }
}
