//! Background removal job client.
//!
//! The provider works asynchronously: a submission returns an order id, and the
//! order is polled until it reports an output image or a failure.

use crate::config::RemoverConfig;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, instrument, warn};

#[cfg(test)]
use mockall::automock;

/// Job client failures
#[derive(Debug, Error)]
pub enum RemoverError {
    #[error("Submission rejected: {0}")]
    SubmissionRejected(String),

    #[error("Status check failed: {0}")]
    StatusCheckFailed(String),
}

/// Provider job status, normalized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    /// Map a provider status string. Unknown values count as pending.
    pub fn from_provider(status: &str) -> Self {
        match status.trim().to_lowercase().as_str() {
            "failed" | "error" => JobStatus::Failed,
            "completed" | "complete" | "success" | "succeeded" => JobStatus::Completed,
            "processing" | "active" | "running" | "in_progress" => JobStatus::Processing,
            _ => JobStatus::Pending,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }
}

/// Result of one status check
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobState {
    pub status: JobStatus,
    pub output_url: Option<String>,
    /// Raw status text as reported by the provider
    pub status_text: Option<String>,
}

/// Per-submission options
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemovalOptions {
    pub background: String,
}

impl Default for RemovalOptions {
    fn default() -> Self {
        Self {
            background: "transparent".to_string(),
        }
    }
}

/// External background removal provider.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait BackgroundRemover: Send + Sync {
    /// Start a job for the image at `image_url` and return its id.
    async fn submit(&self, image_url: &str, options: &RemovalOptions) -> Result<String, RemoverError>;

    /// Check a job once.
    async fn poll(&self, job_id: &str) -> Result<JobState, RemoverError>;
}

/// Provider responses wrap their payload in `body`.
#[derive(Debug, Deserialize)]
struct Envelope<T> {
    body: Option<T>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubmitBody {
    order_id: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct StatusBody {
    status: Option<String>,
    output: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SubmitRequest<'a> {
    image_url: &'a str,
    background: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StatusRequest<'a> {
    order_id: &'a str,
}

/// HTTP client for a LightX-compatible removal API
pub struct HttpBackgroundRemover {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl HttpBackgroundRemover {
    pub fn new(config: &RemoverConfig) -> anyhow::Result<Self> {
        let api_key = config
            .api_key
            .clone()
            .filter(|k| !k.is_empty())
            .ok_or_else(|| anyhow::anyhow!("remover.api_key is not configured"))?;

        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key,
        })
    }
}

#[async_trait]
impl BackgroundRemover for HttpBackgroundRemover {
    #[instrument(skip(self, options))]
    async fn submit(&self, image_url: &str, options: &RemovalOptions) -> Result<String, RemoverError> {
        let response = self
            .client
            .post(format!("{}/remove-background", self.base_url))
            .header("x-api-key", &self.api_key)
            .json(&SubmitRequest {
                image_url,
                background: &options.background,
            })
            .send()
            .await
            .map_err(|e| RemoverError::SubmissionRejected(e.to_string()))?;

        let status = response.status();
        let envelope: Envelope<SubmitBody> = response
            .json()
            .await
            .map_err(|e| RemoverError::SubmissionRejected(format!("{status}: {e}")))?;

        debug!(status = %status, message = ?envelope.message, "Removal job submitted");

        parse_order_id(envelope)
    }

    #[instrument(skip(self))]
    async fn poll(&self, job_id: &str) -> Result<JobState, RemoverError> {
        let response = self
            .client
            .post(format!("{}/order-status", self.base_url))
            .header("x-api-key", &self.api_key)
            .json(&StatusRequest { order_id: job_id })
            .send()
            .await
            .map_err(|e| RemoverError::StatusCheckFailed(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let details = response.text().await.unwrap_or_default();
            warn!(status = %status, details = %details, "Provider status request failed");
            return Err(RemoverError::StatusCheckFailed(format!(
                "provider responded with status {status}"
            )));
        }

        let envelope: Envelope<StatusBody> = response
            .json()
            .await
            .map_err(|e| RemoverError::StatusCheckFailed(e.to_string()))?;

        parse_job_state(envelope)
    }
}

/// Stands in for the provider when no API key is configured. Every job fails
/// at submission, so local processing and manual uploads keep working.
#[derive(Debug, Default)]
pub struct UnconfiguredRemover;

#[async_trait]
impl BackgroundRemover for UnconfiguredRemover {
    async fn submit(&self, _image_url: &str, _options: &RemovalOptions) -> Result<String, RemoverError> {
        Err(RemoverError::SubmissionRejected(
            "removal provider is not configured".to_string(),
        ))
    }

    async fn poll(&self, _job_id: &str) -> Result<JobState, RemoverError> {
        Err(RemoverError::StatusCheckFailed(
            "removal provider is not configured".to_string(),
        ))
    }
}

/// Build the configured job client
pub fn from_config(config: &RemoverConfig) -> anyhow::Result<Arc<dyn BackgroundRemover>> {
    if config.api_key.as_deref().map_or(true, |k| k.trim().is_empty()) {
        warn!("remover.api_key is not set, provider processing is disabled");
        return Ok(Arc::new(UnconfiguredRemover));
    }
    Ok(Arc::new(HttpBackgroundRemover::new(config)?))
}

fn parse_order_id(envelope: Envelope<SubmitBody>) -> Result<String, RemoverError> {
    let order_id = envelope.body.and_then(|b| b.order_id).and_then(|id| match id {
        serde_json::Value::String(s) if !s.trim().is_empty() => Some(s),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    });

    order_id.ok_or_else(|| {
        RemoverError::SubmissionRejected(
            envelope
                .message
                .unwrap_or_else(|| "response carried no order id".to_string()),
        )
    })
}

fn parse_job_state(envelope: Envelope<StatusBody>) -> Result<JobState, RemoverError> {
    let body = envelope
        .body
        .ok_or_else(|| RemoverError::StatusCheckFailed("invalid response structure".to_string()))?;

    Ok(JobState {
        status: body
            .status
            .as_deref()
            .map(JobStatus::from_provider)
            .unwrap_or(JobStatus::Pending),
        output_url: body.output.filter(|o| !o.trim().is_empty()),
        status_text: body.status,
    })
}
