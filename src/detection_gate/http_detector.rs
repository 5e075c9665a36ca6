//! HTTP workflow-inference detector
//!
//! Posts JPEG frames to a hosted (or locally served) inference workflow and
//! parses its prediction list. Credentials are validated at construction so
//! a misconfigured deployment fails at startup instead of per request.

use super::Detector;
use crate::error::{Error, Result};
use crate::models::Detection;
use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use serde::Deserialize;
use std::time::Duration;

/// Detector invocation timeout; a detector that exceeds it is treated
/// as failed for that cycle
const DETECT_TIMEOUT: Duration = Duration::from_secs(20);

/// Detector endpoint configuration
#[derive(Debug, Clone)]
pub struct DetectorConfig {
    /// Inference server base URL
    pub api_url: String,
    /// API key (required)
    pub api_key: Option<String>,
    /// Workspace name (required)
    pub workspace: Option<String>,
    /// Workflow id (required)
    pub workflow_id: Option<String>,
}

impl DetectorConfig {
    /// Read from environment (`DETECTOR_API_URL`, `DETECTOR_API_KEY`,
    /// `DETECTOR_WORKSPACE`, `DETECTOR_WORKFLOW_ID`)
    pub fn from_env() -> Self {
        Self {
            api_url: std::env::var("DETECTOR_API_URL")
                .unwrap_or_else(|_| "https://serverless.roboflow.com".to_string()),
            api_key: std::env::var("DETECTOR_API_KEY").ok(),
            workspace: std::env::var("DETECTOR_WORKSPACE").ok(),
            workflow_id: std::env::var("DETECTOR_WORKFLOW_ID").ok(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct PredictionsResponse {
    #[serde(default)]
    predictions: Vec<Detection>,
}

/// HttpDetector instance
#[derive(Debug)]
pub struct HttpDetector {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
}

impl HttpDetector {
    /// Build the detector; missing credentials are a config error
    pub fn new(config: DetectorConfig) -> Result<Self> {
        let api_key = config
            .api_key
            .ok_or_else(|| Error::Config("DETECTOR_API_KEY not set".into()))?;
        let workspace = config
            .workspace
            .ok_or_else(|| Error::Config("DETECTOR_WORKSPACE not set".into()))?;
        let workflow_id = config
            .workflow_id
            .ok_or_else(|| Error::Config("DETECTOR_WORKFLOW_ID not set".into()))?;

        let client = reqwest::Client::builder()
            .timeout(DETECT_TIMEOUT)
            .build()
            .map_err(|e| Error::Config(format!("failed to build HTTP client: {}", e)))?;

        let endpoint = format!(
            "{}/infer/workflows/{}/{}",
            config.api_url.trim_end_matches('/'),
            workspace,
            workflow_id
        );

        tracing::info!(endpoint = %endpoint, "HTTP detector initialized");

        Ok(Self {
            client,
            endpoint,
            api_key,
        })
    }
}

#[async_trait]
impl Detector for HttpDetector {
    async fn detect(&self, image: &[u8], confidence: f32) -> Result<Vec<Detection>> {
        let part = Part::bytes(image.to_vec())
            .file_name("frame.jpg")
            .mime_str("image/jpeg")
            .map_err(|e| Error::Internal(format!("multipart build failed: {}", e)))?;
        let form = Form::new().part("image", part);

        let response = self
            .client
            .post(&self.endpoint)
            .query(&[
                ("api_key", self.api_key.as_str()),
                ("confidence", &confidence.to_string()),
            ])
            .multipart(form)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Error::Transient(format!(
                "detector returned HTTP {}",
                response.status()
            )));
        }

        let parsed: PredictionsResponse = response.json().await?;
        tracing::debug!(count = parsed.predictions.len(), "Detector response parsed");
        Ok(parsed.predictions)
    }
}
