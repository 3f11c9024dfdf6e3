//! Vision caption client.
//!
//! Sends the image to a hosted vision model and gets back a short
//! description used as the post caption. The image goes inline as base64;
//! the model and prompt come from configuration.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use secrecy::ExposeSecret;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use crate::config::VisionConfig;
use crate::model::ErrorKind;

use super::{Analyzer, StepError, StepResult};

pub struct VisionClient {
    http: reqwest::Client,
    config: VisionConfig,
}

#[derive(Deserialize)]
struct DescribeResponse {
    description: String,
}

impl VisionClient {
    pub fn new(config: VisionConfig) -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(60))
                .build()
                .expect("reqwest client"),
            config,
        }
    }

    fn caption_from(&self, description: &str) -> String {
        let description = description.trim();
        if self.config.append_text.is_empty() {
            description.to_string()
        } else {
            format!("{description}\n\n{}", self.config.append_text)
        }
    }
}

#[async_trait]
impl Analyzer for VisionClient {
    async fn analyze(&self, file: &Path) -> StepResult<String> {
        let bytes = tokio::fs::read(file)
            .await
            .map_err(|e| StepError::new(ErrorKind::InvalidInput, format!("read {}: {e}", file.display())))?;

        let url = format!("{}/v1/describe", self.config.api_base.trim_end_matches('/'));
        let response = self
            .http
            .post(url)
            .bearer_auth(self.config.api_key.expose_secret())
            .json(&json!({
                "model": self.config.model,
                "prompt": self.config.prompt,
                "image": BASE64.encode(&bytes),
            }))
            .send()
            .await
            .map_err(StepError::from_transport)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(StepError::from_status(status, body));
        }

        let parsed: DescribeResponse = response
            .json()
            .await
            .map_err(|e| StepError::new(ErrorKind::Network, format!("bad describe response: {e}")))?;

        debug!(file = %file.display(), chars = parsed.description.len(), "image described");
        Ok(self.caption_from(&parsed.description))
    }
}
