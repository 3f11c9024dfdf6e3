//! Gallery upload client.
//!
//! One multipart POST per photo post: the image bytes plus caption, tags,
//! and post state. Returns the remote post id.

use std::time::Duration;

use async_trait::async_trait;
use secrecy::ExposeSecret;
use serde::Deserialize;
use tracing::debug;

use crate::config::PublishConfig;
use crate::model::ErrorKind;

use super::{PostRequest, Publisher, StepError, StepResult};

pub struct GalleryClient {
    http: reqwest::Client,
    config: PublishConfig,
}

#[derive(Deserialize)]
struct PostResponse {
    id: String,
}

impl GalleryClient {
    pub fn new(config: PublishConfig) -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(120))
                .build()
                .expect("reqwest client"),
            config,
        }
    }

    /// Cheap credential probe used at startup.
    pub async fn check_credentials(&self) -> StepResult<()> {
        let url = format!(
            "{}/v1/collections/{}",
            self.config.api_base.trim_end_matches('/'),
            self.config.collection
        );
        let response = self
            .http
            .get(url)
            .bearer_auth(self.config.token.expose_secret())
            .send()
            .await
            .map_err(StepError::from_transport)?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(StepError::from_status(status, body));
        }
        Ok(())
    }
}

#[async_trait]
impl Publisher for GalleryClient {
    async fn publish(&self, request: &PostRequest) -> StepResult<String> {
        let bytes = tokio::fs::read(&request.file).await.map_err(|e| {
            StepError::new(
                ErrorKind::InvalidInput,
                format!("read {}: {e}", request.file.display()),
            )
        })?;

        let file_name = request
            .file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "upload".to_string());

        let part = reqwest::multipart::Part::bytes(bytes)
            .file_name(file_name)
            .mime_str("application/octet-stream")
            .map_err(|e| StepError::new(ErrorKind::Internal, e.to_string()))?;

        let mut form = reqwest::multipart::Form::new()
            .text("type", "photo")
            .text("state", request.state.clone())
            .text("tags", request.tags.join(","))
            .part("data", part);
        if let Some(caption) = &request.caption {
            form = form.text("caption", caption.clone());
        }

        let url = format!(
            "{}/v1/collections/{}/posts",
            self.config.api_base.trim_end_matches('/'),
            self.config.collection
        );
        let response = self
            .http
            .post(url)
            .bearer_auth(self.config.token.expose_secret())
            .multipart(form)
            .send()
            .await
            .map_err(StepError::from_transport)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(StepError::from_status(status, body));
        }

        let parsed: PostResponse = response
            .json()
            .await
            .map_err(|e| StepError::new(ErrorKind::Network, format!("bad post response: {e}")))?;

        debug!(
            trace_id = %request.trace_id,
            post_id = %parsed.id,
            category = %request.category,
            "post created"
        );
        Ok(parsed.id)
    }
}
