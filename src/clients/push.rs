//! Push notification client.
//!
//! A single form POST per alert. Delivery is best-effort: errors are logged
//! and dropped, and an unconfigured client degrades to a no-op so the
//! pipeline runs fine without alerting credentials.

use std::time::Duration;

use async_trait::async_trait;
use secrecy::ExposeSecret;
use tracing::warn;

use crate::config::AlertConfig;

use super::Notifier;

pub struct PushClient {
    http: reqwest::Client,
    config: AlertConfig,
}

impl PushClient {
    pub fn new(config: AlertConfig) -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .expect("reqwest client"),
            config,
        }
    }
}

#[async_trait]
impl Notifier for PushClient {
    async fn notify(&self, title: &str, message: &str) {
        let (Some(token), Some(user)) = (&self.config.api_token, &self.config.user_key) else {
            warn!(title, "alert dropped: push credentials not configured");
            return;
        };

        let url = format!("{}/1/messages.json", self.config.api_base.trim_end_matches('/'));
        let result = self
            .http
            .post(url)
            .form(&[
                ("token", token.expose_secret()),
                ("user", user.expose_secret()),
                ("title", title),
                ("message", message),
                ("priority", "1"),
            ])
            .send()
            .await;

        match result {
            Ok(response) if response.status().is_success() => {}
            Ok(response) => warn!(title, status = %response.status(), "alert delivery rejected"),
            Err(e) => warn!(title, error = %e, "alert delivery failed"),
        }
    }
}
