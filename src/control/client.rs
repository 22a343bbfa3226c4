// Control-plane client
//
// Thin reqwest wrapper used by test drivers to toggle faults on a running
// proxy.

use std::time::Duration;

use anyhow::{Context, Result};
use tokio::task::JoinHandle;

use crate::controller::{Action, ProxyStatus};

#[derive(Debug, Clone)]
pub struct ControlClient {
    /// Reqwest HTTP client
    client: reqwest::Client,

    /// `http://host:port` of the control server
    base: String,
}

impl ControlClient {
    /// Client for the control server at `addr` (`host:port`)
    ///
    /// No request timeout is set: a graceful restart waits for live sessions
    /// for up to the proxy's shutdown grace period.
    pub fn new(addr: impl std::fmt::Display) -> Self {
        Self {
            client: reqwest::Client::new(),
            base: format!("http://{}", addr),
        }
    }

    /// Same client with a per-request timeout
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn with_timeout(mut self, timeout: Duration) -> Result<Self> {
        self.client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(self)
    }

    pub fn base_url(&self) -> &str {
        &self.base
    }

    /// POST an action and expect `204 No Content`. Query values are sent
    /// as given and must already be URL-safe.
    ///
    /// # Errors
    ///
    /// Returns the server's error text for any other status.
    pub async fn post(&self, action: Action, query: &[(&str, String)]) -> Result<()> {
        let mut url = format!("{}{}", self.base, action);
        for (i, (key, value)) in query.iter().enumerate() {
            url.push(if i == 0 { '?' } else { '&' });
            url.push_str(key);
            url.push('=');
            url.push_str(value);
        }
        tracing::debug!("POST {}", url);

        let response = self
            .client
            .post(&url)
            .send()
            .await
            .with_context(|| format!("Failed to send {}", action))?;

        let status = response.status();
        if status != reqwest::StatusCode::NO_CONTENT {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("{} failed with status {}: {}", action, status, body.trim_end());
        }
        Ok(())
    }

    pub async fn start(&self) -> Result<()> {
        self.post(Action::Start, &[]).await
    }

    pub async fn stop(&self) -> Result<()> {
        self.post(Action::Stop, &[]).await
    }

    pub async fn kill_all(&self) -> Result<()> {
        self.post(Action::KillAll, &[]).await
    }

    pub async fn reject(&self) -> Result<()> {
        self.post(Action::Reject, &[]).await
    }

    pub async fn accept(&self) -> Result<()> {
        self.post(Action::Accept, &[]).await
    }

    pub async fn freeze(&self) -> Result<()> {
        self.post(Action::Freeze, &[]).await
    }

    pub async fn thaw(&self) -> Result<()> {
        self.post(Action::Thaw, &[]).await
    }

    pub async fn quit(&self) -> Result<()> {
        self.post(Action::Quit, &[]).await
    }

    /// Restart the proxy, sleeping `sleep` in between
    pub async fn restart(&self, sleep: Duration, forceful: bool) -> Result<()> {
        let query = [
            ("sleep", format!("{}ms", sleep.as_millis())),
            ("forceful", forceful.to_string()),
        ];
        self.post(Action::Restart, &query).await
    }

    /// Freeze now and thaw after `duration` in the background.
    ///
    /// The returned handle resolves to the result of the thaw.
    pub async fn freeze_and_thaw(&self, duration: Duration) -> Result<JoinHandle<Result<()>>> {
        self.freeze().await?;
        let client = self.clone();
        Ok(tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            client.thaw().await
        }))
    }

    /// Fetch `GET /status`
    pub async fn status(&self) -> Result<ProxyStatus> {
        self.client
            .get(format!("{}/status", self.base))
            .send()
            .await
            .context("Failed to fetch status")?
            .error_for_status()?
            .json()
            .await
            .context("Failed to parse status")
    }

    /// Fetch `GET /metrics`
    pub async fn metrics(&self) -> Result<String> {
        self.client
            .get(format!("{}/metrics", self.base))
            .send()
            .await
            .context("Failed to fetch metrics")?
            .error_for_status()?
            .text()
            .await
            .context("Failed to read metrics")
    }
}
