use anyhow::{Context, Result, bail};
use parley_types::{AuthStatus, StartResponse, Step, StepResponse};
use serde_json::json;

/// HTTP side of the login flow.
#[derive(Clone)]
pub struct LoginClient {
    client: reqwest::Client,
    endpoint: String,
}

impl LoginClient {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into().trim_end_matches('/').to_owned(),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub async fn status(&self) -> Result<AuthStatus> {
        let resp = self
            .client
            .get(format!("{}/auth/status", self.endpoint))
            .send()
            .await
            .context("Failed to send auth status request")?;
        if !resp.status().is_success() {
            bail!(
                "Failed to get auth status: {:?}: {}",
                resp.status(),
                resp.text().await.unwrap_or_default()
            )
        }
        resp.json().await.context("Failed to decode auth status")
    }

    pub async fn start(&self) -> Result<StartResponse> {
        let resp = self
            .client
            .post(format!("{}/auth/start", self.endpoint))
            .send()
            .await
            .context("Failed to send login start request")?;
        if !resp.status().is_success() {
            bail!(
                "Failed to start login: {:?}: {}",
                resp.status(),
                resp.text().await.unwrap_or_default()
            )
        }
        resp.json().await.context("Failed to decode login start response")
    }

    /// Submits `value` for `step`. Rejections come back as a `StepResponse`
    /// with `ok: false`; only transport failures are errors.
    pub async fn submit(&self, step: Step, value: &str) -> Result<StepResponse> {
        let resp = self
            .client
            .post(format!("{}/auth/{}", self.endpoint, step))
            .json(&json!({ step.to_string(): value }))
            .send()
            .await
            .with_context(|| format!("Failed to send {} submission", step))?;
        let status = resp.status();
        let body = resp
            .text()
            .await
            .with_context(|| format!("Failed to read {} response", step))?;
        serde_json::from_str(&body)
            .with_context(|| format!("Unexpected {} response: {:?}: {}", step, status, body))
    }
}
