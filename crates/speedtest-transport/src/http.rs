//! HTTP client for the runner's task-creation endpoint.

use async_trait::async_trait;
use serde::Deserialize;
use speedtest_core::{
    TestConfig, TestStarter,
    traits::{StartError, TaskId},
};

/// Path of the asynchronous test endpoint, relative to the API base.
pub const START_PATH: &str = "/api/test/async";

#[derive(Debug, Deserialize)]
struct ApiResponse {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    data: Option<TaskCreated>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TaskCreated {
    #[serde(default)]
    task_id: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

/// Starts test tasks over HTTP.
#[derive(Debug, Clone)]
pub struct HttpStarter {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpStarter {
    #[must_use]
    pub fn new(api_url: &str) -> Self {
        Self::with_client(reqwest::Client::new(), api_url)
    }

    /// Use a preconfigured client (timeouts, proxies, TLS roots).
    #[must_use]
    pub fn with_client(client: reqwest::Client, api_url: &str) -> Self {
        Self {
            client,
            endpoint: format!("{}{START_PATH}", api_url.trim_end_matches('/')),
        }
    }

    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl TestStarter for HttpStarter {
    async fn start(&self, config: &TestConfig) -> Result<TaskId, StartError> {
        tracing::debug!(endpoint = %self.endpoint, targets = config.target_count(), "Requesting test task");

        let response = self
            .client
            .post(&self.endpoint)
            .json(&config.request_body())
            .send()
            .await
            .map_err(|e| StartError::Transport(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| StartError::Transport(e.to_string()))?;

        let parsed: ApiResponse = match serde_json::from_str(&body) {
            Ok(parsed) => parsed,
            Err(_) if !status.is_success() => {
                return Err(StartError::Rejected(format!("HTTP {}", status.as_u16())));
            }
            Err(e) => return Err(StartError::InvalidResponse(e.to_string())),
        };

        if !parsed.success {
            let reason = parsed
                .error
                .filter(|e| !e.is_empty())
                .unwrap_or_else(|| "failed to create test task".to_string());
            tracing::warn!(status = status.as_u16(), %reason, "Runner rejected test task");
            return Err(StartError::Rejected(reason));
        }

        let created = parsed.data.ok_or(StartError::MissingTaskId)?;
        let task_id = created
            .task_id
            .filter(|id| !id.is_empty())
            .ok_or(StartError::MissingTaskId)?;

        tracing::info!(
            %task_id,
            message = created.message.as_deref().unwrap_or_default(),
            "Test task created"
        );
        Ok(task_id)
    }
}
