//! HTTP client for the server's REST endpoints.

use std::collections::BTreeMap;

use devteam_core::{
    ReplayReport, ReplayRequest, RunAccepted, RunRequest, RunStatusView, TaskId, TaskOutput,
};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use crate::error::ClientError;

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: String,
}

/// HTTP client for the DevTeam API.
#[derive(Debug, Clone)]
pub struct DevTeamClient {
    inner: reqwest::Client,
    base_url: String,
}

impl DevTeamClient {
    /// Create a new HTTP client.
    pub fn new(base_url: &str) -> Self {
        Self {
            inner: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Turn a non-success response into [`ClientError::Api`].
    async fn check(response: reqwest::Response) -> Result<reqwest::Response, ClientError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let text = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<ErrorBody>(&text)
            .map(|b| b.error)
            .unwrap_or(text);
        Err(ClientError::Api {
            status: status.as_u16(),
            message,
        })
    }

    async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, ClientError> {
        Self::check(response)
            .await?
            .json()
            .await
            .map_err(|e| ClientError::Serialization(e.to_string()))
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, ClientError> {
        let url = self.url(path);
        debug!(url = %url, "GET request");
        let response = self.inner.get(&url).send().await?;
        Self::decode(response).await
    }

    async fn post_json<T: DeserializeOwned>(
        &self,
        path: &str,
        body: &Value,
    ) -> Result<T, ClientError> {
        let url = self.url(path);
        debug!(url = %url, "POST request");
        let response = self.inner.post(&url).json(body).send().await?;
        Self::decode(response).await
    }

    /// Check if the server is healthy.
    pub async fn health(&self) -> Result<Value, ClientError> {
        self.get_json("/health").await
    }

    pub async fn create_run(&self, request: &RunRequest) -> Result<RunAccepted, ClientError> {
        let body =
            serde_json::to_value(request).map_err(|e| ClientError::Serialization(e.to_string()))?;
        self.post_json("/v1/runs", &body).await
    }

    pub async fn list_runs(&self) -> Result<Vec<RunStatusView>, ClientError> {
        self.get_json("/v1/runs").await
    }

    pub async fn status(&self, run_id: &str) -> Result<RunStatusView, ClientError> {
        self.get_json(&format!("/v1/runs/{run_id}")).await
    }

    pub async fn outputs(&self, run_id: &str) -> Result<BTreeMap<TaskId, TaskOutput>, ClientError> {
        self.get_json(&format!("/v1/runs/{run_id}/outputs")).await
    }

    pub async fn cancel(&self, run_id: &str) -> Result<RunStatusView, ClientError> {
        self.post_json(&format!("/v1/runs/{run_id}/cancel"), &Value::Null)
            .await
    }

    pub async fn feedback(&self, run_id: &str, feedback: &str) -> Result<RunAccepted, ClientError> {
        self.post_json(
            &format!("/v1/runs/{run_id}/feedback"),
            &json!({ "feedback": feedback }),
        )
        .await
    }

    /// Re-execute one task of a finished run; returns when it is done.
    pub async fn replay(
        &self,
        run_id: &str,
        request: &ReplayRequest,
    ) -> Result<ReplayReport, ClientError> {
        let body =
            serde_json::to_value(request).map_err(|e| ClientError::Serialization(e.to_string()))?;
        self.post_json(&format!("/v1/runs/{run_id}/replay"), &body)
            .await
    }

    pub async fn team(&self) -> Result<Value, ClientError> {
        self.get_json("/v1/team").await
    }

    /// Open the SSE progress stream of a run.
    pub async fn events(&self, run_id: &str) -> Result<reqwest::Response, ClientError> {
        let url = self.url(&format!("/v1/runs/{run_id}/events"));
        debug!(url = %url, "Subscribing to run events");
        let response = self
            .inner
            .get(&url)
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .send()
            .await?;
        Self::check(response).await
    }
}
