//! Authenticated HTTP client for the backend's agent API

use backon::{ExponentialBuilder, Retryable};
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;
use url::Url;
use uuid::Uuid;

use crate::models::{JobResult, JobType};

use super::AgentConfig;

#[derive(Debug, Error)]
pub enum ClientError {
    /// Pairing key rejected; re-pairing is the only fix, never retried
    #[error("agent credentials rejected")]
    Unauthorized,
    #[error("transport error: {0}")]
    Transport(String),
    #[error("api error {status}: {detail}")]
    Api { status: u16, detail: String },
}

impl ClientError {
    pub fn is_transient(&self) -> bool {
        match self {
            ClientError::Unauthorized => false,
            ClientError::Transport(_) => true,
            ClientError::Api { status, .. } => *status >= 500,
        }
    }
}

/// A job handed to this agent by the backend
#[derive(Debug, Clone)]
pub struct ClaimedJob {
    pub job_id: Uuid,
    pub job_type: JobType,
    pub input_data: Value,
}

#[derive(Debug, Serialize)]
pub struct QuotePush {
    pub bid: f64,
    pub ask: f64,
    pub time: DateTime<Utc>,
}

pub struct ApiClient {
    http: reqwest::Client,
    base: Url,
    agent_id: Uuid,
    agent_key: String,
}

impl ApiClient {
    pub fn new(config: &AgentConfig) -> Result<Self, ClientError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| ClientError::Transport(e.to_string()))?;

        Ok(Self {
            http,
            base: config.api_url.clone(),
            agent_id: config.agent_id,
            agent_key: config.agent_key.clone(),
        })
    }

    pub fn agent_id(&self) -> Uuid {
        self.agent_id
    }

    fn endpoint(&self, path: &str) -> Result<Url, ClientError> {
        self.base
            .join(path)
            .map_err(|e| ClientError::Transport(e.to_string()))
    }

    fn backoff() -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_min_delay(Duration::from_secs(5))
            .with_max_delay(Duration::from_secs(300))
            .with_max_times(6)
    }

    async fn request(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<Value, ClientError> {
        let url = self.endpoint(path)?;

        let send = || async {
            let mut request = self
                .http
                .request(method.clone(), url.clone())
                .header("X-Agent-Id", self.agent_id.to_string())
                .header("X-Agent-Key", &self.agent_key);
            if let Some(body) = body {
                request = request.json(body);
            }

            let response = request
                .send()
                .await
                .map_err(|e| ClientError::Transport(e.to_string()))?;

            match response.status() {
                StatusCode::UNAUTHORIZED => Err(ClientError::Unauthorized),
                status if status.is_success() => response
                    .json::<Value>()
                    .await
                    .map_err(|e| ClientError::Transport(e.to_string())),
                status => {
                    let detail = response.text().await.unwrap_or_default();
                    Err(ClientError::Api {
                        status: status.as_u16(),
                        detail,
                    })
                }
            }
        };

        send.retry(Self::backoff())
            .when(ClientError::is_transient)
            .notify(|e, dur| {
                warn!(error = %e, "API request failed, retrying in {:?}", dur);
            })
            .await
    }

    /// Poll for work; `None` means an empty queue
    pub async fn next_job(&self) -> Result<Option<ClaimedJob>, ClientError> {
        let body = self
            .request(
                reqwest::Method::GET,
                &format!("/agents/{}/jobs/next", self.agent_id),
                None,
            )
            .await?;

        if body.get("no_jobs").and_then(Value::as_bool).unwrap_or(false) {
            return Ok(None);
        }

        let job_id = body
            .get("job_id")
            .and_then(Value::as_str)
            .and_then(|s| Uuid::parse_str(s).ok())
            .ok_or_else(|| ClientError::Transport("malformed job payload".to_string()))?;
        let job_type = body
            .get("job_type")
            .and_then(Value::as_str)
            .and_then(JobType::parse)
            .ok_or_else(|| ClientError::Transport("unknown job type".to_string()))?;

        Ok(Some(ClaimedJob {
            job_id,
            job_type,
            input_data: body.get("input_data").cloned().unwrap_or(Value::Null),
        }))
    }

    pub async fn submit_result(
        &self,
        job_id: Uuid,
        result: &JobResult,
    ) -> Result<(), ClientError> {
        let body = serde_json::to_value(result)
            .map_err(|e| ClientError::Transport(e.to_string()))?;
        self.request(
            reqwest::Method::POST,
            &format!("/agents/{}/jobs/{}/result", self.agent_id, job_id),
            Some(&body),
        )
        .await?;
        Ok(())
    }

    pub async fn heartbeat(&self, status: &str, metrics: Value) -> Result<(), ClientError> {
        let body = serde_json::json!({ "status": status, "metrics": metrics });
        self.request(
            reqwest::Method::POST,
            &format!("/agents/{}/heartbeat", self.agent_id),
            Some(&body),
        )
        .await?;
        Ok(())
    }

    /// Push a batch of quotes; returns how many the backend accepted
    pub async fn push_prices(
        &self,
        quotes: &HashMap<String, QuotePush>,
    ) -> Result<usize, ClientError> {
        let body = serde_json::to_value(quotes)
            .map_err(|e| ClientError::Transport(e.to_string()))?;
        let response = self
            .request(
                reqwest::Method::POST,
                &format!("/agents/{}/prices", self.agent_id),
                Some(&body),
            )
            .await?;
        Ok(response
            .get("received")
            .and_then(Value::as_u64)
            .unwrap_or(0) as usize)
    }
}
