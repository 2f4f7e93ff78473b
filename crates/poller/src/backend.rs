use std::time::Duration;

use reqwest::Client;
use serde_json::Value;

use crate::store::Adapter;

#[derive(Debug)]
pub enum BackendError {
    Transport(String),
    Status { code: u16, body: String },
    Decode(String),
    Rejected(String),
}

impl std::fmt::Display for BackendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Transport(e) => write!(f, "transport: {e}"),
            Self::Status { code, body } => write!(f, "backend returned {code}: {body}"),
            Self::Decode(e) => write!(f, "decode: {e}"),
            Self::Rejected(e) => write!(f, "backend rejected query: {e}"),
        }
    }
}

impl std::error::Error for BackendError {}

impl From<reqwest::Error> for BackendError {
    fn from(e: reqwest::Error) -> Self {
        Self::Transport(e.to_string())
    }
}

/// A conflict is a normal outcome: a concurrent poller already owns the
/// adapter and the caller yields instead of erroring.
#[derive(Debug)]
pub enum QueryOutcome {
    Payload(Value),
    Conflict,
}

#[async_trait::async_trait]
pub trait Backend: Send + Sync {
    async fn query(
        &self,
        adapter: &Adapter,
        window_start: f64,
        window_end: f64,
    ) -> Result<QueryOutcome, BackendError>;
}

/// Queries a monitoring backend over its HTTP range API. One request per
/// cycle, no retries; retry policy lives with the supervisor's schedule.
pub struct HttpBackend {
    client: Client,
    step: String,
}

impl HttpBackend {
    pub fn new(timeout: Duration, step: String) -> Result<Self, BackendError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { client, step })
    }
}

#[async_trait::async_trait]
impl Backend for HttpBackend {
    async fn query(
        &self,
        adapter: &Adapter,
        window_start: f64,
        window_end: f64,
    ) -> Result<QueryOutcome, BackendError> {
        let mut params: Vec<(&str, String)> = Vec::new();
        if !adapter.metric.is_empty() {
            params.push(("query", adapter.metric.clone()));
        }
        params.push(("start", window_start.to_string()));
        params.push(("end", window_end.to_string()));
        params.push(("step", self.step.clone()));

        let mut request = self.client.post(&adapter.uri).form(&params);
        if !adapter.username.is_empty() {
            request = request.basic_auth(&adapter.username, Some(&adapter.password));
        }

        let response = request.send().await?;
        let status = response.status();

        if status.as_u16() == 409 {
            return Ok(QueryOutcome::Conflict);
        }
        if !status.is_success() {
            return Err(BackendError::Status {
                code: status.as_u16(),
                body: response.text().await.unwrap_or_default(),
            });
        }

        let payload: Value = response
            .json()
            .await
            .map_err(|e| BackendError::Decode(e.to_string()))?;

        // Backends that answer 200 with an error body still fail the query.
        if let Some(err) = payload.get("error") {
            return Err(BackendError::Rejected(err.to_string()));
        }

        Ok(QueryOutcome::Payload(payload))
    }
}
