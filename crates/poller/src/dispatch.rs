use reqwest::Client;

use crate::format::EventRequest;

#[derive(Debug)]
pub struct DispatchError(pub String);

impl std::fmt::Display for DispatchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "dispatch: {}", self.0)
    }
}

impl std::error::Error for DispatchError {}

/// Hands a formatted batch of new events to the downstream automation engine.
/// Success/failure is boolean from the poller's point of view; the downstream
/// owns queueing and retries.
#[async_trait::async_trait]
pub trait Dispatcher: Send + Sync {
    fn name(&self) -> &str;
    async fn send(&self, batch: &[EventRequest]) -> Result<(), DispatchError>;
}

pub struct HttpDispatcher {
    url: String,
    client: Client,
}

impl HttpDispatcher {
    pub fn new(url: String) -> Self {
        Self {
            url,
            client: Client::new(),
        }
    }
}

#[async_trait::async_trait]
impl Dispatcher for HttpDispatcher {
    fn name(&self) -> &str {
        "http"
    }

    async fn send(&self, batch: &[EventRequest]) -> Result<(), DispatchError> {
        self.client
            .post(&self.url)
            .json(batch)
            .send()
            .await
            .map_err(|e| DispatchError(e.to_string()))?
            .error_for_status()
            .map_err(|e| DispatchError(e.to_string()))?;

        Ok(())
    }
}
