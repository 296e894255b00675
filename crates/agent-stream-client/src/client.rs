use agent_stream_core::{ChatRequest, ChatResponse, ExecutionTree, Message};
use tracing::debug;

use crate::config::StreamClientConfig;
use crate::errors::ClientError;
use crate::stream::{EventStream, event_stream, reconstruct};

const RUN_ID_HEADER: &str = "x-run-id";

/// A streamed run as seen by the client.
pub struct RunEvents {
    /// Server-assigned run id, if the server sent one.
    pub run_id: Option<String>,
    pub events: EventStream,
}

/// HTTP client for the stream server.
#[derive(Clone, Debug)]
pub struct StreamClient {
    http: reqwest::Client,
    config: StreamClientConfig,
}

impl StreamClient {
    pub fn new(config: StreamClientConfig) -> Result<Self, ClientError> {
        config.validate()?;
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| ClientError::Config(format!("failed to build http client: {e}")))?;
        Ok(Self { http, config })
    }

    /// Creates a client from `AGENT_STREAM_URL` and `AGENT_STREAM_REQUEST_TIMEOUT_SECS`.
    pub fn from_env() -> Result<Self, ClientError> {
        Self::new(StreamClientConfig::from_env()?)
    }

    pub fn config(&self) -> &StreamClientConfig {
        &self.config
    }

    /// Starts a run and returns its events as they arrive.
    pub async fn stream(&self, messages: Vec<Message>) -> Result<RunEvents, ClientError> {
        let request = ChatRequest::new(messages)
            .with_stream(true)
            .with_tool_details(self.config.show_tool_details);
        let response = self
            .http
            .post(self.config.url("/chat/stream"))
            .json(&request)
            .send()
            .await
            .map_err(ClientError::http)?;
        let response = check_status(response).await?;

        let run_id = response
            .headers()
            .get(RUN_ID_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        debug!(run_id = ?run_id, "run stream opened");

        Ok(RunEvents {
            run_id,
            events: Box::pin(event_stream(Box::pin(response.bytes_stream()))),
        })
    }

    /// Streams a run to the end and rebuilds its execution tree.
    pub async fn replay(&self, messages: Vec<Message>) -> Result<ExecutionTree, ClientError> {
        let run = self.stream(messages).await?;
        reconstruct(run.events).await
    }

    /// Runs to completion without streaming and returns the assistant's answer.
    pub async fn chat(&self, messages: Vec<Message>) -> Result<String, ClientError> {
        let request = ChatRequest::new(messages);
        let response = self
            .http
            .post(self.config.url("/chat"))
            .json(&request)
            .send()
            .await
            .map_err(ClientError::http)?;
        let response = check_status(response).await?;
        let body: ChatResponse = response.json().await.map_err(ClientError::http)?;
        Ok(body.message.content)
    }

    /// Cancels a run. Returns false if the server does not know the run.
    pub async fn cancel(&self, run_id: &str) -> Result<bool, ClientError> {
        let response = self
            .http
            .delete(self.config.url(&format!("/chat/runs/{run_id}")))
            .send()
            .await
            .map_err(ClientError::http)?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(false);
        }
        check_status(response).await?;
        Ok(true)
    }
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, ClientError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response
        .text()
        .await
        .unwrap_or_else(|_| "<unreadable body>".to_string());
    Err(ClientError::Status {
        status: status.as_u16(),
        body,
    })
}
