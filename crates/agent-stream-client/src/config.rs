use std::time::Duration;

use crate::errors::ClientError;

pub const DEFAULT_BASE_URL: &str = "http://127.0.0.1:8000";
/// Long enough for a full multi-agent run.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(300);

/// Configuration for [`StreamClient`](crate::StreamClient).
#[derive(Clone, Debug)]
pub struct StreamClientConfig {
    /// Base URL of the stream server.
    pub base_url: String,
    /// Timeout for a whole request, including the streamed body.
    pub timeout: Duration,
    /// Ask the server for tool and sub-agent events, not just the answer.
    pub show_tool_details: bool,
}

impl Default for StreamClientConfig {
    fn default() -> Self {
        Self::new(DEFAULT_BASE_URL)
    }
}

impl StreamClientConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            timeout: DEFAULT_REQUEST_TIMEOUT,
            show_tool_details: true,
        }
    }

    /// Builds a config from `AGENT_STREAM_URL` and `AGENT_STREAM_REQUEST_TIMEOUT_SECS`.
    pub fn from_env() -> Result<Self, ClientError> {
        let mut config = match std::env::var("AGENT_STREAM_URL") {
            Ok(url) if !url.trim().is_empty() => Self::new(url.trim()),
            _ => Self::default(),
        };
        if let Ok(raw) = std::env::var("AGENT_STREAM_REQUEST_TIMEOUT_SECS") {
            let secs: u64 = raw.trim().parse().map_err(|_| {
                ClientError::Config(format!(
                    "AGENT_STREAM_REQUEST_TIMEOUT_SECS must be a number of seconds, got `{raw}`"
                ))
            })?;
            config = config.timeout(Duration::from_secs(secs));
        }
        Ok(config)
    }

    pub fn base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn show_tool_details(mut self, show: bool) -> Self {
        self.show_tool_details = show;
        self
    }

    pub(crate) fn validate(&self) -> Result<(), ClientError> {
        let url = self.base_url.trim();
        if url.is_empty() {
            return Err(ClientError::Config("base_url must not be empty".into()));
        }
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return Err(ClientError::Config(format!(
                "base_url must start with http:// or https://, got `{url}`"
            )));
        }
        if self.timeout.is_zero() {
            return Err(ClientError::Config("timeout must be greater than 0".into()));
        }
        Ok(())
    }

    pub(crate) fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim().trim_end_matches('/'), path)
    }
}
