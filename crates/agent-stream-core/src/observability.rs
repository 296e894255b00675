//! Process-wide `tracing` setup.
//!
//! Each run executes inside a [`run_span`], and the emission owner task
//! inherits it, so every emitter log line carries the run id.

use std::fmt::Display;
use std::path::{Path, PathBuf};

use once_cell::sync::OnceCell;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;

static INIT: OnceCell<()> = OnceCell::new();

pub const DEFAULT_FILTER: &str = "info";
const DEFAULT_JSON_FILE: &str = "agent-stream.logs.jsonl";

/// Where log lines go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogOutput {
    /// Compact human-readable lines on stdout.
    Console,
    /// JSON lines on stdout.
    JsonStdout,
    /// JSON lines appended to a file by a background writer.
    JsonFile(PathBuf),
    /// Lines captured by the test harness.
    TestWriter,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObservabilityConfig {
    pub enabled: bool,
    /// `EnvFilter` directive.
    pub filter: String,
    pub output: LogOutput,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            filter: DEFAULT_FILTER.to_string(),
            output: LogOutput::Console,
        }
    }
}

impl ObservabilityConfig {
    /// Reads the config from the environment:
    /// - `AGENT_STREAM_OBSERVABILITY`: on unless set to a false value.
    /// - `AGENT_STREAM_LOG_LEVEL`, then `RUST_LOG`: filter directive.
    /// - `AGENT_STREAM_JSON_LOG_PATH`: JSON lines to this file.
    /// - `AGENT_STREAM_LOG_FORMAT=json`: JSON lines on stdout.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Debug output routed through the test harness, filtered by `RUST_LOG` when set.
    pub fn for_tests() -> Self {
        Self {
            enabled: true,
            filter: std::env::var("RUST_LOG").unwrap_or_else(|_| "debug".to_string()),
            output: LogOutput::TestWriter,
        }
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let non_empty = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());
        let mut config = Self::default();

        if let Some(enabled) = non_empty("AGENT_STREAM_OBSERVABILITY").and_then(|v| parse_bool_env(&v)) {
            config.enabled = enabled;
        }
        if let Some(filter) = non_empty("AGENT_STREAM_LOG_LEVEL").or_else(|| non_empty("RUST_LOG")) {
            config.filter = filter.trim().to_string();
        }
        let json = non_empty("AGENT_STREAM_LOG_FORMAT")
            .is_some_and(|format| format.trim().eq_ignore_ascii_case("json"));
        config.output = match non_empty("AGENT_STREAM_JSON_LOG_PATH") {
            Some(path) => LogOutput::JsonFile(PathBuf::from(path.trim())),
            None if json => LogOutput::JsonStdout,
            None => LogOutput::Console,
        };
        config
    }
}

fn parse_bool_env(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" | "enabled" => Some(true),
        "0" | "false" | "no" | "off" | "disabled" => Some(false),
        _ => None,
    }
}

/// Keeps the background file writer alive. Buffered lines are flushed on drop.
#[must_use = "dropping the guard stops the log file writer"]
pub struct ObservabilityGuard {
    _writer: Option<WorkerGuard>,
}

/// Installs the global subscriber. Only the first call in a process has an effect.
pub fn init_observability(config: &ObservabilityConfig) -> ObservabilityGuard {
    let mut writer = None;
    INIT.get_or_init(|| writer = install(config));
    ObservabilityGuard { _writer: writer }
}

/// Span for everything one run does.
pub fn run_span(run_id: impl Display) -> tracing::Span {
    tracing::info_span!("run", run_id = %run_id)
}

fn install(config: &ObservabilityConfig) -> Option<WorkerGuard> {
    if !config.enabled {
        return None;
    }

    let (filter, rejected) = match EnvFilter::try_new(&config.filter) {
        Ok(filter) => (filter, None),
        Err(err) => (EnvFilter::new(DEFAULT_FILTER), Some(err)),
    };
    let registry = tracing_subscriber::registry().with(filter);

    let mut writer = None;
    let installed = match &config.output {
        LogOutput::Console => registry
            .with(fmt::layer().compact().with_target(false))
            .try_init(),
        LogOutput::JsonStdout => registry
            .with(
                fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_span_list(false)
                    .with_writer(std::io::stdout),
            )
            .try_init(),
        LogOutput::JsonFile(path) => {
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender(path));
            writer = Some(guard);
            registry
                .with(
                    fmt::layer()
                        .json()
                        .with_current_span(true)
                        .with_span_list(false)
                        .with_writer(non_blocking),
                )
                .try_init()
        }
        LogOutput::TestWriter => registry
            .with(fmt::layer().with_test_writer())
            .try_init(),
    };

    // Another subscriber was installed first; keep it.
    installed.ok()?;
    if let Some(err) = rejected {
        tracing::warn!(filter = %config.filter, error = %err, "invalid log filter, using `{DEFAULT_FILTER}`");
    }
    writer
}

fn file_appender(path: &Path) -> tracing_appender::rolling::RollingFileAppender {
    let dir = path
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let _ = std::fs::create_dir_all(dir);
    let file_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or(DEFAULT_JSON_FILE);
    tracing_appender::rolling::never(dir, file_name)
}
