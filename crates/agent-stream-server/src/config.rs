use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use agent_stream_core::mux::{DEFAULT_COMMAND_BUFFER, DEFAULT_FRAME_BUFFER, MuxOptions};
use clap::Parser;

use crate::errors::ConfigError;
use crate::run::RunOptions;

/// Loads `.env` from the crate directory and the working directory, if present.
pub fn load_env() {
    let _ = dotenvy::from_path(Path::new(concat!(env!("CARGO_MANIFEST_DIR"), "/.env")));
    dotenvy::dotenv().ok();
}

#[derive(Parser, Debug, Clone)]
#[command(name = "agent-stream-server")]
#[command(about = "Streams nested agent runs as Server-Sent Events")]
pub struct ServerArgs {
    /// Address to listen on
    #[arg(long, env = "AGENT_STREAM_BIND", default_value = "127.0.0.1:8000")]
    pub bind: SocketAddr,

    /// Frames buffered between a run and its HTTP response
    #[arg(long, env = "AGENT_STREAM_FRAME_BUFFER", default_value_t = DEFAULT_FRAME_BUFFER)]
    pub frame_buffer: usize,

    /// Events queued between the runtime and the emitter
    #[arg(long, env = "AGENT_STREAM_COMMAND_BUFFER", default_value_t = DEFAULT_COMMAND_BUFFER)]
    pub command_buffer: usize,

    /// Cancel runs that take longer than this many seconds
    #[arg(long, env = "AGENT_STREAM_RUN_TIMEOUT_SECS")]
    pub run_timeout_secs: Option<u64>,

    /// Interval between SSE keep-alive comments
    #[arg(long, env = "AGENT_STREAM_KEEP_ALIVE_SECS", default_value_t = 15)]
    pub keep_alive_secs: u64,

    /// JSON script for the scripted runtime (built-in demo when unset)
    #[arg(long, env = "AGENT_STREAM_SCRIPT")]
    pub script: Option<PathBuf>,
}

/// Validated server settings.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: SocketAddr,
    pub run: RunOptions,
    pub keep_alive: Duration,
    pub script: Option<PathBuf>,
}

impl ServerArgs {
    pub fn into_config(self) -> Result<ServerConfig, ConfigError> {
        if self.frame_buffer == 0 {
            return Err(ConfigError::Invalid(
                "frame_buffer must be greater than 0".into(),
            ));
        }
        if self.command_buffer == 0 {
            return Err(ConfigError::Invalid(
                "command_buffer must be greater than 0".into(),
            ));
        }
        if self.keep_alive_secs == 0 {
            return Err(ConfigError::Invalid(
                "keep_alive_secs must be greater than 0".into(),
            ));
        }
        if self.run_timeout_secs == Some(0) {
            return Err(ConfigError::Invalid(
                "run_timeout_secs must be greater than 0".into(),
            ));
        }

        let mut run = RunOptions::default().mux(MuxOptions {
            frame_buffer: self.frame_buffer,
            command_buffer: self.command_buffer,
        });
        if let Some(secs) = self.run_timeout_secs {
            run = run.timeout(Duration::from_secs(secs));
        }

        Ok(ServerConfig {
            bind: self.bind,
            run,
            keep_alive: Duration::from_secs(self.keep_alive_secs),
            script: self.script,
        })
    }
}
