//! HTTP service that runs agents and streams their execution events.

pub mod api;
pub mod config;
pub mod errors;
pub mod run;
pub mod runtime;

pub use api::{AppState, RUN_ID_HEADER, create_router};
pub use config::{ServerArgs, ServerConfig};
pub use errors::{ApiError, ConfigError, RunError, RuntimeFailure};
pub use run::{AbortHandle, RunHandle, RunOptions, RunOutcome, RunStream, start_run};
pub use runtime::{AgentRuntime, ScriptedRuntime, Step};
