use std::sync::Arc;

use agent_stream_core::{ObservabilityConfig, init_observability};
use agent_stream_server::{AppState, ScriptedRuntime, ServerArgs, config, create_router};
use anyhow::Context as _;
use clap::Parser;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    config::load_env();
    let _logs = init_observability(&ObservabilityConfig::from_env());

    let config = ServerArgs::parse().into_config()?;
    let runtime = match &config.script {
        Some(path) => ScriptedRuntime::from_path(path)?,
        None => ScriptedRuntime::demo(),
    };
    info!(
        script = ?config.script,
        steps = runtime.steps().len(),
        timeout = ?config.run.timeout_duration(),
        "runtime loaded"
    );

    let state = AppState::new(Arc::new(runtime), config.run.clone(), config.keep_alive);
    let app = create_router(state.clone());

    let listener = tokio::net::TcpListener::bind(config.bind)
        .await
        .with_context(|| format!("binding {}", config.bind))?;
    info!(addr = %config.bind, "listening");

    let shutdown_signal = async move {
        let ctrl_c = async {
            let _ = tokio::signal::ctrl_c().await;
        };

        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut signal) => {
                    signal.recv().await;
                }
                Err(_) => std::future::pending::<()>().await,
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {},
            _ = terminate => {},
        }

        info!(active = state.active_runs(), "shutdown signal received, cancelling runs");
        state.abort_all();
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal)
        .await
        .context("running server")?;

    Ok(())
}
