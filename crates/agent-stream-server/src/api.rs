use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use agent_stream_core::{ChatRequest, ChatResponse, Message, StreamReader};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use dashmap::DashMap;
use futures::StreamExt as _;
use serde_json::json;
use tokio::sync::oneshot;
use tokio_stream::wrappers::ReceiverStream;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::{Level, debug, info};
use uuid::Uuid;

use crate::errors::ApiError;
use crate::run::{AbortHandle, RunHandle, RunOptions, RunOutcome, RunStream, start_run};
use crate::runtime::AgentRuntime;

/// Response header carrying the id of a started run.
pub const RUN_ID_HEADER: &str = "x-run-id";

/// Shared state of the HTTP service.
#[derive(Clone)]
pub struct AppState {
    runtime: Arc<dyn AgentRuntime>,
    options: RunOptions,
    keep_alive: Duration,
    runs: Arc<DashMap<Uuid, AbortHandle>>,
}

impl AppState {
    pub fn new(runtime: Arc<dyn AgentRuntime>, options: RunOptions, keep_alive: Duration) -> Self {
        Self {
            runtime,
            options,
            keep_alive,
            runs: Arc::new(DashMap::new()),
        }
    }

    /// Number of runs that have not finished yet.
    pub fn active_runs(&self) -> usize {
        self.runs.len()
    }

    /// Cancels every active run.
    pub fn abort_all(&self) {
        for entry in self.runs.iter() {
            entry.value().abort();
        }
    }

    fn start(&self, request: ChatRequest) -> Result<RunStream, ApiError> {
        let options = self.options.clone().show_steps(request.show_tool_details);
        Ok(start_run(self.runtime.clone(), request, options)?)
    }

    // Registers the run for cancellation until it ends. The entry is removed
    // by a detached task, so it goes away even if the request is dropped.
    fn track(&self, handle: RunHandle) -> oneshot::Receiver<RunOutcome> {
        let run_id = handle.run_id();
        self.runs.insert(run_id, handle.abort_handle());
        let runs = self.runs.clone();
        let (outcome_tx, outcome_rx) = oneshot::channel();
        tokio::spawn(async move {
            let outcome = handle.wait().await;
            runs.remove(&run_id);
            debug!(%run_id, outcome = ?outcome, "run untracked");
            let _ = outcome_tx.send(outcome);
        });
        outcome_rx
    }
}

/// Builds the service router.
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
        .expose_headers(Any);

    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
        .on_request(DefaultOnRequest::new().level(Level::INFO))
        .on_response(DefaultOnResponse::new().level(Level::INFO));

    Router::new()
        .route("/health", get(health))
        .route("/chat", post(chat))
        .route("/chat/stream", post(chat_stream))
        .route("/chat/runs/{run_id}", delete(cancel_run))
        .layer(trace_layer)
        .layer(cors)
        .with_state(state)
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

async fn chat_stream(
    State(state): State<AppState>,
    Json(request): Json<ChatRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let stream = state.start(request)?;
    let run_id = stream.run_id();
    let (frames, handle) = stream.into_parts();
    // The SSE body observes the end of the run through its frames.
    drop(state.track(handle));
    info!(%run_id, "streaming run");

    let events = ReceiverStream::new(frames).map(|frame| {
        Ok::<_, Infallible>(SseEvent::default().id(frame.seq.to_string()).data(frame.data))
    });
    let sse = Sse::new(events).keep_alive(KeepAlive::new().interval(state.keep_alive));
    Ok(([(RUN_ID_HEADER, run_id.to_string())], sse))
}

async fn chat(
    State(state): State<AppState>,
    Json(request): Json<ChatRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let stream = state.start(request)?;
    let run_id = stream.run_id();
    let (mut frames, handle) = stream.into_parts();
    let outcome = state.track(handle);

    let mut reader = StreamReader::new();
    let mut decode_error = None;
    while let Some(frame) = frames.recv().await {
        if decode_error.is_some() {
            continue;
        }
        match frame.decode() {
            Ok(event) => {
                if let Err(err) = reader.apply(&event) {
                    decode_error = Some(ApiError::from(err));
                }
            }
            Err(err) => decode_error = Some(ApiError::from(err)),
        }
    }
    let outcome = outcome
        .await
        .map_err(|_| ApiError::Internal(format!("run {run_id} ended without an outcome")))?;

    if let Some(err) = decode_error {
        return Err(err);
    }
    let tree = reader.into_tree()?;
    match outcome {
        RunOutcome::Completed => Ok(Json(ChatResponse {
            message: Message::assistant(tree.root().text.clone()),
        })),
        RunOutcome::Failed(reason) => Err(ApiError::RunFailed(reason)),
        RunOutcome::Cancelled => Err(ApiError::RunFailed("run cancelled".into())),
        RunOutcome::TimedOut => Err(ApiError::RunFailed("run timed out".into())),
        RunOutcome::TransportLost => Err(ApiError::Internal("run stream was lost".into())),
    }
}

async fn cancel_run(
    State(state): State<AppState>,
    Path(run_id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    match state.runs.get(&run_id) {
        Some(entry) => {
            entry.value().abort();
            info!(%run_id, "run cancellation requested");
            Ok(StatusCode::NO_CONTENT)
        }
        None => Err(ApiError::NotFound(format!("run {run_id} not found"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{ScriptedRuntime, Step};
    use agent_stream_core::{Event, FrameDecoder};
    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use tower::ServiceExt as _;

    fn app_with(runtime: ScriptedRuntime) -> (Router, AppState) {
        let state = AppState::new(Arc::new(runtime), RunOptions::default(), Duration::from_secs(15));
        (create_router(state.clone()), state)
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn decode_body(body: &[u8]) -> Vec<Event> {
        let mut decoder = FrameDecoder::default();
        let mut events: Vec<Event> = decoder
            .push_chunk(body)
            .into_iter()
            .map(|event| event.unwrap())
            .collect();
        events.extend(decoder.finish().unwrap());
        events
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let (app, _) = app_with(ScriptedRuntime::demo());
        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(serde_json::from_slice::<serde_json::Value>(&body).unwrap(), json!({"status": "ok"}));
    }

    #[tokio::test]
    async fn stream_endpoint_emits_ordered_frames() {
        let (app, _) = app_with(ScriptedRuntime::demo());
        let response = app
            .oneshot(post_json(
                "/chat/stream",
                json!({"messages": [{"role": "user", "content": "tokio"}], "stream": true}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().contains_key(RUN_ID_HEADER));
        assert_eq!(
            response.headers()["content-type"].to_str().unwrap(),
            "text/event-stream"
        );

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let events = decode_body(&body);
        assert_eq!(events.last(), Some(&Event::Done));
        let tree = StreamReader::replay(events).unwrap();
        assert!(tree.root().text.ends_with("tokio"));
    }

    #[tokio::test]
    async fn chat_endpoint_returns_the_root_text() {
        let (app, state) = app_with(ScriptedRuntime::new(vec![Step::Echo]));
        let response = app
            .oneshot(post_json(
                "/chat",
                json!({"messages": [{"role": "user", "content": "echo me"}]}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(
            serde_json::from_slice::<serde_json::Value>(&body).unwrap(),
            json!({"message": {"role": "assistant", "content": "echo me"}})
        );
        assert_eq!(state.active_runs(), 0);
    }

    #[tokio::test]
    async fn dropped_chat_request_releases_its_run() {
        let (app, state) = app_with(ScriptedRuntime::new(vec![
            Step::Delay { ms: 100 },
            Step::Token {
                text: "too late".into(),
            },
        ]));
        let request = app.oneshot(post_json(
            "/chat",
            json!({"messages": [{"role": "user", "content": "hi"}]}),
        ));
        // The caller disconnects while the run is still going.
        assert!(tokio::time::timeout(Duration::from_millis(20), request).await.is_err());
        assert_eq!(state.active_runs(), 1);

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(state.active_runs(), 0);
    }

    #[tokio::test]
    async fn failed_run_maps_to_bad_gateway() {
        let (app, _) = app_with(ScriptedRuntime::new(vec![Step::Fail {
            message: "model unavailable".into(),
        }]));
        let response = app
            .oneshot(post_json(
                "/chat",
                json!({"messages": [{"role": "user", "content": "hi"}]}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn empty_messages_are_a_bad_request() {
        let (app, _) = app_with(ScriptedRuntime::demo());
        let response = app
            .oneshot(post_json("/chat/stream", json!({"messages": []})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["code"], "bad_request");
    }

    #[tokio::test]
    async fn cancelling_an_unknown_run_is_not_found() {
        let (app, _) = app_with(ScriptedRuntime::demo());
        let response = app
            .oneshot(
                Request::builder()
                    .method("DELETE")
                    .uri(format!("/chat/runs/{}", Uuid::new_v4()))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    async fn serve(runtime: ScriptedRuntime) -> (String, AppState) {
        let (app, state) = app_with(runtime);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{addr}"), state)
    }

    #[tokio::test]
    async fn client_replays_a_live_run() {
        let (base_url, _) = serve(ScriptedRuntime::demo()).await;
        let client = agent_stream_client::StreamClient::new(
            agent_stream_client::StreamClientConfig::new(base_url),
        )
        .unwrap();

        let tree = client.replay(vec![Message::user("loopback")]).await.unwrap();
        assert!(tree.root().text.ends_with("loopback"));
        let agent = tree
            .find(agent_stream_core::SpanKind::Agent, "agent-1")
            .unwrap();
        assert_eq!(agent.name, "research-agent");
        assert!(tree.descendants().all(|node| node.is_complete()));

        let answer = client.chat(vec![Message::user("again")]).await.unwrap();
        assert!(answer.ends_with("again"));
    }

    #[tokio::test]
    async fn client_without_details_sees_only_the_answer() {
        let (base_url, _) = serve(ScriptedRuntime::demo()).await;
        let client = agent_stream_client::StreamClient::new(
            agent_stream_client::StreamClientConfig::new(base_url).show_tool_details(false),
        )
        .unwrap();

        let tree = client.replay(vec![Message::user("quiet")]).await.unwrap();
        assert!(tree.is_empty());
        assert!(tree.root().statuses.is_empty());
        assert!(tree.root().text.ends_with("quiet"));
    }

    #[tokio::test]
    async fn client_surfaces_validation_errors() {
        let (base_url, _) = serve(ScriptedRuntime::demo()).await;
        let client = agent_stream_client::StreamClient::new(
            agent_stream_client::StreamClientConfig::new(base_url),
        )
        .unwrap();

        let err = client.stream(Vec::new()).await.err().unwrap();
        assert_eq!(err.status(), Some(400));
        assert!(!client.cancel(&Uuid::new_v4().to_string()).await.unwrap());
    }

    #[tokio::test]
    async fn cancelling_an_active_run_closes_its_stream() {
        let (app, state) = app_with(ScriptedRuntime::new(vec![
            Step::Tool {
                name: "tavily_search".into(),
                result: "slow".into(),
                delay_ms: 10_000,
            },
        ]));
        let response = app
            .clone()
            .oneshot(post_json(
                "/chat/stream",
                json!({"messages": [{"role": "user", "content": "hi"}]}),
            ))
            .await
            .unwrap();
        let run_id = response.headers()[RUN_ID_HEADER].to_str().unwrap().to_string();
        assert_eq!(state.active_runs(), 1);

        let cancel = app
            .oneshot(
                Request::builder()
                    .method("DELETE")
                    .uri(format!("/chat/runs/{run_id}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(cancel.status(), StatusCode::NO_CONTENT);

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let events = decode_body(&body);
        assert_eq!(
            &events[events.len() - 2..],
            &[Event::status("Run cancelled", 0), Event::Done]
        );
    }
}
