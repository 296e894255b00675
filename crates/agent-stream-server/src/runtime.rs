//! Agent runtime boundary.
//!
//! The stream does not care what an agent actually does; it only needs the
//! runtime to report through an [`Ingress`]. [`ScriptedRuntime`] is a
//! deterministic runtime that replays a JSON script, used by the server binary
//! when no real agent backend is wired in, and by the tests.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use agent_stream_core::{ChatRequest, Ingress};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::errors::{ConfigError, RuntimeFailure};

/// Name of the tool that wraps a delegated sub-agent.
pub const DELEGATION_TOOL: &str = "task";

/// Something that executes a chat request and reports its progress.
#[async_trait::async_trait]
pub trait AgentRuntime: Send + Sync {
    /// Runs `request` to completion. Must leave no span open on success;
    /// `done` is emitted by the caller.
    async fn run(&self, request: &ChatRequest, ingress: &Ingress) -> Result<(), RuntimeFailure>;
}

/// One step of a script.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "step", rename_all = "snake_case")]
pub enum Step {
    Status {
        description: String,
    },
    Tool {
        name: String,
        #[serde(default)]
        result: String,
        #[serde(default)]
        delay_ms: u64,
    },
    /// Output text, streamed word by word.
    Token {
        text: String,
    },
    /// Hands work to a sub-agent through the `task` tool.
    Delegate {
        agent: String,
        description: String,
        steps: Vec<Step>,
    },
    Delay {
        ms: u64,
    },
    Fail {
        message: String,
    },
    /// Streams back the last user message.
    Echo,
}

/// A runtime that plays back a fixed list of steps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptedRuntime {
    steps: Vec<Step>,
}

impl Default for ScriptedRuntime {
    fn default() -> Self {
        Self::demo()
    }
}

// Ids are unique within one run only.
#[derive(Debug, Default)]
struct RunIds {
    tools: AtomicU64,
    agents: AtomicU64,
}

impl RunIds {
    fn next_tool(&self) -> String {
        format!("tool-{}", self.tools.fetch_add(1, Ordering::Relaxed) + 1)
    }

    fn next_agent(&self) -> String {
        format!("agent-{}", self.agents.fetch_add(1, Ordering::Relaxed) + 1)
    }
}

struct Playback<'a> {
    request: &'a ChatRequest,
    ingress: &'a Ingress,
    ids: RunIds,
}

impl ScriptedRuntime {
    pub fn new(steps: Vec<Step>) -> Self {
        Self { steps }
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    /// Loads a script from a JSON file: either `{"steps": [...]}` or a bare array.
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::ScriptIo {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&raw).map_err(|source| ConfigError::ScriptFormat {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Script {
            Wrapped { steps: Vec<Step> },
            Bare(Vec<Step>),
        }
        Ok(match serde_json::from_str(raw)? {
            Script::Wrapped { steps } | Script::Bare(steps) => Self::new(steps),
        })
    }

    /// Plan with todos, delegate research to a sub-agent, then answer.
    pub fn demo() -> Self {
        Self::new(vec![
            Step::Status {
                description: "Planning research".into(),
            },
            Step::Tool {
                name: "write_todos".into(),
                result: "Updated todo list: research topic, draft answer".into(),
                delay_ms: 0,
            },
            Step::Delegate {
                agent: "research-agent".into(),
                description: "Research the user's question".into(),
                steps: vec![
                    Step::Tool {
                        name: "tavily_search".into(),
                        result: "Found 3 relevant sources".into(),
                        delay_ms: 0,
                    },
                    Step::Tool {
                        name: "think_tool".into(),
                        result: String::new(),
                        delay_ms: 0,
                    },
                    Step::Token {
                        text: "Sources agree on the main points.".into(),
                    },
                ],
            },
            Step::Tool {
                name: "read_todos".into(),
                result: "All todos completed".into(),
                delay_ms: 0,
            },
            Step::Token {
                text: "Here is what I found about:".into(),
            },
            Step::Echo,
        ])
    }
}

#[async_trait::async_trait]
impl AgentRuntime for ScriptedRuntime {
    async fn run(&self, request: &ChatRequest, ingress: &Ingress) -> Result<(), RuntimeFailure> {
        let playback = Playback {
            request,
            ingress,
            ids: RunIds::default(),
        };
        playback.play(&self.steps, 0).await.map(|_| ())
    }
}

impl<'a> Playback<'a> {
    /// Plays `steps` at `depth` and returns the text produced at that depth.
    fn play<'s>(&'s self, steps: &'s [Step], depth: u32) -> BoxFuture<'s, Result<String, RuntimeFailure>> {
        Box::pin(async move {
            let mut text = String::new();
            for step in steps {
                match step {
                    Step::Status { description } => {
                        self.ingress.status(description.as_str(), depth).await?;
                    }
                    Step::Tool {
                        name,
                        result,
                        delay_ms,
                    } => {
                        let tool_id = self.ids.next_tool();
                        self.ingress.tool_start(&tool_id, name.as_str(), depth).await?;
                        if *delay_ms > 0 {
                            tokio::time::sleep(Duration::from_millis(*delay_ms)).await;
                        }
                        self.ingress
                            .tool_end(&tool_id, name.as_str(), result.as_str(), depth)
                            .await?;
                    }
                    Step::Token { text: content } => {
                        self.stream_words(content, depth, &mut text).await?;
                    }
                    Step::Echo => {
                        let content = self.request.last_user_message().unwrap_or_default();
                        let content = if text.is_empty() || content.is_empty() {
                            content.to_string()
                        } else {
                            format!(" {content}")
                        };
                        self.stream_words(&content, depth, &mut text).await?;
                    }
                    Step::Delegate {
                        agent,
                        description,
                        steps,
                    } => {
                        let result = self.delegate(agent, description, steps, depth).await?;
                        debug!(agent = %agent, depth, chars = result.len(), "sub-agent finished");
                    }
                    Step::Delay { ms } => {
                        tokio::time::sleep(Duration::from_millis(*ms)).await;
                    }
                    Step::Fail { message } => {
                        return Err(RuntimeFailure::step(message.as_str()));
                    }
                }
            }
            Ok(text)
        })
    }

    async fn delegate(
        &self,
        agent: &str,
        description: &str,
        steps: &[Step],
        depth: u32,
    ) -> Result<String, RuntimeFailure> {
        let tool_id = self.ids.next_tool();
        let agent_id = self.ids.next_agent();
        let sub_depth = depth + 1;

        self.ingress.tool_start(&tool_id, DELEGATION_TOOL, depth).await?;
        self.ingress.agent_start(&agent_id, agent, sub_depth).await?;
        self.ingress.status(description, sub_depth).await?;
        let text = self.play(steps, sub_depth).await?;
        self.ingress.agent_end(&agent_id, sub_depth).await?;
        self.ingress
            .tool_end(&tool_id, DELEGATION_TOOL, text.as_str(), depth)
            .await?;
        Ok(text)
    }

    async fn stream_words(&self, content: &str, depth: u32, text: &mut String) -> Result<(), RuntimeFailure> {
        for word in content.split_inclusive(' ') {
            self.ingress.token(word, depth).await?;
            text.push_str(word);
        }
        Ok(())
    }
}
