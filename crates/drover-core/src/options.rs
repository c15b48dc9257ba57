use crate::message::{ContentBlock, Role};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;

/// Prompt payload: plain text or structured content blocks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PromptContent {
    /// A plain text prompt.
    Text(String),
    /// Structured content (text plus, e.g., tool results to replay).
    Blocks(Vec<ContentBlock>),
}

impl PromptContent {
    /// Flatten the prompt to text, joining text blocks with blank lines.
    pub fn as_text(&self) -> String {
        match self {
            PromptContent::Text(t) => t.clone(),
            PromptContent::Blocks(blocks) => blocks
                .iter()
                .filter_map(|b| match b {
                    ContentBlock::Text { text } => Some(text.as_str()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join("\n\n"),
        }
    }

    /// True when the prompt carries no text at all.
    pub fn is_empty(&self) -> bool {
        self.as_text().trim().is_empty()
    }
}

impl From<&str> for PromptContent {
    fn from(s: &str) -> Self {
        PromptContent::Text(s.to_string())
    }
}

impl From<String> for PromptContent {
    fn from(s: String) -> Self {
        PromptContent::Text(s)
    }
}

/// Launch description of an MCP server handed to the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct McpServerConfig {
    /// Executable to launch.
    pub command: String,
    /// Arguments for the executable.
    #[serde(default)]
    pub args: Vec<String>,
    /// Extra environment for the server process.
    #[serde(default)]
    pub env: HashMap<String, String>,
}

/// Reasoning-effort hint for backends that support it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReasoningEffort {
    /// Minimal reasoning.
    Low,
    /// Backend default.
    Medium,
    /// Maximum reasoning.
    High,
}

impl ReasoningEffort {
    /// Lowercase wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            ReasoningEffort::Low => "low",
            ReasoningEffort::Medium => "medium",
            ReasoningEffort::High => "high",
        }
    }
}

/// Extended-thinking budget hint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThinkingLevel {
    /// Thinking disabled.
    None,
    /// Small budget.
    Low,
    /// Medium budget.
    Medium,
    /// Large budget.
    High,
}

impl ThinkingLevel {
    /// Token budget associated with the level, `None` if thinking is off.
    pub fn budget_tokens(&self) -> Option<u32> {
        match self {
            ThinkingLevel::None => None,
            ThinkingLevel::Low => Some(2_048),
            ThinkingLevel::Medium => Some(8_192),
            ThinkingLevel::High => Some(24_576),
        }
    }
}

/// One prior turn of conversation replayed into a new session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryMessage {
    /// Who said it.
    pub role: Role,
    /// What was said.
    pub content: String,
}

/// Immutable per-dispatch configuration handed to a provider adapter.
///
/// The model identifier must already be stripped of its provider prefix.
#[derive(Debug, Clone)]
pub struct ExecuteOptions {
    /// Prompt to submit.
    pub prompt: PromptContent,
    /// Bare model identifier.
    pub model: String,
    /// Working directory the agent operates in.
    pub cwd: PathBuf,
    /// Optional system prompt appended to the backend default.
    pub system_prompt: Option<String>,
    /// Maximum agent turns.
    pub max_turns: Option<u32>,
    /// Tool allow-list; `None` leaves the backend default.
    pub allowed_tools: Option<Vec<String>>,
    /// MCP servers, keyed by server name.
    pub mcp_servers: HashMap<String, McpServerConfig>,
    /// Reasoning-effort hint.
    pub reasoning_effort: Option<ReasoningEffort>,
    /// Extended-thinking hint.
    pub thinking_level: Option<ThinkingLevel>,
    /// Cancellation handle; triggering it ends the dispatch silently.
    pub cancel: CancellationToken,
    /// Prior conversation to seed a new session with.
    pub conversation_history: Vec<HistoryMessage>,
    /// Session to resume instead of opening a new one.
    pub resume_session_id: Option<String>,
}

impl ExecuteOptions {
    /// Options with only the required fields set.
    pub fn new(prompt: impl Into<PromptContent>, model: impl Into<String>, cwd: impl Into<PathBuf>) -> Self {
        Self {
            prompt: prompt.into(),
            model: model.into(),
            cwd: cwd.into(),
            system_prompt: None,
            max_turns: None,
            allowed_tools: None,
            mcp_servers: HashMap::new(),
            reasoning_effort: None,
            thinking_level: None,
            cancel: CancellationToken::new(),
            conversation_history: Vec::new(),
            resume_session_id: None,
        }
    }

    /// Set the system prompt.
    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    /// Set the turn limit.
    pub fn with_max_turns(mut self, turns: u32) -> Self {
        self.max_turns = Some(turns);
        self
    }

    /// Set the tool allow-list.
    pub fn with_allowed_tools(mut self, tools: Vec<String>) -> Self {
        self.allowed_tools = Some(tools);
        self
    }

    /// Add an MCP server.
    pub fn with_mcp_server(mut self, name: impl Into<String>, server: McpServerConfig) -> Self {
        self.mcp_servers.insert(name.into(), server);
        self
    }

    /// Set the reasoning-effort hint.
    pub fn with_reasoning_effort(mut self, effort: ReasoningEffort) -> Self {
        self.reasoning_effort = Some(effort);
        self
    }

    /// Set the thinking-level hint.
    pub fn with_thinking_level(mut self, level: ThinkingLevel) -> Self {
        self.thinking_level = Some(level);
        self
    }

    /// Use the given cancellation handle.
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Seed the session with prior turns.
    pub fn with_history(mut self, history: Vec<HistoryMessage>) -> Self {
        self.conversation_history = history;
        self
    }

    /// Resume a prior session.
    pub fn with_resume_session(mut self, session_id: impl Into<String>) -> Self {
        self.resume_session_id = Some(session_id.into());
        self
    }
}
