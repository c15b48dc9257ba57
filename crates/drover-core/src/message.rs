use serde::{Deserialize, Serialize};

/// The role of the participant that authored a conversational message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// A human end-user (or the scheduler acting on its behalf).
    User,
    /// The AI agent.
    Assistant,
}

/// One block of message content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    /// Plain assistant or user text.
    Text {
        /// The text itself.
        text: String,
    },
    /// A tool invocation made by the agent.
    ToolUse {
        /// Backend-assigned call identifier.
        id: String,
        /// Tool name.
        name: String,
        /// Tool arguments.
        input: serde_json::Value,
    },
    /// The output of a previously announced tool invocation.
    ToolResult {
        /// The `id` of the matching [`ContentBlock::ToolUse`].
        tool_use_id: String,
        /// Tool output rendered as text.
        content: String,
        /// Whether the tool reported a failure.
        #[serde(default)]
        is_error: bool,
    },
}

impl ContentBlock {
    /// Creates a text block.
    pub fn text(text: impl Into<String>) -> Self {
        ContentBlock::Text { text: text.into() }
    }

    /// Creates a tool-use block.
    pub fn tool_use(
        id: impl Into<String>,
        name: impl Into<String>,
        input: serde_json::Value,
    ) -> Self {
        ContentBlock::ToolUse {
            id: id.into(),
            name: name.into(),
            input,
        }
    }

    /// Creates a tool-result block.
    pub fn tool_result(tool_use_id: impl Into<String>, content: impl Into<String>, is_error: bool) -> Self {
        ContentBlock::ToolResult {
            tool_use_id: tool_use_id.into(),
            content: content.into(),
            is_error,
        }
    }
}

/// Outcome flavour carried by a terminal [`ProviderMessage::Result`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultSubtype {
    /// The agent finished its turn normally.
    Success,
    /// The agent finished but reported an error.
    Error,
    /// The agent stopped because it ran out of turns or tokens.
    ErrorMaxTurns,
}

/// The uniform output contract of every provider adapter.
///
/// Each dispatch yields a sequence of these that ends in exactly one terminal
/// signal ([`ProviderMessage::Result`] or [`ProviderMessage::Error`]), or ends
/// without one only when the dispatch was cancelled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProviderMessage {
    /// Content produced by the agent.
    Assistant {
        /// Always [`Role::Assistant`].
        role: Role,
        /// Ordered content blocks.
        content: Vec<ContentBlock>,
    },
    /// Content echoed on behalf of the user.
    User {
        /// Always [`Role::User`].
        role: Role,
        /// Ordered content blocks.
        content: Vec<ContentBlock>,
    },
    /// Terminal outcome of the dispatch.
    Result {
        /// Success or error flavour.
        subtype: ResultSubtype,
        /// Final result text, if the backend reports one.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<String>,
        /// Session identifier that can be used to resume the conversation.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
    },
    /// Terminal failure of the dispatch.
    Error {
        /// Human-readable summary plus technical detail.
        error: String,
        /// Session identifier, when one had been established.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
    },
}

impl ProviderMessage {
    /// An assistant message with the given blocks.
    pub fn assistant(content: Vec<ContentBlock>) -> Self {
        ProviderMessage::Assistant {
            role: Role::Assistant,
            content,
        }
    }

    /// An assistant message holding a single text block.
    pub fn assistant_text(text: impl Into<String>) -> Self {
        Self::assistant(vec![ContentBlock::text(text)])
    }

    /// A user message with the given blocks.
    pub fn user(content: Vec<ContentBlock>) -> Self {
        ProviderMessage::User {
            role: Role::User,
            content,
        }
    }

    /// A successful terminal result.
    pub fn success(result: Option<String>, session_id: Option<String>) -> Self {
        ProviderMessage::Result {
            subtype: ResultSubtype::Success,
            result,
            session_id,
        }
    }

    /// A terminal error.
    pub fn error(error: impl Into<String>, session_id: Option<String>) -> Self {
        ProviderMessage::Error {
            error: error.into(),
            session_id,
        }
    }

    /// Whether this message ends the dispatch.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProviderMessage::Result { .. } | ProviderMessage::Error { .. }
        )
    }

    /// Whether this is a terminal signal describing a successful run.
    pub fn is_success(&self) -> bool {
        matches!(
            self,
            ProviderMessage::Result {
                subtype: ResultSubtype::Success,
                ..
            }
        )
    }

    /// Session identifier carried by a terminal message.
    pub fn session_id(&self) -> Option<&str> {
        match self {
            ProviderMessage::Result { session_id, .. }
            | ProviderMessage::Error { session_id, .. } => session_id.as_deref(),
            _ => None,
        }
    }

    /// Content blocks of an assistant or user message.
    pub fn blocks(&self) -> &[ContentBlock] {
        match self {
            ProviderMessage::Assistant { content, .. } | ProviderMessage::User { content, .. } => {
                content
            }
            _ => &[],
        }
    }

    /// Concatenated text of all text blocks.
    pub fn text(&self) -> String {
        self.blocks()
            .iter()
            .filter_map(|b| match b {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_assistant_wire_shape() {
        let msg = ProviderMessage::assistant_text("hello");
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "assistant",
                "role": "assistant",
                "content": [{"type": "text", "text": "hello"}]
            })
        );
    }

    #[test]
    fn test_result_wire_shape_omits_empty_fields() {
        let msg = ProviderMessage::success(None, Some("sess-1".into()));
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(
            value,
            json!({"type": "result", "subtype": "success", "session_id": "sess-1"})
        );
    }

    #[test]
    fn test_error_max_turns_parses() {
        let msg: ProviderMessage =
            serde_json::from_value(json!({"type": "result", "subtype": "error_max_turns"})).unwrap();
        assert!(msg.is_terminal());
        assert!(!msg.is_success());
    }

    #[test]
    fn test_terminal_classification() {
        assert!(!ProviderMessage::assistant_text("x").is_terminal());
        assert!(ProviderMessage::error("bad", None).is_terminal());
        assert!(ProviderMessage::success(None, None).is_success());
    }

    #[test]
    fn test_text_joins_only_text_blocks() {
        let msg = ProviderMessage::assistant(vec![
            ContentBlock::text("a"),
            ContentBlock::tool_use("t1", "Read", json!({"path": "x"})),
            ContentBlock::text("b"),
        ]);
        assert_eq!(msg.text(), "ab");
    }

    #[test]
    fn test_tool_result_default_is_error() {
        let block: ContentBlock =
            serde_json::from_value(json!({"type": "tool_result", "tool_use_id": "t", "content": "ok"}))
                .unwrap();
        assert_eq!(block, ContentBlock::tool_result("t", "ok", false));
    }
}
