use super::{InstallMethod, InstallationStatus, ModelDefinition, Provider, ProviderStream};
use crate::config::ClaudeConfig;
use async_trait::async_trait;
use drover_core::{
    ContentBlock, DroverError, DroverResult, ExecuteOptions, HistoryMessage, ProviderMessage,
    ResultSubtype, Role,
};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Registry name of the Claude backend.
pub const NAME: &str = "claude";
const API_VERSION: &str = "2023-06-01";
/// Sessions kept for resume; the least recently used is evicted beyond this.
const MAX_SESSIONS: usize = 256;

/// Short aliases accepted in place of full model ids.
const MODEL_ALIASES: &[(&str, &str)] = &[
    ("opus", "claude-opus-4-1"),
    ("sonnet", "claude-sonnet-4-5"),
    ("haiku", "claude-haiku-4-5"),
];

/// Claude backend over the Anthropic Messages API.
///
/// Runs in-process, so there is no binary to discover. Sessions live in
/// memory for the lifetime of the provider and cannot be resumed after a
/// restart.
pub struct ClaudeProvider {
    config: ClaudeConfig,
    http: reqwest::Client,
    sessions: Arc<SessionBook>,
}

impl ClaudeProvider {
    /// Claude backend using `config`.
    pub fn new(config: ClaudeConfig) -> Self {
        Self {
            config,
            http: reqwest::Client::new(),
            sessions: Arc::new(SessionBook::default()),
        }
    }

    fn open_session(&self, options: &ExecuteOptions) -> (String, Vec<ApiMessage>) {
        if let Some(id) = &options.resume_session_id {
            if let Some(turns) = self.sessions.get(id) {
                return (id.clone(), turns);
            }
            warn!(session_id = %id, "claude: unknown session, starting a new one");
        }
        let seed = options
            .conversation_history
            .iter()
            .map(ApiMessage::from_history)
            .collect();
        (uuid::Uuid::new_v4().to_string(), seed)
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
struct ApiMessage {
    role: &'static str,
    content: String,
}

impl ApiMessage {
    fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user",
            content: content.into(),
        }
    }

    fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant",
            content: content.into(),
        }
    }

    fn from_history(m: &HistoryMessage) -> Self {
        match m.role {
            Role::User => Self::user(m.content.clone()),
            Role::Assistant => Self::assistant(m.content.clone()),
        }
    }
}

/// Conversation turns per session id, bounded to `capacity` sessions.
struct SessionBook {
    capacity: usize,
    inner: Mutex<BookInner>,
}

#[derive(Default)]
struct BookInner {
    turns: HashMap<String, Vec<ApiMessage>>,
    /// Least recently used first.
    order: VecDeque<String>,
}

impl BookInner {
    fn touch(&mut self, id: &str) {
        if let Some(pos) = self.order.iter().position(|k| k == id) {
            self.order.remove(pos);
        }
        self.order.push_back(id.to_string());
    }
}

impl Default for SessionBook {
    fn default() -> Self {
        Self::with_capacity(MAX_SESSIONS)
    }
}

impl SessionBook {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(BookInner::default()),
        }
    }

    fn get(&self, id: &str) -> Option<Vec<ApiMessage>> {
        let mut inner = self.inner.lock();
        let turns = inner.turns.get(id).cloned()?;
        inner.touch(id);
        Some(turns)
    }

    fn record(&self, id: &str, mut messages: Vec<ApiMessage>, reply: &str) {
        if !reply.is_empty() {
            messages.push(ApiMessage::assistant(reply));
        }
        let mut inner = self.inner.lock();
        inner.turns.insert(id.to_string(), messages);
        inner.touch(id);
        while inner.order.len() > self.capacity {
            if let Some(evicted) = inner.order.pop_front() {
                inner.turns.remove(&evicted);
                debug!(session_id = %evicted, "claude: evicted session");
            }
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.inner.lock().turns.len()
    }
}

/// Resolve `opus`/`sonnet`/`haiku` to full model ids.
pub fn resolve_model_alias(model: &str) -> String {
    MODEL_ALIASES
        .iter()
        .find(|(alias, _)| *alias == model)
        .map(|(_, id)| (*id).to_string())
        .unwrap_or_else(|| model.to_string())
}

/// Category of an API failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdkErrorKind {
    /// HTTP 429 or `rate_limit_error`.
    RateLimit,
    /// HTTP 529 or `overloaded_error`.
    Overloaded,
    /// The request never got a response.
    Network,
    /// Rejected credentials.
    Auth,
    /// Anything else.
    Other,
}

impl SdkErrorKind {
    fn summary(&self) -> &'static str {
        match self {
            SdkErrorKind::RateLimit => "Rate limited",
            SdkErrorKind::Overloaded => "API overloaded",
            SdkErrorKind::Network => "Network error",
            SdkErrorKind::Auth => "Not authenticated",
            SdkErrorKind::Other => "Claude API error",
        }
    }

    /// Classify by HTTP status, then by the API's error type.
    pub fn from_response(status: u16, error_type: Option<&str>) -> Self {
        match (status, error_type) {
            (429, _) | (_, Some("rate_limit_error")) => SdkErrorKind::RateLimit,
            (401 | 403, _) | (_, Some("authentication_error" | "permission_error")) => {
                SdkErrorKind::Auth
            }
            (529, _) | (_, Some("overloaded_error")) => SdkErrorKind::Overloaded,
            _ => SdkErrorKind::Other,
        }
    }
}

#[derive(Debug)]
struct SdkError {
    kind: SdkErrorKind,
    detail: String,
}

impl SdkError {
    fn render(&self) -> String {
        format!("{}: {}", self.kind.summary(), self.detail)
    }
}

impl From<reqwest::Error> for SdkError {
    fn from(e: reqwest::Error) -> Self {
        let kind = if e.is_timeout() || e.is_connect() || e.is_request() {
            SdkErrorKind::Network
        } else {
            SdkErrorKind::Other
        };
        Self {
            kind,
            detail: e.to_string(),
        }
    }
}

fn build_body(
    model: &str,
    max_tokens: u32,
    messages: &[ApiMessage],
    options: &ExecuteOptions,
) -> serde_json::Value {
    let mut max_tokens = max_tokens;
    let mut body = serde_json::json!({
        "model": model,
        "messages": messages,
    });
    if let Some(sys) = options.system_prompt.as_deref().filter(|s| !s.is_empty()) {
        body["system"] = serde_json::json!(sys);
    }
    if let Some(budget) = options.thinking_level.and_then(|l| l.budget_tokens()) {
        max_tokens = max_tokens.max(budget + 4096);
        body["thinking"] = serde_json::json!({ "type": "enabled", "budget_tokens": budget });
    }
    body["max_tokens"] = serde_json::json!(max_tokens);
    body
}

/// Content blocks and concatenated text of a Messages API response.
fn parse_content(body: &serde_json::Value) -> (Vec<ContentBlock>, String) {
    let mut blocks = Vec::new();
    let mut text = String::new();
    for block in body["content"].as_array().into_iter().flatten() {
        match block["type"].as_str() {
            Some("text") => {
                let t = block["text"].as_str().unwrap_or_default();
                if !t.is_empty() {
                    text.push_str(t);
                    blocks.push(ContentBlock::text(t));
                }
            }
            Some("tool_use") => blocks.push(ContentBlock::tool_use(
                block["id"].as_str().unwrap_or_default(),
                block["name"].as_str().unwrap_or_default(),
                block["input"].clone(),
            )),
            _ => {}
        }
    }
    (blocks, text)
}

async fn send(request: reqwest::RequestBuilder) -> Result<serde_json::Value, SdkError> {
    let resp = request.send().await?;
    let status = resp.status();
    if status.is_success() {
        return Ok(resp.json().await?);
    }

    // Proxies and overload paths return HTML, plain text or nothing at all.
    let text = resp.text().await.unwrap_or_default();
    let body: Option<serde_json::Value> = serde_json::from_str(&text).ok();
    let error_type = body
        .as_ref()
        .and_then(|b| b["error"]["type"].as_str())
        .map(String::from);
    let detail = body
        .as_ref()
        .and_then(|b| b["error"]["message"].as_str())
        .map(String::from)
        .or_else(|| {
            let raw = text.trim();
            (!raw.is_empty()).then(|| raw.chars().take(500).collect())
        })
        .unwrap_or_else(|| format!("HTTP {status}"));
    Err(SdkError {
        kind: SdkErrorKind::from_response(status.as_u16(), error_type.as_deref()),
        detail,
    })
}

#[async_trait]
impl Provider for ClaudeProvider {
    fn name(&self) -> &'static str {
        NAME
    }

    async fn detect_installation(&self) -> InstallationStatus {
        let key = self.config.resolve_api_key();
        InstallationStatus {
            installed: true,
            version: Some(API_VERSION.to_string()),
            path: None,
            method: Some(InstallMethod::Sdk),
            auth_method: key.as_ref().map(|_| "api_key".to_string()),
            authenticated: key.is_some(),
            error: key
                .is_none()
                .then(|| "ANTHROPIC_API_KEY is not set".to_string()),
        }
    }

    fn available_models(&self) -> Vec<ModelDefinition> {
        vec![
            ModelDefinition::new(NAME, "claude-opus-4-1", "Claude Opus 4.1", "Most capable, slowest"),
            ModelDefinition::new(NAME, "claude-sonnet-4-5", "Claude Sonnet 4.5", "Balanced coding model")
                .as_default(),
            ModelDefinition::new(NAME, "claude-haiku-4-5", "Claude Haiku 4.5", "Fast and inexpensive"),
        ]
    }

    async fn execute_query(&self, options: ExecuteOptions) -> DroverResult<ProviderStream> {
        let api_key = self
            .config
            .resolve_api_key()
            .ok_or_else(|| DroverError::NotAuthenticated {
                provider: NAME.into(),
            })?;
        if options.prompt.is_empty() {
            return Err(DroverError::Provider("claude: prompt is empty".into()));
        }

        let model = resolve_model_alias(&options.model);
        let (session_id, mut messages) = self.open_session(&options);
        messages.push(ApiMessage::user(options.prompt.as_text()));
        let body = build_body(&model, self.config.max_tokens, &messages, &options);
        if options.max_turns.is_some() || options.allowed_tools.is_some() {
            debug!("claude: turn limits and tool allow-lists do not apply to single-shot requests");
        }

        let url = format!("{}/v1/messages", self.config.base_url().trim_end_matches('/'));
        let request = self
            .http
            .post(&url)
            .header("x-api-key", api_key)
            .header("anthropic-version", API_VERSION)
            .header("content-type", "application/json")
            .timeout(Duration::from_secs(self.config.timeout_secs))
            .json(&body);

        info!(model = %model, session_id = %session_id, turns = messages.len(), "claude: sending request");
        let sessions = self.sessions.clone();
        let cancel = options.cancel.clone();

        Ok(Box::pin(async_stream::stream! {
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                result = send(request) => Some(result),
            };
            match outcome {
                None => debug!(session_id = %session_id, "claude: request cancelled"),
                Some(Ok(body)) => {
                    let (blocks, text) = parse_content(&body);
                    sessions.record(&session_id, messages, &text);
                    if !blocks.is_empty() {
                        yield ProviderMessage::assistant(blocks);
                    }
                    let result = (!text.is_empty()).then_some(text);
                    if body["stop_reason"] == "max_tokens" {
                        yield ProviderMessage::Result {
                            subtype: ResultSubtype::ErrorMaxTurns,
                            result,
                            session_id: Some(session_id),
                        };
                    } else {
                        yield ProviderMessage::success(result, Some(session_id));
                    }
                }
                Some(Err(e)) => {
                    warn!(kind = ?e.kind, "claude: request failed");
                    yield ProviderMessage::error(e.render(), Some(session_id));
                }
            }
        }))
    }

    fn supports_resume(&self) -> bool {
        false
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use drover_core::ThinkingLevel;
    use futures_util::StreamExt;
    use serde_json::json;
    use tokio_util::sync::CancellationToken;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn provider(server: &MockServer) -> ClaudeProvider {
        ClaudeProvider::new(ClaudeConfig {
            api_key: Some("test-key".into()),
            api_base_url: Some(server.uri()),
            ..ClaudeConfig::default()
        })
    }

    fn reply(text: &str, stop_reason: &str) -> serde_json::Value {
        json!({
            "id": "msg_1",
            "type": "message",
            "role": "assistant",
            "content": [{"type": "text", "text": text}],
            "stop_reason": stop_reason,
            "usage": {"input_tokens": 5, "output_tokens": 7}
        })
    }

    #[tokio::test]
    async fn test_success_stream() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .and(header("x-api-key", "test-key"))
            .and(header("anthropic-version", API_VERSION))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "content": [
                    {"type": "text", "text": "I'll list files."},
                    {"type": "tool_use", "id": "tu_1", "name": "Bash", "input": {"command": "ls"}}
                ],
                "stop_reason": "tool_use"
            })))
            .mount(&server)
            .await;

        let p = provider(&server);
        let stream = p
            .execute_query(ExecuteOptions::new("list files", "sonnet", "/tmp"))
            .await
            .unwrap();
        let messages: Vec<_> = stream.collect().await;
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].blocks().len(), 2);
        assert!(messages[1].is_success());
        assert!(messages[1].session_id().is_some());

        let sent: serde_json::Value =
            serde_json::from_slice(&server.received_requests().await.unwrap()[0].body).unwrap();
        assert_eq!(sent["model"], "claude-sonnet-4-5");
    }

    #[tokio::test]
    async fn test_rate_limit_is_error_message() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429).set_body_json(json!({
                "type": "error",
                "error": {"type": "rate_limit_error", "message": "slow down"}
            })))
            .mount(&server)
            .await;

        let messages: Vec<_> = provider(&server)
            .execute_query(ExecuteOptions::new("hi", "haiku", "/tmp"))
            .await
            .unwrap()
            .collect()
            .await;
        assert_eq!(messages.len(), 1);
        assert!(matches!(&messages[0], ProviderMessage::Error { error, .. } if error == "Rate limited: slow down"));
    }

    #[tokio::test]
    async fn test_plain_text_error_bodies_keep_their_kind() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429).set_body_string("Too Many Requests"))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(529))
            .mount(&server)
            .await;

        let p = provider(&server);
        let first: Vec<_> = p
            .execute_query(ExecuteOptions::new("hi", "haiku", "/tmp"))
            .await
            .unwrap()
            .collect()
            .await;
        assert!(
            matches!(&first[0], ProviderMessage::Error { error, .. } if error == "Rate limited: Too Many Requests"),
            "{first:?}"
        );

        let second: Vec<_> = p
            .execute_query(ExecuteOptions::new("hi", "haiku", "/tmp"))
            .await
            .unwrap()
            .collect()
            .await;
        assert!(
            matches!(&second[0], ProviderMessage::Error { error, .. } if error.starts_with("API overloaded: HTTP 529")),
            "{second:?}"
        );
    }

    #[test]
    fn test_session_book_evicts_least_recently_used() {
        let book = SessionBook::with_capacity(2);
        book.record("a", vec![ApiMessage::user("one")], "ok");
        book.record("b", vec![ApiMessage::user("two")], "ok");
        assert!(book.get("a").is_some());
        book.record("c", vec![ApiMessage::user("three")], "ok");

        assert_eq!(book.len(), 2);
        assert!(book.get("b").is_none());
        assert_eq!(book.get("a").unwrap().len(), 2);
        assert!(book.get("c").is_some());
    }

    #[tokio::test]
    async fn test_max_tokens_maps_to_error_max_turns() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(reply("partial", "max_tokens")))
            .mount(&server)
            .await;

        let messages: Vec<_> = provider(&server)
            .execute_query(ExecuteOptions::new("write a novel", "opus", "/tmp"))
            .await
            .unwrap()
            .collect()
            .await;
        assert!(matches!(
            messages.last().unwrap(),
            ProviderMessage::Result { subtype: ResultSubtype::ErrorMaxTurns, .. }
        ));
    }

    #[tokio::test]
    async fn test_resume_replays_session_turns() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(reply("ok", "end_turn")))
            .mount(&server)
            .await;

        let p = provider(&server);
        let first: Vec<_> = p
            .execute_query(ExecuteOptions::new("step one", "sonnet", "/tmp"))
            .await
            .unwrap()
            .collect()
            .await;
        let session = first.last().unwrap().session_id().unwrap().to_string();

        let second: Vec<_> = p
            .execute_query(ExecuteOptions::new("step two", "sonnet", "/tmp").with_resume_session(&session))
            .await
            .unwrap()
            .collect()
            .await;
        assert_eq!(second.last().unwrap().session_id(), Some(session.as_str()));

        let requests = server.received_requests().await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&requests[1].body).unwrap();
        let turns = body["messages"].as_array().unwrap();
        assert_eq!(turns.len(), 3);
        assert_eq!(turns[0]["content"], "step one");
        assert_eq!(turns[1]["role"], "assistant");
        assert!(!p.supports_resume());
    }

    #[tokio::test]
    async fn test_cancelled_before_response_ends_silently() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(reply("late", "end_turn"))
                    .set_delay(Duration::from_secs(5)),
            )
            .mount(&server)
            .await;

        let cancel = CancellationToken::new();
        let mut stream = provider(&server)
            .execute_query(ExecuteOptions::new("hi", "sonnet", "/tmp").with_cancel(cancel.clone()))
            .await
            .unwrap();
        cancel.cancel();
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_empty_prompt_rejected() {
        let server = MockServer::start().await;
        let err = provider(&server)
            .execute_query(ExecuteOptions::new("  ", "sonnet", "/tmp"))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, DroverError::Provider(_)));
    }

    #[test]
    fn test_thinking_raises_max_tokens() {
        let opts = ExecuteOptions::new("x", "sonnet", "/tmp").with_thinking_level(ThinkingLevel::High);
        let body = build_body("claude-sonnet-4-5", 8192, &[ApiMessage::user("x")], &opts);
        assert_eq!(body["thinking"]["budget_tokens"], 24_576);
        assert_eq!(body["max_tokens"], 24_576 + 4096);
    }

    #[test]
    fn test_error_kind_classification() {
        assert_eq!(SdkErrorKind::from_response(429, None), SdkErrorKind::RateLimit);
        assert_eq!(SdkErrorKind::from_response(400, Some("authentication_error")), SdkErrorKind::Auth);
        assert_eq!(SdkErrorKind::from_response(529, None), SdkErrorKind::Overloaded);
        assert_eq!(SdkErrorKind::from_response(500, Some("api_error")), SdkErrorKind::Other);
    }

    #[test]
    fn test_alias_resolution() {
        assert_eq!(resolve_model_alias("opus"), "claude-opus-4-1");
        assert_eq!(resolve_model_alias("claude-3-5-haiku-latest"), "claude-3-5-haiku-latest");
    }
}
