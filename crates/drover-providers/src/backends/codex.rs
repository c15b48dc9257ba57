use super::cli::{
    compose_prompt, conventional_paths, locate_native, probe_status, probe_version, run_cli_stream,
    tool_exchange, value_text, EventNormalizer,
};
use super::{InstallMethod, InstallationStatus, ModelDefinition, Provider, ProviderStream};
use crate::config::CliToolConfig;
use crate::process::SpawnSpec;
use crate::wsl::{discover_auth, AuthSearch, AuthSource, BinarySearch, NativeProbe};
use async_trait::async_trait;
use drover_core::{ContentBlock, DroverError, DroverResult, ExecuteOptions, ProviderMessage};
use serde_json::{json, Value};
use std::time::Duration;

/// Registry name of the Codex backend.
pub const NAME: &str = "codex";

/// OpenAI Codex CLI backend.
///
/// Runs `codex exec --json` non-interactively and normalizes its thread/item
/// event stream.
pub struct CodexProvider {
    config: CliToolConfig,
}

impl CodexProvider {
    /// Codex backend using `config`.
    pub fn new(config: CliToolConfig) -> Self {
        Self { config }
    }

    async fn locate(&self) -> Option<String> {
        let home = dirs::home_dir().map(|p| p.to_string_lossy().into_owned());
        let search = BinarySearch {
            name: "codex".into(),
            conventional: conventional_paths(
                home.as_deref(),
                &[".local/bin/codex", ".npm-global/bin/codex", ".cargo/bin/codex"],
                &["/usr/local/bin/codex", "/opt/homebrew/bin/codex"],
            ),
            versions_dir: None,
        };
        locate_native(&self.config, &search).await
    }

    fn token(&self) -> Option<String> {
        self.config
            .api_key
            .clone()
            .or_else(|| std::env::var("CODEX_API_KEY").ok())
            .or_else(|| std::env::var("OPENAI_API_KEY").ok())
    }
}

/// Command-line arguments for one dispatch, prompt last after `--`.
pub fn build_args(options: &ExecuteOptions, extra_args: &[String]) -> Vec<String> {
    let mut args = vec![
        "exec".to_string(),
        "--json".to_string(),
        "--skip-git-repo-check".to_string(),
        "--sandbox".to_string(),
        "workspace-write".to_string(),
        "--model".to_string(),
        options.model.clone(),
        "-C".to_string(),
        options.cwd.to_string_lossy().into_owned(),
    ];
    if let Some(effort) = options.reasoning_effort {
        args.push("-c".into());
        args.push(format!("model_reasoning_effort=\"{}\"", effort.as_str()));
    }
    let mut servers: Vec<_> = options.mcp_servers.iter().collect();
    servers.sort_by(|a, b| a.0.cmp(b.0));
    for (name, server) in servers {
        args.push("-c".into());
        args.push(format!("mcp_servers.{name}.command={}", json!(server.command)));
        if !server.args.is_empty() {
            args.push("-c".into());
            args.push(format!("mcp_servers.{name}.args={}", json!(server.args)));
        }
    }
    args.extend(extra_args.iter().cloned());
    if let Some(session) = &options.resume_session_id {
        args.push("resume".into());
        args.push(session.clone());
    }
    // A prompt starting with `-` must not be parsed as a flag.
    args.push("--".into());
    args.push(compose_prompt(options, true));
    args
}

fn is_terminal(event: &Value) -> bool {
    matches!(
        event["type"].as_str(),
        Some("turn.completed" | "turn.failed" | "error")
    )
}

#[derive(Default)]
struct CodexNormalizer {
    thread_id: Option<String>,
    last_text: Option<String>,
}

impl CodexNormalizer {
    fn started(&self, item: &Value) -> Result<Vec<ProviderMessage>, String> {
        let id = item["id"].as_str().ok_or("item without id")?;
        match item["type"].as_str() {
            Some("command_execution") => match item["command"].as_str() {
                Some(cmd) if !cmd.is_empty() => Ok(vec![ProviderMessage::assistant(vec![
                    ContentBlock::tool_use(id, "Bash", json!({ "command": cmd })),
                ])]),
                _ => Ok(vec![]),
            },
            _ => Ok(vec![]),
        }
    }

    fn completed(&mut self, item: &Value) -> Result<Vec<ProviderMessage>, String> {
        let id = item["id"].as_str().unwrap_or_default();
        match item["type"].as_str() {
            Some("agent_message") => {
                let text = item["text"].as_str().ok_or("agent_message without text")?;
                if text.is_empty() {
                    return Ok(vec![]);
                }
                self.last_text = Some(text.to_string());
                Ok(vec![ProviderMessage::assistant_text(text)])
            }
            Some("command_execution") => {
                let cmd = item["command"].as_str().ok_or("command_execution without command")?;
                let failed = item["status"] == "failed"
                    || item["exit_code"].as_i64().is_some_and(|c| c != 0);
                Ok(vec![tool_exchange(
                    id,
                    "Bash",
                    json!({ "command": cmd }),
                    value_text(&item["aggregated_output"]),
                    failed,
                )])
            }
            Some("file_change") => {
                let changes = item["changes"].clone();
                let summary = changes
                    .as_array()
                    .map(|c| {
                        c.iter()
                            .map(|ch| {
                                format!(
                                    "{} {}",
                                    ch["kind"].as_str().unwrap_or("update"),
                                    ch["path"].as_str().unwrap_or("?")
                                )
                            })
                            .collect::<Vec<_>>()
                            .join("\n")
                    })
                    .unwrap_or_default();
                let failed = item["status"] == "failed";
                Ok(vec![tool_exchange(id, "Edit", json!({ "changes": changes }), summary, failed)])
            }
            Some("mcp_tool_call") => {
                let server = item["server"].as_str().unwrap_or("mcp");
                let tool = item["tool"].as_str().ok_or("mcp_tool_call without tool")?;
                let failed = item["status"] == "failed" || !item["error"].is_null();
                let output = if failed {
                    value_text(&item["error"])
                } else {
                    value_text(&item["result"])
                };
                Ok(vec![tool_exchange(
                    id,
                    &format!("{server}__{tool}"),
                    item["arguments"].clone(),
                    output,
                    failed,
                )])
            }
            Some("error") => {
                tracing::warn!(message = %value_text(&item["message"]), "codex reported a non-fatal error");
                Ok(vec![])
            }
            _ => Ok(vec![]),
        }
    }
}

impl EventNormalizer for CodexNormalizer {
    fn normalize(&mut self, event: &Value) -> Result<Vec<ProviderMessage>, String> {
        match event["type"].as_str() {
            Some("thread.started") => {
                self.thread_id = event["thread_id"].as_str().map(String::from);
                Ok(vec![])
            }
            Some("item.started") => self.started(&event["item"]),
            Some("item.completed") => self.completed(&event["item"]),
            Some("turn.completed") => Ok(vec![ProviderMessage::success(
                self.last_text.clone(),
                self.thread_id.clone(),
            )]),
            Some("turn.failed") => {
                let message = event["error"]["message"]
                    .as_str()
                    .unwrap_or("codex turn failed");
                Ok(vec![ProviderMessage::error(message, self.thread_id.clone())])
            }
            Some("error") => {
                let message = event["message"].as_str().unwrap_or("codex reported an error");
                Ok(vec![ProviderMessage::error(message, self.thread_id.clone())])
            }
            _ => Ok(vec![]),
        }
    }

    fn session_id(&self) -> Option<String> {
        self.thread_id.clone()
    }
}

#[async_trait]
impl Provider for CodexProvider {
    fn name(&self) -> &'static str {
        NAME
    }

    async fn detect_installation(&self) -> InstallationStatus {
        let Some(path) = self.locate().await else {
            return InstallationStatus::not_installed("codex CLI not found on PATH");
        };
        let version = probe_version(&path).await;

        let home = dirs::home_dir().map(|p| p.to_string_lossy().into_owned());
        let search = AuthSearch {
            token: self.token(),
            compat_credentials: Vec::new(),
            native_credentials: conventional_paths(home.as_deref(), &[".codex/auth.json"], &[]),
        };
        let auth = match discover_auth(&NativeProbe, &NativeProbe, &search).await {
            Some(source) => Some(source),
            None => probe_status(&path, &["login", "status"])
                .await
                .map(|_| AuthSource::CliStatus),
        };

        InstallationStatus {
            installed: true,
            version,
            path: Some(path),
            method: Some(InstallMethod::Native),
            auth_method: auth.as_ref().map(|a| a.method().to_string()),
            authenticated: auth.is_some(),
            error: None,
        }
    }

    fn available_models(&self) -> Vec<ModelDefinition> {
        vec![
            ModelDefinition::new(NAME, "codex-gpt-5-codex", "GPT-5 Codex", "Agentic coding model tuned for Codex")
                .as_default(),
            ModelDefinition::new(NAME, "codex-gpt-5", "GPT-5", "General-purpose reasoning model"),
            ModelDefinition::new(NAME, "codex-o4-mini", "o4-mini", "Fast, low-cost reasoning"),
        ]
    }

    async fn execute_query(&self, options: ExecuteOptions) -> DroverResult<ProviderStream> {
        if options.prompt.is_empty() {
            return Err(DroverError::Provider("codex: prompt is empty".into()));
        }
        let binary = self.locate().await.ok_or_else(|| DroverError::NotInstalled {
            provider: NAME.into(),
        })?;

        let mut spec = SpawnSpec::new(binary)
            .args(build_args(&options, &self.config.extra_args))
            .cwd(&options.cwd)
            .timeout(Duration::from_secs(self.config.timeout_secs));
        if let Some(token) = &self.config.api_key {
            spec = spec.env("CODEX_API_KEY", token);
        }

        tracing::info!(model = %options.model, resume = options.resume_session_id.is_some(), "codex: spawning CLI");
        run_cli_stream(NAME, spec, options.cancel.clone(), is_terminal, CodexNormalizer::default())
    }
}
