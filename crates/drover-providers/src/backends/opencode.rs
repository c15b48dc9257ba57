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
use serde_json::Value;
use std::time::Duration;

/// Registry name of the OpenCode backend.
pub const NAME: &str = "opencode";

/// Environment variables opencode picks up provider credentials from.
const PROVIDER_KEY_VARS: &[&str] = &[
    "ANTHROPIC_API_KEY",
    "OPENAI_API_KEY",
    "OPENROUTER_API_KEY",
    "GEMINI_API_KEY",
    "GROQ_API_KEY",
];

/// OpenCode CLI backend.
///
/// Runs `opencode run --format json`. Models are addressed as
/// `provider/model`.
pub struct OpencodeProvider {
    config: CliToolConfig,
}

impl OpencodeProvider {
    /// OpenCode backend using `config`.
    pub fn new(config: CliToolConfig) -> Self {
        Self { config }
    }

    async fn locate(&self) -> Option<String> {
        let home = dirs::home_dir().map(|p| p.to_string_lossy().into_owned());
        let search = BinarySearch {
            name: "opencode".into(),
            conventional: conventional_paths(
                home.as_deref(),
                &[".opencode/bin/opencode", ".local/bin/opencode", ".bun/bin/opencode"],
                &["/usr/local/bin/opencode", "/opt/homebrew/bin/opencode"],
            ),
            versions_dir: None,
        };
        locate_native(&self.config, &search).await
    }

    fn token(&self) -> Option<String> {
        self.config.api_key.clone().or_else(|| {
            PROVIDER_KEY_VARS
                .iter()
                .find_map(|v| std::env::var(v).ok().filter(|k| !k.is_empty()))
        })
    }
}

/// Command-line arguments for one dispatch, prompt last after `--`.
pub fn build_args(options: &ExecuteOptions, extra_args: &[String]) -> Vec<String> {
    let mut args = vec![
        "run".to_string(),
        "--format".to_string(),
        "json".to_string(),
        "--model".to_string(),
        options.model.clone(),
    ];
    if let Some(session) = &options.resume_session_id {
        args.push("--session".into());
        args.push(session.clone());
    }
    args.extend(extra_args.iter().cloned());
    args.push("--".into());
    args.push(compose_prompt(options, true));
    args
}

fn is_terminal(event: &Value) -> bool {
    event["type"] == "error"
}

#[derive(Default)]
struct OpencodeNormalizer {
    session_id: Option<String>,
    text: String,
}

impl OpencodeNormalizer {
    fn tool(&self, part: &Value) -> Result<Vec<ProviderMessage>, String> {
        let id = part["callID"].as_str().or_else(|| part["id"].as_str()).unwrap_or_default();
        let name = part["tool"].as_str().ok_or("tool_use part without tool name")?;
        let state = &part["state"];
        let input = state["input"].clone();
        let has_input = input.as_object().is_some_and(|m| !m.is_empty());
        match state["status"].as_str() {
            Some("completed") => Ok(vec![tool_exchange(
                id,
                name,
                input,
                value_text(&state["output"]),
                false,
            )]),
            Some("error") => Ok(vec![tool_exchange(
                id,
                name,
                input,
                value_text(&state["error"]),
                true,
            )]),
            Some("running") if has_input => Ok(vec![ProviderMessage::assistant(vec![
                ContentBlock::tool_use(id, name, input),
            ])]),
            _ => Ok(vec![]),
        }
    }
}

impl EventNormalizer for OpencodeNormalizer {
    fn normalize(&mut self, event: &Value) -> Result<Vec<ProviderMessage>, String> {
        let part = &event["part"];
        if self.session_id.is_none() {
            self.session_id = event["sessionID"]
                .as_str()
                .or_else(|| part["sessionID"].as_str())
                .map(String::from);
        }
        match event["type"].as_str() {
            Some("text") => {
                let text = part["text"].as_str().ok_or("text event without text")?;
                if text.trim().is_empty() {
                    return Ok(vec![]);
                }
                if !self.text.is_empty() {
                    self.text.push_str("\n\n");
                }
                self.text.push_str(text);
                Ok(vec![ProviderMessage::assistant_text(text)])
            }
            Some("tool_use") => self.tool(part),
            Some("error") => {
                let err = &event["error"];
                let message = err["data"]["message"]
                    .as_str()
                    .or_else(|| err["message"].as_str())
                    .or_else(|| err["name"].as_str())
                    .unwrap_or("opencode reported an error");
                Ok(vec![ProviderMessage::error(message, self.session_id.clone())])
            }
            // step_start, step_finish, reasoning
            _ => Ok(vec![]),
        }
    }

    fn session_id(&self) -> Option<String> {
        self.session_id.clone()
    }

    /// opencode has no result event; a clean exit is the success signal.
    fn finish(&mut self, _provider: &str) -> ProviderMessage {
        let text = std::mem::take(&mut self.text);
        ProviderMessage::success((!text.is_empty()).then_some(text), self.session_id.clone())
    }
}

#[async_trait]
impl Provider for OpencodeProvider {
    fn name(&self) -> &'static str {
        NAME
    }

    async fn detect_installation(&self) -> InstallationStatus {
        let Some(path) = self.locate().await else {
            return InstallationStatus::not_installed("opencode CLI not found on PATH");
        };
        let version = probe_version(&path).await;

        let home = dirs::home_dir().map(|p| p.to_string_lossy().into_owned());
        let search = AuthSearch {
            token: self.token(),
            compat_credentials: Vec::new(),
            native_credentials: conventional_paths(
                home.as_deref(),
                &[".local/share/opencode/auth.json"],
                &[],
            ),
        };
        let mut auth = discover_auth(&NativeProbe, &NativeProbe, &search).await;
        if auth.is_none() {
            let listed = probe_status(&path, &["auth", "list"]).await;
            if listed.is_some_and(|out| !out.to_lowercase().contains("0 credentials")) {
                auth = Some(AuthSource::CliStatus);
            }
        }

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
            ModelDefinition::new(
                NAME,
                "opencode-anthropic/claude-sonnet-4-5",
                "Claude Sonnet 4.5 (OpenCode)",
                "Anthropic Sonnet through OpenCode",
            )
            .as_default(),
            ModelDefinition::new(NAME, "opencode-openai/gpt-5", "GPT-5 (OpenCode)", "OpenAI GPT-5 through OpenCode"),
            ModelDefinition::new(
                NAME,
                "opencode-opencode/grok-code",
                "Grok Code (OpenCode Zen)",
                "Hosted coding model from OpenCode Zen",
            ),
        ]
    }

    async fn execute_query(&self, options: ExecuteOptions) -> DroverResult<ProviderStream> {
        if options.prompt.is_empty() {
            return Err(DroverError::Provider("opencode: prompt is empty".into()));
        }
        let binary = self.locate().await.ok_or_else(|| DroverError::NotInstalled {
            provider: NAME.into(),
        })?;
        let spec = SpawnSpec::new(binary)
            .args(build_args(&options, &self.config.extra_args))
            .cwd(&options.cwd)
            .timeout(Duration::from_secs(self.config.timeout_secs));
        tracing::info!(model = %options.model, "opencode: spawning CLI");
        run_cli_stream(NAME, spec, options.cancel.clone(), is_terminal, OpencodeNormalizer::default())
    }
}
