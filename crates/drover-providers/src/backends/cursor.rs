use super::cli::{
    compose_prompt, conventional_paths, probe_status, probe_version, run_cli_stream,
    tool_exchange, value_text, EventNormalizer,
};
use super::{InstallMethod, InstallationStatus, ModelDefinition, Provider, ProviderStream};
use crate::config::CursorConfig;
use crate::process::SpawnSpec;
use crate::wsl::{
    discover_auth, discover_binary, AuthSearch, AuthSource, BinarySearch, HostPlatform, NativeProbe,
    ShellProbe, WslProbe, WslShell,
};
use async_trait::async_trait;
use drover_core::{ContentBlock, DroverError, DroverResult, ExecuteOptions, ProviderMessage};
use serde_json::{json, Value};
use std::time::Duration;

/// Registry name of the Cursor backend.
pub const NAME: &str = "cursor";
const BINARY: &str = "cursor-agent";

/// Cursor agent CLI backend.
///
/// On Windows the CLI is only available inside WSL, so discovery and
/// execution go through `wsl.exe`.
pub struct CursorProvider {
    config: CursorConfig,
    host: HostPlatform,
}

struct Located {
    path: String,
    method: InstallMethod,
}

impl CursorProvider {
    /// Cursor backend using `config`.
    pub fn new(config: CursorConfig) -> Self {
        Self::for_host(config, HostPlatform::current())
    }

    /// Backend for an explicit host platform.
    pub fn for_host(config: CursorConfig, host: HostPlatform) -> Self {
        Self { config, host }
    }

    fn shell(&self) -> WslShell {
        WslShell::new(self.config.wsl_distro.clone())
    }

    fn probe(&self) -> Box<dyn ShellProbe> {
        match self.host {
            HostPlatform::Windows => Box::new(WslProbe::new(self.shell())),
            HostPlatform::Posix => Box::new(NativeProbe),
        }
    }

    fn method(&self) -> InstallMethod {
        match self.host {
            HostPlatform::Windows => InstallMethod::Wsl,
            HostPlatform::Posix => InstallMethod::Native,
        }
    }

    async fn locate(&self, probe: &dyn ShellProbe) -> Option<Located> {
        if let Some(binary) = &self.config.cli.binary {
            return Some(Located {
                path: binary.to_string_lossy().into_owned(),
                method: self.method(),
            });
        }
        let home = probe.home_dir().await;
        let search = BinarySearch {
            name: BINARY.into(),
            conventional: conventional_paths(
                home.as_deref(),
                &[".local/bin/cursor-agent", ".cursor/bin/cursor-agent"],
                &["/usr/local/bin/cursor-agent", "/opt/homebrew/bin/cursor-agent"],
            ),
            versions_dir: home
                .as_deref()
                .map(|h| format!("{}/.local/share/cursor-agent/versions", h.trim_end_matches('/'))),
        };
        discover_binary(probe, &search).await.map(|path| Located {
            path,
            method: self.method(),
        })
    }

    fn token(&self) -> Option<String> {
        self.config
            .cli
            .api_key
            .clone()
            .or_else(|| std::env::var("CURSOR_API_KEY").ok())
    }

    /// Program and arguments for a dispatch on this host.
    pub fn invocation(&self, binary: &str, options: &ExecuteOptions) -> SpawnSpec {
        let args = build_args(options, &self.config.cli.extra_args);
        let timeout = Duration::from_secs(self.config.cli.timeout_secs);
        let spec = match self.host {
            HostPlatform::Windows => {
                let (program, wsl_args) = self.shell().invocation(binary, &args, &options.cwd);
                let mut spec = SpawnSpec::new(program).args(wsl_args);
                if let Some(token) = &self.config.cli.api_key {
                    // WSLENV forwards the variable across the wsl.exe boundary.
                    spec = spec.env("CURSOR_API_KEY", token).env("WSLENV", "CURSOR_API_KEY");
                }
                spec
            }
            HostPlatform::Posix => {
                let mut spec = SpawnSpec::new(binary).args(args).cwd(&options.cwd);
                if let Some(token) = &self.config.cli.api_key {
                    spec = spec.env("CURSOR_API_KEY", token);
                }
                spec
            }
        };
        spec.timeout(timeout)
    }

    async fn live_status(&self, located: &Located) -> bool {
        let out = match self.host {
            HostPlatform::Windows => match self
                .shell()
                .run_snippet(&format!("{} status", crate::wsl::shell_quote(&located.path)))
                .await
            {
                Some((true, out)) => Some(out),
                _ => None,
            },
            HostPlatform::Posix => probe_status(&located.path, &["status"]).await,
        };
        out.is_some_and(|o| {
            let lower = o.to_lowercase();
            lower.contains("logged in") && !lower.contains("not logged in")
        })
    }
}

/// Command-line arguments for one dispatch, prompt last after `--`.
pub fn build_args(options: &ExecuteOptions, extra_args: &[String]) -> Vec<String> {
    let mut args = vec![
        "-p".to_string(),
        "--output-format".to_string(),
        "stream-json".to_string(),
        "--model".to_string(),
        options.model.clone(),
        "--force".to_string(),
    ];
    if let Some(session) = &options.resume_session_id {
        args.push("--resume".into());
        args.push(session.clone());
    }
    args.extend(extra_args.iter().cloned());
    args.push("--".into());
    args.push(compose_prompt(options, true));
    args
}

fn is_terminal(event: &Value) -> bool {
    event["type"] == "result"
}

/// The tool name and call payload inside a `tool_call` object.
///
/// Cursor wraps each call in a single key such as `shellToolCall` or
/// `function`.
fn tool_call_parts(tool_call: &Value) -> Option<(String, &Value)> {
    let obj = tool_call.as_object()?;
    let (key, payload) = obj.iter().next()?;
    if key == "function" {
        let name = payload["name"].as_str()?.to_string();
        return Some((name, payload));
    }
    let base = key.strip_suffix("ToolCall").unwrap_or(key);
    let name = match base {
        "shell" => "Bash".to_string(),
        other => {
            let mut chars = other.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect(),
                None => return None,
            }
        }
    };
    Some((name, payload))
}

fn tool_args(payload: &Value) -> Value {
    if let Some(raw) = payload["arguments"].as_str() {
        return serde_json::from_str(raw).unwrap_or_else(|_| json!({ "raw": raw }));
    }
    payload["args"].clone()
}

fn is_empty_args(args: &Value) -> bool {
    match args {
        Value::Null => true,
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

#[derive(Default)]
struct CursorNormalizer {
    session_id: Option<String>,
}

impl EventNormalizer for CursorNormalizer {
    fn normalize(&mut self, event: &Value) -> Result<Vec<ProviderMessage>, String> {
        if let Some(id) = event["session_id"].as_str() {
            self.session_id.get_or_insert_with(|| id.to_string());
        }
        match event["type"].as_str() {
            Some("assistant") => {
                let content = event["message"]["content"]
                    .as_array()
                    .ok_or("assistant event without content")?;
                let text = content
                    .iter()
                    .filter(|b| b["type"] == "text")
                    .filter_map(|b| b["text"].as_str())
                    .collect::<Vec<_>>()
                    .join("");
                if text.is_empty() {
                    Ok(vec![])
                } else {
                    Ok(vec![ProviderMessage::assistant_text(text)])
                }
            }
            Some("tool_call") => {
                let call_id = event["call_id"].as_str().unwrap_or_default();
                let (name, payload) =
                    tool_call_parts(&event["tool_call"]).ok_or("tool_call without a call payload")?;
                let args = tool_args(payload);
                match event["subtype"].as_str() {
                    Some("started") => {
                        if is_empty_args(&args) {
                            return Ok(vec![]);
                        }
                        Ok(vec![ProviderMessage::assistant(vec![ContentBlock::tool_use(
                            call_id, name, args,
                        )])])
                    }
                    Some("completed") => {
                        let result = &payload["result"];
                        let (output, is_error) = if !result["success"].is_null() {
                            let success = &result["success"];
                            let text = success
                                .get("content")
                                .or_else(|| success.get("output"))
                                .map(value_text)
                                .unwrap_or_else(|| value_text(success));
                            (text, false)
                        } else if !result["error"].is_null() || !result["failure"].is_null() {
                            let err = if result["error"].is_null() {
                                &result["failure"]
                            } else {
                                &result["error"]
                            };
                            (value_text(err), true)
                        } else {
                            (value_text(result), false)
                        };
                        Ok(vec![tool_exchange(call_id, &name, args, output, is_error)])
                    }
                    _ => Ok(vec![]),
                }
            }
            Some("result") => {
                let text = event["result"].as_str().map(String::from);
                let failed = event["is_error"].as_bool().unwrap_or(false)
                    || event["subtype"].as_str().is_some_and(|s| s != "success");
                if failed {
                    let message = text.unwrap_or_else(|| "cursor agent reported an error".into());
                    Ok(vec![ProviderMessage::error(message, self.session_id.clone())])
                } else {
                    Ok(vec![ProviderMessage::success(text, self.session_id.clone())])
                }
            }
            // system/init, user echo, thinking
            _ => Ok(vec![]),
        }
    }

    fn session_id(&self) -> Option<String> {
        self.session_id.clone()
    }
}

#[async_trait]
impl Provider for CursorProvider {
    fn name(&self) -> &'static str {
        NAME
    }

    async fn detect_installation(&self) -> InstallationStatus {
        let probe = self.probe();
        let Some(located) = self.locate(probe.as_ref()).await else {
            let where_ = match self.host {
                HostPlatform::Windows => "inside WSL",
                HostPlatform::Posix => "on PATH",
            };
            return InstallationStatus::not_installed(format!("{BINARY} not found {where_}"));
        };

        let version = match self.host {
            HostPlatform::Windows => self
                .shell()
                .run_snippet(&format!("{} --version", crate::wsl::shell_quote(&located.path)))
                .await
                .filter(|(ok, _)| *ok)
                .and_then(|(_, out)| out.lines().next().map(|l| l.trim().to_string())),
            HostPlatform::Posix => probe_version(&located.path).await,
        };

        let compat_home = probe.home_dir().await;
        let native_home = dirs::home_dir().map(|p| p.to_string_lossy().into_owned());
        let search = AuthSearch {
            token: self.token(),
            compat_credentials: conventional_paths(
                compat_home.as_deref(),
                &[".config/cursor/auth.json", ".cursor/cli-config.json"],
                &[],
            ),
            native_credentials: match self.host {
                HostPlatform::Windows => {
                    conventional_paths(native_home.as_deref(), &[".cursor/auth.json"], &[])
                }
                HostPlatform::Posix => Vec::new(),
            },
        };
        let mut auth = discover_auth(probe.as_ref(), &NativeProbe, &search).await;
        if auth.is_none() && self.live_status(&located).await {
            auth = Some(AuthSource::CliStatus);
        }

        InstallationStatus {
            installed: true,
            version,
            path: Some(located.path),
            method: Some(located.method),
            auth_method: auth.as_ref().map(|a| a.method().to_string()),
            authenticated: auth.is_some(),
            error: None,
        }
    }

    fn available_models(&self) -> Vec<ModelDefinition> {
        vec![
            ModelDefinition::new(NAME, "cursor-auto", "Auto", "Cursor picks the model per request")
                .as_default(),
            ModelDefinition::new(NAME, "cursor-sonnet-4.5", "Claude Sonnet 4.5", "Anthropic Sonnet via Cursor"),
            ModelDefinition::new(NAME, "cursor-gpt-5", "GPT-5", "OpenAI GPT-5 via Cursor"),
        ]
    }

    async fn execute_query(&self, options: ExecuteOptions) -> DroverResult<ProviderStream> {
        if options.prompt.is_empty() {
            return Err(DroverError::Provider("cursor: prompt is empty".into()));
        }
        let probe = self.probe();
        let located = self
            .locate(probe.as_ref())
            .await
            .ok_or_else(|| DroverError::NotInstalled {
                provider: NAME.into(),
            })?;
        let spec = self.invocation(&located.path, &options);
        tracing::info!(model = %options.model, method = ?located.method, "cursor: spawning agent");
        run_cli_stream(NAME, spec, options.cancel.clone(), is_terminal, CursorNormalizer::default())
    }
}
