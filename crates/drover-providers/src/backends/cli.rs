//! Machinery shared by the subprocess-driven backends.

use super::ProviderStream;
use crate::config::CliToolConfig;
use crate::failure::CliFailure;
use crate::process::{EndReason, JsonlProcess, SpawnSpec};
use crate::wsl::{discover_binary, run_capture, BinarySearch, NativeProbe};
use drover_core::{ContentBlock, DroverError, DroverResult, ExecuteOptions, ProviderMessage, Role};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Translates one CLI's native JSON events into provider messages.
pub(crate) trait EventNormalizer: Send + 'static {
    /// Messages for one event. Unrecognized event types map to an empty list;
    /// `Err` marks a recognized event whose payload is malformed.
    fn normalize(&mut self, event: &Value) -> Result<Vec<ProviderMessage>, String>;

    /// Session id announced so far.
    fn session_id(&self) -> Option<String>;

    /// Terminal message for a clean exit that never produced one.
    fn finish(&mut self, provider: &str) -> ProviderMessage {
        ProviderMessage::error(
            format!("{provider} exited without reporting a result"),
            self.session_id(),
        )
    }
}

/// Spawn the CLI and expose its normalized output as a stream.
///
/// Only the first terminal message is forwarded. Cancellation ends the stream
/// without a terminal message. A timeout or a failed exit ends it with an
/// `error` message carrying the classified failure.
pub(crate) fn run_cli_stream<N: EventNormalizer>(
    provider: &'static str,
    spec: SpawnSpec,
    cancel: CancellationToken,
    is_terminal: fn(&Value) -> bool,
    normalizer: N,
) -> DroverResult<ProviderStream> {
    let mut process = JsonlProcess::spawn(spec, cancel, is_terminal).map_err(|e| match e {
        DroverError::NotInstalled { .. } => DroverError::NotInstalled {
            provider: provider.to_string(),
        },
        other => other,
    })?;
    let mut normalizer = normalizer;

    Ok(Box::pin(async_stream::stream! {
        let mut finished = false;
        let mut skipped = 0usize;
        loop {
            match process.next_json().await {
                Ok(Some(event)) => match normalizer.normalize(&event) {
                    Ok(messages) => {
                        for message in messages {
                            if finished {
                                continue;
                            }
                            if message.is_terminal() {
                                finished = true;
                            }
                            yield message;
                        }
                    }
                    Err(reason) => {
                        skipped += 1;
                        warn!(provider, reason = %reason, "skipping event that could not be normalized");
                    }
                },
                Ok(None) => {
                    if !finished {
                        match process.end_reason() {
                            EndReason::Cancelled => debug!(provider, "dispatch cancelled"),
                            EndReason::TimedOut => {
                                yield ProviderMessage::error(
                                    format!("{provider} timed out before finishing"),
                                    normalizer.session_id(),
                                );
                            }
                            EndReason::Exited { .. } | EndReason::Running => {
                                yield normalizer.finish(provider);
                            }
                        }
                    }
                    break;
                }
                Err(DroverError::Process { exit_code, stderr, .. }) => {
                    if !finished {
                        let failure = CliFailure::classify(exit_code, &stderr);
                        warn!(provider, kind = ?failure.kind, exit_code = ?exit_code, "CLI failed");
                        yield ProviderMessage::error(failure.render(provider), normalizer.session_id());
                    }
                    break;
                }
                Err(e) => {
                    if !finished {
                        yield ProviderMessage::error(e.to_string(), normalizer.session_id());
                    }
                    break;
                }
            }
        }
        info!(
            provider,
            session_id = ?normalizer.session_id(),
            skipped,
            end = ?process.end_reason(),
            "dispatch stream ended"
        );
    }))
}

/// Prompt text for CLIs that take a single prompt argument.
///
/// Prepends the system prompt when the CLI has no flag for it, and replays
/// conversation history when not resuming a session.
pub(crate) fn compose_prompt(options: &ExecuteOptions, inline_system_prompt: bool) -> String {
    let mut sections = Vec::new();
    if inline_system_prompt {
        if let Some(system) = options.system_prompt.as_deref().filter(|s| !s.trim().is_empty()) {
            sections.push(format!("Instructions:\n{system}"));
        }
    }
    if options.resume_session_id.is_none() && !options.conversation_history.is_empty() {
        let transcript = options
            .conversation_history
            .iter()
            .map(|m| {
                let who = match m.role {
                    Role::User => "User",
                    Role::Assistant => "Assistant",
                };
                format!("{who}: {}", m.content)
            })
            .collect::<Vec<_>>()
            .join("\n");
        sections.push(format!("Previous conversation:\n{transcript}"));
    }
    sections.push(options.prompt.as_text());
    sections.join("\n\n")
}

/// A tool call and its outcome as one assistant message.
pub(crate) fn tool_exchange(
    id: &str,
    name: &str,
    input: Value,
    output: impl Into<String>,
    is_error: bool,
) -> ProviderMessage {
    ProviderMessage::assistant(vec![
        ContentBlock::tool_use(id, name, input),
        ContentBlock::tool_result(id, output, is_error),
    ])
}

/// Render a JSON value as tool output text.
pub(crate) fn value_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Configured binary, else native discovery.
pub(crate) async fn locate_native(config: &CliToolConfig, search: &BinarySearch) -> Option<String> {
    if let Some(binary) = &config.binary {
        return Some(binary.to_string_lossy().into_owned());
    }
    discover_binary(&NativeProbe, search).await
}

/// Conventional install locations under the home directory, plus system ones.
pub(crate) fn conventional_paths(home: Option<&str>, relative: &[&str], absolute: &[&str]) -> Vec<String> {
    let mut paths: Vec<String> = match home {
        Some(home) => relative
            .iter()
            .map(|r| format!("{}/{}", home.trim_end_matches(['/', '\\']), r))
            .collect(),
        None => Vec::new(),
    };
    paths.extend(absolute.iter().map(|a| (*a).to_string()));
    paths
}

/// First non-empty output line of `program --version`.
pub(crate) async fn probe_version(program: &str) -> Option<String> {
    let (ok, out) = run_capture(program, &["--version".to_string()]).await?;
    if !ok {
        return None;
    }
    out.lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .map(String::from)
}

/// Run a status command; `Some(output)` when it exits successfully.
pub(crate) async fn probe_status(program: &str, args: &[&str]) -> Option<String> {
    let args: Vec<String> = args.iter().map(|a| (*a).to_string()).collect();
    match run_capture(program, &args).await {
        Some((true, out)) => Some(out),
        _ => None,
    }
}
