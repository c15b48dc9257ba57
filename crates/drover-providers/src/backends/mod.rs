/// Anthropic Messages API.
pub mod claude;
/// Shared driver for subprocess backends.
pub mod cli;
/// OpenAI Codex CLI.
pub mod codex;
/// Cursor agent CLI.
pub mod cursor;
/// OpenCode CLI.
pub mod opencode;

use async_trait::async_trait;
use drover_core::{DroverResult, ExecuteOptions, ProviderMessage};
use futures_util::Stream;
use serde::{Deserialize, Serialize};
use std::pin::Pin;

/// Lazily produced, finite sequence of normalized provider messages.
///
/// Every stream ends with at most one terminal message (`result` or
/// `error`); a cancelled dispatch ends without one.
pub type ProviderStream = Pin<Box<dyn Stream<Item = ProviderMessage> + Send>>;

/// How a backend is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstallMethod {
    /// A CLI binary on the host.
    Native,
    /// A CLI binary inside WSL.
    Wsl,
    /// An in-process HTTP client.
    Sdk,
}

/// Result of probing whether a backend is usable.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InstallationStatus {
    /// Binary or client found.
    pub installed: bool,
    /// Reported version, when known.
    pub version: Option<String>,
    /// Where the binary was found.
    pub path: Option<String>,
    /// How the backend is reached.
    pub method: Option<InstallMethod>,
    /// Credential source, e.g. `api_key` or `cli_login`.
    pub auth_method: Option<String>,
    /// Usable credentials were found.
    pub authenticated: bool,
    /// Why the backend is unusable, if it is.
    pub error: Option<String>,
}

impl InstallationStatus {
    /// Status for a backend whose binary is missing.
    pub fn not_installed(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::default()
        }
    }
}

/// A model a backend can run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelDefinition {
    /// Identifier as typed by users, including any provider prefix.
    pub id: String,
    /// Human-readable name.
    pub display_name: String,
    /// Short description for listings.
    pub description: String,
    /// Owning backend's name.
    pub provider: String,
    /// The backend's default model.
    #[serde(default)]
    pub default: bool,
}

impl ModelDefinition {
    /// A non-default catalog entry.
    pub fn new(provider: &str, id: &str, display_name: &str, description: &str) -> Self {
        Self {
            id: id.to_string(),
            display_name: display_name.to_string(),
            description: description.to_string(),
            provider: provider.to_string(),
            default: false,
        }
    }

    /// Mark as the backend's default model.
    pub fn as_default(mut self) -> Self {
        self.default = true;
        self
    }
}

/// Trait implemented by every execution backend.
///
/// To add a backend:
/// 1. Create a module in `backends/`
/// 2. Implement `Provider` for your struct
/// 3. Register it in [`crate::registry::ProviderRegistry::with_defaults`]
#[async_trait]
pub trait Provider: Send + Sync {
    /// Stable lowercase name used in logs and events.
    fn name(&self) -> &'static str;

    /// Probe for the binary or client library and its credentials.
    async fn detect_installation(&self) -> InstallationStatus;

    /// Models this backend accepts.
    fn available_models(&self) -> Vec<ModelDefinition>;

    /// Start a dispatch. Setup problems (missing binary or credentials, empty
    /// prompt) are returned as `Err`; failures after that are reported as an
    /// `error` message on the stream.
    async fn execute_query(&self, options: ExecuteOptions) -> DroverResult<ProviderStream>;

    /// Whether a session id from an earlier process can be resumed.
    fn supports_resume(&self) -> bool {
        true
    }
}
