use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Provider section of `drover.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvidersConfig {
    /// Model used for work items that do not name one.
    #[serde(default = "default_model")]
    pub default_model: String,
    /// `[providers.claude]`.
    #[serde(default)]
    pub claude: ClaudeConfig,
    /// `[providers.codex]`.
    #[serde(default)]
    pub codex: CliToolConfig,
    /// `[providers.cursor]`.
    #[serde(default)]
    pub cursor: CursorConfig,
    /// `[providers.opencode]`.
    #[serde(default)]
    pub opencode: CliToolConfig,
}

impl Default for ProvidersConfig {
    fn default() -> Self {
        Self {
            default_model: default_model(),
            claude: ClaudeConfig::default(),
            codex: CliToolConfig::default(),
            cursor: CursorConfig::default(),
            opencode: CliToolConfig::default(),
        }
    }
}

/// Anthropic Messages API settings for the SDK-style backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaudeConfig {
    /// Falls back to `ANTHROPIC_API_KEY` when unset.
    #[serde(default)]
    pub api_key: Option<String>,
    /// API base URL; defaults to the public endpoint.
    #[serde(default)]
    pub api_base_url: Option<String>,
    /// `max_tokens` sent with every request.
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    /// Request timeout.
    #[serde(default = "default_request_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for ClaudeConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            api_base_url: None,
            max_tokens: default_max_tokens(),
            timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl ClaudeConfig {
    /// Effective API base URL.
    pub fn base_url(&self) -> &str {
        self.api_base_url
            .as_deref()
            .unwrap_or("https://api.anthropic.com")
    }

    /// Configured key, else the environment.
    pub fn resolve_api_key(&self) -> Option<String> {
        self.api_key
            .clone()
            .filter(|k| !k.is_empty())
            .or_else(|| std::env::var("ANTHROPIC_API_KEY").ok().filter(|k| !k.is_empty()))
    }
}

/// Settings shared by every CLI-driven backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CliToolConfig {
    /// Explicit binary path; skips discovery when set.
    #[serde(default)]
    pub binary: Option<PathBuf>,
    /// Overall wall-clock limit for one dispatch.
    #[serde(default = "default_cli_timeout_secs")]
    pub timeout_secs: u64,
    /// Extra arguments appended before the prompt.
    #[serde(default)]
    pub extra_args: Vec<String>,
    /// Token exported to the child environment.
    #[serde(default)]
    pub api_key: Option<String>,
}

impl Default for CliToolConfig {
    fn default() -> Self {
        Self {
            binary: None,
            timeout_secs: default_cli_timeout_secs(),
            extra_args: Vec::new(),
            api_key: None,
        }
    }
}

/// Cursor agent settings; on Windows the CLI runs inside WSL.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CursorConfig {
    /// Settings shared with the other CLIs.
    #[serde(flatten)]
    pub cli: CliToolConfig,
    /// WSL distribution to use; the WSL default when unset.
    #[serde(default)]
    pub wsl_distro: Option<String>,
}

fn default_model() -> String {
    "sonnet".to_string()
}

fn default_max_tokens() -> u32 {
    8192
}

fn default_request_timeout_secs() -> u64 {
    600
}

fn default_cli_timeout_secs() -> u64 {
    1800
}
