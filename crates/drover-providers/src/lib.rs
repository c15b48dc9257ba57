//! Provider adapters for the Drover agent scheduler.
//!
//! Every backend turns an [`drover_core::ExecuteOptions`] into a stream of
//! [`drover_core::ProviderMessage`]s, whatever its native transport.
//!
//! # Backends
//!
//! - [`ClaudeProvider`] — Anthropic Messages API, in-process.
//! - [`CodexProvider`] — `codex exec --json`.
//! - [`CursorProvider`] — `cursor-agent`, through WSL on Windows.
//! - [`OpencodeProvider`] — `opencode run --format json`.
//!
//! [`ProviderRegistry`] maps model identifiers to the backend that runs them.

/// The [`Provider`] trait and the four built-in backends.
pub mod backends;
/// Provider configuration loaded from `drover.toml`.
pub mod config;
/// Classification of failed CLI runs.
pub mod failure;
/// Subprocess bridge reading newline-delimited JSON.
pub mod process;
/// Model-to-provider routing.
pub mod registry;
/// Path translation and discovery through WSL.
pub mod wsl;

pub use backends::claude::ClaudeProvider;
pub use backends::codex::CodexProvider;
pub use backends::cursor::CursorProvider;
pub use backends::opencode::OpencodeProvider;
pub use backends::{InstallMethod, InstallationStatus, ModelDefinition, Provider, ProviderStream};
pub use config::{ClaudeConfig, CliToolConfig, CursorConfig, ProvidersConfig};
pub use failure::{CliFailure, CliFailureKind};
pub use process::{EndReason, JsonlProcess, SpawnSpec};
pub use registry::{ProviderFactory, ProviderRegistration, ProviderRegistry};
