use crate::backends::claude::{self, ClaudeProvider};
use crate::backends::codex::{self, CodexProvider};
use crate::backends::cursor::{self, CursorProvider};
use crate::backends::opencode::{self, OpencodeProvider};
use crate::backends::{ModelDefinition, Provider};
use crate::config::ProvidersConfig;
use drover_core::{DroverError, DroverResult};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Builds a provider instance on first use.
pub type ProviderFactory = Arc<dyn Fn() -> Arc<dyn Provider> + Send + Sync>;

/// One entry in the registry.
#[derive(Clone)]
pub struct ProviderRegistration {
    /// Backend name, unique in a registry.
    pub name: &'static str,
    /// Builds the backend on first use.
    pub factory: ProviderFactory,
    /// Whether this provider claims a model identifier.
    pub owns_model: fn(&str) -> bool,
    /// Higher values are consulted first.
    pub priority: i32,
    /// Prefix stripped from model ids before they reach the provider.
    pub prefix: Option<&'static str>,
}

impl ProviderRegistration {
    /// Registration claiming the models `owns_model` accepts.
    pub fn new<F>(name: &'static str, owns_model: fn(&str) -> bool, factory: F) -> Self
    where
        F: Fn() -> Arc<dyn Provider> + Send + Sync + 'static,
    {
        Self {
            name,
            factory: Arc::new(factory),
            owns_model,
            priority: 0,
            prefix: None,
        }
    }

    /// Higher priorities are consulted first.
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Prefix stripped from model ids before dispatch.
    pub fn with_prefix(mut self, prefix: &'static str) -> Self {
        self.prefix = Some(prefix);
        self
    }
}

impl std::fmt::Debug for ProviderRegistration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRegistration")
            .field("name", &self.name)
            .field("priority", &self.priority)
            .field("prefix", &self.prefix)
            .finish()
    }
}

/// Maps model identifiers to providers.
///
/// Registrations are fixed once built. Predicates are consulted in descending
/// priority, ties in registration order; a model nobody claims goes to the
/// default provider. Instances are created on first lookup and reused.
pub struct ProviderRegistry {
    entries: Vec<ProviderRegistration>,
    default: usize,
    instances: Mutex<HashMap<&'static str, Arc<dyn Provider>>>,
}

impl ProviderRegistry {
    /// Start configuring a registry.
    pub fn builder() -> ProviderRegistryBuilder {
        ProviderRegistryBuilder::default()
    }

    /// The four built-in backends with claude as the default.
    pub fn with_defaults(config: &ProvidersConfig) -> Self {
        let claude_cfg = config.claude.clone();
        let codex_cfg = config.codex.clone();
        let cursor_cfg = config.cursor.clone();
        let opencode_cfg = config.opencode.clone();

        let entries = vec![
            ProviderRegistration::new(cursor::NAME, owns_cursor, move || {
                Arc::new(CursorProvider::new(cursor_cfg.clone())) as Arc<dyn Provider>
            })
            .with_priority(10)
            .with_prefix("cursor-"),
            ProviderRegistration::new(opencode::NAME, owns_opencode, move || {
                Arc::new(OpencodeProvider::new(opencode_cfg.clone())) as Arc<dyn Provider>
            })
            .with_priority(5)
            .with_prefix("opencode-"),
            ProviderRegistration::new(codex::NAME, owns_codex, move || {
                Arc::new(CodexProvider::new(codex_cfg.clone())) as Arc<dyn Provider>
            })
            .with_priority(3)
            .with_prefix("codex-"),
            ProviderRegistration::new(claude::NAME, owns_claude, move || {
                Arc::new(ClaudeProvider::new(claude_cfg.clone())) as Arc<dyn Provider>
            }),
        ];
        // claude is registered, so this cannot fail.
        Self::from_entries(entries, claude::NAME).unwrap_or_else(|_| Self::empty())
    }

    fn empty() -> Self {
        Self {
            entries: Vec::new(),
            default: 0,
            instances: Mutex::new(HashMap::new()),
        }
    }

    fn from_entries(mut entries: Vec<ProviderRegistration>, default: &str) -> DroverResult<Self> {
        if entries.is_empty() {
            return Err(DroverError::Config("provider registry is empty".into()));
        }
        // Stable sort keeps registration order among equal priorities.
        entries.sort_by(|a, b| b.priority.cmp(&a.priority));
        let default = entries
            .iter()
            .position(|e| e.name == default)
            .ok_or_else(|| DroverError::Config(format!("default provider '{default}' is not registered")))?;
        Ok(Self {
            entries,
            default,
            instances: Mutex::new(HashMap::new()),
        })
    }

    fn entry_for_model(&self, model: &str) -> Option<&ProviderRegistration> {
        self.entries
            .iter()
            .find(|e| (e.owns_model)(model))
            .or_else(|| self.entries.get(self.default))
    }

    fn instance(&self, entry: &ProviderRegistration) -> Arc<dyn Provider> {
        self.instances
            .lock()
            .entry(entry.name)
            .or_insert_with(|| (entry.factory)())
            .clone()
    }

    /// Name of the provider that runs `model`.
    pub fn provider_name_for_model(&self, model: &str) -> Option<&'static str> {
        self.entry_for_model(model).map(|e| e.name)
    }

    /// Provider instance that runs `model`.
    pub fn provider_for_model(&self, model: &str) -> DroverResult<Arc<dyn Provider>> {
        let entry = self
            .entry_for_model(model)
            .ok_or_else(|| DroverError::Config("provider registry is empty".into()))?;
        Ok(self.instance(entry))
    }

    /// Provider by registered name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Provider>> {
        let entry = self.entries.iter().find(|e| e.name == name)?;
        Some(self.instance(entry))
    }

    /// Remove the owning provider's prefix, and only that one.
    ///
    /// `cursor-gpt-5` routes to cursor and becomes `gpt-5`. An id whose owner
    /// has no prefix, or that lacks it, is returned unchanged.
    pub fn strip_provider_prefix(&self, model: &str) -> String {
        self.entry_for_model(model)
            .and_then(|e| e.prefix)
            .and_then(|p| model.strip_prefix(p))
            .unwrap_or(model)
            .to_string()
    }

    /// Registered names in lookup order.
    pub fn names(&self) -> Vec<&'static str> {
        self.entries.iter().map(|e| e.name).collect()
    }

    /// Every registered provider, instantiating as needed.
    pub fn all_providers(&self) -> Vec<Arc<dyn Provider>> {
        self.entries.iter().map(|e| self.instance(e)).collect()
    }

    /// Union of every provider's models.
    pub fn all_models(&self) -> Vec<ModelDefinition> {
        self.all_providers()
            .iter()
            .flat_map(|p| p.available_models())
            .collect()
    }
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("entries", &self.entries)
            .field("default", &self.entries.get(self.default).map(|e| e.name))
            .finish()
    }
}

/// Accumulates registrations for a [`ProviderRegistry`].
#[derive(Default)]
pub struct ProviderRegistryBuilder {
    entries: Vec<ProviderRegistration>,
    default: Option<&'static str>,
}

impl ProviderRegistryBuilder {
    /// Add a backend.
    pub fn register(mut self, registration: ProviderRegistration) -> Self {
        self.entries.push(registration);
        self
    }

    /// Backend used when no predicate matches.
    pub fn default_provider(mut self, name: &'static str) -> Self {
        self.default = Some(name);
        self
    }

    /// Fails if nothing is registered or the default is unknown. Without an
    /// explicit default the first registration is used.
    pub fn build(self) -> DroverResult<ProviderRegistry> {
        let default = match self.default {
            Some(d) => d,
            None => self
                .entries
                .first()
                .map(|e| e.name)
                .ok_or_else(|| DroverError::Config("provider registry is empty".into()))?,
        };
        ProviderRegistry::from_entries(self.entries, default)
    }
}

fn owns_cursor(model: &str) -> bool {
    model.starts_with("cursor-")
}

fn owns_opencode(model: &str) -> bool {
    model.starts_with("opencode-") || model.contains('/')
}

fn owns_codex(model: &str) -> bool {
    model.starts_with("codex-") || model.contains("gpt-") || is_o_series(model)
}

fn owns_claude(model: &str) -> bool {
    model.starts_with("claude-") || matches!(model, "opus" | "sonnet" | "haiku")
}

/// `o1`, `o3-mini`, `o4-mini` and the like.
fn is_o_series(model: &str) -> bool {
    let mut chars = model.chars();
    chars.next() == Some('o') && chars.next().is_some_and(|c| c.is_ascii_digit())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::backends::{InstallationStatus, ProviderStream};
    use async_trait::async_trait;
    use drover_core::ExecuteOptions;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Named(&'static str);

    #[async_trait]
    impl Provider for Named {
        fn name(&self) -> &'static str {
            self.0
        }
        async fn detect_installation(&self) -> InstallationStatus {
            InstallationStatus::default()
        }
        fn available_models(&self) -> Vec<ModelDefinition> {
            Vec::new()
        }
        async fn execute_query(&self, _options: ExecuteOptions) -> DroverResult<ProviderStream> {
            Err(DroverError::Provider("unused".into()))
        }
    }

    fn registry() -> ProviderRegistry {
        ProviderRegistry::with_defaults(&ProvidersConfig::default())
    }

    #[test]
    fn test_default_routing() {
        let r = registry();
        assert_eq!(r.provider_name_for_model("cursor-gpt-5"), Some("cursor"));
        assert_eq!(r.provider_name_for_model("opencode-anthropic/claude-sonnet-4-5"), Some("opencode"));
        assert_eq!(r.provider_name_for_model("openai/gpt-5"), Some("opencode"));
        assert_eq!(r.provider_name_for_model("gpt-5-codex"), Some("codex"));
        assert_eq!(r.provider_name_for_model("o3-mini"), Some("codex"));
        assert_eq!(r.provider_name_for_model("sonnet"), Some("claude"));
        assert_eq!(r.provider_name_for_model("llama3"), Some("claude"));
        assert_eq!(r.names(), vec!["cursor", "opencode", "codex", "claude"]);
    }

    #[test]
    fn test_strip_only_owning_prefix() {
        let r = registry();
        assert_eq!(r.strip_provider_prefix("cursor-gpt-5"), "gpt-5");
        assert_eq!(r.strip_provider_prefix("codex-gpt-5-codex"), "gpt-5-codex");
        assert_eq!(
            r.strip_provider_prefix("opencode-anthropic/claude-sonnet-4-5"),
            "anthropic/claude-sonnet-4-5"
        );
        assert_eq!(r.strip_provider_prefix("claude-opus-4-1"), "claude-opus-4-1");
        assert_eq!(r.strip_provider_prefix("orca"), "orca");
    }

    #[test]
    fn test_instances_are_cached() {
        let built = Arc::new(AtomicUsize::new(0));
        let b = built.clone();
        let r = ProviderRegistry::builder()
            .register(ProviderRegistration::new("only", |_| true, move || {
                b.fetch_add(1, Ordering::SeqCst);
                Arc::new(Named("only")) as Arc<dyn Provider>
            }))
            .build()
            .unwrap();
        assert_eq!(built.load(Ordering::SeqCst), 0);
        let a = r.provider_for_model("x").unwrap();
        let c = r.provider_for_model("y").unwrap();
        assert!(Arc::ptr_eq(&a, &c));
        assert_eq!(built.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_ties_keep_registration_order() {
        let r = ProviderRegistry::builder()
            .register(ProviderRegistration::new("first", |m| m.starts_with('x'), || {
                Arc::new(Named("first")) as Arc<dyn Provider>
            }))
            .register(ProviderRegistration::new("second", |m| m.starts_with('x'), || {
                Arc::new(Named("second")) as Arc<dyn Provider>
            }))
            .register(
                ProviderRegistration::new("fallback", |_| false, || Arc::new(Named("fallback")) as Arc<dyn Provider>)
                    .with_priority(-1),
            )
            .default_provider("fallback")
            .build()
            .unwrap();
        assert_eq!(r.provider_name_for_model("xyz"), Some("first"));
        assert_eq!(r.provider_name_for_model("abc"), Some("fallback"));
        assert_eq!(r.provider_for_model("abc").unwrap().name(), "fallback");
    }

    #[test]
    fn test_builder_rejects_unknown_default() {
        let err = ProviderRegistry::builder()
            .register(ProviderRegistration::new("a", |_| true, || Arc::new(Named("a")) as Arc<dyn Provider>))
            .default_provider("missing")
            .build()
            .err()
            .unwrap();
        assert!(matches!(err, DroverError::Config(_)));
        assert!(ProviderRegistry::builder().build().is_err());
    }

    #[test]
    fn test_get_by_name() {
        let r = registry();
        assert_eq!(r.get("codex").unwrap().name(), "codex");
        assert!(r.get("nope").is_none());
        assert!(!r.all_models().is_empty());
    }
}
