use drover_providers::ProvidersConfig;
use drover_scheduler::SchedulerConfig;
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Top-level `drover.toml`.
#[derive(Debug, Deserialize)]
pub struct DroverConfig {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub providers: ProvidersConfig,
    /// Directory holding execution-state snapshots, relative to the project
    /// when not absolute.
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
    /// JSON array of work items, relative to the project when not absolute.
    #[serde(default = "default_store_path")]
    pub store_path: PathBuf,
}

impl Default for DroverConfig {
    fn default() -> Self {
        Self {
            scheduler: SchedulerConfig::default(),
            providers: ProvidersConfig::default(),
            state_dir: default_state_dir(),
            store_path: default_store_path(),
        }
    }
}

fn default_state_dir() -> PathBuf {
    PathBuf::from(".drover/state")
}
fn default_store_path() -> PathBuf {
    PathBuf::from(".drover/work-items.json")
}

impl DroverConfig {
    /// Parse a config document. `[providers] default_model` is the single
    /// knob for the fallback model and is copied into the scheduler section.
    pub fn parse(text: &str) -> anyhow::Result<Self> {
        let mut config: DroverConfig = toml::from_str(text)?;
        config.scheduler.default_model = config.providers.default_model.clone();
        Ok(config)
    }

    /// Read `path`, or fall back to defaults when it does not exist.
    pub async fn load(path: &Path) -> anyhow::Result<Self> {
        match tokio::fs::read_to_string(path).await {
            Ok(text) => Self::parse(&text)
                .map_err(|e| anyhow::anyhow!("Failed to parse config file '{}': {e}", path.display())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = %path.display(), "no config file, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(anyhow::anyhow!(
                "Failed to read config file '{}': {e}",
                path.display()
            )),
        }
    }

    /// Work-item file for a project.
    pub fn store_path_for(&self, project: &Path) -> PathBuf {
        under(project, &self.store_path)
    }

    /// Snapshot directory for a project.
    pub fn state_dir_for(&self, project: &Path) -> PathBuf {
        under(project, &self.state_dir)
    }
}

fn under(project: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        project.join(path)
    }
}
