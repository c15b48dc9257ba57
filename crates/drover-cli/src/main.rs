//! `drover`: run the autonomous scheduling loop from a terminal.

mod config;

use clap::{Parser, Subcommand, ValueEnum};
use config::DroverConfig;
use drover_core::{EventBus, Scope};
use drover_providers::{InstallationStatus, ProviderRegistry};
use drover_scheduler::{JsonFileWorkItemStore, Scheduler, SchedulerDeps, SnapshotStore};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncBufReadExt;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "drover", about = "Drover: dependency-aware scheduling of AI coding agents")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "drover.toml")]
    config: PathBuf,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Json)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Json,
    Pretty,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the scheduling loop for a project until interrupted
    Run {
        /// Project root
        #[arg(long, default_value = ".")]
        project: PathBuf,
        /// Branch scope within the project
        #[arg(long)]
        branch: Option<String>,
        /// Concurrent dispatches (overrides config)
        #[arg(long)]
        max_concurrency: Option<usize>,
    },
    /// Show installation and authentication status of every provider
    Providers,
    /// List the models every provider offers
    Models,
    /// Print the saved execution state of a project
    Status {
        /// Project root
        #[arg(long, default_value = ".")]
        project: PathBuf,
        /// Branch scope within the project
        #[arg(long)]
        branch: Option<String>,
    },
}

fn init_logging(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    // Events own stdout, so logs go to stderr.
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Pretty => builder.pretty().init(),
    }
}

fn scope_for(project: PathBuf, branch: Option<String>) -> Scope {
    match branch {
        Some(branch) => Scope::with_branch(project, branch),
        None => Scope::new(project),
    }
}

async fn canonical_project(project: &Path) -> anyhow::Result<PathBuf> {
    tokio::fs::canonicalize(project)
        .await
        .map_err(|e| anyhow::anyhow!("Project '{}' is not accessible: {e}", project.display()))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_format);

    if let Err(e) = dotenvy::dotenv() {
        if !e.not_found() {
            warn!(error = %e, "failed to load .env");
        }
    }

    let config = DroverConfig::load(&cli.config).await?;
    let registry = Arc::new(ProviderRegistry::with_defaults(&config.providers));

    match cli.command {
        Commands::Run {
            project,
            branch,
            max_concurrency,
        } => {
            let project = canonical_project(&project).await?;
            let scope = scope_for(project.clone(), branch);
            run(config, registry, &project, scope, max_concurrency).await?;
        }
        Commands::Providers => {
            for provider in registry.all_providers() {
                let status = provider.detect_installation().await;
                println!("{}", describe_installation(provider.name(), &status));
            }
        }
        Commands::Models => {
            let models = registry.all_models();
            for model in &models {
                let marker = if model.default { " (default)" } else { "" };
                println!(
                    "  {:<40} {}{} [{}]",
                    model.id, model.display_name, marker, model.provider
                );
            }
            println!("\nTotal: {} model(s)", models.len());
        }
        Commands::Status { project, branch } => {
            let project = canonical_project(&project).await?;
            let scope = scope_for(project.clone(), branch);
            let snapshots = SnapshotStore::new(config.state_dir_for(&project));
            match snapshots.load(&scope).await? {
                Some(snapshot) => println!("{}", serde_json::to_string_pretty(&snapshot)?),
                None => println!("No saved execution state for {scope}"),
            }
        }
    }

    Ok(())
}

fn describe_installation(name: &str, status: &InstallationStatus) -> String {
    if !status.installed {
        let reason = status.error.as_deref().unwrap_or("not found");
        return format!("{name:<10} not installed ({reason})");
    }
    let version = status.version.as_deref().unwrap_or("unknown version");
    let path = status.path.as_deref().unwrap_or("-");
    let auth = match (&status.auth_method, status.authenticated) {
        (Some(method), true) => format!("authenticated via {method}"),
        (None, true) => "authenticated".to_string(),
        (_, false) => "not authenticated".to_string(),
    };
    format!("{name:<10} {version} at {path}, {auth}")
}

async fn run(
    mut config: DroverConfig,
    registry: Arc<ProviderRegistry>,
    project: &Path,
    scope: Scope,
    max_concurrency: Option<usize>,
) -> anyhow::Result<()> {
    if let Some(max) = max_concurrency {
        config.scheduler.max_concurrency = max;
    }
    let store_path = config.store_path_for(project);
    let state_dir = config.state_dir_for(project);
    info!(store = %store_path.display(), state = %state_dir.display(), "starting drover");

    let bus = EventBus::new();
    let _printer = bus.subscribe(|event| match serde_json::to_string(event) {
        Ok(line) => println!("{line}"),
        Err(e) => warn!(error = %e, "failed to serialize event"),
    });

    let scheduler = Scheduler::new(
        SchedulerDeps {
            store: Arc::new(JsonFileWorkItemStore::new(store_path)),
            registry,
            bus,
            snapshots: Arc::new(SnapshotStore::new(state_dir)),
        },
        config.scheduler,
    );

    if let Some(report) = scheduler.recover_scope(&scope).await? {
        info!(
            scope = %report.scope,
            reset = ?report.reset,
            resumable = ?report.resumable,
            "resumed interrupted loop"
        );
    }
    if !scheduler.is_running(&scope) {
        scheduler.start(scope.clone(), max_concurrency).await?;
    }

    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    loop {
        tokio::select! {
            _ = &mut ctrl_c => break,
            line = lines.next_line(), if stdin_open => match line {
                Ok(Some(line)) => operator_command(&scheduler, &scope, line.trim()),
                Ok(None) => stdin_open = false,
                Err(e) => {
                    warn!(error = %e, "stdin closed");
                    stdin_open = false;
                }
            },
        }
    }

    info!(scope = %scope, "interrupted, stopping");
    scheduler.stop(&scope).await?;
    Ok(())
}

/// `resume`, `cancel <id>` or `status`, one per line.
fn operator_command(scheduler: &Scheduler, scope: &Scope, line: &str) {
    let mut parts = line.split_whitespace();
    match (parts.next(), parts.next()) {
        (None, _) => {}
        (Some("resume"), None) => {
            if !scheduler.resume(scope) {
                info!(scope = %scope, "scope is not paused");
            }
        }
        (Some("cancel"), Some(id)) => {
            if !scheduler.cancel_work_item(id) {
                warn!(work_item_id = %id, "work item is not running");
            }
        }
        (Some("status"), None) => {
            let status = scheduler.status(scope);
            println!(
                "{}",
                serde_json::json!({ "type": "status", "status": status })
            );
        }
        _ => warn!(command = %line, "unknown command; expected resume, cancel <id> or status"),
    }
}
