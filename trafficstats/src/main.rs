use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;
use tracker::api::{self, AppState, ServeError};
use tracker::config::ValidationError;
use tracker::github::{GitHubClient, SourceError};
use tracker::scheduler::{Schedule, SyncService};
use tracker::store::{self, Snapshot, StorageError, TrafficStore};
use tracker::summary::Stats;
use tracker::sync::{SyncError, Synchronizer};
use tracker::types::OwnerKind;

mod config;
mod logging;
mod statsd;

use config::Config;

#[derive(Parser)]
#[command(version, about = "Collects and serves GitHub repository traffic statistics")]
struct Args {
    /// Defaults to trafficstats.yaml in the working directory when present
    #[arg(long)]
    config_file_path: Option<PathBuf>,

    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Subcommand)]
enum CliCommand {
    /// Run one sync cycle over every tracked repository and exit
    Sync,
    /// Serve the API with the background scheduler
    Serve {
        #[arg(long)]
        port: Option<u16>,
    },
    /// Write every stored record as JSON
    Export {
        #[arg(long)]
        output: Option<PathBuf>,
    },
    Import {
        #[arg(long)]
        input: PathBuf,
        /// Clear existing data before importing
        #[arg(long)]
        replace: bool,
    },
    Track {
        repo: String,
        #[arg(long, value_enum, default_value_t = OwnerType::User)]
        owner_type: OwnerType,
    },
    Untrack {
        repo: String,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum OwnerType {
    User,
    Org,
}

impl From<OwnerType> for OwnerKind {
    fn from(value: OwnerType) -> Self {
        match value {
            OwnerType::User => OwnerKind::Individual,
            OwnerType::Org => OwnerKind::Organization,
        }
    }
}

#[derive(thiserror::Error, Debug)]
enum CliError {
    #[error(transparent)]
    Invalid(#[from] ValidationError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error(transparent)]
    Sync(#[from] SyncError),
    #[error(transparent)]
    Serve(#[from] ServeError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid snapshot: {0}")]
    Snapshot(#[from] serde_json::Error),
    #[error("{0}")]
    Failed(String),
}

fn main() {
    let args = Args::parse();

    let config = match Config::load(args.config_file_path.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {e}");
            std::process::exit(2);
        }
    };

    let _sentry = logging::init(config.common.logging.as_ref());
    if let Some(metrics_config) = &config.common.metrics
        && let Err(e) = statsd::init(metrics_config)
    {
        tracing::warn!(error = %e, "metrics disabled");
    }

    if let Err(e) = run(config, args.command) {
        tracing::error!(error = %e, "command failed");
        std::process::exit(1);
    }
}

fn run(config: Config, command: CliCommand) -> Result<(), CliError> {
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    rt.block_on(async move {
        let store = store::open(&config.tracker.storage).await?;

        match command {
            CliCommand::Sync => sync_once(&config, store).await,
            CliCommand::Serve { port } => serve(config, store, port).await,
            CliCommand::Export { output } => export(store.as_ref(), output).await,
            CliCommand::Import { input, replace } => import(store.as_ref(), input, replace).await,
            CliCommand::Track { repo, owner_type } => {
                if store.track_repository(&repo, owner_type.into(), None).await {
                    println!("now tracking {repo}");
                    Ok(())
                } else {
                    Err(CliError::Failed(format!("could not track {repo}")))
                }
            }
            CliCommand::Untrack { repo } => {
                if store.untrack_repository(&repo, None).await {
                    println!("stopped tracking {repo}");
                    Ok(())
                } else {
                    Err(CliError::Failed(format!("could not untrack {repo}")))
                }
            }
        }
    })
}

fn synchronizer(
    config: &Config,
    store: Arc<dyn TrafficStore>,
) -> Result<Arc<Synchronizer>, CliError> {
    let github = &config.tracker.github;
    let source = GitHubClient::new(github.api_url()?, github.timeout())?;
    Ok(Arc::new(Synchronizer::new(store, Arc::new(source))))
}

async fn sync_once(config: &Config, store: Arc<dyn TrafficStore>) -> Result<(), CliError> {
    let credential = config.tracker.github.credential().map_err(SyncError::from)?;
    let report = synchronizer(config, store)?
        .run_sync_cycle(&credential)
        .await?;

    for failure in &report.failures {
        tracing::warn!(
            repository = %failure.repository_id,
            state = %failure.state,
            error = %failure.error,
            "repository failed"
        );
    }
    println!("{}", report.message());
    Ok(())
}

async fn serve(
    mut config: Config,
    store: Arc<dyn TrafficStore>,
    port: Option<u16>,
) -> Result<(), CliError> {
    if let Some(port) = port {
        config.tracker.listener.port = port;
    }

    let credential = config.tracker.github.credential();
    if let Err(e) = &credential {
        tracing::warn!(error = %e, "no usable credential, sync cycles will fail until configured");
    }

    let sync_config = &config.tracker.sync;
    let schedule = sync_config.enabled.then(|| Schedule {
        interval: sync_config.interval(),
        run_on_start: sync_config.run_on_start,
    });
    let sync = SyncService::spawn(synchronizer(&config, store.clone())?, credential, schedule);

    let state = AppState {
        stats: Stats::new(store.clone(), sync_config.trailing_window_days),
        sync: sync.clone(),
        store,
    };

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for shutdown signal");
        }
        tracing::info!("shutting down");
    };
    let result = api::serve(&config.tracker.listener, state, shutdown).await;

    sync.shutdown().await;
    Ok(result?)
}

async fn export(store: &dyn TrafficStore, output: Option<PathBuf>) -> Result<(), CliError> {
    let snapshot = store.export_all().await?;
    let json = serde_json::to_string_pretty(&snapshot)?;

    match output {
        Some(path) => {
            tokio::fs::write(&path, json).await?;
            tracing::info!(
                path = ?path,
                clones = snapshot.clone_history.len(),
                views = snapshot.view_history.len(),
                "exported snapshot"
            );
        }
        None => println!("{json}"),
    }
    Ok(())
}

async fn import(store: &dyn TrafficStore, input: PathBuf, replace: bool) -> Result<(), CliError> {
    let data = tokio::fs::read(&input).await?;
    let snapshot: Snapshot = serde_json::from_slice(&data)?;

    if store.import_all(&snapshot, replace).await {
        println!(
            "imported {} clone and {} view records",
            snapshot.clone_history.len(),
            snapshot.view_history.len()
        );
        Ok(())
    } else {
        Err(CliError::Failed("import failed, store left unchanged".into()))
    }
}
