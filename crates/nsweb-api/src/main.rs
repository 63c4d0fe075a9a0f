//! nsweb-api server binary.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use nsweb_api::{build_router, AppConfig, AppState, Repositories};
use nsweb_core::{defaults, DecodingSet};
use nsweb_db::{ArtifactStore, Database, FilesystemBackend, MemoryStore};
use nsweb_jobs::{decoding_worker, ReferenceLibrary, WorkerConfig, WorkerEvent};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Initialize tracing with configurable output
    //
    // Environment variables:
    //   LOG_FORMAT  - "json" or "text" (default: "text")
    //   LOG_FILE    - path to log file (optional, enables file logging)
    //   LOG_ANSI    - "true"/"false" override ANSI colors (auto-detected by default)
    //   RUST_LOG    - standard env filter (default: "nsweb_api=debug,tower_http=debug")
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| "text".to_string());
    let log_file = std::env::var("LOG_FILE").ok();
    let log_ansi = std::env::var("LOG_ANSI")
        .ok()
        .map(|v| v == "true" || v == "1");

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "nsweb_api=debug,nsweb_jobs=info,tower_http=debug".into());

    let registry = tracing_subscriber::registry().with(env_filter);

    // Optionally create a file appender with daily rotation
    let _file_guard = if let Some(ref path) = log_file {
        let file_dir = Path::new(path).parent().unwrap_or(Path::new("."));
        let file_name = Path::new(path)
            .file_name()
            .and_then(|f| f.to_str())
            .unwrap_or("nsweb-api.log");
        let file_appender = tracing_appender::rolling::daily(file_dir, file_name);
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        if log_format == "json" {
            registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_writer(non_blocking),
                )
                .init();
        } else {
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(log_ansi.unwrap_or(false));
            registry.with(layer).init();
        }
        Some(guard)
    } else {
        if log_format == "json" {
            registry
                .with(tracing_subscriber::fmt::layer().json())
                .init();
        } else {
            let mut layer = tracing_subscriber::fmt::layer();
            if let Some(ansi) = log_ansi {
                layer = layer.with_ansi(ansi);
            }
            registry.with(layer).init();
        }
        None
    };

    info!(
        log_format = %log_format,
        log_file = log_file.as_deref().unwrap_or("(stdout)"),
        "Logging initialized"
    );

    let config = AppConfig::from_env();
    info!(
        cache_decodings = config.cache_decodings,
        default_set = %config.default_decoding_set,
        max_image_bytes = config.max_image_bytes,
        task_timeout_secs = config.task_timeout.as_secs(),
        "Configuration loaded"
    );

    let repos = if config.uses_memory_store() {
        let sets = discover_decoding_sets(&config.reference_data_dir);
        warn!(
            set_count = sets.len(),
            "DATABASE_URL=memory: using the in-memory store, nothing is persisted"
        );
        Repositories::in_memory(Arc::new(MemoryStore::new().with_decoding_sets(sets)))
    } else {
        info!("Connecting to database...");
        let db = Database::connect(&config.database_url).await?;
        info!("Database connected");

        info!("Running database migrations...");
        db.migrate().await?;
        info!("Database migrations complete");
        Repositories::from_database(db)
    };

    for dir in [
        &config.decoded_image_dir,
        &config.results_dir,
        &config.scatterplots_dir,
    ] {
        FilesystemBackend::new(dir)
            .validate()
            .await
            .map_err(|e| anyhow::anyhow!("artifact directory {}: {}", dir.display(), e))?;
    }

    let library = Arc::new(ReferenceLibrary::new(&config.reference_data_dir));
    let artifacts = ArtifactStore::new(
        &config.decoded_image_dir,
        &config.results_dir,
        &config.scatterplots_dir,
    );
    let worker = decoding_worker(WorkerConfig::from_env(), library, artifacts)
        .build()
        .await
        .start();
    tokio::spawn(log_worker_events(worker.events()));

    let state = AppState::new(&config, repos, worker.dispatcher(config.task_timeout))?;
    let app = build_router(state);

    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    info!("Starting server on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
            info!("Shutdown signal received");
        })
        .await?;

    worker.shutdown().await?;
    Ok(())
}

/// Reference sets present on disk, used to seed the in-memory store.
fn discover_decoding_sets(root: &Path) -> Vec<DecodingSet> {
    let Ok(entries) = std::fs::read_dir(root) else {
        warn!(root = %root.display(), "Reference data directory is not readable");
        return Vec::new();
    };
    let mut names: Vec<String> = entries
        .filter_map(|e| e.ok())
        .filter(|e| e.path().is_dir())
        .filter_map(|e| e.file_name().to_str().map(str::to_string))
        .filter(|name| !defaults::VOXEL_REFERENCES.contains(&name.as_str()))
        .collect();
    names.sort();

    names
        .into_iter()
        .enumerate()
        .map(|(i, name)| {
            let n_images = std::fs::read_dir(root.join(&name))
                .map(|files| {
                    files
                        .filter_map(|f| f.ok())
                        .filter_map(|f| f.file_name().to_str().map(str::to_string))
                        .filter(|f| f.ends_with(".nii") || f.ends_with(".nii.gz"))
                        .filter(|f| !f.trim_end_matches(".gz").ends_with("_pp.nii"))
                        .count()
                })
                .unwrap_or(0);
            DecodingSet {
                id: i as i64 + 1,
                name,
                description: None,
                n_images: n_images as i32,
            }
        })
        .collect()
}

/// Log worker lifecycle and job outcomes.
async fn log_worker_events(mut rx: broadcast::Receiver<WorkerEvent>) {
    loop {
        match rx.recv().await {
            Ok(WorkerEvent::JobFailed {
                job_id,
                job_type,
                error,
            }) => warn!(
                subsystem = "jobs",
                %job_id,
                job_type = job_type.as_str(),
                error = %error,
                "Job failed"
            ),
            Ok(WorkerEvent::WorkerStopped) => {
                info!(subsystem = "jobs", "Worker stopped");
                break;
            }
            Ok(event) => debug!(subsystem = "jobs", ?event, "Worker event"),
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!(subsystem = "jobs", skipped = n, "Worker event log lagged")
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
