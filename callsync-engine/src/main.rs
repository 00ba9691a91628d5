//! callsync-engine - call-event ingestion and reconciliation service
//!
//! Receives provider webhooks into a durable inbox, applies them to canonical
//! call records through the status state machine, and repairs drift by
//! polling the provider on three cadences.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use callsync_common::config::{database_path, find_config_file, resolve_root_folder, ROOT_FOLDER_ENV};
use callsync_common::db::init_database;
use callsync_common::events::EventBus;
use clap::Parser;
use tokio::signal;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use callsync_engine::config::Config;
use callsync_engine::inbox::InboxStore;
use callsync_engine::notify::{EventBusNotifier, RealtimeNotifier};
use callsync_engine::provider::{HttpProviderClient, ProviderError};
use callsync_engine::reconcile::{self, Reconciler};
use callsync_engine::state_machine::StateMachine;
use callsync_engine::store::CallStore;
use callsync_engine::worker::{InboxWorker, WorkerSettings};
use callsync_engine::{AppState, WebhookSettings};

/// Command-line arguments for callsync-engine
#[derive(Parser, Debug)]
#[command(name = "callsync-engine")]
#[command(about = "Call-event ingestion and reconciliation service")]
#[command(version)]
struct Args {
    /// Root folder holding the database
    #[arg(short, long, env = "CALLSYNC_ROOT_FOLDER")]
    root_folder: Option<PathBuf>,

    /// Port to listen on (overrides the config file)
    #[arg(short, long, env = "CALLSYNC_PORT")]
    port: Option<u16>,

    /// TOML config file
    #[arg(short, long, env = "CALLSYNC_CONFIG")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "callsync_engine=info,callsync_common=info,tower_http=info".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    info!(
        "Starting callsync-engine v{} [{}] built {} ({})",
        env!("CARGO_PKG_VERSION"),
        env!("GIT_HASH"),
        env!("BUILD_TIMESTAMP"),
        env!("BUILD_PROFILE")
    );

    let config_path = args.config.clone().or_else(|| find_config_file().ok());
    let mut config = Config::load(config_path.as_deref()).context("Failed to load configuration")?;
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(path) = &config_path {
        info!("Config file: {}", path.display());
    }

    let root_folder = resolve_root_folder(args.root_folder.as_deref(), ROOT_FOLDER_ENV, config_path.as_deref());
    info!("Root folder: {}", root_folder.display());

    let db_path = database_path(&root_folder);
    let db = init_database(&db_path)
        .await
        .context("Failed to initialize database")?;
    info!("Database: {}", db_path.display());

    let event_bus = EventBus::new(config.server.event_capacity);
    let notifier: Arc<dyn RealtimeNotifier> = Arc::new(EventBusNotifier::new(event_bus.clone()));

    let state_machine = StateMachine::new(config.reconcile.freeze_cooldown());
    let inbox = InboxStore::new(db.clone(), config.worker.max_attempts);
    let store = CallStore::new(db.clone(), state_machine);

    let worker = Arc::new(InboxWorker::new(
        inbox.clone(),
        store.clone(),
        Arc::clone(&notifier),
        event_bus.clone(),
        WorkerSettings {
            concurrency: config.worker.concurrency,
            batch_size: config.worker.batch_size,
            poll_interval: config.worker_poll_interval(),
        },
    ));

    let signing_token = config.signing_token().map(str::to_string);
    if signing_token.is_none() {
        warn!("No webhook signing token configured; signature validation is disabled");
    }

    let mut state = AppState::new(
        db,
        inbox,
        store.clone(),
        event_bus.clone(),
        worker.wake_handle(),
        WebhookSettings {
            provider_name: config.provider.name.clone(),
            public_base_url: config.webhooks.public_base_url.clone(),
            signing_token,
        },
    )
    .with_admin_token(config.server.admin_token.clone());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut background = vec![tokio::spawn(Arc::clone(&worker).run(shutdown_rx.clone()))];

    match HttpProviderClient::new(&config.provider) {
        Ok(client) => {
            let reconciler = Arc::new(Reconciler::new(
                store,
                Arc::new(client),
                Arc::clone(&notifier),
                event_bus,
                config.reconcile.clone(),
            ));
            if config.reconcile.enabled {
                background.extend(reconcile::spawn_tiers(Arc::clone(&reconciler), shutdown_rx.clone()));
            } else {
                info!("Scheduled reconciliation disabled by config");
            }
            state = state.with_reconciler(reconciler);
        }
        Err(ProviderError::NotConfigured) => {
            warn!("Provider credentials not configured; reconciliation is disabled");
        }
        Err(e) => return Err(e).context("Failed to build provider client"),
    }

    let app = callsync_engine::build_router(state);

    let addr: SocketAddr = format!("{}:{}", config.server.bind_addr, config.server.port)
        .parse()
        .context("Invalid bind address")?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("Failed to bind to address")?;
    info!("Listening on http://{}", addr);
    info!("Health check: http://{}/health", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    let _ = shutdown_tx.send(true);
    for handle in background {
        let _ = handle.await;
    }

    info!("Server shutdown complete");
    Ok(())
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down");
        },
        _ = terminate => {
            info!("Received terminate signal, shutting down");
        },
    }
}
