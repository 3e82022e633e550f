//! nflow Server
//!
//! Workflow runtime serving one app's playbooks over HTTP.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use nflow::cache::ScriptCache;
use nflow::config::Config;
use nflow::engine::{Engine, StepRegistry};
use nflow::playbook::PlaybookStore;
use nflow::plugin::PluginRegistry;
use nflow::process::ProcessRegistry;
use nflow::server::{create_router, AppState};
use nflow::session::{MemoryBackend, SessionLayer};
use nflow::store::{AppStore, FileStore};
use nflow::tracker::build_tracker;
use nflow::vm::VmPool;

/// Hard cap of the transform/program caches
const SCRIPT_CACHE_CAP: usize = 1000;

/// nflow workflow runtime
#[derive(Parser, Debug)]
#[command(name = "nflow")]
#[command(about = "Workflow runtime server", long_about = None)]
struct Args {
    /// App name, or path to a playbook JSON file
    #[arg(short = 'a', long = "app", default_value = "default")]
    app: String,

    /// Configuration file
    #[arg(short = 'c', long = "config", default_value = "config.toml")]
    config: PathBuf,

    /// Directory holding <app>.json documents
    #[arg(long, default_value = "./apps")]
    apps_dir: PathBuf,

    /// Verbose logging
    #[arg(short = 'v', long)]
    verbose: bool,

    /// Listener host override
    #[arg(long)]
    host: Option<String>,

    /// Listener port override
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let default_filter = if args.verbose {
        "nflow=debug,tower_http=debug"
    } else {
        "nflow=info,tower_http=warn"
    };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("starting nflow v{}", env!("CARGO_PKG_VERSION"));

    let mut config = match Config::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            error!("failed to load config {}: {}", args.config.display(), e);
            std::process::exit(1);
        }
    };
    if let Some(host) = args.host {
        config.server.host = host;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }

    // App source: a pinned JSON file or the apps directory.
    let file_store = FileStore::new(&args.apps_dir);
    let app_name = if args.app.ends_with(".json") {
        match file_store.pin_file(Path::new(&args.app)) {
            Ok(name) => name,
            Err(e) => {
                error!("invalid app file {}: {}", args.app, e);
                std::process::exit(1);
            }
        }
    } else {
        args.app.clone()
    };
    let store: Arc<dyn AppStore> = Arc::new(file_store);

    let playbooks = Arc::new(PlaybookStore::new(store.clone()));

    // Fail fast when the served app cannot be loaded.
    match playbooks.load(&app_name).await {
        Ok(loaded) => {
            info!(app = app_name.as_str(), flows = loaded.playbooks.len(), "app loaded");
        }
        Err(e) => {
            error!("failed to load app {}: {}", app_name, e);
            std::process::exit(1);
        }
    }

    let sessions = Arc::new(SessionLayer::new(
        Arc::new(MemoryBackend::new()),
        Duration::from_secs(config.session.ttl_minutes * 60),
    ));
    let _session_sweeper =
        sessions.spawn_sweeper(Duration::from_secs(config.session.sweep_seconds.max(1)));

    let env_json = serde_json::to_value(&config.env)?;
    let vm_pool = VmPool::new(config.vm_pool.clone(), env_json);
    if let Err(e) = vm_pool.preload() {
        warn!("vm preload failed: {}", e);
    }
    let _pool_maintenance = vm_pool.spawn_maintenance();

    let tracker = build_tracker(&config.tracker).await?;

    let plugins = Arc::new(PluginRegistry::new());
    plugins.set_enabled(config.plugin.plugins.clone());

    let hostname = std::env::var("HOSTNAME").unwrap_or_else(|_| config.server.host.clone());

    let engine = Engine::new(
        playbooks,
        sessions,
        Arc::new(ScriptCache::new(SCRIPT_CACHE_CAP)),
        vm_pool.clone(),
        Arc::new(StepRegistry::new()),
        Arc::new(ProcessRegistry::new()),
        tracker.clone(),
        plugins,
        store,
        config.vm_pool.max_size,
        hostname,
    );

    let state = AppState::new(engine.clone(), app_name, config.clone());
    let app = create_router(state);

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    let listener = TcpListener::bind(addr).await?;
    info!("listening on http://{}", addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    // Teardown: stop runs, drain the tracker, drop idle VMs.
    let killed = engine.processes.kill_all();
    if killed > 0 {
        info!(killed = killed, "live runs killed on shutdown");
    }
    tracker.shutdown().await;
    vm_pool.shutdown();

    info!("shutdown complete");
    Ok(())
}

/// Wait for SIGINT or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("failed to install Ctrl+C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => error!("failed to install signal handler: {}", e),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("received Ctrl+C, shutting down");
        },
        _ = terminate => {
            info!("received terminate signal, shutting down");
        },
    }
}
