use std::sync::Arc;

use sea_orm_migration::MigratorTrait;
use shipyard_control::broker::LogBroker;
use shipyard_control::config::{Config, SupervisorKind};
use shipyard_control::http;
use shipyard_control::lifecycle::Lifecycle;
use shipyard_control::pipeline::Pipeline;
use shipyard_control::proxy::{CaddyProxy, ReverseProxy};
use shipyard_control::queue::QueueManager;
use shipyard_control::source::GitFetcher;
use shipyard_control::state::AppState;
use shipyard_control::store::{SeaOrmStore, Store};
use shipyard_control::supervisor::{LocalSupervisor, ServiceSupervisor, SystemdSupervisor};
use shipyard_control::workspace::{UploadStore, Workspaces};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Console logging always; a daily-rolled file too when a log dir is configured.
/// The returned guard must live until shutdown so buffered lines get flushed.
fn init_tracing(config: &Config) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,sqlx=warn,sea_orm=warn"));
    let console = tracing_subscriber::fmt::layer();

    match &config.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "shipyard-control.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(filter)
                .with(console)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(writer),
                )
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry()
                .with(filter)
                .with(console)
                .init();
            None
        }
    }
}

async fn build_state(config: Config) -> anyhow::Result<AppState> {
    tokio::fs::create_dir_all(&config.data_root).await?;
    let db = shipyard_db::connect(&config.database_url).await?;

    // Apply migrations on boot (idempotent).
    shipyard_migration::Migrator::up(&db, None).await?;

    let store: Arc<dyn Store> = Arc::new(SeaOrmStore::new(db));
    let supervisor: Arc<dyn ServiceSupervisor> = match config.supervisor {
        SupervisorKind::Systemd => Arc::new(SystemdSupervisor::new(&config.systemd_unit_dir)),
        SupervisorKind::Local => Arc::new(LocalSupervisor::default()),
    };
    let proxy: Arc<dyn ReverseProxy> = Arc::new(CaddyProxy::new(
        store.clone(),
        &config.caddyfile,
        config.caddy_bin.clone(),
    ));
    let workspaces = Workspaces::new(config.workspaces_dir());
    let uploads = UploadStore::new(config.uploads_dir());

    let pipeline = Pipeline {
        store: store.clone(),
        supervisor: supervisor.clone(),
        proxy: proxy.clone(),
        fetcher: Arc::new(GitFetcher::new(config.command_timeout)),
        workspaces: workspaces.clone(),
        uploads: uploads.clone(),
        command_timeout: config.command_timeout,
    };
    let queue = QueueManager::start(store, LogBroker::new(), pipeline, uploads.clone()).await?;
    let lifecycle = Lifecycle::new(queue.clone(), supervisor, proxy, workspaces, uploads);

    Ok(AppState {
        config: Arc::new(config),
        queue,
        lifecycle,
    })
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %err, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown requested");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env()?;
    let _log_guard = init_tracing(&config);

    let addr = config.listen;
    let supervisor = config.supervisor;
    let state = build_state(config).await?;
    let app = http::router(state);

    tracing::info!(%addr, ?supervisor, "shipyard-control HTTP listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}
