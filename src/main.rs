use std::sync::Arc;

use anyhow::Context;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

use roomsync::api::{self, AppState};
use roomsync::config::Config;
use roomsync::engine::Engine;
use roomsync::fetch::{CalendarFetcher, HttpFetcher};
use roomsync::groups::Groups;
use roomsync::notify::NotifyHub;
use roomsync::{mail, observability, payment, tasks};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Arc::new(Config::from_env());
    observability::init(config.metrics_port)?;

    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("creating data dir {}", config.data_dir.display()))?;

    let notify = Arc::new(NotifyHub::new());
    let engine = Engine::new(config.wal_path(), notify.clone())
        .with_context(|| format!("opening WAL {}", config.wal_path().display()))?
        .with_default_currency(config.default_currency.clone());
    let engine = Arc::new(engine);
    let groups = Arc::new(Groups::load(&config.groups_file)?);
    let fetcher: Arc<dyn CalendarFetcher> = Arc::new(HttpFetcher::new(config.fetch_timeout)?);
    let mailer = Arc::from(mail::mailer_from_config(&config.mail)?);
    let payments = Arc::from(payment::gateway_from_config(&config.stripe)?);

    tokio::spawn(tasks::run_notification_dispatcher(
        notify.subscribe(),
        mailer,
        config.mail.alert_to.clone(),
    ));
    tokio::spawn(tasks::run_compactor(engine.clone(), config.compact_threshold));
    if config.is_single_worker() {
        tokio::spawn(tasks::run_sync_loop(
            engine.clone(),
            fetcher.clone(),
            config.sync_interval,
        ));
    } else {
        info!("WEB_CONCURRENCY={}, background sync disabled", config.web_concurrency);
    }

    let addr = format!("{}:{}", config.bind, config.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!("roomsync listening on {addr}");
    info!("  data_dir: {}", config.data_dir.display());
    info!("  groups: {}", groups.len());
    info!("  sync every {:?}", config.sync_interval);
    info!("  admin api: {}", if config.admin_token.is_some() { "enabled" } else { "locked" });
    info!("  metrics: {}", config.metrics_port.map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics")));

    let app = api::router(AppState {
        engine,
        groups,
        fetcher,
        payments,
        config,
    });
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("roomsync stopped");
    Ok(())
}

/// Resolves on ctrl-c or SIGTERM. In-flight requests drain after that.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("ctrl-c handler: {e}");
            std::future::pending::<()>().await;
        }
    };
    #[cfg(unix)]
    {
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    sigterm.recv().await;
                }
                Err(e) => {
                    tracing::error!("SIGTERM handler: {e}");
                    std::future::pending::<()>().await;
                }
            }
        };
        tokio::select! {
            _ = ctrl_c => {}
            _ = terminate => {}
        }
    }
    #[cfg(not(unix))]
    ctrl_c.await;
    info!("shutdown signal received, draining requests");
}
