use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum_server::tls_rustls::RustlsConfig;
use clap::Parser;
use scanbroker_core::SystemClock;
use scanbroker_daemon::api::{self, AppState};
use scanbroker_daemon::config::{BrokerConfig, BrokerTimings, LoggingConfig, DEFAULT_CONFIG_PATH};
use scanbroker_daemon::db::tasks::TaskDb;
use scanbroker_daemon::manager::HttpManager;
use scanbroker_daemon::{Broker, BrokerOptions};
use tokio::signal;
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "scanbroker", version, about = "Scan task broker between agents and the manager")]
struct Cli {
    /// Config file. Falls back to SCANBROKER_CONFIG, then broker.json.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Overrides `listen_address`, e.g. 0.0.0.0:2222
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// Overrides `logging.level` and RUST_LOG (env-filter syntax).
    #[arg(long)]
    log: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = cli
        .config
        .or_else(|| std::env::var_os("SCANBROKER_CONFIG").map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
    let mut config = BrokerConfig::load(&config_path)?;
    if let Some(listen) = cli.listen {
        config.listen_address = listen;
    }
    let env_filter = std::env::var(EnvFilter::DEFAULT_ENV).ok();
    config.logging.level = config.logging.directive(cli.log.as_deref(), env_filter.as_deref());

    init_tracing(&config.logging);

    let tasks = TaskDb::open(&config.broker_db_path, config.pool_options())?;
    let manager = Arc::new(HttpManager::new(
        &config.manager_address,
        &config.manager_privilege_secret,
    )?);

    let broker = Broker::new(
        tasks,
        manager.clone(),
        Arc::new(SystemClock),
        BrokerOptions {
            scope_db_root: config.scope_db_root.clone(),
            pool: config.pool_options(),
            timings: BrokerTimings::default(),
        },
    );
    broker.spawn_background();
    let subscription = manager.spawn_subscription(broker.shutdown_token());
    broker.warm_cache().await;

    let app = api::router(AppState::new(broker.clone()));
    let addr = config.listen_address;

    match &config.tls {
        Some(tls) => {
            let rustls = RustlsConfig::from_pem_file(&tls.cert_path, &tls.key_path)
                .await
                .context("load TLS certificate and key")?;
            let handle: axum_server::Handle<std::net::SocketAddr> = axum_server::Handle::new();
            {
                let handle = handle.clone();
                tokio::spawn(async move {
                    shutdown_signal().await;
                    handle.graceful_shutdown(Some(Duration::from_secs(10)));
                });
            }
            info!(listen = %addr, "broker listening (TLS)");
            axum_server::bind_rustls(addr, rustls)
                .handle(handle)
                .serve(app.into_make_service())
                .await?;
        }
        None => {
            let listener = tokio::net::TcpListener::bind(addr).await?;
            info!(listen = %addr, "broker listening");
            axum::serve(listener, app)
                .with_graceful_shutdown(shutdown_signal())
                .await?;
        }
    }

    broker.shutdown().await;
    let _ = subscription.await;
    info!("broker stopped");
    Ok(())
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::new(&logging.level);
    let registry = tracing_subscriber::registry().with(filter);
    if logging.json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }
}

async fn shutdown_signal() {
    let _ = signal::ctrl_c().await;
    info!("shutdown requested");
}
