use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use tvws_broker::config::Config;
use tvws_broker::driver::tv::{TvClient, TvConfig};
use tvws_broker::health::HealthMonitor;
use tvws_broker::mux::Multiplexer;
use tvws_broker::prices::PriceLog;
use tvws_broker::push::{self, PushConfig};
use tvws_broker::registry::Registry;
use tvws_broker::server::FrontState;
use tvws_broker::state::AppState;
use tvws_broker::{api, fanout, metrics, server};

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    let cfg = Config::from_env().context("load configuration")?;
    init_tracing(&cfg)?;

    // rustls 0.23+ requires selecting a crypto provider at process start.
    let _ =
        rustls::crypto::CryptoProvider::install_default(rustls::crypto::ring::default_provider());

    let metrics_handle = metrics::setup_metrics_recorder();

    info!(
        "broker starting: ws_port={} ws_enabled={} health_port={} metrics_port={} pinned={} push={}",
        cfg.websocket_port,
        cfg.websocket_enabled,
        cfg.health_api_port,
        cfg.metrics_port,
        cfg.initial_subscriptions.len(),
        cfg.push_enabled(),
    );

    let driver = Arc::new(TvClient::new(TvConfig::new(
        cfg.proxy.clone(),
        cfg.upstream_timeout,
    )));
    let mux = Multiplexer::new(driver);

    let health = HealthMonitor::new(cfg.health.clone(), mux.clone());
    health.start();

    let (bars_tx, _) = tokio::sync::broadcast::channel::<String>(256);
    let registry = Registry::new(mux.clone(), cfg.initial_subscriptions.iter().cloned());

    let push_handle = if cfg.push_enabled() {
        Some(push::start(PushConfig {
            endpoint: cfg.backend_endpoint.clone(),
            api_key: cfg.backend_api_key.clone(),
            retry_attempts: cfg.backend_retry_attempts,
            retry_backoff: cfg.backend_retry_backoff,
        })?)
    } else {
        None
    };
    let price_log = if cfg.debug_prices {
        Some(PriceLog::start(&cfg.prices_log_file)?)
    } else {
        None
    };

    let fanout_cancel = CancellationToken::new();
    let fanout_task = fanout::spawn(
        &mux,
        bars_tx.clone(),
        push_handle,
        price_log,
        fanout_cancel.clone(),
    );

    // Bind everything up front; a taken port is fatal.
    let api_listener = TcpListener::bind(("0.0.0.0", cfg.health_api_port))
        .await
        .context("bind health api port")?;
    let metrics_listener = TcpListener::bind(("0.0.0.0", cfg.metrics_port))
        .await
        .context("bind metrics port")?;
    let front_listener = if cfg.websocket_enabled {
        Some(
            TcpListener::bind(("0.0.0.0", cfg.websocket_port))
                .await
                .context("bind websocket port")?,
        )
    } else {
        None
    };

    let api_cancel = CancellationToken::new();
    let front_cancel = CancellationToken::new();
    let metrics_cancel = CancellationToken::new();

    let app_state = AppState::new(mux.clone(), health.clone());
    let api_task = tokio::spawn(api::serve_on(api_listener, app_state, api_cancel.clone()));
    let metrics_task = tokio::spawn(metrics::serve_on(
        metrics_listener,
        metrics_handle,
        metrics_cancel.clone(),
    ));
    let front_task = front_listener.map(|listener| {
        let state = FrontState {
            registry: registry.clone(),
            bars: bars_tx.clone(),
        };
        tokio::spawn(server::serve_on(listener, state, front_cancel.clone()))
    });

    // Upstream bring-up runs in the background so signals stay responsive
    // during backoff.
    let startup = {
        let mux = mux.clone();
        let initial = cfg.initial_subscriptions.clone();
        tokio::spawn(async move {
            if mux.connect().await {
                for key in &initial {
                    mux.subscribe(key, "startup").await;
                }
            } else {
                error!("upstream connect failed; waiting on operator or health recovery");
            }
        })
    };

    wait_for_shutdown().await;
    info!("shutdown signal received");

    // Orderly teardown: health api, health monitor, client front, then the
    // multiplexer itself.
    api_cancel.cancel();
    let _ = api_task.await;
    health.stop();
    front_cancel.cancel();
    if let Some(task) = front_task {
        let _ = task.await;
    }
    fanout_cancel.cancel();
    let _ = fanout_task.await;
    startup.abort();
    mux.close().await;
    metrics_cancel.cancel();
    let _ = metrics_task.await;
    info!("shutdown complete");
    Ok(())
}

fn init_tracing(cfg: &Config) -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cfg.log_level));
    match &cfg.log_file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("open log file {path}"))?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::sync::Mutex::new(file))
                .with_ansi(false)
                .init();
        }
        None => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
        }
    }
    Ok(())
}

async fn wait_for_shutdown() {
    let mut sigint = signal(SignalKind::interrupt()).expect("install SIGINT handler");
    let mut sigterm = signal(SignalKind::terminate()).expect("install SIGTERM handler");
    tokio::select! {
        _ = sigint.recv() => {}
        _ = sigterm.recv() => {}
    }
}
