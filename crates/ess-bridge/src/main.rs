use std::env;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use collector::CollectorLoop;
use device_link::DeviceLink;
use dispatch::DispatchController;
use ess_bridge::server::{self, AppState};
use ess_bridge::BridgeConfig;
use realtime::{ConnectionStateBroadcaster, RealtimeChannel};
use scheduler::DispatchScheduler;
use store::SqliteStore;
use types::{EventLog, NullEventLog, ScheduleSource};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config_path = parse_config_arg();
    let config = BridgeConfig::load_with_path(config_path).context("load config failed")?;
    config.validate().context("config validation failed")?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    if let Some(addr) = config.metrics_addr.as_deref() {
        let addr: SocketAddr = addr.parse().context("parse metrics listen address")?;
        PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .context("metrics exporter init failed")?;
        info!(%addr, "prometheus exporter listening");
    }

    let store = if config.store_enabled {
        let store = SqliteStore::open(&config.store)
            .await
            .context("store init failed")?;
        info!(path = %config.store.path, "sqlite store opened");
        Some(Arc::new(store))
    } else {
        None
    };
    let events: Arc<dyn EventLog> = match &store {
        Some(store) => Arc::clone(store) as Arc<dyn EventLog>,
        None => Arc::new(NullEventLog),
    };

    let link = Arc::new(DeviceLink::tcp(config.link.clone()));
    let channel = RealtimeChannel::new();
    let broadcaster = Arc::new(ConnectionStateBroadcaster::new(
        Arc::clone(&link),
        channel.clone(),
        Arc::clone(&events),
    ));
    let broadcaster_handle = {
        let broadcaster = Arc::clone(&broadcaster);
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move { broadcaster.run(shutdown).await })
    };

    let dispatch = Arc::new(DispatchController::new(Arc::clone(&link), Arc::clone(&events)));

    if let Err(err) = link.connect().await {
        warn!(device = %link.identity(), error = %err, "initial connect failed, collector will retry");
    }

    let mut collector = CollectorLoop::new(
        Arc::clone(&link),
        channel.clone(),
        Arc::clone(&events),
        config.collector.clone(),
    );
    if let Some(store) = &store {
        collector = collector.with_sink(store.clone()).with_rollup(store.clone());
    }
    let collector_handle = Arc::new(collector).spawn();

    let scheduler_handle = store.as_ref().map(|store| {
        let scheduler = DispatchScheduler::new(
            Arc::clone(&dispatch),
            Arc::clone(store) as Arc<dyn ScheduleSource>,
            config.dispatch,
            config.scheduler.clone(),
        );
        Arc::new(scheduler).spawn()
    });

    let state = AppState {
        channel: channel.clone(),
        dispatch,
        limits: config.dispatch,
        subscriber_options: config.realtime.subscriber_options(),
    };
    let app = server::router(state, &config.realtime.path);
    let listener = TcpListener::bind(&config.realtime.listen_addr)
        .await
        .with_context(|| format!("bind {}", config.realtime.listen_addr))?;
    info!(
        addr = %config.realtime.listen_addr,
        path = %config.realtime.path,
        "realtime server listening"
    );
    let server_handle = {
        let mut shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            let graceful = async move {
                while shutdown.changed().await.is_ok() {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            };
            if let Err(err) = axum::serve(listener, app)
                .with_graceful_shutdown(graceful)
                .await
            {
                warn!(error = %err, "realtime server failed");
            }
        })
    };

    notify_ready();
    let watchdog_handle = start_watchdog(shutdown_rx.clone());

    tokio::signal::ctrl_c()
        .await
        .context("listen for shutdown signal")?;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);

    if let Some(handle) = scheduler_handle {
        handle.stop().await;
    }
    collector_handle.stop().await;
    link.disconnect().await;
    channel.shutdown();

    let _ = broadcaster_handle.await;
    let _ = server_handle.await;
    if let Some(handle) = watchdog_handle {
        let _ = handle.await;
    }
    info!("ess bridge stopped");
    Ok(())
}

fn parse_config_arg() -> Option<String> {
    let mut args = env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--config" {
            return args.next();
        }
        if let Some(path) = arg.strip_prefix("--config=") {
            return Some(path.to_string());
        }
    }
    None
}

#[cfg(target_os = "linux")]
fn notify_ready() {
    if let Err(err) = sd_notify::notify(true, &[sd_notify::NotifyState::Ready]) {
        warn!(error = %err, "systemd ready notify failed");
    }
}

#[cfg(not(target_os = "linux"))]
fn notify_ready() {}

#[cfg(target_os = "linux")]
fn start_watchdog(mut shutdown: watch::Receiver<bool>) -> Option<tokio::task::JoinHandle<()>> {
    let interval = watchdog_interval()?;
    Some(tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = sleep(interval) => {
                    if let Err(err) = sd_notify::notify(false, &[sd_notify::NotifyState::Watchdog]) {
                        warn!(error = %err, "systemd watchdog notify failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }))
}

#[cfg(not(target_os = "linux"))]
fn start_watchdog(_shutdown: watch::Receiver<bool>) -> Option<tokio::task::JoinHandle<()>> {
    None
}

#[cfg(target_os = "linux")]
fn watchdog_interval() -> Option<Duration> {
    let watchdog_usec = env::var("WATCHDOG_USEC").ok()?.parse::<u64>().ok()?;
    if let Some(pid) = env::var("WATCHDOG_PID")
        .ok()
        .and_then(|value| value.parse::<u32>().ok())
    {
        if pid != std::process::id() {
            return None;
        }
    }

    let interval = watchdog_usec.saturating_div(2).max(100_000);
    Some(Duration::from_micros(interval))
}
