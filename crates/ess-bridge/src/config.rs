use std::env;
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use collector::CollectorConfig;
use device_link::LinkConfig;
use dispatch::{DispatchLimits, NEUTRAL_POWER};
use realtime::SubscriberOptions;
use scheduler::SchedulerConfig;
use store::StoreConfig;

const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:8080";
const DEFAULT_WS_PATH: &str = "/ws/power-data";
const DEFAULT_QUEUE_CAPACITY: usize = 32;
const DEFAULT_SEND_TIMEOUT_MS: u64 = 5_000;

#[derive(Clone, Debug)]
pub struct RealtimeConfig {
    pub listen_addr: String,
    /// Route of the websocket subscriber endpoint.
    pub path: String,
    pub queue_capacity: usize,
    /// Minimum spacing of `power_update` frames per client; `None` disables throttling.
    pub cadence_ms: Option<u64>,
    pub send_timeout_ms: u64,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            listen_addr: DEFAULT_LISTEN_ADDR.to_string(),
            path: DEFAULT_WS_PATH.to_string(),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            cadence_ms: None,
            send_timeout_ms: DEFAULT_SEND_TIMEOUT_MS,
        }
    }
}

impl RealtimeConfig {
    pub fn subscriber_options(&self) -> SubscriberOptions {
        SubscriberOptions {
            queue_capacity: self.queue_capacity,
            cadence: self.cadence_ms.map(Duration::from_millis),
            send_timeout: Duration::from_millis(self.send_timeout_ms),
        }
    }
}

#[derive(Clone, Debug)]
pub struct BridgeConfig {
    pub link: LinkConfig,
    pub collector: CollectorConfig,
    pub dispatch: DispatchLimits,
    pub realtime: RealtimeConfig,
    pub store: StoreConfig,
    pub store_enabled: bool,
    /// Schedules live in the store; the scheduler only runs when the store is enabled.
    pub scheduler: SchedulerConfig,
    pub metrics_addr: Option<String>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            link: LinkConfig::default(),
            collector: CollectorConfig::default(),
            dispatch: DispatchLimits::default(),
            realtime: RealtimeConfig::default(),
            store: StoreConfig::default(),
            store_enabled: true,
            scheduler: SchedulerConfig::default(),
            metrics_addr: None,
        }
    }
}

impl BridgeConfig {
    pub fn load() -> Result<Self> {
        Self::load_with_path(None)
    }

    pub fn load_with_path(config_path: Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(file_config) = load_file_config(config_path.as_deref())? {
            apply_file_config(&mut config, file_config);
        }

        apply_env_overrides(&mut config);
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.link.host.trim().is_empty() {
            anyhow::bail!("device.host must be non-empty");
        }
        if self.link.port == 0 {
            anyhow::bail!("device.port must be between 1 and 65535");
        }
        if self.link.timeout_ms == 0 {
            anyhow::bail!("device.timeout_ms must be >= 1");
        }
        if self.link.retry_backoff_ms == 0 {
            anyhow::bail!("device.retry_backoff_ms must be >= 1");
        }
        if self.link.retry_max_backoff_ms < self.link.retry_backoff_ms {
            anyhow::bail!("device.retry_max_backoff_ms must be >= device.retry_backoff_ms");
        }
        if let Some(max_batch) = self.link.max_batch_size {
            if max_batch == 0 {
                anyhow::bail!("device.max_batch_size must be >= 1");
            }
        }
        if self.collector.poll_interval.is_zero() {
            anyhow::bail!("collector.poll_interval_ms must be >= 1");
        }
        if self.collector.rollup_interval.is_zero() {
            anyhow::bail!("collector.rollup_interval_ms must be >= 1");
        }
        if self.dispatch.max_power_w == 0 || self.dispatch.max_power_w > NEUTRAL_POWER {
            anyhow::bail!("dispatch.max_power_w must be between 1 and {NEUTRAL_POWER}");
        }
        self.realtime
            .listen_addr
            .parse::<SocketAddr>()
            .map_err(|_| anyhow::anyhow!("realtime.listen_addr must be a socket address"))?;
        if !self.realtime.path.starts_with('/') {
            anyhow::bail!("realtime.path must start with '/'");
        }
        if self.realtime.queue_capacity == 0 {
            anyhow::bail!("realtime.queue_capacity must be >= 1");
        }
        if self.realtime.send_timeout_ms == 0 {
            anyhow::bail!("realtime.send_timeout_ms must be >= 1");
        }
        if let Some(cadence) = self.realtime.cadence_ms {
            if cadence == 0 {
                anyhow::bail!("realtime.cadence_ms must be >= 1 when set");
            }
        }
        if self.store_enabled {
            if self.store.path.trim().is_empty() {
                anyhow::bail!("store.path must be non-empty");
            }
            if self.store.retention_days == 0 {
                anyhow::bail!("store.retention_days must be >= 1");
            }
        }
        if self.scheduler.check_interval.is_zero()
            || self.scheduler.check_interval >= Duration::from_secs(60)
        {
            anyhow::bail!("scheduler.check_interval_ms must be between 1 and 59999");
        }
        if let Some(ref addr) = self.metrics_addr {
            addr.parse::<SocketAddr>()
                .map_err(|_| anyhow::anyhow!("metrics.listen_addr must be a socket address"))?;
        }

        Ok(())
    }
}

fn apply_env_overrides(config: &mut BridgeConfig) {
    if let Ok(value) = env::var("ESS_HOST") {
        config.link.host = value;
    }
    if let Some(port) = parse_env_u16("ESS_PORT") {
        config.link.port = port;
    }
    if let Some(unit_id) = parse_env_u8("ESS_UNIT_ID") {
        config.link.unit_id = unit_id;
    }
    if let Some(timeout_ms) = parse_env_u64("ESS_TIMEOUT_MS") {
        config.link.timeout_ms = timeout_ms;
    }
    if let Some(retries) = parse_env_usize("ESS_CONNECT_RETRIES") {
        config.link.connect_retries = retries;
    }
    if let Some(backoff) = parse_env_u64("ESS_RETRY_BACKOFF_MS") {
        config.link.retry_backoff_ms = backoff;
        config.link.retry_max_backoff_ms = config.link.retry_max_backoff_ms.max(backoff);
    }
    if let Some(interval_ms) = parse_env_u64("ESS_POLL_INTERVAL_MS") {
        config.collector.poll_interval = Duration::from_millis(interval_ms);
    }
    if let Some(interval_ms) = parse_env_u64("ESS_ROLLUP_INTERVAL_MS") {
        config.collector.rollup_interval = Duration::from_millis(interval_ms);
    }
    if let Some(max_power) = parse_env_u32("ESS_MAX_POWER_W") {
        config.dispatch.max_power_w = max_power;
    }
    if let Ok(value) = env::var("ESS_LISTEN_ADDR") {
        config.realtime.listen_addr = value;
    }
    if let Ok(value) = env::var("ESS_WS_PATH") {
        config.realtime.path = value;
    }
    if let Some(capacity) = parse_env_usize("ESS_QUEUE_CAPACITY") {
        config.realtime.queue_capacity = capacity;
    }
    if let Some(cadence) = parse_env_u64("ESS_CADENCE_MS") {
        config.realtime.cadence_ms = Some(cadence);
    }
    if let Ok(value) = env::var("ESS_DB_PATH") {
        config.store.path = value;
    }
    if let Some(days) = parse_env_u32("ESS_RETENTION_DAYS") {
        config.store.retention_days = days;
    }
    if let Some(interval_ms) = parse_env_u64("ESS_SCHEDULE_INTERVAL_MS") {
        config.scheduler.check_interval = Duration::from_millis(interval_ms);
    }
    config.store_enabled = parse_env_bool("ESS_STORE_ENABLED").unwrap_or(config.store_enabled);
    config.metrics_addr = env::var("ESS_METRICS_ADDR").ok().or(config.metrics_addr.take());
}

#[derive(Debug, Deserialize)]
struct FileConfig {
    device: Option<FileDeviceConfig>,
    collector: Option<FileCollectorConfig>,
    dispatch: Option<FileDispatchConfig>,
    realtime: Option<FileRealtimeConfig>,
    store: Option<FileStoreConfig>,
    scheduler: Option<FileSchedulerConfig>,
    metrics: Option<FileMetricsConfig>,
}

#[derive(Debug, Deserialize)]
struct FileDeviceConfig {
    host: Option<String>,
    port: Option<u16>,
    unit_id: Option<u8>,
    timeout_ms: Option<u64>,
    connect_retries: Option<usize>,
    retry_backoff_ms: Option<u64>,
    retry_max_backoff_ms: Option<u64>,
    max_batch_size: Option<u16>,
}

#[derive(Debug, Deserialize)]
struct FileCollectorConfig {
    poll_interval_ms: Option<u64>,
    rollup_interval_ms: Option<u64>,
    jitter_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct FileDispatchConfig {
    max_power_w: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct FileRealtimeConfig {
    listen_addr: Option<String>,
    path: Option<String>,
    queue_capacity: Option<usize>,
    cadence_ms: Option<u64>,
    send_timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct FileStoreConfig {
    enabled: Option<bool>,
    path: Option<String>,
    retention_days: Option<u32>,
    max_connections: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct FileSchedulerConfig {
    check_interval_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct FileMetricsConfig {
    listen_addr: Option<String>,
}

fn load_file_config(config_path: Option<&str>) -> Result<Option<FileConfig>> {
    let path = match config_path {
        Some(path) => path.to_string(),
        None => match env::var("ESS_CONFIG") {
            Ok(value) => value,
            Err(_) => return Ok(None),
        },
    };

    let content = fs::read_to_string(&path)
        .with_context(|| format!("read config file {path}"))?;
    let ext = Path::new(&path).extension().and_then(|value| value.to_str());

    let config = match ext {
        Some("json") => serde_json::from_str(&content).context("parse json config")?,
        _ => toml::from_str(&content).context("parse toml config")?,
    };

    Ok(Some(config))
}

fn apply_file_config(config: &mut BridgeConfig, file: FileConfig) {
    if let Some(device) = file.device {
        if let Some(host) = device.host {
            config.link.host = host;
        }
        if let Some(port) = device.port {
            config.link.port = port;
        }
        if let Some(unit_id) = device.unit_id {
            config.link.unit_id = unit_id;
        }
        if let Some(timeout_ms) = device.timeout_ms {
            config.link.timeout_ms = timeout_ms;
        }
        if let Some(retries) = device.connect_retries {
            config.link.connect_retries = retries;
        }
        if let Some(backoff) = device.retry_backoff_ms {
            config.link.retry_backoff_ms = backoff;
        }
        if let Some(max_backoff) = device.retry_max_backoff_ms {
            config.link.retry_max_backoff_ms = max_backoff;
        }
        if let Some(max_batch) = device.max_batch_size {
            config.link.max_batch_size = Some(max_batch);
        }
    }

    if let Some(collector) = file.collector {
        if let Some(interval_ms) = collector.poll_interval_ms {
            config.collector.poll_interval = Duration::from_millis(interval_ms);
        }
        if let Some(interval_ms) = collector.rollup_interval_ms {
            config.collector.rollup_interval = Duration::from_millis(interval_ms);
        }
        if let Some(jitter_ms) = collector.jitter_ms {
            config.collector.jitter_ms = jitter_ms;
        }
    }

    if let Some(dispatch) = file.dispatch {
        if let Some(max_power) = dispatch.max_power_w {
            config.dispatch.max_power_w = max_power;
        }
    }

    if let Some(realtime) = file.realtime {
        if let Some(addr) = realtime.listen_addr {
            config.realtime.listen_addr = addr;
        }
        if let Some(path) = realtime.path {
            config.realtime.path = path;
        }
        if let Some(capacity) = realtime.queue_capacity {
            config.realtime.queue_capacity = capacity;
        }
        if let Some(cadence) = realtime.cadence_ms {
            config.realtime.cadence_ms = Some(cadence);
        }
        if let Some(timeout_ms) = realtime.send_timeout_ms {
            config.realtime.send_timeout_ms = timeout_ms;
        }
    }

    if let Some(store) = file.store {
        if let Some(enabled) = store.enabled {
            config.store_enabled = enabled;
        }
        if let Some(path) = store.path {
            config.store.path = path;
        }
        if let Some(days) = store.retention_days {
            config.store.retention_days = days;
        }
        if let Some(max) = store.max_connections {
            config.store.max_connections = max;
        }
    }

    if let Some(scheduler) = file.scheduler {
        if let Some(interval_ms) = scheduler.check_interval_ms {
            config.scheduler.check_interval = Duration::from_millis(interval_ms);
        }
    }

    if let Some(metrics) = file.metrics {
        if let Some(addr) = metrics.listen_addr {
            config.metrics_addr = Some(addr);
        }
    }
}

fn parse_env_u8(key: &str) -> Option<u8> {
    env::var(key).ok().and_then(|value| value.parse().ok())
}

fn parse_env_u16(key: &str) -> Option<u16> {
    env::var(key).ok().and_then(|value| value.parse().ok())
}

fn parse_env_u32(key: &str) -> Option<u32> {
    env::var(key).ok().and_then(|value| value.parse().ok())
}

fn parse_env_u64(key: &str) -> Option<u64> {
    env::var(key).ok().and_then(|value| value.parse().ok())
}

fn parse_env_usize(key: &str) -> Option<usize> {
    env::var(key).ok().and_then(|value| value.parse().ok())
}

fn parse_env_bool(key: &str) -> Option<bool> {
    env::var(key).ok().and_then(|value| value.parse().ok())
}
