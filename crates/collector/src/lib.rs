use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chrono::Utc;
use device_link::{DeviceLink, LinkError};
use metrics::counter;
use realtime::RealtimeChannel;
use register_codec::{decode_snapshot, telemetry, CodecError};
use serde_json::json;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};
use types::{EventLog, EventRecord, RegisterSample, RollupHook, SnapshotSink, TelemetrySnapshot};

const SNAPSHOT_LOG_EVERY: u64 = 10;

#[derive(Debug, Clone)]
pub struct CollectorConfig {
    pub poll_interval: Duration,
    /// Period of the rollup hook. Aggregation itself happens downstream.
    pub rollup_interval: Duration,
    pub jitter_ms: u64,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(10),
            rollup_interval: Duration::from_secs(60),
            jitter_ms: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    Sampled(Box<TelemetrySnapshot>),
    /// The device could not be reached; nothing was read.
    Unavailable,
    /// A read or decode failed part way through the pass; no snapshot was produced.
    ReadFailed,
}

#[derive(Debug, Error)]
pub enum CollectError {
    #[error("telemetry read failed: {0}")]
    Link(#[from] LinkError),
    #[error("telemetry decode failed: {0}")]
    Codec(#[from] CodecError),
}

/// Periodic telemetry collection for one device.
pub struct CollectorLoop {
    link: Arc<DeviceLink>,
    channel: RealtimeChannel,
    events: Arc<dyn EventLog>,
    sink: Option<Arc<dyn SnapshotSink>>,
    rollup: Option<Arc<dyn RollupHook>>,
    config: CollectorConfig,
    snapshots: AtomicU64,
}

impl CollectorLoop {
    pub fn new(
        link: Arc<DeviceLink>,
        channel: RealtimeChannel,
        events: Arc<dyn EventLog>,
        config: CollectorConfig,
    ) -> Self {
        Self {
            link,
            channel,
            events,
            sink: None,
            rollup: None,
            config,
            snapshots: AtomicU64::new(0),
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn SnapshotSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn with_rollup(mut self, rollup: Arc<dyn RollupHook>) -> Self {
        self.rollup = Some(rollup);
        self
    }

    pub fn snapshot_count(&self) -> u64 {
        self.snapshots.load(Ordering::Relaxed)
    }

    /// One collection cycle: reconnect if needed, then read and fan out a snapshot.
    pub async fn tick(&self) -> TickOutcome {
        if !self.link.state().is_connected() {
            counter!("ess_reconnect_attempts_total").increment(1);
            if let Err(err) = self.link.connect().await {
                warn!(device = %self.link.identity(), error = %err, "device unavailable, skipping collection");
                return TickOutcome::Unavailable;
            }
        }

        let snapshot = match self.read_pass().await {
            Ok(Some(snapshot)) => snapshot,
            Ok(None) => return TickOutcome::Unavailable,
            Err(err) => {
                counter!("ess_snapshot_failures_total").increment(1);
                warn!(device = %self.link.identity(), error = %err, "telemetry pass aborted");
                self.events
                    .record(
                        EventRecord::error("data_collection_error", "telemetry read failed")
                            .with_payload(json!({ "error": err.to_string() })),
                    )
                    .await;
                return TickOutcome::ReadFailed;
            }
        };

        self.fan_out(&snapshot).await;
        TickOutcome::Sampled(Box::new(snapshot))
    }

    /// Read every telemetry block under one session and decode them together.
    async fn read_pass(&self) -> Result<Option<TelemetrySnapshot>, CollectError> {
        let mut session = self.link.session().await;
        if !session.is_connected() {
            return Ok(None);
        }

        let mut samples: Vec<RegisterSample> = Vec::with_capacity(telemetry::BLOCKS.len());
        for block in telemetry::BLOCKS {
            samples.push(session.read_registers(block.address, block.count).await?);
        }
        drop(session);

        Ok(Some(decode_snapshot(&samples, Utc::now())?))
    }

    async fn fan_out(&self, snapshot: &TelemetrySnapshot) {
        let count = self.snapshots.fetch_add(1, Ordering::Relaxed) + 1;
        counter!("ess_snapshots_total").increment(1);

        let delivered = self.channel.publish_snapshot(snapshot, self.link.state());
        if let Some(sink) = &self.sink {
            if let Err(err) = sink.store(snapshot).await {
                warn!(error = %err, "snapshot persistence failed");
            }
        }

        if count % SNAPSHOT_LOG_EVERY == 0 {
            info!(
                count,
                soc = snapshot.battery.soc_percent,
                pv_w = snapshot.pv.power_w,
                grid_w = snapshot.grid.power_w,
                subscribers = delivered,
                "telemetry snapshot collected"
            );
        } else {
            debug!(count, subscribers = delivered, "telemetry snapshot collected");
        }
    }

    pub async fn rollup_tick(&self) {
        let Some(rollup) = &self.rollup else {
            return;
        };
        if let Err(err) = rollup.on_rollup_tick().await {
            warn!(error = %err, "rollup hook failed");
        }
    }

    /// Poll until `shutdown` flips to true. A tick in progress is abandoned on shutdown.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut rollup = interval_at(
            Instant::now() + self.config.rollup_interval,
            self.config.rollup_interval,
        );
        rollup.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut iteration = 0u64;

        loop {
            if *shutdown.borrow() {
                break;
            }

            let cycle_start = Instant::now();
            let outcome = tokio::select! {
                outcome = self.tick() => outcome,
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
            };

            iteration = iteration.wrapping_add(1);
            let elapsed = cycle_start.elapsed();
            let delay = jittered_delay(self.config.poll_interval, self.config.jitter_ms, iteration)
                .saturating_sub(elapsed);
            debug!(
                device = %self.link.identity(),
                elapsed_ms = elapsed.as_millis() as u64,
                delay_ms = delay.as_millis() as u64,
                sampled = matches!(outcome, TickOutcome::Sampled(_)),
                "collection cycle complete"
            );

            let next_poll = sleep(delay);
            tokio::pin!(next_poll);
            loop {
                tokio::select! {
                    _ = &mut next_poll => break,
                    _ = rollup.tick() => self.rollup_tick().await,
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        }

        info!(device = %self.link.identity(), "collector stopped");
    }

    /// Start the loop on its own task.
    pub fn spawn(self: Arc<Self>) -> CollectorHandle {
        let (shutdown, receiver) = watch::channel(false);
        let task = tokio::spawn(async move { self.run(receiver).await });
        CollectorHandle { shutdown, task }
    }
}

pub struct CollectorHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl CollectorHandle {
    /// Signal shutdown and wait for the loop to exit.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(err) = self.task.await {
            warn!(error = %err, "collector task ended abnormally");
        }
    }
}

fn jittered_delay(base: Duration, jitter_ms: u64, iteration: u64) -> Duration {
    if jitter_ms == 0 {
        return base;
    }

    let seed = unix_ms().wrapping_add(iteration.wrapping_mul(1_664_525));
    base + Duration::from_millis(seed % jitter_ms)
}

fn unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
