use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use device_link::{DeviceLink, LinkError};
use metrics::counter;
use register_codec::{decode_dispatch_status, dispatch, CodecError, DispatchStatus};
use serde::Serialize;
use serde_json::json;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, warn};
use types::{EventLog, EventRecord};

mod command;

pub use command::{
    CommandError, DispatchCommand, DispatchLimits, DispatchMode, DispatchStep, PowerTarget,
    MAX_DURATION,
};
pub use register_codec::dispatch::NEUTRAL_POWER;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("another dispatch command is in progress")]
    Busy,
    #[error("device link is not connected")]
    NotConnected,
    #[error("dispatch step '{step}' failed after {completed_steps}/{total_steps} steps: {source}")]
    WriteFailed {
        completed_steps: usize,
        total_steps: usize,
        step: &'static str,
        #[source]
        source: LinkError,
    },
    #[error(transparent)]
    Link(LinkError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("dispatch task ended abnormally: {0}")]
    Aborted(String),
}

impl From<LinkError> for DispatchError {
    fn from(err: LinkError) -> Self {
        match err {
            LinkError::NotConnected => Self::NotConnected,
            other => Self::Link(other),
        }
    }
}

impl DispatchError {
    /// HTTP-style status for callers that surface dispatch failures over an API.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Busy => 409,
            Self::NotConnected => 503,
            Self::Link(err) if err.is_unavailable() => 503,
            Self::Link(_) => 500,
            Self::WriteFailed { .. } => 502,
            Self::Codec(_) | Self::Aborted(_) => 500,
        }
    }
}

/// Origin of a dispatch command, recorded with its journal entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    Api,
    Schedule,
}

impl Trigger {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Api => "api",
            Self::Schedule => "schedule",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct DispatchOutcome {
    pub mode: DispatchMode,
    pub command: DispatchCommand,
}

struct ActiveDispatch {
    id: u64,
    mode: DispatchMode,
    timer: JoinHandle<()>,
}

/// Runs dispatch commands against the device, one at a time.
///
/// A command's register writes are issued under a single link session so no other
/// traffic can interleave with them. The sequence runs on its own task: once started it
/// completes or fails on its own, even if the caller stops waiting. A second command
/// arriving while one is in flight is rejected with [`DispatchError::Busy`] instead of queued.
pub struct DispatchController {
    in_flight: Arc<Mutex<()>>,
    sequencer: Arc<Sequencer>,
}

struct Sequencer {
    link: Arc<DeviceLink>,
    events: Arc<dyn EventLog>,
    journal: StdMutex<Option<ActiveDispatch>>,
    next_id: AtomicU64,
}

impl DispatchController {
    pub fn new(link: Arc<DeviceLink>, events: Arc<dyn EventLog>) -> Self {
        Self {
            in_flight: Arc::new(Mutex::new(())),
            sequencer: Arc::new(Sequencer {
                link,
                events,
                journal: StdMutex::new(None),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    pub async fn execute(&self, command: DispatchCommand) -> Result<DispatchOutcome, DispatchError> {
        self.execute_as(command, Trigger::Api).await
    }

    pub async fn execute_as(
        &self,
        command: DispatchCommand,
        trigger: Trigger,
    ) -> Result<DispatchOutcome, DispatchError> {
        let in_flight = Arc::clone(&self.in_flight).try_lock_owned().map_err(|_| {
            debug!(mode = command.mode().as_str(), "dispatch rejected, another command in flight");
            DispatchError::Busy
        })?;
        let plan = command.write_plan()?;

        let sequencer = Arc::clone(&self.sequencer);
        let task = tokio::spawn(async move {
            let _in_flight = in_flight;
            sequencer.apply(command, trigger, plan).await
        });
        task.await
            .map_err(|err| DispatchError::Aborted(err.to_string()))?
    }

    /// Mode of the dispatch that is still within its commanded duration, if any.
    pub fn current_dispatch(&self) -> Option<DispatchMode> {
        self.sequencer
            .journal
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|active| active.mode)
    }

    /// Read back the dispatch registers as currently staged on the device.
    pub async fn read_status(&self) -> Result<DispatchStatus, DispatchError> {
        let block = dispatch::STATUS_BLOCK;
        let sample = self
            .sequencer
            .link
            .read_registers(block.address, block.count)
            .await?;
        Ok(decode_dispatch_status(&sample)?)
    }
}

impl Sequencer {
    async fn apply(
        self: Arc<Self>,
        command: DispatchCommand,
        trigger: Trigger,
        plan: Vec<DispatchStep>,
    ) -> Result<DispatchOutcome, DispatchError> {
        let mode = command.mode();
        let total_steps = plan.len();

        let mut session = self.link.session().await;
        if !session.is_connected() {
            return Err(DispatchError::NotConnected);
        }

        for (completed_steps, step) in plan.iter().enumerate() {
            for &(address, value) in &step.writes {
                if let Err(source) = session.write_register(address, value).await {
                    drop(session);
                    return Err(self
                        .record_failure(command, completed_steps, total_steps, step.name, source)
                        .await);
                }
            }
            debug!(step = step.name, mode = mode.as_str(), "dispatch step written");
        }
        drop(session);

        counter!("ess_dispatch_total", "mode" => mode.as_str()).increment(1);
        info!(
            mode = mode.as_str(),
            trigger = trigger.as_str(),
            steps = total_steps,
            "dispatch command applied"
        );
        self.journal_applied(command, trigger).await;

        Ok(DispatchOutcome { mode, command })
    }

    async fn record_failure(
        &self,
        command: DispatchCommand,
        completed_steps: usize,
        total_steps: usize,
        step: &'static str,
        source: LinkError,
    ) -> DispatchError {
        let mode = command.mode();
        counter!("ess_dispatch_failures_total", "mode" => mode.as_str()).increment(1);
        warn!(
            mode = mode.as_str(),
            step,
            completed_steps,
            total_steps,
            error = %source,
            "dispatch sequence aborted"
        );
        self.events
            .record(
                EventRecord::error(
                    "dispatch_failed",
                    format!("{} dispatch failed at step '{step}'", mode.as_str()),
                )
                .with_payload(json!({
                    "mode": mode.as_str(),
                    "step": step,
                    "completed_steps": completed_steps,
                    "total_steps": total_steps,
                    "error": source.to_string(),
                })),
            )
            .await;

        DispatchError::WriteFailed {
            completed_steps,
            total_steps,
            step,
            source,
        }
    }

    async fn journal_applied(self: &Arc<Self>, command: DispatchCommand, trigger: Trigger) {
        let mode = command.mode();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let superseded = self.take_active();
        if let Some(previous) = &superseded {
            previous.timer.abort();
        }

        let Some(duration) = command.duration() else {
            let description = match superseded {
                Some(previous) => format!("stopped {} dispatch", previous.mode.as_str()),
                None => format!("{} mode applied", mode.as_str()),
            };
            self.events
                .record(
                    EventRecord::info("dispatch_stop", description).with_payload(json!({
                        "mode": mode.as_str(),
                        "triggered_by": trigger.as_str(),
                    })),
                )
                .await;
            return;
        };

        self.events
            .record(
                EventRecord::info(
                    "dispatch_start",
                    format!("{} dispatch started for {}s", mode.as_str(), duration.as_secs()),
                )
                .with_payload(json!({
                    "mode": mode.as_str(),
                    "command": command,
                    "triggered_by": trigger.as_str(),
                })),
            )
            .await;

        let timer = tokio::spawn(Arc::clone(self).end_timer(id, mode, duration));
        let mut journal = self.journal.lock().unwrap_or_else(PoisonError::into_inner);
        *journal = Some(ActiveDispatch { id, mode, timer });
    }

    fn take_active(&self) -> Option<ActiveDispatch> {
        self.journal
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    async fn end_timer(self: Arc<Self>, id: u64, mode: DispatchMode, duration: Duration) {
        sleep(duration).await;
        let ended = {
            let mut journal = self.journal.lock().unwrap_or_else(PoisonError::into_inner);
            match journal.as_ref() {
                Some(active) if active.id == id => journal.take(),
                _ => None,
            }
        };
        if ended.is_some() {
            info!(mode = mode.as_str(), "dispatch duration elapsed");
            self.events
                .record(
                    EventRecord::info(
                        "dispatch_end",
                        format!("{} dispatch ended after {}s", mode.as_str(), duration.as_secs()),
                    )
                    .with_payload(json!({ "mode": mode.as_str() })),
                )
                .await;
        }
    }
}
