use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{Local, NaiveDate, NaiveDateTime, Timelike};
use dispatch::{
    CommandError, DispatchCommand, DispatchController, DispatchError, DispatchLimits, DispatchMode,
    Trigger,
};
use metrics::counter;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};
use types::{ScheduleMode, ScheduleSource, ScheduledDispatch};

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// How often the schedule table is reloaded and matched against the local clock.
    /// Must stay below one minute so no start minute is skipped.
    pub check_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error("scheduled command rejected: {0}")]
    Command(#[from] CommandError),
    #[error("scheduled dispatch failed: {0}")]
    Dispatch(#[from] DispatchError),
}

/// Result of one schedule that came due during a check.
#[derive(Debug)]
pub struct Fired {
    pub id: i64,
    pub name: String,
    pub result: Result<DispatchMode, ScheduleError>,
}

type Clock = Arc<dyn Fn() -> NaiveDateTime + Send + Sync>;
type MinuteKey = (NaiveDate, u32, u32);

/// Starts forced charge or discharge dispatches from recurring schedules.
pub struct DispatchScheduler {
    dispatch: Arc<DispatchController>,
    source: Arc<dyn ScheduleSource>,
    limits: DispatchLimits,
    config: SchedulerConfig,
    clock: Clock,
    schedules: Mutex<Vec<ScheduledDispatch>>,
    fired: Mutex<HashMap<i64, MinuteKey>>,
}

impl DispatchScheduler {
    pub fn new(
        dispatch: Arc<DispatchController>,
        source: Arc<dyn ScheduleSource>,
        limits: DispatchLimits,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            dispatch,
            source,
            limits,
            config,
            clock: Arc::new(|| Local::now().naive_local()),
            schedules: Mutex::new(Vec::new()),
            fired: Mutex::new(HashMap::new()),
        }
    }

    /// Replace the local wall clock used by `run`.
    pub fn with_clock(mut self, clock: impl Fn() -> NaiveDateTime + Send + Sync + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Reload the enabled schedules. On failure the previous list stays in effect.
    pub async fn reload(&self) -> usize {
        match self.source.enabled_schedules().await {
            Ok(schedules) => {
                let count = schedules.len();
                *self
                    .schedules
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner) = schedules;
                debug!(count, "schedules loaded");
                count
            }
            Err(err) => {
                warn!(error = %err, "schedule reload failed, keeping previous schedules");
                self.schedules
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .len()
            }
        }
    }

    /// Reload, then start every schedule due at `now`. Each schedule fires at most once per minute.
    pub async fn check_at(&self, now: NaiveDateTime) -> Vec<Fired> {
        self.reload().await;

        let minute = (now.date(), now.hour(), now.minute());
        let due: Vec<ScheduledDispatch> = {
            let schedules = self
                .schedules
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            let mut fired = self.fired.lock().unwrap_or_else(PoisonError::into_inner);
            schedules
                .iter()
                .filter(|schedule| schedule.is_due(now))
                .filter(|schedule| fired.insert(schedule.id, minute) != Some(minute))
                .cloned()
                .collect()
        };

        let mut results = Vec::with_capacity(due.len());
        for schedule in due {
            info!(
                id = schedule.id,
                name = %schedule.name,
                mode = schedule.mode.as_str(),
                "schedule due"
            );
            let result = self.start(&schedule).await;
            match &result {
                Ok(mode) => {
                    counter!("ess_scheduled_dispatch_total", "outcome" => "applied").increment(1);
                    info!(
                        id = schedule.id,
                        name = %schedule.name,
                        mode = mode.as_str(),
                        "scheduled dispatch applied"
                    );
                }
                Err(err) => {
                    counter!("ess_scheduled_dispatch_total", "outcome" => "failed").increment(1);
                    warn!(
                        id = schedule.id,
                        name = %schedule.name,
                        error = %err,
                        "scheduled dispatch failed"
                    );
                }
            }
            results.push(Fired {
                id: schedule.id,
                name: schedule.name,
                result,
            });
        }
        results
    }

    async fn start(&self, schedule: &ScheduledDispatch) -> Result<DispatchMode, ScheduleError> {
        let duration = Duration::from_secs(u64::from(schedule.duration_secs));
        let command = match schedule.mode {
            ScheduleMode::ChargeFromGrid => DispatchCommand::force_charge(
                schedule.target_power_w,
                schedule.target_soc,
                duration,
                self.limits,
            )?,
            ScheduleMode::DischargeToGrid => DispatchCommand::force_discharge(
                schedule.target_power_w,
                schedule.target_soc,
                duration,
                self.limits,
            )?,
        };
        let outcome = self.dispatch.execute_as(command, Trigger::Schedule).await?;
        Ok(outcome.mode)
    }

    /// Check on every interval tick until `shutdown` flips to true.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(self.config.check_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            check_interval_ms = self.config.check_interval.as_millis() as u64,
            "scheduler started"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = ticker.tick() => {
                    let now = (self.clock)();
                    self.check_at(now).await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        info!("scheduler stopped");
    }

    pub fn spawn(self: Arc<Self>) -> SchedulerHandle {
        let (shutdown, receiver) = watch::channel(false);
        let task = tokio::spawn(async move { self.run(receiver).await });
        SchedulerHandle { shutdown, task }
    }
}

pub struct SchedulerHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SchedulerHandle {
    /// Signal shutdown and wait for the loop to exit.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(err) = self.task.await {
            warn!(error = %err, "scheduler task ended abnormally");
        }
    }
}
