use std::str::FromStr;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use chrono::{NaiveTime, Utc, Weekday};
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Row, SqlitePool};
use thiserror::Error;
use tracing::{debug, info, warn};
use types::{
    EventLog, EventRecord, RollupHook, ScheduleMode, ScheduleSource, ScheduledDispatch, SinkError,
    SnapshotSink, TelemetrySnapshot,
};

const DAY_MS: i64 = 24 * 60 * 60 * 1000;
const DEFAULT_SCHEDULE_DURATION_SECS: u32 = 3_600;

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub path: String,
    pub max_connections: u32,
    /// Snapshots older than this are pruned on every rollup tick.
    pub retention_days: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: "ess-bridge.sqlite".to_string(),
            max_connections: 5,
            retention_days: 7,
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlx error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("payload encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Parameters of a dispatch as recorded in `dispatch_history`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DispatchStart {
    pub mode: String,
    pub target_power_w: Option<i64>,
    pub target_soc: Option<f64>,
    pub planned_duration_secs: Option<i64>,
    pub triggered_by: String,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DispatchEntry {
    pub id: i64,
    pub mode: String,
    pub target_power_w: Option<i64>,
    pub triggered_by: String,
    pub started_ms: i64,
    pub ended_ms: Option<i64>,
}

/// SQLite persistence for snapshots, system events and dispatch history.
#[derive(Debug)]
pub struct SqliteStore {
    pool: SqlitePool,
    retention_days: u32,
    open_dispatch: Mutex<Option<i64>>,
}

impl SqliteStore {
    pub async fn open(config: &StoreConfig) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(&sqlite_url(&config.path))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal);
        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections.max(1))
            .connect_with(options)
            .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS energy_snapshots (\
                id INTEGER PRIMARY KEY AUTOINCREMENT,\
                captured_at INTEGER NOT NULL,\
                battery_soc REAL NOT NULL,\
                battery_voltage REAL NOT NULL,\
                battery_current REAL NOT NULL,\
                battery_power INTEGER NOT NULL,\
                battery_temperature REAL NOT NULL,\
                grid_power INTEGER NOT NULL,\
                grid_voltage_l1 REAL NOT NULL,\
                grid_voltage_l2 REAL NOT NULL,\
                grid_voltage_l3 REAL NOT NULL,\
                grid_current_l1 REAL NOT NULL,\
                grid_current_l2 REAL NOT NULL,\
                grid_current_l3 REAL NOT NULL,\
                grid_frequency REAL NOT NULL,\
                pv_power INTEGER NOT NULL,\
                pv_string1_power INTEGER NOT NULL,\
                pv_string2_power INTEGER NOT NULL,\
                pv_string3_power INTEGER NOT NULL,\
                pv_energy_today REAL NOT NULL,\
                load_power INTEGER NOT NULL,\
                inverter_power INTEGER NOT NULL\
            )",
        )
        .execute(&pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_snapshots_captured_at ON energy_snapshots(captured_at)",
        )
        .execute(&pool)
        .await?;
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS system_events (\
                id INTEGER PRIMARY KEY AUTOINCREMENT,\
                timestamp INTEGER NOT NULL,\
                event_type TEXT NOT NULL,\
                description TEXT NOT NULL,\
                severity TEXT NOT NULL,\
                data TEXT\
            )",
        )
        .execute(&pool)
        .await?;
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS dispatch_history (\
                id INTEGER PRIMARY KEY AUTOINCREMENT,\
                start_time INTEGER NOT NULL,\
                end_time INTEGER,\
                actual_duration INTEGER,\
                mode TEXT NOT NULL,\
                target_power INTEGER,\
                target_soc REAL,\
                planned_duration INTEGER,\
                triggered_by TEXT NOT NULL,\
                notes TEXT\
            )",
        )
        .execute(&pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS scheduled_dispatch (\
                id INTEGER PRIMARY KEY AUTOINCREMENT,\
                name TEXT NOT NULL,\
                enabled INTEGER NOT NULL DEFAULT 1,\
                mode TEXT NOT NULL,\
                start_time TEXT NOT NULL,\
                duration INTEGER,\
                target_power INTEGER NOT NULL,\
                target_soc REAL NOT NULL,\
                days_of_week TEXT NOT NULL\
            )",
        )
        .execute(&pool)
        .await?;

        info!(path = %config.path, "store initialized");

        Ok(Self {
            pool,
            retention_days: config.retention_days,
            open_dispatch: Mutex::new(None),
        })
    }

    pub async fn store_snapshot(&self, snapshot: &TelemetrySnapshot) -> Result<(), StoreError> {
        let grid = &snapshot.grid;
        let pv = &snapshot.pv;
        sqlx::query(
            "INSERT INTO energy_snapshots (\
                captured_at, battery_soc, battery_voltage, battery_current, battery_power,\
                battery_temperature, grid_power, grid_voltage_l1, grid_voltage_l2, grid_voltage_l3,\
                grid_current_l1, grid_current_l2, grid_current_l3, grid_frequency, pv_power,\
                pv_string1_power, pv_string2_power, pv_string3_power, pv_energy_today,\
                load_power, inverter_power\
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(snapshot.captured_at.timestamp_millis())
        .bind(snapshot.battery.soc_percent)
        .bind(snapshot.battery.voltage_v)
        .bind(snapshot.battery.current_a)
        .bind(snapshot.battery.power_w)
        .bind(snapshot.battery.temperature_c)
        .bind(grid.power_w)
        .bind(grid.voltage_v[0])
        .bind(grid.voltage_v[1])
        .bind(grid.voltage_v[2])
        .bind(grid.current_a[0])
        .bind(grid.current_a[1])
        .bind(grid.current_a[2])
        .bind(grid.frequency_hz)
        .bind(pv.power_w)
        .bind(i64::from(pv.string_power_w[0]))
        .bind(i64::from(pv.string_power_w[1]))
        .bind(i64::from(pv.string_power_w[2]))
        .bind(pv.energy_today_kwh)
        .bind(snapshot.load.power_w)
        .bind(snapshot.load.inverter_power_w)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn log_event(&self, event: &EventRecord) -> Result<(), StoreError> {
        let data = event
            .payload
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        sqlx::query(
            "INSERT INTO system_events (timestamp, event_type, description, severity, data) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(event.timestamp.timestamp_millis())
        .bind(&event.event_type)
        .bind(&event.description)
        .bind(event.severity.as_str())
        .bind(data)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Insert an open dispatch row and return its id.
    pub async fn log_dispatch_start(&self, start: &DispatchStart) -> Result<i64, StoreError> {
        let result = sqlx::query(
            "INSERT INTO dispatch_history \
             (start_time, mode, target_power, target_soc, planned_duration, triggered_by, notes) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(unix_ms())
        .bind(&start.mode)
        .bind(start.target_power_w)
        .bind(start.target_soc)
        .bind(start.planned_duration_secs)
        .bind(&start.triggered_by)
        .bind(&start.notes)
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    /// Close a dispatch row. Rows that are already closed are left untouched.
    pub async fn log_dispatch_end(&self, id: i64) -> Result<bool, StoreError> {
        let now = unix_ms();
        let result = sqlx::query(
            "UPDATE dispatch_history \
             SET end_time = ?, actual_duration = (? - start_time) / 1000 \
             WHERE id = ? AND end_time IS NULL",
        )
        .bind(now)
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    pub async fn recent_dispatches(&self, limit: i64) -> Result<Vec<DispatchEntry>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, mode, target_power, triggered_by, start_time, end_time \
             FROM dispatch_history ORDER BY id DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| DispatchEntry {
                id: row.get::<i64, _>("id"),
                mode: row.get::<String, _>("mode"),
                target_power_w: row.get::<Option<i64>, _>("target_power"),
                triggered_by: row.get::<String, _>("triggered_by"),
                started_ms: row.get::<i64, _>("start_time"),
                ended_ms: row.get::<Option<i64>, _>("end_time"),
            })
            .collect())
    }

    /// Insert a recurring dispatch and return its id. The `id` of `schedule` is ignored.
    pub async fn add_schedule(
        &self,
        schedule: &ScheduledDispatch,
        enabled: bool,
    ) -> Result<i64, StoreError> {
        let days = schedule
            .days
            .iter()
            .map(|day| weekday_code(*day))
            .collect::<Vec<_>>()
            .join(",");
        let result = sqlx::query(
            "INSERT INTO scheduled_dispatch \
             (name, enabled, mode, start_time, duration, target_power, target_soc, days_of_week) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&schedule.name)
        .bind(enabled)
        .bind(schedule.mode.as_str())
        .bind(schedule.start_time.format("%H:%M:%S").to_string())
        .bind(i64::from(schedule.duration_secs))
        .bind(i64::from(schedule.target_power_w))
        .bind(schedule.target_soc)
        .bind(days)
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    pub async fn set_schedule_enabled(&self, id: i64, enabled: bool) -> Result<bool, StoreError> {
        let result = sqlx::query("UPDATE scheduled_dispatch SET enabled = ? WHERE id = ?")
            .bind(enabled)
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Enabled schedules in id order. Rows that cannot be interpreted are skipped with a warning.
    pub async fn load_enabled_schedules(&self) -> Result<Vec<ScheduledDispatch>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, name, mode, start_time, duration, target_power, target_soc, days_of_week \
             FROM scheduled_dispatch WHERE enabled = 1 ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut schedules = Vec::with_capacity(rows.len());
        for row in rows {
            let id = row.get::<i64, _>("id");
            let name = row.get::<String, _>("name");
            let mode = row.get::<String, _>("mode");
            let start_time = row.get::<String, _>("start_time");
            let Some(mode) = ScheduleMode::parse(&mode) else {
                warn!(id, %name, %mode, "skipping schedule with unknown mode");
                continue;
            };
            let Some(start_time) = parse_start_time(&start_time) else {
                warn!(id, %name, %start_time, "skipping schedule with invalid start time");
                continue;
            };
            let (Ok(target_power_w), Ok(duration_secs)) = (
                u32::try_from(row.get::<i64, _>("target_power")),
                u32::try_from(row.get::<Option<i64>, _>("duration").unwrap_or(0)),
            ) else {
                warn!(id, %name, "skipping schedule with out of range power or duration");
                continue;
            };

            schedules.push(ScheduledDispatch {
                id,
                name,
                mode,
                start_time,
                duration_secs: if duration_secs == 0 {
                    DEFAULT_SCHEDULE_DURATION_SECS
                } else {
                    duration_secs
                },
                target_power_w,
                target_soc: row.get::<f64, _>("target_soc"),
                days: parse_days(&row.get::<String, _>("days_of_week")),
            });
        }

        Ok(schedules)
    }

    /// Delete snapshots captured more than `days` days ago; returns the number removed.
    pub async fn cleanup_old_snapshots(&self, days: u32) -> Result<u64, StoreError> {
        let cutoff = unix_ms() - i64::from(days) * DAY_MS;
        let result = sqlx::query("DELETE FROM energy_snapshots WHERE captured_at < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    pub async fn snapshot_count(&self) -> Result<i64, StoreError> {
        let row = sqlx::query("SELECT COUNT(*) AS count FROM energy_snapshots")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get::<i64, _>("count"))
    }

    pub async fn event_count(&self) -> Result<i64, StoreError> {
        let row = sqlx::query("SELECT COUNT(*) AS count FROM system_events")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get::<i64, _>("count"))
    }

    async fn track_dispatch(&self, event: &EventRecord) -> Result<(), StoreError> {
        match event.event_type.as_str() {
            "dispatch_start" => {
                self.close_open_dispatch().await?;
                let start = dispatch_start_from(event.payload.as_ref());
                let id = self.log_dispatch_start(&start).await?;
                *self
                    .open_dispatch
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner) = Some(id);
                debug!(id, mode = %start.mode, "dispatch history opened");
            }
            "dispatch_end" | "dispatch_stop" => self.close_open_dispatch().await?,
            _ => {}
        }
        Ok(())
    }

    async fn close_open_dispatch(&self) -> Result<(), StoreError> {
        let open = self
            .open_dispatch
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(id) = open {
            self.log_dispatch_end(id).await?;
            debug!(id, "dispatch history closed");
        }
        Ok(())
    }
}

fn dispatch_start_from(payload: Option<&Value>) -> DispatchStart {
    let command = payload.and_then(|payload| payload.get("command"));
    let field = |name: &str| command.and_then(|command| command.get(name));
    DispatchStart {
        mode: payload
            .and_then(|payload| payload.get("mode"))
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string(),
        target_power_w: field("watts").and_then(Value::as_i64),
        target_soc: field("soc_percent").and_then(Value::as_f64),
        planned_duration_secs: field("duration_secs").and_then(Value::as_i64),
        triggered_by: payload
            .and_then(|payload| payload.get("triggered_by"))
            .and_then(Value::as_str)
            .unwrap_or("api")
            .to_string(),
        notes: None,
    }
}

#[async_trait]
impl SnapshotSink for SqliteStore {
    async fn store(&self, snapshot: &TelemetrySnapshot) -> Result<(), SinkError> {
        self.store_snapshot(snapshot)
            .await
            .map_err(|err| SinkError::new(err.to_string()))
    }
}

#[async_trait]
impl EventLog for SqliteStore {
    async fn record(&self, event: EventRecord) {
        if let Err(err) = self.log_event(&event).await {
            warn!(event_type = %event.event_type, error = %err, "event logging failed");
        }
        if let Err(err) = self.track_dispatch(&event).await {
            warn!(event_type = %event.event_type, error = %err, "dispatch history update failed");
        }
    }
}

#[async_trait]
impl ScheduleSource for SqliteStore {
    async fn enabled_schedules(&self) -> Result<Vec<ScheduledDispatch>, SinkError> {
        self.load_enabled_schedules()
            .await
            .map_err(|err| SinkError::new(err.to_string()))
    }
}

#[async_trait]
impl RollupHook for SqliteStore {
    async fn on_rollup_tick(&self) -> Result<(), SinkError> {
        let removed = self
            .cleanup_old_snapshots(self.retention_days)
            .await
            .map_err(|err| SinkError::new(err.to_string()))?;
        if removed > 0 {
            info!(removed, retention_days = self.retention_days, "pruned old snapshots");
        }
        Ok(())
    }
}

fn parse_start_time(value: &str) -> Option<NaiveTime> {
    NaiveTime::parse_from_str(value, "%H:%M:%S")
        .or_else(|_| NaiveTime::parse_from_str(value, "%H:%M"))
        .ok()
}

fn parse_days(value: &str) -> Vec<Weekday> {
    value
        .split(',')
        .filter_map(|day| day.trim().parse::<Weekday>().ok())
        .collect()
}

fn weekday_code(day: Weekday) -> &'static str {
    match day {
        Weekday::Mon => "mon",
        Weekday::Tue => "tue",
        Weekday::Wed => "wed",
        Weekday::Thu => "thu",
        Weekday::Fri => "fri",
        Weekday::Sat => "sat",
        Weekday::Sun => "sun",
    }
}

fn sqlite_url(path: &str) -> String {
    if path.starts_with("sqlite:") {
        path.to_string()
    } else {
        format!("sqlite://{path}")
    }
}

fn unix_ms() -> i64 {
    Utc::now().timestamp_millis()
}
