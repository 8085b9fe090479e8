use std::fmt;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Datelike, NaiveDateTime, NaiveTime, Timelike, Utc, Weekday};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Network identity of the inverter endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    pub host: String,
    pub port: u16,
    pub unit_id: u8,
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}#{}", self.host, self.port, self.unit_id)
    }
}

/// Connection lifecycle of the device link. Only the link itself moves between states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

impl ConnectionState {
    pub fn is_connected(self) -> bool {
        matches!(self, Self::Connected)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionChanged {
    pub from: ConnectionState,
    pub to: ConnectionState,
    pub at: DateTime<Utc>,
}

impl ConnectionChanged {
    pub fn new(from: ConnectionState, to: ConnectionState) -> Self {
        Self {
            from,
            to,
            at: Utc::now(),
        }
    }
}

/// Raw words read from one contiguous register range during a single poll cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterSample {
    pub address: u16,
    pub words: Vec<u16>,
    pub captured_at: DateTime<Utc>,
}

impl RegisterSample {
    pub fn new(address: u16, words: Vec<u16>) -> Self {
        Self {
            address,
            words,
            captured_at: Utc::now(),
        }
    }

    /// One past the last address covered by this sample.
    pub fn end(&self) -> u32 {
        u32::from(self.address) + self.words.len() as u32
    }

    pub fn covers(&self, address: u16, width: u16) -> bool {
        u32::from(address) >= u32::from(self.address)
            && u32::from(address) + u32::from(width) <= self.end()
    }

    pub fn word(&self, address: u16) -> Option<u16> {
        self.slice(address, 1).map(|words| words[0])
    }

    /// Words for `width` registers starting at `address`, if fully covered.
    pub fn slice(&self, address: u16, width: u16) -> Option<&[u16]> {
        if !self.covers(address, width) {
            return None;
        }
        let start = usize::from(address - self.address);
        self.words.get(start..start + usize::from(width))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatteryTelemetry {
    pub soc_percent: f64,
    pub voltage_v: f64,
    pub current_a: f64,
    pub power_w: i64,
    pub temperature_c: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridTelemetry {
    pub power_w: i64,
    pub voltage_v: [f64; 3],
    pub current_a: [f64; 3],
    pub frequency_hz: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PvTelemetry {
    pub power_w: i64,
    pub string_power_w: [u32; 3],
    pub energy_today_kwh: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadTelemetry {
    pub power_w: i64,
    pub inverter_power_w: i64,
}

/// Fully decoded telemetry from one poll pass. Never constructed from a partial read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySnapshot {
    pub captured_at: DateTime<Utc>,
    pub battery: BatteryTelemetry,
    pub grid: GridTelemetry,
    pub pv: PvTelemetry,
    pub load: LoadTelemetry,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
        }
    }
}

/// Structured record handed to the event log collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub event_type: String,
    pub description: String,
    pub severity: Severity,
    pub timestamp: DateTime<Utc>,
    pub payload: Option<serde_json::Value>,
}

impl EventRecord {
    pub fn new(
        event_type: impl Into<String>,
        description: impl Into<String>,
        severity: Severity,
    ) -> Self {
        Self {
            event_type: event_type.into(),
            description: description.into(),
            severity,
            timestamp: Utc::now(),
            payload: None,
        }
    }

    pub fn info(event_type: impl Into<String>, description: impl Into<String>) -> Self {
        Self::new(event_type, description, Severity::Info)
    }

    pub fn warning(event_type: impl Into<String>, description: impl Into<String>) -> Self {
        Self::new(event_type, description, Severity::Warning)
    }

    pub fn error(event_type: impl Into<String>, description: impl Into<String>) -> Self {
        Self::new(event_type, description, Severity::Error)
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = Some(payload);
        self
    }
}

#[derive(Debug, Error)]
#[error("{0}")]
pub struct SinkError(pub String);

impl SinkError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Persistence collaborator receiving every decoded snapshot.
#[async_trait]
pub trait SnapshotSink: Send + Sync {
    async fn store(&self, snapshot: &TelemetrySnapshot) -> Result<(), SinkError>;
}

/// Event log collaborator. Recording is best effort and never fails the caller.
#[async_trait]
pub trait EventLog: Send + Sync {
    async fn record(&self, event: EventRecord);
}

/// Invoked on the low-frequency rollup timer.
#[async_trait]
pub trait RollupHook: Send + Sync {
    async fn on_rollup_tick(&self) -> Result<(), SinkError>;
}

/// Direction of a recurring dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleMode {
    ChargeFromGrid,
    DischargeToGrid,
}

impl ScheduleMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ChargeFromGrid => "charge_from_grid",
            Self::DischargeToGrid => "discharge_to_grid",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "charge_from_grid" => Some(Self::ChargeFromGrid),
            "discharge_to_grid" => Some(Self::DischargeToGrid),
            _ => None,
        }
    }
}

/// A forced dispatch started at a local wall-clock minute on selected weekdays.
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduledDispatch {
    pub id: i64,
    pub name: String,
    pub mode: ScheduleMode,
    pub start_time: NaiveTime,
    pub duration_secs: u32,
    pub target_power_w: u32,
    pub target_soc: f64,
    pub days: Vec<Weekday>,
}

impl ScheduledDispatch {
    /// Whether `now` lies in the start minute on one of the selected days. Seconds are ignored.
    pub fn is_due(&self, now: NaiveDateTime) -> bool {
        self.days.contains(&now.weekday())
            && now.hour() == self.start_time.hour()
            && now.minute() == self.start_time.minute()
    }
}

/// Supplies the currently enabled schedules.
#[async_trait]
pub trait ScheduleSource: Send + Sync {
    async fn enabled_schedules(&self) -> Result<Vec<ScheduledDispatch>, SinkError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NullEventLog;

#[async_trait]
impl EventLog for NullEventLog {
    async fn record(&self, _event: EventRecord) {}
}

/// Keeps records in memory; used where no durable log is configured and in tests.
#[derive(Debug, Default)]
pub struct MemoryEventLog {
    events: Mutex<Vec<EventRecord>>,
}

impl MemoryEventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<EventRecord> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn event_types(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .map(|event| event.event_type)
            .collect()
    }
}

#[async_trait]
impl EventLog for MemoryEventLog {
    async fn record(&self, event: EventRecord) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }
}
