use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use types::{ConnectionState, DeviceIdentity, TelemetrySnapshot};

/// Frames pushed to realtime subscribers, serialized as JSON tagged by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RealtimeEvent {
    ConnectionStatus {
        connected: bool,
        state: ConnectionState,
        timestamp: DateTime<Utc>,
    },
    PowerUpdate {
        data: Box<TelemetrySnapshot>,
        timestamp: DateTime<Utc>,
    },
    ModbusConnected {
        message: String,
        timestamp: DateTime<Utc>,
    },
    ModbusDisconnected {
        message: String,
        timestamp: DateTime<Utc>,
    },
    Pong {
        timestamp: DateTime<Utc>,
    },
}

impl RealtimeEvent {
    pub fn connection_status(state: ConnectionState) -> Self {
        Self::ConnectionStatus {
            connected: state.is_connected(),
            state,
            timestamp: Utc::now(),
        }
    }

    pub fn power_update(snapshot: TelemetrySnapshot) -> Self {
        Self::PowerUpdate {
            data: Box::new(snapshot),
            timestamp: Utc::now(),
        }
    }

    pub fn modbus_connected(device: &DeviceIdentity) -> Self {
        Self::ModbusConnected {
            message: format!("device {device} connection restored"),
            timestamp: Utc::now(),
        }
    }

    pub fn modbus_disconnected(device: &DeviceIdentity) -> Self {
        Self::ModbusDisconnected {
            message: format!("device {device} connection lost"),
            timestamp: Utc::now(),
        }
    }

    pub fn pong() -> Self {
        Self::Pong {
            timestamp: Utc::now(),
        }
    }

    /// Wire name of the frame, matching its `type` tag.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ConnectionStatus { .. } => "connection_status",
            Self::PowerUpdate { .. } => "power_update",
            Self::ModbusConnected { .. } => "modbus_connected",
            Self::ModbusDisconnected { .. } => "modbus_disconnected",
            Self::Pong { .. } => "pong",
        }
    }

    pub fn is_power_update(&self) -> bool {
        matches!(self, Self::PowerUpdate { .. })
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
