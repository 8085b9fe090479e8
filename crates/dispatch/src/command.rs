use std::time::Duration;

use register_codec::{
    dispatch, encode32, encode_charge_power, encode_discharge_power, soc_to_register, CodecError,
};
use serde::Serialize;
use thiserror::Error;

pub const MAX_DURATION: Duration = Duration::from_secs(24 * 60 * 60);

const PREVENT_DISCHARGE_SOC: f64 = 100.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchLimits {
    /// Largest charge or discharge power accepted, in watts.
    pub max_power_w: u32,
}

impl Default for DispatchLimits {
    fn default() -> Self {
        Self { max_power_w: 5_000 }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum CommandError {
    #[error("power {watts}W outside 0..={max}W")]
    Power { watts: u32, max: u32 },
    #[error("soc {0}% outside 0..=100")]
    Soc(f64),
    #[error("duration {0:?} outside (0s, 24h]")]
    Duration(Duration),
    #[error("power limit {0}W exceeds the {neutral}W neutral baseline", neutral = dispatch::NEUTRAL_POWER)]
    Limit(u32),
}

/// Validated power, SOC bound and duration of a forced charge or discharge.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PowerTarget {
    watts: u32,
    soc_percent: f64,
    duration_secs: u32,
}

impl PowerTarget {
    fn new(
        watts: u32,
        soc_percent: f64,
        duration: Duration,
        limits: DispatchLimits,
    ) -> Result<Self, CommandError> {
        if limits.max_power_w > dispatch::NEUTRAL_POWER {
            return Err(CommandError::Limit(limits.max_power_w));
        }
        if watts > limits.max_power_w {
            return Err(CommandError::Power {
                watts,
                max: limits.max_power_w,
            });
        }
        if !soc_percent.is_finite() || !(0.0..=100.0).contains(&soc_percent) {
            return Err(CommandError::Soc(soc_percent));
        }
        if duration.as_secs() == 0 || duration > MAX_DURATION {
            return Err(CommandError::Duration(duration));
        }

        Ok(Self {
            watts,
            soc_percent,
            duration_secs: duration.as_secs() as u32,
        })
    }

    pub fn watts(&self) -> u32 {
        self.watts
    }

    pub fn soc_percent(&self) -> f64 {
        self.soc_percent
    }

    pub fn duration(&self) -> Duration {
        Duration::from_secs(u64::from(self.duration_secs))
    }
}

/// An instruction for the device's power flow. Only the constructors below create one.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum DispatchCommand {
    Stop,
    Normal,
    PreventDischarge,
    ForceCharge(PowerTarget),
    ForceDischarge(PowerTarget),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchMode {
    Stopped,
    Normal,
    #[serde(rename = "grid_discharge_prevented")]
    DischargePrevented,
    Charging,
    Discharging,
}

impl DispatchMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::Normal => "normal",
            Self::DischargePrevented => "grid_discharge_prevented",
            Self::Charging => "charging",
            Self::Discharging => "discharging",
        }
    }
}

/// One logical step of a dispatch sequence; its writes are issued in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchStep {
    pub name: &'static str,
    pub writes: Vec<(u16, u16)>,
}

impl DispatchCommand {
    pub fn stop() -> Self {
        Self::Stop
    }

    pub fn normal() -> Self {
        Self::Normal
    }

    pub fn prevent_discharge() -> Self {
        Self::PreventDischarge
    }

    pub fn force_charge(
        watts: u32,
        target_soc: f64,
        duration: Duration,
        limits: DispatchLimits,
    ) -> Result<Self, CommandError> {
        PowerTarget::new(watts, target_soc, duration, limits).map(Self::ForceCharge)
    }

    pub fn force_discharge(
        watts: u32,
        minimum_soc: f64,
        duration: Duration,
        limits: DispatchLimits,
    ) -> Result<Self, CommandError> {
        PowerTarget::new(watts, minimum_soc, duration, limits).map(Self::ForceDischarge)
    }

    pub fn mode(&self) -> DispatchMode {
        match self {
            Self::Stop => DispatchMode::Stopped,
            Self::Normal => DispatchMode::Normal,
            Self::PreventDischarge => DispatchMode::DischargePrevented,
            Self::ForceCharge(_) => DispatchMode::Charging,
            Self::ForceDischarge(_) => DispatchMode::Discharging,
        }
    }

    /// How long the device stays in the commanded mode, if the command stages one.
    pub fn duration(&self) -> Option<Duration> {
        match self {
            Self::Stop | Self::Normal => None,
            Self::PreventDischarge => Some(MAX_DURATION),
            Self::ForceCharge(target) | Self::ForceDischarge(target) => Some(target.duration()),
        }
    }

    /// Register writes in the order the device requires: enable, power, SOC bound,
    /// duration, and the mode register strictly last.
    pub fn write_plan(&self) -> Result<Vec<DispatchStep>, CodecError> {
        let (power, soc_percent, duration_secs) = match self {
            Self::Stop | Self::Normal => {
                return Ok(vec![DispatchStep {
                    name: "disable",
                    writes: vec![(dispatch::ENABLE, 0)],
                }]);
            }
            Self::PreventDischarge => (
                encode_discharge_power(0)?,
                PREVENT_DISCHARGE_SOC,
                MAX_DURATION.as_secs() as u32,
            ),
            Self::ForceCharge(target) => (
                encode_charge_power(target.watts)?,
                target.soc_percent,
                target.duration_secs,
            ),
            Self::ForceDischarge(target) => (
                encode_discharge_power(target.watts)?,
                target.soc_percent,
                target.duration_secs,
            ),
        };

        let (power_lo, power_hi) = encode32(i64::from(power));
        let (duration_lo, duration_hi) = encode32(i64::from(duration_secs));

        Ok(vec![
            DispatchStep {
                name: "enable",
                writes: vec![(dispatch::ENABLE, 1)],
            },
            DispatchStep {
                name: "power",
                writes: vec![(dispatch::POWER, power_lo), (dispatch::POWER + 1, power_hi)],
            },
            DispatchStep {
                name: "soc_bound",
                writes: vec![(dispatch::SOC_BOUND, soc_to_register(soc_percent))],
            },
            DispatchStep {
                name: "duration",
                writes: vec![
                    (dispatch::DURATION, duration_lo),
                    (dispatch::DURATION + 1, duration_hi),
                ],
            },
            DispatchStep {
                name: "mode",
                writes: vec![(dispatch::MODE, dispatch::MODE_SOC_CONTROL)],
            },
        ])
    }
}
