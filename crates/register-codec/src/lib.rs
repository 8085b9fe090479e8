use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;
use types::{
    BatteryTelemetry, GridTelemetry, LoadTelemetry, PvTelemetry, RegisterSample, TelemetrySnapshot,
};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("expected {expected} register words, got {actual}")]
    Length { expected: usize, actual: usize },
    #[error("register 0x{0:04X} not present in sample set")]
    MissingRegister(u16),
    #[error("value {value} does not fit register encoding")]
    OutOfRange { value: i64 },
}

/// Interpret a single register as a signed 16-bit value.
pub fn decode16_signed(word: u16) -> i16 {
    word as i16
}

/// Compose `(hi << 16) | lo` and reinterpret values above `0x7FFF_FFFF` as negative.
pub fn decode32_signed(hi: u16, lo: u16) -> i32 {
    let value = i64::from(decode32_unsigned(hi, lo));
    let value = if value > 0x7FFF_FFFF {
        value - 0x1_0000_0000
    } else {
        value
    };
    value as i32
}

pub fn decode32_unsigned(hi: u16, lo: u16) -> u32 {
    (u32::from(hi) << 16) | u32::from(lo)
}

/// Split a 32-bit value into `(lo, hi)` words, each masked to 16 bits.
pub fn encode32(value: i64) -> (u16, u16) {
    let lo = (value & 0xFFFF) as u16;
    let hi = ((value >> 16) & 0xFFFF) as u16;
    (lo, hi)
}

pub fn decode32_signed_words(words: &[u16]) -> Result<i32, CodecError> {
    match words {
        [hi, lo] => Ok(decode32_signed(*hi, *lo)),
        _ => Err(CodecError::Length {
            expected: 2,
            actual: words.len(),
        }),
    }
}

pub fn decode32_unsigned_words(words: &[u16]) -> Result<u32, CodecError> {
    match words {
        [hi, lo] => Ok(decode32_unsigned(*hi, *lo)),
        _ => Err(CodecError::Length {
            expected: 2,
            actual: words.len(),
        }),
    }
}

/// Fixed-point factor applied to a raw register integer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Scale(f64);

impl Scale {
    pub const UNIT: Scale = Scale(1.0);
    pub const VOLTAGE: Scale = Scale(0.1);
    pub const CURRENT: Scale = Scale(0.01);
    pub const BATTERY_CURRENT: Scale = Scale(0.1);
    pub const FREQUENCY: Scale = Scale(0.01);
    pub const SOC: Scale = Scale(0.4);
    pub const TEMPERATURE: Scale = Scale(0.1);
    pub const ENERGY: Scale = Scale(0.01);

    pub const fn factor(self) -> f64 {
        self.0
    }

    /// Smallest representable step; round trips are exact to within half of this.
    pub const fn resolution(self) -> f64 {
        self.0
    }

    pub fn decode(self, raw: i64) -> f64 {
        raw as f64 * self.0
    }

    pub fn encode(self, value: f64) -> i64 {
        (value / self.0).round() as i64
    }
}

pub fn soc_to_register(percent: f64) -> u16 {
    Scale::SOC.encode(percent).clamp(0, i64::from(u16::MAX)) as u16
}

pub fn register_to_soc(word: u16) -> f64 {
    Scale::SOC.decode(i64::from(word))
}

/// A contiguous register range read in one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterBlock {
    pub address: u16,
    pub count: u16,
}

pub mod telemetry {
    //! Holding-register addresses of the live telemetry fields.

    use super::RegisterBlock;

    pub const BATTERY_VOLTAGE: u16 = 0x0100;
    pub const BATTERY_CURRENT: u16 = 0x0101;
    pub const BATTERY_SOC: u16 = 0x0102;
    pub const BATTERY_TEMPERATURE: u16 = 0x0103;

    pub const INVERTER_POWER: u16 = 0x041A;
    pub const BATTERY_POWER: u16 = 0x041B;
    pub const PV_STRING_POWER: [u16; 3] = [0x041F, 0x0423, 0x0427];

    pub const GRID_VOLTAGE: [u16; 3] = [0x0470, 0x0472, 0x0474];
    pub const GRID_CURRENT: [u16; 3] = [0x0476, 0x0478, 0x047A];
    pub const GRID_POWER: u16 = 0x0484;
    pub const PV_ENERGY_TODAY: u16 = 0x0488;
    pub const PV_POWER: u16 = 0x048A;
    pub const LOAD_POWER: u16 = 0x0492;
    pub const GRID_FREQUENCY: u16 = 0x049C;

    /// Blocks read by one collection pass; together they cover every field above.
    pub const BLOCKS: [RegisterBlock; 3] = [
        RegisterBlock {
            address: 0x0100,
            count: 4,
        },
        RegisterBlock {
            address: 0x041A,
            count: 15,
        },
        RegisterBlock {
            address: 0x0470,
            count: 45,
        },
    ];
}

pub mod dispatch {
    //! Dispatch staging registers. The mode register must be written last.

    use super::RegisterBlock;

    pub const ENABLE: u16 = 0x0880;
    pub const POWER: u16 = 0x0881;
    pub const MODE: u16 = 0x0885;
    pub const SOC_BOUND: u16 = 0x0886;
    pub const DURATION: u16 = 0x0887;

    pub const NEUTRAL_POWER: u32 = 32_000;
    pub const MODE_SOC_CONTROL: u16 = 2;

    pub const STATUS_BLOCK: RegisterBlock = RegisterBlock {
        address: ENABLE,
        count: 9,
    };
}

/// Charging is encoded below the neutral baseline.
pub fn encode_charge_power(watts: u32) -> Result<u32, CodecError> {
    dispatch::NEUTRAL_POWER
        .checked_sub(watts)
        .ok_or(CodecError::OutOfRange {
            value: i64::from(watts),
        })
}

/// Discharging is encoded above the neutral baseline.
pub fn encode_discharge_power(watts: u32) -> Result<u32, CodecError> {
    dispatch::NEUTRAL_POWER
        .checked_add(watts)
        .ok_or(CodecError::OutOfRange {
            value: i64::from(watts),
        })
}

fn lookup<'a>(
    samples: &'a [RegisterSample],
    address: u16,
    width: u16,
) -> Result<&'a [u16], CodecError> {
    samples
        .iter()
        .find_map(|sample| sample.slice(address, width))
        .ok_or(CodecError::MissingRegister(address))
}

fn word(samples: &[RegisterSample], address: u16) -> Result<u16, CodecError> {
    Ok(lookup(samples, address, 1)?[0])
}

fn signed32(samples: &[RegisterSample], address: u16) -> Result<i32, CodecError> {
    decode32_signed_words(lookup(samples, address, 2)?)
}

fn unsigned32(samples: &[RegisterSample], address: u16) -> Result<u32, CodecError> {
    decode32_unsigned_words(lookup(samples, address, 2)?)
}

fn scaled_signed32(samples: &[RegisterSample], address: u16, scale: Scale) -> Result<f64, CodecError> {
    Ok(scale.decode(i64::from(signed32(samples, address)?)))
}

/// Decode a complete snapshot. Any field not covered by `samples` fails the whole decode.
pub fn decode_snapshot(
    samples: &[RegisterSample],
    captured_at: DateTime<Utc>,
) -> Result<TelemetrySnapshot, CodecError> {
    use telemetry::*;

    let battery = BatteryTelemetry {
        soc_percent: Scale::UNIT.decode(i64::from(word(samples, BATTERY_SOC)?)),
        voltage_v: Scale::VOLTAGE.decode(i64::from(word(samples, BATTERY_VOLTAGE)?)),
        current_a: Scale::BATTERY_CURRENT
            .decode(i64::from(decode16_signed(word(samples, BATTERY_CURRENT)?))),
        power_w: i64::from(signed32(samples, BATTERY_POWER)?),
        temperature_c: Scale::TEMPERATURE
            .decode(i64::from(decode16_signed(word(samples, BATTERY_TEMPERATURE)?))),
    };

    let mut voltage_v = [0.0; 3];
    let mut current_a = [0.0; 3];
    for phase in 0..3 {
        voltage_v[phase] = scaled_signed32(samples, GRID_VOLTAGE[phase], Scale::VOLTAGE)?;
        current_a[phase] = scaled_signed32(samples, GRID_CURRENT[phase], Scale::CURRENT)?;
    }
    let grid = GridTelemetry {
        power_w: i64::from(signed32(samples, GRID_POWER)?),
        voltage_v,
        current_a,
        frequency_hz: Scale::FREQUENCY.decode(i64::from(word(samples, GRID_FREQUENCY)?)),
    };

    let mut string_power_w = [0u32; 3];
    for (slot, address) in string_power_w.iter_mut().zip(PV_STRING_POWER) {
        *slot = unsigned32(samples, address)?;
    }
    let pv = PvTelemetry {
        power_w: i64::from(signed32(samples, PV_POWER)?),
        string_power_w,
        energy_today_kwh: Scale::ENERGY.decode(i64::from(unsigned32(samples, PV_ENERGY_TODAY)?)),
    };

    let load = LoadTelemetry {
        power_w: i64::from(signed32(samples, LOAD_POWER)?),
        inverter_power_w: i64::from(signed32(samples, INVERTER_POWER)?),
    };

    if !(0.0..=100.0).contains(&battery.soc_percent) {
        warn!(soc = battery.soc_percent, "battery soc outside 0-100");
    }

    Ok(TelemetrySnapshot {
        captured_at,
        battery,
        grid,
        pv,
        load,
    })
}

/// Dispatch configuration as currently staged on the device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchStatus {
    pub active: bool,
    pub mode: u16,
    pub raw_power: u32,
    pub charging: bool,
    pub discharging: bool,
    pub watts: u32,
    pub soc_percent: f64,
    pub remaining_seconds: u32,
}

/// Decode the dispatch block, reading 32-bit values in the same `(lo, hi)` order they are written.
pub fn decode_dispatch_status(sample: &RegisterSample) -> Result<DispatchStatus, CodecError> {
    let samples = std::slice::from_ref(sample);
    let power = lookup(samples, dispatch::POWER, 2)?;
    let duration = lookup(samples, dispatch::DURATION, 2)?;
    let raw_power = decode32_unsigned(power[1], power[0]);
    let remaining_seconds = decode32_unsigned(duration[1], duration[0]);

    Ok(DispatchStatus {
        active: word(samples, dispatch::ENABLE)? == 1,
        mode: word(samples, dispatch::MODE)?,
        raw_power,
        charging: raw_power < dispatch::NEUTRAL_POWER,
        discharging: raw_power > dispatch::NEUTRAL_POWER,
        watts: raw_power.abs_diff(dispatch::NEUTRAL_POWER),
        soc_percent: register_to_soc(word(samples, dispatch::SOC_BOUND)?),
        remaining_seconds,
    })
}
