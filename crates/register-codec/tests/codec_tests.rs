use chrono::Utc;
use proptest::prelude::*;
use register_codec::{
    decode16_signed, decode32_signed, decode32_signed_words, decode32_unsigned,
    decode32_unsigned_words, decode_dispatch_status, decode_snapshot, encode32,
    encode_charge_power, encode_discharge_power, register_to_soc, soc_to_register, telemetry,
    CodecError, Scale,
};
use types::RegisterSample;

#[test]
fn signed_composition_matches_twos_complement() {
    assert_eq!(decode32_signed(0x0000, 0x0001), 1);
    assert_eq!(decode32_signed(0x7FFF, 0xFFFF), i32::MAX);
    assert_eq!(decode32_signed(0x8000, 0x0000), i32::MIN);
    assert_eq!(decode32_signed(0xFFFF, 0xFFFF), -1);
    assert_eq!(decode32_signed(0xFFFF, 0xF830), -2000);
    assert_eq!(decode32_unsigned(0xFFFF, 0xFFFF), u32::MAX);
    assert_eq!(decode16_signed(0xFFF6), -10);
}

#[test]
fn encode_splits_low_word_first() {
    assert_eq!(encode32(30_000), (30_000, 0));
    assert_eq!(encode32(3_600), (3_600, 0));
    assert_eq!(encode32(86_400), (0x5180, 0x0001));
    assert_eq!(encode32(-1), (0xFFFF, 0xFFFF));
}

#[test]
fn word_slices_must_be_two_words() {
    assert_eq!(
        decode32_signed_words(&[1]),
        Err(CodecError::Length {
            expected: 2,
            actual: 1
        })
    );
    assert_eq!(
        decode32_unsigned_words(&[1, 2, 3]),
        Err(CodecError::Length {
            expected: 2,
            actual: 3
        })
    );
    assert_eq!(decode32_unsigned_words(&[0x0001, 0x0002]), Ok(0x0001_0002));
}

#[test]
fn soc_register_uses_point_four_scale() {
    assert_eq!(soc_to_register(100.0), 250);
    assert_eq!(soc_to_register(10.0), 25);
    assert_eq!(soc_to_register(0.0), 0);
    assert!((register_to_soc(250) - 100.0).abs() < 1e-9);
}

#[test]
fn dispatch_power_offsets_from_neutral() {
    assert_eq!(encode_charge_power(2_000), Ok(30_000));
    assert_eq!(encode_discharge_power(2_000), Ok(34_000));
    assert_eq!(encode_charge_power(0), Ok(32_000));
    assert!(encode_charge_power(40_000).is_err());
}

fn telemetry_samples() -> Vec<RegisterSample> {
    let mut battery = vec![0u16; 4];
    battery[0] = 5_123; // 512.3 V
    battery[1] = (-125i16) as u16; // -12.5 A
    battery[2] = 80;
    battery[3] = 251; // 25.1 C

    let mut inverter = vec![0u16; 15];
    let put32 = |block: &mut Vec<u16>, base: u16, address: u16, value: i64| {
        let (lo, hi) = register_codec::encode32(value);
        let index = usize::from(address - base);
        block[index] = hi;
        block[index + 1] = lo;
    };
    put32(&mut inverter, 0x041A, telemetry::INVERTER_POWER, 1_500);
    put32(&mut inverter, 0x041A, telemetry::PV_STRING_POWER[0], 1_200);
    put32(&mut inverter, 0x041A, telemetry::PV_STRING_POWER[1], 900);
    put32(&mut inverter, 0x041A, telemetry::PV_STRING_POWER[2], 0);

    let mut grid = vec![0u16; 45];
    for (phase, address) in telemetry::GRID_VOLTAGE.iter().enumerate() {
        put32(&mut grid, 0x0470, *address, 2_300 + phase as i64);
    }
    for address in telemetry::GRID_CURRENT {
        put32(&mut grid, 0x0470, address, 512);
    }
    put32(&mut grid, 0x0470, telemetry::GRID_POWER, -750);
    put32(&mut grid, 0x0470, telemetry::PV_ENERGY_TODAY, 1_234);
    put32(&mut grid, 0x0470, telemetry::PV_POWER, 2_100);
    put32(&mut grid, 0x0470, telemetry::LOAD_POWER, 1_350);
    grid[usize::from(telemetry::GRID_FREQUENCY - 0x0470)] = 5_001;

    vec![
        RegisterSample::new(0x0100, battery),
        RegisterSample::new(0x041A, inverter),
        RegisterSample::new(0x0470, grid),
    ]
}

#[test]
fn decode_full_snapshot() {
    let samples = telemetry_samples();
    let snapshot = decode_snapshot(&samples, Utc::now()).expect("decode");

    assert_eq!(snapshot.battery.soc_percent, 80.0);
    assert!((snapshot.battery.voltage_v - 512.3).abs() < 0.05);
    assert!((snapshot.battery.current_a + 12.5).abs() < 0.05);
    assert!((snapshot.battery.temperature_c - 25.1).abs() < 0.05);
    assert_eq!(snapshot.load.inverter_power_w, 1_500);
    assert_eq!(snapshot.pv.string_power_w, [1_200, 900, 0]);
    assert!((snapshot.grid.voltage_v[0] - 230.0).abs() < 0.05);
    assert!((snapshot.grid.voltage_v[2] - 230.2).abs() < 0.05);
    assert!((snapshot.grid.current_a[1] - 5.12).abs() < 0.005);
    assert_eq!(snapshot.grid.power_w, -750);
    assert!((snapshot.grid.frequency_hz - 50.01).abs() < 0.005);
    assert_eq!(snapshot.pv.power_w, 2_100);
    assert!((snapshot.pv.energy_today_kwh - 12.34).abs() < 0.005);
    assert_eq!(snapshot.load.power_w, 1_350);
}

#[test]
fn decode_snapshot_rejects_missing_block() {
    let mut samples = telemetry_samples();
    samples.pop();
    let err = decode_snapshot(&samples, Utc::now()).expect_err("partial samples");
    assert!(matches!(err, CodecError::MissingRegister(_)));
}

#[test]
fn decode_snapshot_rejects_truncated_block() {
    let mut samples = telemetry_samples();
    samples[2].words.truncate(20);
    let err = decode_snapshot(&samples, Utc::now()).expect_err("truncated block");
    assert_eq!(err, CodecError::MissingRegister(telemetry::GRID_POWER));
}

#[test]
fn dispatch_status_reads_back_staged_values() {
    let (power_lo, power_hi) = encode32(30_000);
    let (duration_lo, duration_hi) = encode32(3_600);
    let sample = RegisterSample::new(
        0x0880,
        vec![1, power_lo, power_hi, 0, 0, 2, 250, duration_lo, duration_hi],
    );

    let status = decode_dispatch_status(&sample).expect("status");
    assert!(status.active);
    assert_eq!(status.mode, 2);
    assert!(status.charging);
    assert!(!status.discharging);
    assert_eq!(status.watts, 2_000);
    assert!((status.soc_percent - 100.0).abs() < 1e-9);
    assert_eq!(status.remaining_seconds, 3_600);
}

proptest! {
    #[test]
    fn signed_round_trip(value in any::<i32>()) {
        let (lo, hi) = encode32(i64::from(value));
        prop_assert_eq!(decode32_signed(hi, lo), value);
    }

    #[test]
    fn unsigned_round_trip(value in any::<u32>()) {
        let (lo, hi) = encode32(i64::from(value));
        prop_assert_eq!(decode32_unsigned(hi, lo), value);
    }

    #[test]
    fn voltage_round_trip_within_resolution(value in -3_000.0f64..3_000.0) {
        let decoded = Scale::VOLTAGE.decode(Scale::VOLTAGE.encode(value));
        prop_assert!((decoded - value).abs() <= Scale::VOLTAGE.resolution());
    }

    #[test]
    fn current_round_trip_within_resolution(value in -500.0f64..500.0) {
        let decoded = Scale::CURRENT.decode(Scale::CURRENT.encode(value));
        prop_assert!((decoded - value).abs() <= Scale::CURRENT.resolution());
    }

    #[test]
    fn frequency_round_trip_within_resolution(value in 40.0f64..70.0) {
        let decoded = Scale::FREQUENCY.decode(Scale::FREQUENCY.encode(value));
        prop_assert!((decoded - value).abs() <= Scale::FREQUENCY.resolution());
    }

    #[test]
    fn soc_round_trip_within_resolution(value in 0.0f64..=100.0) {
        let decoded = register_to_soc(soc_to_register(value));
        prop_assert!((decoded - value).abs() <= Scale::SOC.resolution());
    }
}
