//! Producers of measurement payloads for the server side of a session.

use crate::clock::Clock;
use crate::constants::{HARVEST_NONE, MAX_RECORDS, MIN_RECORDS};
use crate::frame::to_bcd;
use crate::payload::{LampStatus, MeasureType, MeasurementData, RecordStatus, SubReading};
use chrono::Datelike;
use rand::Rng;
use std::sync::Arc;
use zerocopy::FromZeros;

/// Supplies the records a server session streams.
///
/// Sources are shared by every session of a server and must not fail.
pub trait MeasurementSource: Send + Sync {
    /// How many records the next download should carry.
    fn batch_len(&self) -> usize;

    /// The next 48-byte payload.
    fn next_payload(&self) -> MeasurementData;
}

/// Fabricates plausible records dated today.
pub struct RandomSource {
    clock: Arc<dyn Clock>,
}

impl RandomSource {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }

    fn status_byte(rng: &mut impl Rng) -> u8 {
        RecordStatus::new()
            .with_acquired(rng.gen_bool(0.8))
            .with_complete(rng.gen_bool(0.7))
            .with_is_final(rng.gen_bool(0.9))
            .into_bytes()[0]
    }

    fn lamp_status(rng: &mut impl Rng) -> u8 {
        LampStatus::new()
            .with_lamp_on(rng.gen_bool(0.8))
            .with_undervoltage(rng.gen_bool(0.1))
            .with_overvoltage(rng.gen_bool(0.1))
            .with_output_limiter(rng.gen_bool(0.1))
            .with_thermal_derating(rng.gen_bool(0.1))
            .with_led_open_circuit(rng.gen_bool(0.1))
            .with_led_thermal_derating(rng.gen_bool(0.1))
            .with_led_thermal_shutdown(rng.gen_bool(0.1))
            .into_bytes()[0]
    }

    fn sub_reading(rng: &mut impl Rng) -> SubReading {
        let mut reading = SubReading::new_zeroed();
        reading.lamp_status = Self::lamp_status(rng);
        reading.voltage.set(rng.gen_range(18_000..25_000));
        reading.current.set(rng.gen_range(0..5_000));
        reading.powered_minutes.set(rng.r#gen());
        reading.lit_minutes.set(rng.r#gen());
        reading.cosfi_value = rng.gen_range(0..=100);
        reading.cosfi_sign = u8::from(rng.gen_bool(0.1));
        reading
    }
}

impl MeasurementSource for RandomSource {
    fn batch_len(&self) -> usize {
        rand::thread_rng().gen_range(MIN_RECORDS..=MAX_RECORDS)
    }

    fn next_payload(&self) -> MeasurementData {
        let mut rng = rand::thread_rng();
        let today = self.clock.now().date();

        let mut data = MeasurementData::new_zeroed();
        data.status = Self::status_byte(&mut rng);
        data.year = today.year().rem_euclid(100) as u8;
        data.month = to_bcd(today.month() as u8);
        data.day = to_bcd(today.day() as u8);
        data.pole.set(rng.gen_range(0..10_000));
        data.measure_type = if rng.gen_bool(0.5) {
            MeasureType::Extended.into()
        } else {
            MeasureType::Standard.into()
        };
        for reading in data.readings.iter_mut() {
            *reading = Self::sub_reading(&mut rng);
        }
        for harvest in data.harvest.iter_mut() {
            let minutes = if rng.gen_bool(0.1) {
                HARVEST_NONE
            } else {
                rng.gen_range(0..1440)
            };
            harvest.set(minutes);
        }
        data.conversion_type = rng.gen_range(0..4);
        data
    }
}
