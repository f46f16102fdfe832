use crate::constants::{COSFI_SCALE, CURRENT_SCALE, HARVEST_NONE, VOLTAGE_SCALE};
use crate::frame::from_bcd;
use chrono::{Duration, NaiveDate, NaiveDateTime};
use modular_bitfield::prelude::*;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use serde::Serialize;
use std::fmt;
use strum_macros::Display;
use zerocopy::byteorder::little_endian::U16;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

/// Record-level status byte: completion flags plus the high bits of the year.
#[bitfield(bytes = 1)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RecordStatus {
    pub year_high: B5,
    pub is_final: bool,
    pub complete: bool,
    pub acquired: bool,
}

/// Lamp state bitmask of one sub-reading.
#[bitfield(bytes = 1)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LampStatus {
    pub lamp_on: bool,
    pub undervoltage: bool,
    pub overvoltage: bool,
    pub output_limiter: bool,
    pub thermal_derating: bool,
    pub led_open_circuit: bool,
    pub led_thermal_derating: bool,
    pub led_thermal_shutdown: bool,
}

/// The three readings carried by every measurement record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum Slot {
    #[strum(to_string = "AE")]
    Ae = 0,
    #[strum(to_string = "M1")]
    M1 = 1,
    #[strum(to_string = "M2")]
    M2 = 2,
}

impl Slot {
    pub const ALL: [Slot; 3] = [Slot::Ae, Slot::M1, Slot::M2];

    fn index(self) -> usize {
        u8::from(self) as usize
    }
}

/// Kind of measurement recorded in a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum MeasureType {
    Standard = 0,
    Extended = 7,
}

/// One AE/M1/M2 reading (11 bytes, little-endian).
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct SubReading {
    pub lamp_status: u8,
    pub voltage: U16,         // Centivolts
    pub current: U16,         // Raw units of 3.57 mA
    pub powered_minutes: U16, // Minutes with supply present
    pub lit_minutes: U16,     // Minutes with lamp lit
    pub cosfi_value: u8,      // 0..=100
    pub cosfi_sign: u8,       // bit0 set => negative
}

impl SubReading {
    pub fn lamp_status(&self) -> LampStatus {
        LampStatus::from_bytes([self.lamp_status])
    }

    pub fn voltage_v(&self) -> f64 {
        self.voltage.get() as f64 / VOLTAGE_SCALE
    }

    pub fn current_a(&self) -> f64 {
        self.current.get() as f64 * CURRENT_SCALE
    }

    /// Signed power factor in -1.0..=1.0
    pub fn cosfi(&self) -> f64 {
        let magnitude = self.cosfi_value as f64 / COSFI_SCALE;
        if self.cosfi_sign & 0x01 == 0x01 { -magnitude } else { magnitude }
    }

    /// Active power in watts
    pub fn power_w(&self) -> f64 {
        self.voltage_v() * self.current_a() * self.cosfi()
    }
}

/// The 48-byte payload of a measurement record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct MeasurementData {
    pub status: u8,
    pub year: u8,  // Low byte of the year
    pub month: u8, // BCD
    pub day: u8,   // BCD
    pub pole: U16,
    pub measure_type: u8,
    pub readings: [SubReading; 3],
    /// Minutes from local noon, `HARVEST_NONE` when no sample was taken
    pub harvest: [U16; 3],
    /// Time scale selector, 0..=3
    pub conversion_type: u8,
    pub reserved: u8,
}

impl MeasurementData {
    pub fn record_status(&self) -> RecordStatus {
        RecordStatus::from_bytes([self.status])
    }

    /// Calendar year of the record.
    ///
    /// Devices that set the year-high bits carry the full year across the
    /// status and year bytes; otherwise the year byte is an offset from 2000.
    pub fn full_year(&self) -> i32 {
        let high = self.record_status().year_high() as i32;
        if high == 0 {
            2000 + self.year as i32
        } else {
            (high << 8) | self.year as i32
        }
    }

    pub fn date(&self) -> Option<NaiveDate> {
        NaiveDate::from_ymd_opt(
            self.full_year(),
            from_bcd(self.month) as u32,
            from_bcd(self.day) as u32,
        )
    }

    pub fn pole(&self) -> u16 {
        self.pole.get()
    }

    pub fn measure_type(&self) -> Option<MeasureType> {
        MeasureType::try_from(self.measure_type).ok()
    }

    pub fn reading(&self, slot: Slot) -> &SubReading {
        &self.readings[slot.index()]
    }

    pub fn harvest_minutes(&self, slot: Slot) -> Option<u16> {
        match self.harvest[slot.index()].get() {
            HARVEST_NONE => None,
            minutes => Some(minutes),
        }
    }

    /// When `slot` was sampled: local noon of the record date plus the
    /// harvest offset, or plain noon when no offset was recorded.
    pub fn sampled_at(&self, slot: Slot) -> Option<NaiveDateTime> {
        let noon = self.date()?.and_hms_opt(12, 0, 0)?;
        match self.harvest_minutes(slot) {
            Some(minutes) => noon.checked_add_signed(Duration::minutes(minutes as i64)),
            None => Some(noon),
        }
    }

    /// All three readings in engineering units.
    pub fn lamp_readings(&self) -> Vec<LampReading> {
        Slot::ALL
            .iter()
            .map(|&slot| LampReading::new(self, slot))
            .collect()
    }
}

/// One sub-reading converted to engineering units.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LampReading {
    pub timestamp: Option<NaiveDateTime>,
    pub pole: u16,
    pub slot: Slot,
    pub voltage_v: f64,
    pub current_a: f64,
    pub cosfi: f64,
    pub power_w: f64,
    pub lamp_on: bool,
    pub lamp_status: u8,
    pub measure_type: u8,
    pub status: u8,
}

impl LampReading {
    pub fn new(data: &MeasurementData, slot: Slot) -> Self {
        let reading = data.reading(slot);
        Self {
            timestamp: data.sampled_at(slot),
            pole: data.pole(),
            slot,
            voltage_v: reading.voltage_v(),
            current_a: reading.current_a(),
            cosfi: reading.cosfi(),
            power_w: reading.power_w(),
            lamp_on: reading.lamp_status().lamp_on(),
            lamp_status: reading.lamp_status,
            measure_type: data.measure_type,
            status: data.status,
        }
    }
}

impl fmt::Display for LampReading {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let when = match self.timestamp {
            Some(ts) => ts.format("%Y-%m-%d %H:%M").to_string(),
            None => "invalid date".to_string(),
        };
        write!(
            f,
            "pole {:>5} {} @ {}: {:.2} V, {:.3} A, cosfi {:+.2}, {:.1} W, lamp {}",
            self.pole,
            self.slot,
            when,
            self.voltage_v,
            self.current_a,
            self.cosfi,
            self.power_w,
            if self.lamp_on { "on" } else { "off" }
        )
    }
}
