//! Live data record and its wire renderings.
//!
//! The HF task refreshes a [`TelemetrySnapshot`] every cycle. Hosts receive it
//! as a comma separated data line; the external bus receives a handful of
//! fields packed into short frames.

#![allow(
    clippy::cast_possible_truncation,
    clippy::cast_precision_loss,
    clippy::cast_sign_loss
)]

use core::fmt::{self, Write};

use heapless::{String, Vec};

use crate::status::StatusFlags;

/// Fields in a data line, after the status word.
pub const FIELD_COUNT: usize = 27;

/// Values are clamped to this magnitude before formatting.
pub const DATA_RANGE: f32 = 9999.9;

/// Digits after the point for each field.
pub const DECIMALS: [usize; FIELD_COUNT] = [
    3, 1, 0, 1, 1, 0, 1, 0, 0, 1, 1, 1, 2, 2, 0, 0, 0, 0, 1, 1, 0, 1, 1, 0, 0, 0, 0,
];

pub const DATA_LINE_CAPACITY: usize = 320;

pub type DataLine = String<DATA_LINE_CAPACITY>;

/// One cycle's worth of engine state, in data line order.
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct TelemetrySnapshot {
    pub status: StatusFlags,
    /// Seconds since boot.
    pub timestamp: f32,
    pub map_kpa: f32,
    pub lambda_mv: f32,
    pub coolant_c: f32,
    pub air_c: f32,
    pub tps_mv: f32,
    pub battery_v: f32,
    pub rpm: f32,
    pub injector_pw_us: f32,
    pub interpolated_ve: f32,
    pub tps_percent: f32,
    pub target_tps: f32,
    pub temp_comp: f32,
    pub accel_comp: f32,
    pub thermistor_ohms: f32,
    pub current_cell: f32,
    pub error_tooth: f32,
    pub sync_errors: f32,
    pub vvt_duty: f32,
    pub advance: f32,
    pub idle_actuator: f32,
    pub spare: f32,
    pub afr_correction: f32,
    pub lambda_average: f32,
    pub afr_index: f32,
    pub afr_saves: f32,
    pub lambda_samples: f32,
}

impl TelemetrySnapshot {
    #[must_use]
    pub const fn fields(&self) -> [f32; FIELD_COUNT] {
        [
            self.timestamp,
            self.map_kpa,
            self.lambda_mv,
            self.coolant_c,
            self.air_c,
            self.tps_mv,
            self.battery_v,
            self.rpm,
            self.injector_pw_us,
            self.interpolated_ve,
            self.tps_percent,
            self.target_tps,
            self.temp_comp,
            self.accel_comp,
            self.thermistor_ohms,
            self.current_cell,
            self.error_tooth,
            self.sync_errors,
            self.vvt_duty,
            self.advance,
            self.idle_actuator,
            self.spare,
            self.afr_correction,
            self.lambda_average,
            self.afr_index,
            self.afr_saves,
            self.lambda_samples,
        ]
    }

    /// Renders `*,<status>,<field>,...` terminated by CRLF.
    ///
    /// # Errors
    ///
    /// Fails only if the line outgrows [`DATA_LINE_CAPACITY`].
    pub fn data_line(&self) -> Result<DataLine, fmt::Error> {
        let mut line = DataLine::new();
        write!(line, "*,{}", self.status)?;
        for (value, decimals) in self.fields().iter().zip(DECIMALS) {
            write!(line, ",{:.*}", decimals, value.clamp(-DATA_RANGE, DATA_RANGE))?;
        }
        line.write_str("\r\n")?;
        Ok(line)
    }

    /// Frames forwarded to the external bus by the slow tasks.
    #[must_use]
    pub fn bus_sensors(&self) -> BusMessage {
        BusMessage::Sensors {
            map_kpa: saturate_u8(self.map_kpa),
            lambda_mv: saturate_u16(self.lambda_mv),
            air_c: saturate_u8(self.air_c),
            coolant_c: saturate_u8(self.coolant_c),
        }
    }

    #[must_use]
    pub fn bus_injection(&self) -> BusMessage {
        BusMessage::Injection {
            pulse_width_us: saturate_u16(self.injector_pw_us),
            advance: saturate_u16(self.advance),
        }
    }
}

/// Frames for the external bus.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum BusMessage {
    Rpm(u16),
    ThrottleSwitch(bool),
    Sensors {
        map_kpa: u8,
        lambda_mv: u16,
        air_c: u8,
        coolant_c: u8,
    },
    Injection {
        pulse_width_us: u16,
        advance: u16,
    },
}

impl BusMessage {
    #[must_use]
    pub fn rpm(rpm: f32) -> Self {
        BusMessage::Rpm(saturate_u16(rpm))
    }

    /// Standard frame identifier.
    #[must_use]
    pub const fn id(&self) -> u16 {
        match self {
            BusMessage::Rpm(_) => 0x123,
            BusMessage::ThrottleSwitch(_) => 0x124,
            BusMessage::Sensors { .. } => 0x125,
            BusMessage::Injection { .. } => 0x126,
        }
    }

    /// Frame payload, big-endian multi-byte values.
    #[must_use]
    pub fn payload(&self) -> Vec<u8, 8> {
        let mut frame = Vec::new();
        // Every layout fits in eight bytes.
        let _ = match *self {
            BusMessage::Rpm(rpm) => {
                let [hi, lo] = rpm.to_be_bytes();
                frame.extend_from_slice(&[0, hi, lo, 0, 0, 0, 0, 0])
            }
            BusMessage::ThrottleSwitch(closed) => frame.extend_from_slice(&[0, u8::from(closed)]),
            BusMessage::Sensors {
                map_kpa,
                lambda_mv,
                air_c,
                coolant_c,
            } => {
                let [hi, lo] = lambda_mv.to_be_bytes();
                frame.extend_from_slice(&[map_kpa, hi, lo, air_c, coolant_c])
            }
            BusMessage::Injection {
                pulse_width_us,
                advance,
            } => {
                let [pw_hi, pw_lo] = pulse_width_us.to_be_bytes();
                let [adv_hi, adv_lo] = advance.to_be_bytes();
                frame.extend_from_slice(&[pw_hi, pw_lo, adv_hi, adv_lo])
            }
        };
        frame
    }
}

fn saturate_u8(value: f32) -> u8 {
    value.clamp(0.0, f32::from(u8::MAX)) as u8
}

fn saturate_u16(value: f32) -> u16 {
    value.clamp(0.0, f32::from(u16::MAX)) as u16
}
