//! Sensor conditioning: raw ADC counts to filtered engineering units.

#![allow(
    clippy::cast_precision_loss,
    clippy::excessive_precision,
    clippy::unreadable_literal
)]

use core::fmt;

use libm::logf;

use crate::config::ConfigPage;
use crate::fuel::limit;

const NTC_PULLUP_OHMS: f32 = 3300.0;
const NTC_SUPPLY_VOLTS: f32 = 5.0;
const ADC_TO_VOLTS: f32 = 0.0008058608058608;
const MIN_THERMISTOR_OHMS: f32 = 0.0001;
const MAX_THERMISTOR_OHMS: f32 = 99999.0;

/// One conversion of every analog channel, in ADC counts.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct RawSample {
    pub map: u16,
    pub lambda: u16,
    pub coolant: u16,
    pub air: u16,
    pub tps: u16,
    pub battery: u16,
}

/// Filtered sensor readings in engineering units.
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct SensorFrame {
    pub map_kpa: f32,
    pub lambda_mv: f32,
    pub coolant_c: f32,
    pub air_c: f32,
    pub tps_mv: f32,
    pub battery_v: f32,
    /// 0% closed, 100% wide open.
    pub tps_percent: f32,
    pub thermistor_ohms: f32,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SensorFault {
    /// Conversion did not complete in time.
    AdcTimeout,
}

impl fmt::Display for SensorFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SensorFault::AdcTimeout => f.write_str("adc conversion timed out"),
        }
    }
}

/// First-order low-pass filter, `y = (x - y1) * alpha + y1`.
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct LowPassFilter {
    alpha: f32,
    prev: f32,
}

impl LowPassFilter {
    #[must_use]
    pub const fn new(alpha: f32) -> Self {
        Self { alpha, prev: 0.0 }
    }

    pub fn apply(&mut self, x: f32) -> f32 {
        let y = (x - self.prev) * self.alpha + self.prev;
        self.prev = y;
        y
    }

    pub fn seed(&mut self, value: f32) {
        self.prev = value;
    }
}

/// Coefficients for a two-point NTC fit, `T = a * ln(R) + b`.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Thermistor {
    a: f32,
    b: f32,
}

impl Thermistor {
    #[must_use]
    pub fn new(t1: f32, r1: f32, t2: f32, r2: f32) -> Self {
        let a = (t2 - t1) / logf(r2 / r1);
        Self { a, b: t1 - a * logf(r1) }
    }

    /// Resistance of the thermistor behind the pull-up for a given count.
    #[must_use]
    pub fn resistance(counts: u16) -> f32 {
        let volts = ADC_TO_VOLTS * f32::from(counts);
        limit(
            volts * NTC_PULLUP_OHMS / (NTC_SUPPLY_VOLTS - volts),
            MIN_THERMISTOR_OHMS,
            MAX_THERMISTOR_OHMS,
        )
    }

    #[must_use]
    pub fn temperature(&self, ohms: f32) -> f32 {
        self.a * logf(ohms) + self.b
    }
}

/// Converts and filters raw samples. Rebuilt whenever the filter block or
/// sensor calibration changes.
#[derive(Clone, Debug)]
pub struct SensorConditioner {
    map: LowPassFilter,
    lambda: LowPassFilter,
    coolant: LowPassFilter,
    air: LowPassFilter,
    tps: LowPassFilter,
    battery: LowPassFilter,
    thermistor: Thermistor,
    tps_offset: f32,
    tps_multiplier: f32,
    primed: bool,
}

impl SensorConditioner {
    #[must_use]
    pub fn new(page: &ConfigPage) -> Self {
        let filters = &page.filters;
        let p2 = &page.p2;
        Self {
            map: LowPassFilter::new(filters.map),
            lambda: LowPassFilter::new(filters.lambda),
            coolant: LowPassFilter::new(filters.coolant_temp),
            air: LowPassFilter::new(filters.air_temp),
            tps: LowPassFilter::new(filters.tps),
            battery: LowPassFilter::new(filters.voltage),
            thermistor: Thermistor::new(
                p2.thermistor_t1,
                p2.thermistor_r1,
                p2.thermistor_t2,
                p2.thermistor_r2,
            ),
            tps_offset: p2.tps_closed_mv,
            tps_multiplier: 100.0 / (p2.tps_open_mv - p2.tps_closed_mv),
            primed: false,
        }
    }

    /// Filters one raw sample into a frame.
    ///
    /// The coolant filter starts from the first unfiltered reading so a warm
    /// engine does not look cold while its slow filter settles.
    pub fn condition(&mut self, raw: &RawSample) -> SensorFrame {
        let thermistor_ohms = Thermistor::resistance(raw.coolant);
        let coolant = self.thermistor.temperature(thermistor_ohms);
        if !self.primed {
            self.coolant.seed(coolant);
            self.primed = true;
        }

        let tps_mv = self.tps.apply(4.8387096774 * f32::from(raw.tps));
        SensorFrame {
            map_kpa: self.map.apply(0.1075258065 * f32::from(raw.map) + 9.4444),
            lambda_mv: self.lambda.apply(3.2258064516 * f32::from(raw.lambda)),
            coolant_c: self.coolant.apply(coolant),
            air_c: self.air.apply(0.3225806452 * f32::from(raw.air)),
            tps_mv,
            battery_v: self.battery.apply(0.0354838710 * f32::from(raw.battery)),
            tps_percent: (tps_mv - self.tps_offset) * self.tps_multiplier,
            thermistor_ohms,
        }
    }
}
