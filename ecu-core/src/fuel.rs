//! Injector pulse width and its compensation terms.

use libm::logf;

use crate::config::ConfigPage;
use crate::table::{LOAD_CELLS, Map, MapLookup, RPM_CELLS};

/// Throttle opening above which cranking fuel is cut to clear a flooded engine.
const FLOOD_CLEAR_TPS: f32 = 60.0;
/// Pulse width, in µs, delivered while clearing a flood.
const FLOOD_CLEAR_PW_US: f32 = 100.0;

/// Linear compensation between two temperatures, flat outside them.
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct TemperatureCompensation {
    t1: f32,
    t2: f32,
    a: f32,
    b: f32,
}

impl TemperatureCompensation {
    /// Compensation points are given in percent, e.g. 10 means 10% more fuel.
    #[must_use]
    pub fn new(t1: f32, comp1_percent: f32, t2: f32, comp2_percent: f32) -> Self {
        let comp1 = 0.01 * comp1_percent;
        let comp2 = 0.01 * comp2_percent;
        let a = (comp2 - comp1) / (t2 - t1);
        Self {
            t1,
            t2,
            a,
            b: comp1 - a * t1,
        }
    }

    /// Multiplier where 1.0 is neutral.
    #[must_use]
    pub fn factor(&self, temperature: f32) -> f32 {
        1.0 + (self.a * limit(temperature, self.t1, self.t2) + self.b)
    }
}

/// Throttle-rate enrichment with peak capture, clip and decay.
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct AccelerationCompensation {
    time_constant: f32,
    amplitude: f32,
    limit: f32,
    low_pass_tps: f32,
    peak: f32,
    value: f32,
}

impl AccelerationCompensation {
    /// `duration_ms` is the time for a step response to fall to 10%.
    #[must_use]
    pub fn new(limit: f32, amplitude_factor: f32, duration_ms: f32, period_ms: f32) -> Self {
        let time_constant = -logf(0.1 / amplitude_factor) * period_ms / duration_ms;
        Self {
            time_constant,
            amplitude: 2.0 * amplitude_factor / (1.0 - time_constant),
            // output is clipped to half the peak
            limit: 2.0 * limit,
            low_pass_tps: 0.0,
            peak: 0.0,
            value: 0.0,
        }
    }

    /// Steps the filter with the current throttle position, percent.
    pub fn update(&mut self, tps: f32) -> f32 {
        let low_pass = (tps - self.low_pass_tps) * self.time_constant + self.low_pass_tps;
        self.low_pass_tps = low_pass;

        let fresh = (self.amplitude * (tps - low_pass)).max(0.0);
        if fresh > self.peak {
            self.peak = fresh.min(self.limit);
        }

        let clip = 0.5 * self.peak;
        if fresh > clip {
            self.value = clip;
        } else {
            self.value = fresh;
            self.peak = 2.0 * fresh;
        }
        self.value
    }

    #[must_use]
    pub const fn value(&self) -> f32 {
        self.value
    }
}

/// Enrichment applied just after start, decaying linearly to 1.0.
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct PostStartEnrichment {
    start: f32,
    value: f32,
    decay: f32,
}

impl PostStartEnrichment {
    #[must_use]
    pub fn new(start_percent: f32, seconds: f32, period_ms: f32) -> Self {
        let start = 1.0 + 0.01 * start_percent;
        Self {
            start,
            value: start,
            decay: (start - 1.0) * period_ms / (1000.0 * seconds),
        }
    }

    pub fn restart(&mut self) {
        self.value = self.start;
    }

    /// Returns the current factor then decays it by one step.
    pub fn step(&mut self) -> f32 {
        let current = self.value;
        self.value = if self.value > 1.0 {
            self.value - self.decay
        } else {
            1.0
        };
        current
    }

    #[must_use]
    pub const fn value(&self) -> f32 {
        self.value
    }
}

/// Operating point fed to the pulse width calculation.
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct FuelInputs {
    pub rpm: f32,
    pub load: f32,
    pub tps_percent: f32,
    pub engine_temp: f32,
    pub air_temp: f32,
}

/// Fuel computation state rebuilt on every maps or full reset.
#[derive(Clone, Debug)]
pub struct FuelCalculator {
    engine_comp: TemperatureCompensation,
    air_comp: TemperatureCompensation,
    accel: AccelerationCompensation,
    pse: PostStartEnrichment,
    ve_corrected: Map,
    interpolated_ve: f32,
    temp_comp: f32,
}

impl FuelCalculator {
    /// `afr_correction` must already be initialised by the AFR trim.
    #[must_use]
    pub fn new(page: &ConfigPage, afr_correction: &Map, period_ms: f32) -> Self {
        let p1 = &page.p1;
        let mut fuel = Self {
            engine_comp: TemperatureCompensation::new(
                p1.eng_temp_comp_t1,
                p1.eng_temp_comp_c1,
                p1.eng_temp_comp_t2,
                p1.eng_temp_comp_c2,
            ),
            air_comp: TemperatureCompensation::new(
                p1.air_temp_comp_t1,
                p1.air_temp_comp_c1,
                p1.air_temp_comp_t2,
                p1.air_temp_comp_c2,
            ),
            accel: AccelerationCompensation::new(
                p1.accel_comp_limit,
                p1.accel_comp_amplitude,
                p1.accel_comp_duration,
                period_ms,
            ),
            pse: PostStartEnrichment::new(p1.pse_start_value, p1.pse_decay_time, period_ms),
            ve_corrected: [[0.0; RPM_CELLS]; LOAD_CELLS],
            interpolated_ve: 0.0,
            temp_comp: 1.0,
        };
        fuel.reset_correction(&page.ve_map, afr_correction);
        fuel
    }

    /// Rebuilds the corrected VE map from scratch.
    pub fn reset_correction(&mut self, ve_map: &Map, afr_correction: &Map) {
        for ((out, ve), corr) in self
            .ve_corrected
            .iter_mut()
            .flatten()
            .zip(ve_map.iter().flatten())
            .zip(afr_correction.iter().flatten())
        {
            *out = ve + corr;
        }
    }

    /// Pulse width in µs. `lookup` must already hold the current operating
    /// point. Only the current cell of the corrected VE map is refreshed.
    pub fn injector_pulse_width(
        &mut self,
        page: &ConfigPage,
        lookup: &MapLookup,
        afr_correction: &Map,
        inputs: &FuelInputs,
    ) -> f32 {
        let adjusted_load = (inputs.load + self.accel.update(inputs.tps_percent)) * 0.01;

        let cell = lookup.current_cell();
        self.ve_corrected[cell.load_index][cell.rpm_index] = page.ve_map[cell.load_index]
            [cell.rpm_index]
            + afr_correction[cell.load_index][cell.rpm_index];
        self.interpolated_ve = lookup.interpolate(&self.ve_corrected);

        let engine_comp = self.engine_comp.factor(inputs.engine_temp);
        self.temp_comp = engine_comp * self.air_comp.factor(inputs.air_temp);

        if inputs.rpm < page.p1.cranking_threshold {
            self.pse.restart();
            if inputs.tps_percent < FLOOD_CLEAR_TPS {
                page.p1.cranking_pw * (1.0 + 2.0 * (engine_comp - 1.0))
            } else {
                FLOOD_CLEAR_PW_US
            }
        } else {
            let pse = self.pse.step();
            1000.0
                * (page.p2.required_fuel
                    * self.interpolated_ve
                    * 0.01
                    * adjusted_load
                    * self.temp_comp
                    * pse
                    + page.p2.injector_latency)
        }
    }

    #[must_use]
    pub const fn interpolated_ve(&self) -> f32 {
        self.interpolated_ve
    }

    #[must_use]
    pub const fn temp_comp(&self) -> f32 {
        self.temp_comp
    }

    #[must_use]
    pub const fn accel_comp(&self) -> f32 {
        self.accel.value()
    }

    #[must_use]
    pub const fn ve_corrected(&self) -> &Map {
        &self.ve_corrected
    }
}

/// Spark advance in degrees BTDC at the current operating point.
#[must_use]
pub fn ignition_advance(lookup: &MapLookup, ignition_map: &Map) -> f32 {
    lookup.interpolate(ignition_map)
}

/// Clamps to `[low, high]`; `low` wins if the bounds cross.
pub(crate) fn limit(value: f32, low: f32, high: f32) -> f32 {
    let capped = if value > high { high } else { value };
    if capped < low { low } else { capped }
}

/// Clamps between two extremes given in either order.
pub(crate) fn range(value: f32, a: f32, b: f32) -> f32 {
    limit(value, a.min(b), a.max(b))
}
