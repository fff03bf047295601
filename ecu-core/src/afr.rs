//! Closed-loop AFR trim.
//!
//! Each map cell keeps a long-term average of the lambda sensor output, a
//! sample count and a PI correction that is added to the VE map. Only the
//! averages and sample counts are persisted; the integral restarts from zero
//! after every reset.

#![allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]

use libm::truncf;

use crate::config::{AFR_DATA_ADDRESS, Parameters1};
use crate::fuel::limit;
use crate::storage::{Storage, StorageError};
use crate::table::{CurrentCell, LOAD_CELLS, Map, RPM_CELLS};

/// Integral saturation bound.
pub const CUMULATIVE_ERROR_LIMIT: f32 = 10_000.0;

const CELLS: usize = RPM_CELLS * LOAD_CELLS;
const PERSISTED_LEN: usize = 2 * CELLS * 4;
const EMPTY: Map = [[0.0; RPM_CELLS]; LOAD_CELLS];

/// One cell of trim data as reported over telemetry.
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct AfrSample {
    pub correction: f32,
    pub average: f32,
    pub samples: f32,
    pub index: usize,
}

/// Per-cell AFR trim state.
#[derive(Clone, Debug)]
pub struct AfrTrim {
    averages: Map,
    samples: Map,
    cumulative_error: Map,
    filter_prev: Map,
    correction: Map,
    save_period: i32,
    save_counter: i32,
    cursor: usize,
    /// Advisory hold on the averages and sample counts. [`Self::persist`]
    /// and [`Self::restore`] already have exclusive access, so only a
    /// caller that spreads a save over several cycles needs to set it.
    data_lock: bool,
}

impl AfrTrim {
    /// Starts every cell at its target. `vlf_period_ms` is the interval
    /// between [`Self::save_due`] calls.
    #[must_use]
    pub fn new(target: &Map, p1: &Parameters1, vlf_period_ms: f32) -> Self {
        let mut trim = Self {
            averages: EMPTY,
            samples: EMPTY,
            cumulative_error: EMPTY,
            filter_prev: EMPTY,
            correction: EMPTY,
            save_period: truncf(60_000.0 * p1.afr_data_save_period / vlf_period_ms) as i32,
            save_counter: 0,
            cursor: 0,
            data_lock: false,
        };
        trim.reset(target);
        trim
    }

    /// Averages back to target; counts, integrals and corrections to zero.
    pub fn reset(&mut self, target: &Map) {
        self.averages = *target;
        self.filter_prev = *target;
        self.samples = EMPTY;
        self.cumulative_error = EMPTY;
        self.correction = EMPTY;
    }

    /// Loads saved averages and sample counts. On failure the reset values
    /// stay in place.
    ///
    /// # Errors
    ///
    /// Propagates the storage failure.
    pub fn restore<S: Storage + ?Sized>(&mut self, storage: &mut S) -> Result<(), StorageError> {
        let mut bytes = [0u8; PERSISTED_LEN];
        storage.restore_block(AFR_DATA_ADDRESS, &mut bytes)?;
        let (averages, samples) = bytes.split_at(CELLS * 4);
        read_map(&mut self.averages, averages);
        read_map(&mut self.samples, samples);
        Ok(())
    }

    /// Writes averages and sample counts.
    ///
    /// # Errors
    ///
    /// Propagates the storage failure.
    pub fn persist<S: Storage + ?Sized>(&self, storage: &mut S) -> Result<(), StorageError> {
        let mut bytes = [0u8; PERSISTED_LEN];
        let (averages, samples) = bytes.split_at_mut(CELLS * 4);
        write_map(&self.averages, averages);
        write_map(&self.samples, samples);
        storage.persist_block(AFR_DATA_ADDRESS, &bytes)
    }

    /// Host-requested reset. Persists the cleared data when storage is
    /// present; succeeds without writing otherwise.
    ///
    /// # Errors
    ///
    /// Propagates the storage failure.
    pub fn reset_and_persist<S: Storage + ?Sized>(
        &mut self,
        target: &Map,
        storage: &mut S,
        storage_available: bool,
    ) -> Result<(), StorageError> {
        self.reset(target);
        if storage_available {
            self.persist(storage)
        } else {
            Ok(())
        }
    }

    /// Updates the current cell. Returns whether closed-loop control is
    /// active, i.e. the engine is warm and running.
    pub fn compute_correction(
        &mut self,
        target: &Map,
        p1: &Parameters1,
        rpm: f32,
        engine_temp: f32,
        cell: CurrentCell,
        lambda_mv: f32,
    ) -> bool {
        if !is_warm_and_running(p1, rpm, engine_temp) {
            return false;
        }
        let (l, r) = (cell.load_index, cell.rpm_index);

        if !self.data_lock {
            let previous = self.filter_prev[l][r];
            let average = p1.afr_averaging_filter_tc * (lambda_mv - previous) + previous;
            self.averages[l][r] = average;
            self.filter_prev[l][r] = average;
            self.samples[l][r] += 0.01;
        }

        let error = target[l][r] - lambda_mv;
        let integral = limit(
            self.cumulative_error[l][r] + 0.001 * error,
            -CUMULATIVE_ERROR_LIMIT,
            CUMULATIVE_ERROR_LIMIT,
        );
        self.cumulative_error[l][r] = integral;
        self.correction[l][r] =
            p1.afr_correction_gain_p * error + p1.afr_correction_gain_i * integral;
        true
    }

    /// Counts one save-period tick; returns `true` when a save is due.
    pub fn save_due(
        &mut self,
        p1: &Parameters1,
        rpm: f32,
        engine_temp: f32,
        storage_available: bool,
    ) -> bool {
        if !storage_available
            || !is_warm_and_running(p1, rpm, engine_temp)
            || self.save_period <= 0
        {
            return false;
        }
        self.save_counter += 1;
        if self.save_counter >= self.save_period {
            self.save_counter = 0;
            true
        } else {
            false
        }
    }

    /// Reports one cell and moves the cursor on, wrapping after the last.
    pub fn next_sample(&mut self) -> AfrSample {
        let cell = CurrentCell::from_flat(self.cursor);
        let (l, r) = (cell.load_index, cell.rpm_index);
        let sample = AfrSample {
            correction: self.correction[l][r],
            average: self.averages[l][r],
            samples: self.samples[l][r],
            index: self.cursor,
        };
        self.cursor = (self.cursor + 1) % CELLS;
        sample
    }

    #[must_use]
    pub const fn correction(&self) -> &Map {
        &self.correction
    }

    #[must_use]
    pub const fn averages(&self) -> &Map {
        &self.averages
    }

    #[must_use]
    pub const fn samples(&self) -> &Map {
        &self.samples
    }

    #[must_use]
    pub fn cumulative_error(&self, cell: CurrentCell) -> f32 {
        self.cumulative_error[cell.load_index][cell.rpm_index]
    }

    #[must_use]
    pub const fn save_period(&self) -> i32 {
        self.save_period
    }

    /// Holds the averages and sample counts while an external save runs.
    pub fn set_data_lock(&mut self, locked: bool) {
        self.data_lock = locked;
    }

    #[must_use]
    pub const fn is_locked(&self) -> bool {
        self.data_lock
    }
}

fn is_warm_and_running(p1: &Parameters1, rpm: f32, engine_temp: f32) -> bool {
    engine_temp > p1.eng_temp_comp_t2 && rpm > p1.cranking_threshold
}

fn write_map(map: &Map, out: &mut [u8]) {
    for (chunk, value) in out.chunks_exact_mut(4).zip(map.iter().flatten()) {
        chunk.copy_from_slice(&value.to_le_bytes());
    }
}

fn read_map(map: &mut Map, bytes: &[u8]) {
    for (cell, chunk) in map.iter_mut().flatten().zip(bytes.chunks_exact(4)) {
        *cell = f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
    }
}
