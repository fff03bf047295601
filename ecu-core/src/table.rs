//! 8x8 calibration tables and bilinear interpolation.
//!
//! Rows are load cells, columns are RPM cells. [`MapLookup::lookup`] must run
//! once per cycle before any [`MapLookup::interpolate`] call; it caches the
//! enclosing cell corners so several maps can be read at the same operating
//! point.

#![allow(
    clippy::cast_possible_truncation,
    clippy::cast_precision_loss,
    clippy::cast_sign_loss
)]

use libm::{roundf, truncf};

use crate::fuel::range;

pub const RPM_CELLS: usize = 8;
pub const LOAD_CELLS: usize = 8;

/// A calibration table indexed `[load][rpm]`.
pub type Map = [[f32; RPM_CELLS]; LOAD_CELLS];

/// Axis geometry: first breakpoint and spacing.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Axis {
    pub start: f32,
    pub delta: f32,
}

impl Axis {
    #[must_use]
    pub const fn new(start: f32, delta: f32) -> Self {
        Self { start, delta }
    }

    fn end(self, cells: usize) -> f32 {
        self.start + (cells - 1) as f32 * self.delta
    }
}

/// Cell nearest the operating point, by rounding to the axis centres.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct CurrentCell {
    pub load_index: usize,
    pub rpm_index: usize,
}

impl CurrentCell {
    /// Flattened index, `load * RPM_CELLS + rpm`.
    #[must_use]
    pub const fn flat(self) -> usize {
        self.load_index * RPM_CELLS + self.rpm_index
    }

    #[must_use]
    pub const fn from_flat(index: usize) -> Self {
        Self {
            load_index: (index / RPM_CELLS) % LOAD_CELLS,
            rpm_index: index % RPM_CELLS,
        }
    }
}

/// Cached state from the most recent [`MapLookup::lookup`].
#[derive(Clone, Debug)]
pub struct MapLookup {
    rpm_axis: Axis,
    load_axis: Axis,
    rpm_reciprocal: f32,
    load_reciprocal: f32,
    current: CurrentCell,
    r1: usize,
    r2: usize,
    l1: usize,
    l2: usize,
    rel_rpm: f32,
    rel_load: f32,
}

impl MapLookup {
    /// Builds a lookup for the given axes. Deltas must be nonzero; a
    /// reversed or non-finite axis gives a meaningless result but never traps.
    #[must_use]
    pub fn new(rpm_axis: Axis, load_axis: Axis) -> Self {
        Self {
            rpm_axis,
            load_axis,
            rpm_reciprocal: 1.0 / rpm_axis.delta,
            load_reciprocal: 1.0 / load_axis.delta,
            current: CurrentCell::default(),
            r1: 0,
            r2: 1,
            l1: 0,
            l2: 1,
            rel_rpm: 0.0,
            rel_load: 0.0,
        }
    }

    /// Selects the cell and interpolation corners for an operating point.
    pub fn lookup(&mut self, rpm: f32, load: f32) {
        let rpm = range(rpm, self.rpm_axis.start, self.rpm_axis.end(RPM_CELLS));
        let load = range(load, self.load_axis.start, self.load_axis.end(LOAD_CELLS));

        let temp_r = (rpm - self.rpm_axis.start) * self.rpm_reciprocal;
        let temp_l = (load - self.load_axis.start) * self.load_reciprocal;

        self.current = CurrentCell {
            load_index: clamp_index(roundf(temp_l), LOAD_CELLS),
            rpm_index: clamp_index(roundf(temp_r), RPM_CELLS),
        };

        let (r1, r2) = lower_pair(clamp_index(truncf(temp_r), RPM_CELLS), RPM_CELLS);
        let (l1, l2) = lower_pair(clamp_index(truncf(temp_l), LOAD_CELLS), LOAD_CELLS);
        self.r1 = r1;
        self.r2 = r2;
        self.l1 = l1;
        self.l2 = l2;

        self.rel_rpm = rpm - (self.rpm_axis.start + r1 as f32 * self.rpm_axis.delta);
        self.rel_load = load - (self.load_axis.start + l1 as f32 * self.load_axis.delta);
    }

    /// Interpolates `map` at the point given to the last [`Self::lookup`].
    #[must_use]
    pub fn interpolate(&self, map: &Map) -> f32 {
        find_height(
            self.rel_rpm,
            self.rel_load,
            self.rpm_reciprocal,
            self.load_reciprocal,
            [
                map[self.l1][self.r1],
                map[self.l1][self.r2],
                map[self.l2][self.r1],
                map[self.l2][self.r2],
            ],
        )
    }

    #[must_use]
    pub const fn current_cell(&self) -> CurrentCell {
        self.current
    }
}

/// Height of a point inside a rectangle from its four corner heights.
///
/// `x` and `y` are distances along the width and depth; the reciprocals are
/// the inverse edge lengths. Corners are ordered near-left, near-right,
/// far-left, far-right.
#[must_use]
pub fn find_height(x: f32, y: f32, width_recip: f32, depth_recip: f32, h: [f32; 4]) -> f32 {
    let x_d = x * width_recip;
    let h12 = x_d * (h[1] - h[0]) + h[0];
    let h34 = x_d * (h[3] - h[2]) + h[2];
    y * depth_recip * (h34 - h12) + h12
}

fn clamp_index(value: f32, cells: usize) -> usize {
    if value <= 0.0 {
        0
    } else {
        (value as usize).min(cells - 1)
    }
}

fn lower_pair(index: usize, cells: usize) -> (usize, usize) {
    let low = if index <= cells - 2 { index } else { index - 1 };
    (low, low + 1)
}
