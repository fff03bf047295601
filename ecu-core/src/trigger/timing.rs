//! Angle and dwell arithmetic for the trigger wheel.
//!
//! Angles are measured from the first missing tooth. A tooth index is the
//! whole number of tooth spacings to the angle; the vernier is the remaining
//! fraction of a spacing, turned into a delay using the filtered period.

#![allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]

/// Converts `angle` to a tooth index and vernier for a `teeth` tooth wheel.
#[must_use]
pub fn angle_to_index(angle: f32, teeth: i32) -> (i32, f32) {
    let position = angle * teeth as f32 / 360.0;
    let index = position as i32;
    (index, position - index as f32)
}

/// Whole teeth swept during `dwell_ms` at `rpm`, never less than one.
#[must_use]
pub fn dwell_teeth(rpm: f32, teeth: i32, dwell_ms: f32) -> i32 {
    let swept = (rpm * (teeth as f32 / 60_000.0) * dwell_ms) as i32;
    swept.max(1)
}

/// Dwell-start teeth for the two firing events.
///
/// Tooth 0 is the gap, which never produces an edge, so an index landing
/// there moves to the last real tooth.
#[must_use]
pub fn dwell_indexes(fire1: i32, dwell_teeth: i32, teeth: i32) -> (i32, i32) {
    let mut index = fire1 - dwell_teeth;
    if index < 0 {
        index += teeth;
    }
    let first = if index == 0 { teeth - 1 } else { index };

    index += teeth / 2;
    if index >= teeth {
        index -= teeth;
    }
    let second = if index == 0 { teeth - 1 } else { index };
    (first, second)
}

/// Timing committed at TDC and TDC + 180, used until the next commit.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct TimingPlan {
    pub injector_index1: i32,
    pub injector_index2: i32,
    pub injector_delay_us: u32,
    pub injector_pw_us: u32,
    pub fire_index1: i32,
    pub fire_index2: i32,
    pub ignition_delay_us: u32,
    pub dwell_index1: i32,
    pub dwell_index2: i32,
}

impl TimingPlan {
    /// Plan in force before the first commit.
    pub const INITIAL: Self = Self {
        injector_index1: 0,
        injector_index2: 18,
        injector_delay_us: 1,
        injector_pw_us: 2000,
        fire_index1: 0,
        fire_index2: 0,
        ignition_delay_us: 1,
        dwell_index1: 0,
        dwell_index2: 0,
    };
}

impl Default for TimingPlan {
    fn default() -> Self {
        Self::INITIAL
    }
}

/// Converts a fraction of the filtered period to whole microseconds.
#[allow(clippy::cast_sign_loss)]
#[must_use]
pub fn vernier_delay(filtered_period_us: i32, vernier: f32) -> u32 {
    let delay = filtered_period_us as f32 * vernier;
    if delay > 0.0 { delay as u32 } else { 0 }
}
