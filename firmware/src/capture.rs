#![cfg_attr(not(target_os = "none"), allow(dead_code))]

//! Crank edge timing.
//!
//! TIM2 free-runs at 1 MHz and latches its count on every crank edge. The
//! period handed to the phase tracker is the wrapping difference between
//! consecutive latches.

/// Capture timer rate.
pub const CAPTURE_HZ: u32 = 1_000_000;

/// Turns free-running capture counts into tooth periods in µs.
#[derive(Debug, Default)]
pub struct EdgeTimer {
    last: Option<u32>,
    edges: u32,
}

impl EdgeTimer {
    pub const fn new() -> Self {
        Self {
            last: None,
            edges: 0,
        }
    }

    /// Records an edge latched at `count`. The first edge only starts the
    /// clock.
    pub fn period_us(&mut self, count: u32) -> Option<u32> {
        let period = self.last.map(|last| count.wrapping_sub(last));
        self.last = Some(count);
        self.edges = self.edges.wrapping_add(1);
        period
    }

    /// Edges seen since start.
    pub const fn edges(&self) -> u32 {
        self.edges
    }
}
