//! Compiled-in calibration used until a stored configuration is restored.
//!
//! Values come from a Mini fitted with a Nissan CR14DE engine.

use crate::table::Map;

use super::blocks::{Filters, Parameters1, Parameters2};
use super::ConfigPage;

pub const VE_MAP: Map = [
    [43.9, 45.0, 45.5, 46.7, 45.4, 41.6, 32.9, 30.7],
    [48.0, 49.1, 50.9, 53.9, 57.9, 57.8, 47.6, 43.4],
    [52.0, 55.9, 57.2, 59.8, 62.4, 64.9, 60.4, 57.5],
    [58.0, 63.3, 61.8, 63.8, 65.5, 69.4, 68.3, 64.8],
    [65.0, 67.5, 65.6, 67.3, 71.1, 75.1, 74.5, 70.0],
    [70.0, 72.9, 71.6, 72.1, 74.0, 78.4, 79.4, 77.8],
    [75.0, 76.1, 74.7, 75.1, 77.1, 83.4, 86.6, 86.4],
    [80.7, 80.4, 80.1, 80.6, 81.6, 87.2, 90.3, 89.4],
];

pub const IGNITION_MAP: Map = [
    [2.0, 5.0, 22.5, 28.8, 29.8, 30.8, 31.8, 32.8],
    [5.0, 10.0, 21.7, 27.5, 28.7, 30.0, 31.2, 32.4],
    [10.0, 15.4, 20.8, 26.3, 27.7, 29.1, 30.6, 32.0],
    [10.0, 15.0, 20.0, 25.0, 26.7, 28.3, 30.0, 31.6],
    [10.0, 14.6, 19.2, 23.8, 25.6, 27.5, 29.3, 31.2],
    [10.0, 14.2, 18.3, 22.5, 24.6, 26.7, 28.7, 30.8],
    [10.0, 13.8, 17.5, 21.3, 23.5, 25.8, 28.1, 30.4],
    [10.0, 13.3, 16.7, 20.0, 22.5, 25.0, 27.5, 30.0],
];

/// Target lambda sensor output in millivolts.
pub const TARGET_AFR_MAP: Map = [
    [480.0, 480.0, 480.0, 480.0, 480.0, 480.0, 480.0, 480.0],
    [482.0, 484.0, 486.0, 488.0, 490.0, 492.0, 494.0, 497.0],
    [484.0, 488.0, 492.0, 496.0, 500.0, 504.0, 508.0, 514.0],
    [486.0, 492.0, 498.0, 504.0, 510.0, 516.0, 522.0, 531.0],
    [488.0, 496.0, 504.0, 512.0, 520.0, 528.0, 536.0, 548.0],
    [490.0, 500.0, 510.0, 520.0, 530.0, 540.0, 550.0, 565.0],
    [492.0, 504.0, 516.0, 528.0, 540.0, 552.0, 564.0, 582.0],
    [500.0, 514.0, 528.0, 542.0, 556.0, 570.0, 584.0, 600.0],
];

pub const PAGE: ConfigPage = ConfigPage {
    filters: Filters::DEFAULT,
    p1: Parameters1::DEFAULT,
    p2: Parameters2::DEFAULT,
    ve_map: VE_MAP,
    ignition_map: IGNITION_MAP,
    target_afr_map: TARGET_AFR_MAP,
};
