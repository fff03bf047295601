//! State exchanged between the crank pulse handler and the periodic tasks.
//!
//! Every field is a lone atomic, so neither side ever blocks the other. The
//! one exception is the settings handoff, which is written from task context
//! inside a short critical section and taken by the next crank pulse.

use core::cell::Cell;

use critical_section::Mutex;
use portable_atomic::{AtomicBool, AtomicF32, AtomicI32, AtomicU32, Ordering};

use super::TriggerSettings;

/// Filtered period before the first tooth is seen, µs.
pub const INITIAL_PERIOD_US: i32 = 1_000_000;

pub struct CrankShared {
    in_sync: AtomicU32,
    filtered_period: AtomicI32,
    sync_errors: AtomicU32,
    error_tooth: AtomicI32,
    pulse_width_us: AtomicF32,
    advance: AtomicF32,
    rpm: AtomicF32,
    camshaft_sync: AtomicBool,
    pending_settings: Mutex<Cell<Option<TriggerSettings>>>,
}

impl CrankShared {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            in_sync: AtomicU32::new(0),
            filtered_period: AtomicI32::new(INITIAL_PERIOD_US),
            sync_errors: AtomicU32::new(0),
            error_tooth: AtomicI32::new(0),
            pulse_width_us: AtomicF32::new(2000.0),
            advance: AtomicF32::new(0.0),
            rpm: AtomicF32::new(0.0),
            camshaft_sync: AtomicBool::new(false),
            pending_settings: Mutex::new(Cell::new(None)),
        }
    }

    /// Completed revolutions with the gap on the expected tooth.
    #[must_use]
    pub fn in_sync(&self) -> u32 {
        self.in_sync.load(Ordering::Acquire)
    }

    pub(crate) fn note_in_sync(&self) {
        self.in_sync.fetch_add(1, Ordering::AcqRel);
    }

    #[must_use]
    pub fn filtered_period_us(&self) -> i32 {
        self.filtered_period.load(Ordering::Acquire)
    }

    pub(crate) fn set_filtered_period_us(&self, period: i32) {
        self.filtered_period.store(period, Ordering::Release);
    }

    #[must_use]
    pub fn sync_errors(&self) -> u32 {
        self.sync_errors.load(Ordering::Relaxed)
    }

    /// Tooth on which the most recent unexpected gap was seen.
    #[must_use]
    pub fn error_tooth(&self) -> i32 {
        self.error_tooth.load(Ordering::Relaxed)
    }

    pub(crate) fn note_sync_error(&self, tooth: i32) {
        self.error_tooth.store(tooth, Ordering::Relaxed);
        self.sync_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn clear_errors(&self) {
        self.error_tooth.store(0, Ordering::Relaxed);
        self.sync_errors.store(0, Ordering::Relaxed);
    }

    /// Drops sync after the crank has stopped turning.
    pub fn clear_sync(&self) {
        self.in_sync.store(0, Ordering::Release);
        self.sync_errors.store(0, Ordering::Relaxed);
        self.rpm.store(0.0, Ordering::Relaxed);
    }

    /// Publishes the task side's latest results for the next timing commit.
    pub fn publish(&self, pulse_width_us: f32, advance: f32, rpm: f32) {
        self.pulse_width_us.store(pulse_width_us, Ordering::Relaxed);
        self.advance.store(advance, Ordering::Relaxed);
        self.rpm.store(rpm, Ordering::Relaxed);
    }

    #[must_use]
    pub fn pulse_width_us(&self) -> f32 {
        self.pulse_width_us.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn advance(&self) -> f32 {
        self.advance.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn rpm(&self) -> f32 {
        self.rpm.load(Ordering::Relaxed)
    }

    /// Called from the camshaft sensor edge.
    pub fn signal_camshaft(&self) {
        self.camshaft_sync.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn take_camshaft_sync(&self) -> bool {
        self.camshaft_sync.swap(false, Ordering::AcqRel)
    }

    /// Queues new wheel settings for the crank handler.
    pub fn offer_settings(&self, settings: TriggerSettings) {
        critical_section::with(|cs| self.pending_settings.borrow(cs).set(Some(settings)));
    }

    pub(crate) fn take_settings(&self) -> Option<TriggerSettings> {
        critical_section::with(|cs| self.pending_settings.borrow(cs).take())
    }
}

impl Default for CrankShared {
    fn default() -> Self {
        Self::new()
    }
}
