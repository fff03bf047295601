//! Trigger-wheel phase tracker.
//!
//! Runs once per crank tooth edge at the highest interrupt priority. It
//! counts teeth, finds the gap left by the missing teeth, keeps a filtered
//! tooth period and turns the latest published pulse width and advance into
//! output events at the right teeth. Sync trouble is counted, never raised.

#![allow(
    clippy::cast_possible_truncation,
    clippy::cast_possible_wrap,
    clippy::cast_precision_loss,
    clippy::cast_sign_loss
)]

pub mod shared;
pub mod timing;

pub use shared::CrankShared;
pub use timing::TimingPlan;

use crate::config::ConfigPage;
use crate::io::{
    CrankIo, INJECTORS, InjectorTarget, Level, OutputAction, OutputDriver, TimerChannel,
};
use crate::sequencer::{EventSequencer, OutputLayout, Stroke, power_reset};

/// Largest accepted filter shift.
const MAX_FILTER_SHIFT: u32 = 16;

/// Wheel geometry and output settings, taken from the configuration page.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct TriggerSettings {
    pub teeth: i32,
    pub missing_teeth: i32,
    /// Angle from the first missing tooth to TDC, degrees.
    pub tdc_angle: f32,
    /// Injector opening angle before TDC, degrees.
    pub injector_angle: f32,
    pub dwell_ms: f32,
    pub cranking_threshold: f32,
    /// Period filter time constant as a power of two.
    pub filter_shift: u32,
    pub coil_on: Level,
    /// 1-based injector for each sequence position.
    pub injector_sequence: [i32; INJECTORS],
    pub sequence_reset: i32,
    pub layout: OutputLayout,
}

impl TriggerSettings {
    #[must_use]
    pub fn from_page(page: &ConfigPage, layout: OutputLayout) -> Self {
        let p2 = &page.p2;
        Self {
            teeth: p2.tw_teeth.max(2),
            missing_teeth: p2.tw_missing_teeth.max(0),
            tdc_angle: p2.tw_tdc_angle,
            injector_angle: p2.injector_start_angle,
            dwell_ms: p2.ignition_dwell,
            cranking_threshold: page.p1.cranking_threshold,
            filter_shift: page.filters.crank_pulse_shift.clamp(0, MAX_FILTER_SHIFT as i32) as u32,
            coil_on: if p2.ignition_firing_sense > 0 {
                Level::High
            } else {
                Level::Low
            },
            injector_sequence: [
                p2.injector_index0,
                p2.injector_index1,
                p2.injector_index2,
                p2.injector_index3,
            ],
            sequence_reset: p2.injector_sequence_reset,
            layout,
        }
    }
}

/// Engine speed for a tooth period on a `teeth` tooth wheel.
#[must_use]
pub fn rpm_from_period(period_us: i32, teeth: i32) -> f32 {
    if period_us <= 0 || teeth <= 0 {
        return 0.0;
    }
    60_000_000.0 / teeth as f32 / period_us as f32
}

pub struct PhaseTracker {
    settings: TriggerSettings,
    sequencer: EventSequencer,
    half: i32,
    injector_vernier: f32,
    plan: TimingPlan,
    tooth: i32,
    raw_period: i32,
    filter_acc: i64,
    filtered: i32,
    prev_filtered: i32,
    estimate: i32,
}

impl PhaseTracker {
    /// Builds a tracker without touching any output. Call
    /// [`Self::configure`] once the outputs are available.
    #[must_use]
    pub fn new(settings: TriggerSettings) -> Self {
        let mut tracker = Self {
            settings,
            sequencer: sequencer_for(&settings),
            half: settings.teeth / 2,
            injector_vernier: 0.0,
            plan: TimingPlan::INITIAL,
            tooth: 0,
            raw_period: shared::INITIAL_PERIOD_US,
            filter_acc: 0,
            filtered: shared::INITIAL_PERIOD_US,
            prev_filtered: 0,
            estimate: 0,
        };
        tracker.set_injection_angle();
        tracker
    }

    /// Applies new settings: every output is released, the injector
    /// sequence and polarity are reloaded and the error counters clear.
    pub fn configure<D: OutputDriver + ?Sized>(
        &mut self,
        settings: TriggerSettings,
        shared: &CrankShared,
        outputs: &mut D,
    ) {
        power_reset(outputs, settings.coil_on.inverted());
        self.settings = settings;
        self.sequencer = sequencer_for(&settings);
        self.half = settings.teeth / 2;
        self.set_injection_angle();
        shared.clear_errors();
    }

    /// Handles one tooth edge, `period_us` after the previous one.
    pub fn handle_crank_pulse<IO: CrankIo + ?Sized>(
        &mut self,
        period_us: u32,
        shared: &CrankShared,
        io: &mut IO,
    ) {
        if let Some(settings) = shared.take_settings() {
            self.configure(settings, shared, io);
        }

        let teeth = self.settings.teeth;
        self.tooth += 1;

        if self.tooth == teeth || self.tooth == self.half {
            self.commit_timing(shared);
        }
        if self.tooth == teeth {
            self.sequencer.apply_reset_policy(|| io.take_camshaft_sync());
        }

        let period = i32::try_from(period_us).unwrap_or(i32::MAX);
        let estimate = i64::from(self.estimate);
        if self.tooth > self.half && i64::from(period) > estimate + (estimate >> 1) {
            if self.tooth == teeth {
                shared.note_in_sync();
            } else {
                shared.note_sync_error(self.tooth);
            }
            self.tooth = self.settings.missing_teeth;
        } else {
            self.raw_period = period;
        }

        if shared.in_sync() > 0 {
            self.fire_events(shared, io);
        }

        self.step_filter(shared);
    }

    #[must_use]
    pub const fn tooth(&self) -> i32 {
        self.tooth
    }

    #[must_use]
    pub const fn settings(&self) -> &TriggerSettings {
        &self.settings
    }

    #[must_use]
    pub const fn plan(&self) -> &TimingPlan {
        &self.plan
    }

    #[must_use]
    pub const fn sequencer(&self) -> &EventSequencer {
        &self.sequencer
    }

    /// Filtered tooth period, µs.
    #[must_use]
    pub const fn filtered_period_us(&self) -> i32 {
        self.filtered
    }

    /// Expected period of the next tooth, µs.
    #[must_use]
    pub const fn period_estimate_us(&self) -> i32 {
        self.estimate
    }

    fn set_injection_angle(&mut self) {
        let (index, vernier) = timing::angle_to_index(
            self.settings.tdc_angle - self.settings.injector_angle,
            self.settings.teeth,
        );
        self.injector_vernier = vernier;
        self.plan.injector_index1 = index;
        self.plan.injector_index2 = index + self.half;
    }

    fn commit_timing(&mut self, shared: &CrankShared) {
        let teeth = self.settings.teeth;
        let pulse_width = shared.pulse_width_us();
        self.plan.injector_pw_us = if pulse_width > 0.0 {
            pulse_width as u32
        } else {
            0
        };
        self.plan.injector_delay_us = timing::vernier_delay(self.filtered, self.injector_vernier);

        let (fire, vernier) =
            timing::angle_to_index(self.settings.tdc_angle - shared.advance(), teeth);
        self.plan.fire_index1 = fire;
        self.plan.fire_index2 = fire + self.half;
        self.plan.ignition_delay_us = timing::vernier_delay(self.filtered, vernier);

        let dwell = timing::dwell_teeth(shared.rpm(), teeth, self.settings.dwell_ms);
        let (dwell1, dwell2) = timing::dwell_indexes(fire, dwell, teeth);
        self.plan.dwell_index1 = dwell1;
        self.plan.dwell_index2 = dwell2;
    }

    fn fire_events<IO: CrankIo + ?Sized>(&mut self, shared: &CrankShared, io: &mut IO) {
        let tooth = self.tooth;
        let plan = self.plan;
        let cranking = shared.rpm() <= self.settings.cranking_threshold;
        let bank_high = io.bank_select();

        for (index, stroke) in [
            (plan.injector_index1, Stroke::Tdc),
            (plan.injector_index2, Stroke::Tdc180),
        ] {
            if tooth == index {
                let (channel, target) = self.sequencer.injection(stroke, bank_high, cranking);
                schedule_injection(io, channel, target, &plan);
            }
        }

        let coil_on = self.sequencer.coil_on();
        if tooth == plan.dwell_index1 {
            io.set_coil(self.sequencer.coil(Stroke::Tdc, bank_high), coil_on);
        }
        if tooth == plan.dwell_index2 {
            io.set_coil(self.sequencer.coil(Stroke::Tdc180, bank_high), coil_on);
        }

        for (index, stroke) in [
            (plan.fire_index1, Stroke::Tdc),
            (plan.fire_index2, Stroke::Tdc180),
        ] {
            if tooth == index {
                io.schedule_one_shot(
                    TimerChannel::Ignition,
                    plan.ignition_delay_us,
                    0,
                    None,
                    OutputAction::Coil {
                        coil: self.sequencer.coil(stroke, bank_high),
                        level: self.sequencer.coil_off(),
                    },
                );
            }
        }
    }

    fn step_filter(&mut self, shared: &CrankShared) {
        let shift = self.settings.filter_shift;
        let scaled = i64::from(self.raw_period) << shift;
        self.filter_acc += (scaled - self.filter_acc) >> shift;
        self.filtered = (self.filter_acc >> shift) as i32;
        self.estimate = 2 * self.filtered - self.prev_filtered;
        self.prev_filtered = self.filtered;
        shared.set_filtered_period_us(self.filtered);
    }
}

fn sequencer_for(settings: &TriggerSettings) -> EventSequencer {
    EventSequencer::new(
        settings.layout,
        settings.injector_sequence,
        settings.sequence_reset,
        settings.coil_on,
    )
}

fn schedule_injection<IO: CrankIo + ?Sized>(
    io: &mut IO,
    channel: TimerChannel,
    target: InjectorTarget,
    plan: &TimingPlan,
) {
    io.schedule_one_shot(
        channel,
        plan.injector_delay_us,
        plan.injector_pw_us,
        Some(OutputAction::Injector { target, open: true }),
        OutputAction::Injector {
            target,
            open: false,
        },
    );
}

#[cfg(test)]
mod tests {
    use heapless::Vec as HeaplessVec;

    use super::*;
    use crate::config::defaults;
    use crate::io::{CrankInputs, OneShotTimers};

    type Scheduled = (TimerChannel, u32, u32, Option<OutputAction>, OutputAction);

    #[derive(Default)]
    struct Rig {
        scheduled: HeaplessVec<Scheduled, 64>,
        coils: [Option<Level>; 4],
        injectors: [bool; 4],
        bank_high: bool,
        camshaft: bool,
    }

    impl OneShotTimers for Rig {
        fn schedule_one_shot(
            &mut self,
            channel: TimerChannel,
            delay_us: u32,
            duration_us: u32,
            on_fire: Option<OutputAction>,
            on_expire: OutputAction,
        ) {
            self.scheduled
                .push((channel, delay_us, duration_us, on_fire, on_expire))
                .expect("schedule log capacity");
        }
    }

    impl OutputDriver for Rig {
        fn set_injector(&mut self, index: u8, open: bool) {
            self.injectors[usize::from(index)] = open;
        }

        fn set_coil(&mut self, index: u8, level: Level) {
            self.coils[usize::from(index)] = Some(level);
        }
    }

    impl CrankInputs for Rig {
        fn bank_select(&mut self) -> bool {
            self.bank_high
        }

        fn take_camshaft_sync(&mut self) -> bool {
            core::mem::take(&mut self.camshaft)
        }
    }

    fn settings() -> TriggerSettings {
        TriggerSettings::from_page(&defaults::PAGE, OutputLayout::BankSelected)
    }

    /// One revolution of a wheel with a single missing tooth.
    fn turn(tracker: &mut PhaseTracker, shared: &CrankShared, rig: &mut Rig, period: u32) {
        for _ in 1..tracker.settings().teeth - tracker.settings().missing_teeth {
            tracker.handle_crank_pulse(period, shared, rig);
        }
        tracker.handle_crank_pulse(period * 2, shared, rig);
    }

    /// Spins the wheel until the tracker sits just past the gap.
    fn lock_on(tracker: &mut PhaseTracker, shared: &CrankShared, rig: &mut Rig, period: u32) {
        for _ in 0..4 {
            turn(tracker, shared, rig, period);
        }
    }

    #[test]
    fn gap_on_the_last_tooth_counts_a_synced_revolution() {
        let shared = CrankShared::new();
        let mut tracker = PhaseTracker::new(settings());
        let mut rig = Rig::default();
        lock_on(&mut tracker, &shared, &mut rig, 5000);

        let synced = shared.in_sync();
        assert!(synced >= 2, "locked after a few turns, got {synced}");
        assert_eq!(tracker.tooth(), 1, "gap resets to the missing tooth count");
        assert!(
            (tracker.filtered_period_us() - 5000).abs() < 50,
            "gap periods stay out of the filter: {}",
            tracker.filtered_period_us()
        );
    }

    #[test]
    fn each_locked_revolution_adds_exactly_one_sync() {
        let shared = CrankShared::new();
        let mut tracker = PhaseTracker::new(settings());
        let mut rig = Rig::default();
        lock_on(&mut tracker, &shared, &mut rig, 5000);
        let synced = shared.in_sync();
        let errors = shared.sync_errors();

        for turns in 1..=12 {
            rig.scheduled.clear();
            turn(&mut tracker, &shared, &mut rig, 5000);
            assert_eq!(shared.in_sync(), synced + turns, "after {turns} turns");
            assert_eq!(shared.sync_errors(), errors, "after {turns} turns");
            assert_eq!(tracker.tooth(), 1);
        }
    }

    #[test]
    fn early_gap_is_a_sync_error() {
        let shared = CrankShared::new();
        let mut tracker = PhaseTracker::new(settings());
        let mut rig = Rig::default();
        lock_on(&mut tracker, &shared, &mut rig, 5000);
        let synced = shared.in_sync();
        let errors = shared.sync_errors();

        for _ in 0..25 {
            tracker.handle_crank_pulse(5000, &shared, &mut rig);
        }
        tracker.handle_crank_pulse(10_000, &shared, &mut rig);

        assert_eq!(shared.sync_errors(), errors + 1);
        assert_eq!(shared.error_tooth(), 27);
        assert_eq!(shared.in_sync(), synced);
        assert_eq!(tracker.tooth(), 1);
    }

    #[test]
    fn tdc_commit_uses_published_values() {
        let shared = CrankShared::new();
        let mut tracker = PhaseTracker::new(settings());
        let mut rig = Rig::default();
        lock_on(&mut tracker, &shared, &mut rig, 5000);
        shared.publish(4200.0, 10.0, 1000.0);

        while tracker.tooth() != tracker.settings().teeth / 2 {
            tracker.handle_crank_pulse(5000, &shared, &mut rig);
        }
        let plan = *tracker.plan();
        assert_eq!(plan.injector_pw_us, 4200);
        // (138 - 10) * 36 / 360 = 12.8
        assert_eq!(plan.fire_index1, 12);
        assert_eq!(plan.fire_index2, 30);
        assert!((3990..=4010).contains(&plan.ignition_delay_us));
        // 1000 rpm, 4 ms: 2.4 teeth
        assert_eq!((plan.dwell_index1, plan.dwell_index2), (10, 28));
        // (138 - 15) * 36 / 360 = 12.3
        assert_eq!((plan.injector_index1, plan.injector_index2), (12, 30));
    }

    #[test]
    fn events_follow_the_bank_pin() {
        let shared = CrankShared::new();
        let mut tracker = PhaseTracker::new(settings());
        let mut rig = Rig {
            bank_high: true,
            ..Rig::default()
        };
        lock_on(&mut tracker, &shared, &mut rig, 5000);
        shared.publish(3000.0, 10.0, 1000.0);
        turn(&mut tracker, &shared, &mut rig, 5000);
        rig.scheduled.clear();

        turn(&mut tracker, &shared, &mut rig, 5000);
        let injections: HeaplessVec<(TimerChannel, InjectorTarget), 4> = rig
            .scheduled
            .iter()
            .filter_map(|entry| match entry.4 {
                OutputAction::Injector { target, .. } => Some((entry.0, target)),
                OutputAction::Coil { .. } => None,
            })
            .collect();
        assert_eq!(
            injections.as_slice(),
            &[
                (TimerChannel::InjectionA, InjectorTarget::One(0)),
                (TimerChannel::InjectionB, InjectorTarget::One(2)),
            ]
        );
        let sparks = rig
            .scheduled
            .iter()
            .filter(|entry| entry.0 == TimerChannel::Ignition)
            .count();
        assert_eq!(sparks, 2);
        assert_eq!(
            rig.coils[0],
            Some(tracker.sequencer().coil_on()),
            "coil 0 dwelling until the spark timer runs"
        );
    }

    #[test]
    fn reconfigure_releases_outputs_and_clears_errors() {
        let shared = CrankShared::new();
        let mut tracker = PhaseTracker::new(settings());
        let mut rig = Rig {
            injectors: [true; 4],
            ..Rig::default()
        };
        shared.note_sync_error(9);

        let mut page = defaults::PAGE;
        page.p2.ignition_firing_sense = 1;
        shared.offer_settings(TriggerSettings::from_page(&page, OutputLayout::BankSelected));
        tracker.handle_crank_pulse(5000, &shared, &mut rig);

        assert_eq!(rig.injectors, [false; 4]);
        assert_eq!(rig.coils, [Some(Level::Low); 4], "plain coils rest low");
        assert_eq!(shared.sync_errors(), 0);
        assert_eq!(shared.error_tooth(), 0);
        assert_eq!(tracker.sequencer().coil_on(), Level::High);
    }

    #[test]
    fn speed_from_period() {
        assert!((rpm_from_period(10_000, 36) - 166.666_67).abs() < 1e-2);
        assert!(rpm_from_period(0, 36).abs() < f32::EPSILON);
    }
}
