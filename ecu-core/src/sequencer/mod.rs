//! Maps crank events onto physical injectors and coils.
//!
//! Events come in two strokes per revolution: near TDC and near TDC + 180.
//! Each stroke owns an injection timer so that an injector may stay open for
//! longer than half a revolution while the other stroke's injector is armed.

pub mod soft_timers;

pub use soft_timers::SoftTimers;

use crate::io::{INJECTORS, InjectorTarget, Level, OutputDriver, TimerChannel};

/// How events are routed to outputs.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum OutputLayout {
    /// Four injectors and four coils. The bank discriminator picks the
    /// cylinder pair for each stroke.
    #[default]
    BankSelected,
    /// Two wasted-spark coils; injectors follow the configured sequence.
    Sequenced,
}

/// Half revolution an event belongs to.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Stroke {
    Tdc,
    Tdc180,
}

impl Stroke {
    #[must_use]
    pub const fn injection_timer(self) -> TimerChannel {
        match self {
            Stroke::Tdc => TimerChannel::InjectionA,
            Stroke::Tdc180 => TimerChannel::InjectionB,
        }
    }
}

/// Injector channel order and coil polarity.
#[derive(Clone, Debug)]
pub struct EventSequencer {
    layout: OutputLayout,
    sequence: [u8; INJECTORS],
    sequence_reset: i32,
    position: usize,
    coil_on: Level,
}

impl EventSequencer {
    /// `sequence` entries are 1-based injector numbers. A `sequence_reset`
    /// above zero is the 1-based position restored on a camshaft pulse; zero
    /// or below is kept as given.
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    #[must_use]
    pub fn new(
        layout: OutputLayout,
        sequence: [i32; INJECTORS],
        sequence_reset: i32,
        coil_on: Level,
    ) -> Self {
        let top = INJECTORS as i32;
        Self {
            layout,
            sequence: sequence.map(|injector| (injector.clamp(1, top) - 1) as u8),
            sequence_reset: if sequence_reset > 0 {
                sequence_reset.clamp(1, top) - 1
            } else {
                sequence_reset
            },
            position: 0,
            coil_on,
        }
    }

    #[must_use]
    pub const fn layout(&self) -> OutputLayout {
        self.layout
    }

    /// Zero-based injector for each sequence position.
    #[must_use]
    pub const fn sequence(&self) -> [u8; INJECTORS] {
        self.sequence
    }

    #[must_use]
    pub const fn sequence_reset(&self) -> i32 {
        self.sequence_reset
    }

    #[must_use]
    pub const fn position(&self) -> usize {
        self.position
    }

    #[must_use]
    pub const fn coil_on(&self) -> Level {
        self.coil_on
    }

    #[must_use]
    pub const fn coil_off(&self) -> Level {
        self.coil_on.inverted()
    }

    /// Runs once per revolution at TDC. A negative reset value always returns
    /// to the first position; otherwise a pending camshaft pulse is consumed
    /// and moves to the configured position.
    #[allow(clippy::cast_sign_loss)]
    pub fn apply_reset_policy(&mut self, camshaft_pending: impl FnOnce() -> bool) {
        if self.sequence_reset < 0 {
            self.position = 0;
        } else if camshaft_pending() {
            self.position = self.sequence_reset as usize % INJECTORS;
        }
    }

    /// Picks the injection timer and injectors for `stroke` and advances the
    /// sequence. While cranking every injector opens together.
    pub fn injection(
        &mut self,
        stroke: Stroke,
        bank_high: bool,
        cranking: bool,
    ) -> (TimerChannel, InjectorTarget) {
        let injector = match self.layout {
            OutputLayout::BankSelected => Self::bank_output(stroke, bank_high),
            OutputLayout::Sequenced => self.sequence[self.position],
        };
        // Advances during cranking batch fire too, so the order carries on after start.
        self.position = (self.position + 1) % INJECTORS;
        let target = if cranking {
            InjectorTarget::All
        } else {
            InjectorTarget::One(injector)
        };
        (stroke.injection_timer(), target)
    }

    /// Coil dwelling and firing for `stroke`.
    #[must_use]
    pub const fn coil(&self, stroke: Stroke, bank_high: bool) -> u8 {
        match self.layout {
            OutputLayout::BankSelected => Self::bank_output(stroke, bank_high),
            OutputLayout::Sequenced => match stroke {
                Stroke::Tdc => 0,
                Stroke::Tdc180 => 1,
            },
        }
    }

    const fn bank_output(stroke: Stroke, bank_high: bool) -> u8 {
        match (stroke, bank_high) {
            (Stroke::Tdc, true) => 0,
            (Stroke::Tdc, false) => 3,
            (Stroke::Tdc180, true) => 2,
            (Stroke::Tdc180, false) => 1,
        }
    }
}

/// Closes every injector and releases every coil.
#[allow(clippy::cast_possible_truncation)]
pub fn power_reset<D: OutputDriver + ?Sized>(driver: &mut D, coil_off: Level) {
    for index in 0..INJECTORS as u8 {
        driver.set_injector(index, false);
        driver.set_coil(index, coil_off);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sequencer(layout: OutputLayout, reset: i32) -> EventSequencer {
        EventSequencer::new(layout, [1, 3, 4, 2], reset, Level::High)
    }

    #[test]
    fn sequence_entries_are_clamped_and_zero_based() {
        let seq = EventSequencer::new(OutputLayout::Sequenced, [0, 2, 9, 4], 7, Level::Low);
        assert_eq!(seq.sequence(), [0, 1, 3, 3]);
        assert_eq!(seq.sequence_reset(), 3);
        assert_eq!(seq.coil_off(), Level::High);

        let keep = EventSequencer::new(OutputLayout::Sequenced, [1, 2, 3, 4], -1, Level::High);
        assert_eq!(keep.sequence_reset(), -1);
    }

    #[test]
    fn bank_pin_selects_cylinder_pair() {
        let mut seq = sequencer(OutputLayout::BankSelected, -1);
        assert_eq!(
            seq.injection(Stroke::Tdc, true, false),
            (TimerChannel::InjectionA, InjectorTarget::One(0))
        );
        assert_eq!(
            seq.injection(Stroke::Tdc180, true, false),
            (TimerChannel::InjectionB, InjectorTarget::One(2))
        );
        assert_eq!(
            seq.injection(Stroke::Tdc, false, false).1,
            InjectorTarget::One(3)
        );
        assert_eq!(
            seq.injection(Stroke::Tdc180, false, false).1,
            InjectorTarget::One(1)
        );
        assert_eq!(seq.coil(Stroke::Tdc, false), 3);
        assert_eq!(seq.coil(Stroke::Tdc180, true), 2);
    }

    #[test]
    fn cranking_fires_every_injector() {
        let mut seq = sequencer(OutputLayout::Sequenced, -1);
        assert_eq!(
            seq.injection(Stroke::Tdc180, false, true),
            (TimerChannel::InjectionB, InjectorTarget::All)
        );
    }

    #[test]
    fn batch_fire_still_steps_the_sequence() {
        let mut seq = sequencer(OutputLayout::Sequenced, -1);
        for _ in 0..3 {
            assert_eq!(seq.injection(Stroke::Tdc, true, true).1, InjectorTarget::All);
        }
        assert_eq!(seq.position(), 3);
        assert_eq!(seq.injection(Stroke::Tdc, true, false).1, InjectorTarget::One(1));
        assert_eq!(seq.position(), 0);
    }

    #[test]
    fn sequenced_layout_walks_the_table() {
        let mut seq = sequencer(OutputLayout::Sequenced, -1);
        let order: [InjectorTarget; 5] =
            core::array::from_fn(|_| seq.injection(Stroke::Tdc, true, false).1);
        assert_eq!(
            order,
            [
                InjectorTarget::One(0),
                InjectorTarget::One(2),
                InjectorTarget::One(3),
                InjectorTarget::One(1),
                InjectorTarget::One(0),
            ]
        );
        assert_eq!(seq.coil(Stroke::Tdc180, true), 1);
    }

    #[test]
    fn reset_policy() {
        let mut seq = sequencer(OutputLayout::Sequenced, -1);
        let _ = seq.injection(Stroke::Tdc, true, false);
        seq.apply_reset_policy(|| panic!("camshaft is ignored when reset is negative"));
        assert_eq!(seq.position(), 0);

        let mut seq = sequencer(OutputLayout::Sequenced, 3);
        seq.apply_reset_policy(|| false);
        assert_eq!(seq.position(), 0, "no pulse, no change");
        seq.apply_reset_policy(|| true);
        assert_eq!(seq.position(), 2);
    }
}
