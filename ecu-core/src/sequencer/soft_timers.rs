//! One-shot timers driven by an explicit microsecond clock.
//!
//! Used wherever there is no hardware timer behind the outputs: the emulator
//! and the integration tests advance time by hand and collect the output
//! changes as they fall due.

use crate::io::{OneShotTimers, OutputAction, OutputDriver, TimerChannel};

const CHANNELS: usize = 3;

#[derive(Copy, Clone, Debug)]
struct Pending {
    fire_at: u64,
    expire_at: u64,
    on_fire: Option<OutputAction>,
    on_expire: OutputAction,
    fired: bool,
}

impl Pending {
    const fn next_due(&self) -> u64 {
        if self.fired { self.expire_at } else { self.fire_at }
    }
}

#[derive(Clone, Debug, Default)]
pub struct SoftTimers {
    now_us: u64,
    slots: [Option<Pending>; CHANNELS],
}

impl SoftTimers {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            now_us: 0,
            slots: [None; CHANNELS],
        }
    }

    #[must_use]
    pub const fn now_us(&self) -> u64 {
        self.now_us
    }

    #[must_use]
    pub fn is_pending(&self, channel: TimerChannel) -> bool {
        self.slots[slot(channel)].is_some()
    }

    /// Moves the clock forward by `delta_us`, applying every action that
    /// falls due in time order.
    pub fn advance<D: OutputDriver + ?Sized>(&mut self, delta_us: u32, driver: &mut D) {
        let until = self.now_us + u64::from(delta_us);
        while let Some(index) = self.earliest_due(until) {
            let Some(pending) = self.slots[index].as_mut() else {
                break;
            };
            if pending.fired {
                self.now_us = self.now_us.max(pending.expire_at);
                let action = pending.on_expire;
                self.slots[index] = None;
                driver.apply(action);
            } else {
                self.now_us = self.now_us.max(pending.fire_at);
                pending.fired = true;
                if let Some(action) = pending.on_fire {
                    driver.apply(action);
                }
            }
        }
        self.now_us = until;
    }

    fn earliest_due(&self, until: u64) -> Option<usize> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| slot.map(|pending| (index, pending.next_due())))
            .filter(|&(_, due)| due <= until)
            .min_by_key(|&(_, due)| due)
            .map(|(index, _)| index)
    }
}

impl OneShotTimers for SoftTimers {
    fn schedule_one_shot(
        &mut self,
        channel: TimerChannel,
        delay_us: u32,
        duration_us: u32,
        on_fire: Option<OutputAction>,
        on_expire: OutputAction,
    ) {
        let fire_at = self.now_us + u64::from(delay_us);
        self.slots[slot(channel)] = Some(Pending {
            fire_at,
            expire_at: fire_at + u64::from(duration_us),
            on_fire,
            on_expire,
            fired: false,
        });
    }
}

const fn slot(channel: TimerChannel) -> usize {
    match channel {
        TimerChannel::InjectionA => 0,
        TimerChannel::InjectionB => 1,
        TimerChannel::Ignition => 2,
    }
}
