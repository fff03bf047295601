//! One-shot output timers on top of embassy-time.
//!
//! Each [`TimerChannel`] has a task waiting on a signal. Arming a channel
//! replaces whatever it had pending; the task then sleeps until the fire
//! time, applies the fire action, sleeps for the duration and applies the
//! expiry action.

use ecu_core::io::{OutputAction, OutputDriver, TimerChannel};
use embassy_futures::select::{Either, select};
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::signal::Signal;
use embassy_time::{Duration, Instant, Timer};

use crate::board::SharedOutputs;

pub const CHANNELS: [TimerChannel; 3] = [
    TimerChannel::InjectionA,
    TimerChannel::InjectionB,
    TimerChannel::Ignition,
];

#[derive(Copy, Clone)]
struct Armed {
    fire_at: Instant,
    duration: Duration,
    on_fire: Option<OutputAction>,
    on_expire: OutputAction,
}

static ARMED: [Signal<CriticalSectionRawMutex, Armed>; 3] =
    [Signal::new(), Signal::new(), Signal::new()];

const fn slot(channel: TimerChannel) -> usize {
    match channel {
        TimerChannel::InjectionA => 0,
        TimerChannel::InjectionB => 1,
        TimerChannel::Ignition => 2,
    }
}

/// Arms `channel` relative to now.
pub fn arm(
    channel: TimerChannel,
    delay_us: u32,
    duration_us: u32,
    on_fire: Option<OutputAction>,
    on_expire: OutputAction,
) {
    ARMED[slot(channel)].signal(Armed {
        fire_at: Instant::now() + Duration::from_micros(u64::from(delay_us)),
        duration: Duration::from_micros(u64::from(duration_us)),
        on_fire,
        on_expire,
    });
}

#[embassy_executor::task(pool_size = 3)]
pub async fn run(channel: TimerChannel) -> ! {
    let signal = &ARMED[slot(channel)];
    let mut outputs = SharedOutputs;
    let mut next = signal.wait().await;
    loop {
        let armed = next;
        if let Either::Second(rearmed) = select(Timer::at(armed.fire_at), signal.wait()).await {
            next = rearmed;
            continue;
        }
        if let Some(action) = armed.on_fire {
            outputs.apply(action);
        }

        let expire_at = armed.fire_at + armed.duration;
        if let Either::Second(rearmed) = select(Timer::at(expire_at), signal.wait()).await {
            next = rearmed;
            continue;
        }
        outputs.apply(armed.on_expire);
        next = signal.wait().await;
    }
}
