use ecu_core::engine::{HF_TASK, LF_TASK, VLF_TASK};
use embassy_time::Ticker;

use super::{EngineCell, TICK};

/// Scheduler tick. Runs above the thread-mode tasks and below the crank.
#[embassy_executor::task]
pub async fn run(engine: &'static EngineCell) -> ! {
    let mut ticker = Ticker::every(TICK);
    let mut reported = 0u32;
    loop {
        ticker.next().await;
        let mut guard = engine.lock().await;
        let Some(engine) = guard.as_mut() else {
            continue;
        };
        engine.on_tick();

        let total: u32 = [HF_TASK, LF_TASK, VLF_TASK]
            .iter()
            .filter_map(|&index| engine.task_status(index))
            .map(|status| status.total_overruns)
            .sum();
        if total != reported {
            reported = total;
            defmt::warn!("scheduler: {} overruns since boot", total);
        }
    }
}
