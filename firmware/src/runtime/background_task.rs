use ecu_core::status::StatusFlags;
use embassy_time::{Duration, Timer};

use super::EngineCell;

const BACKGROUND_PERIOD: Duration = Duration::from_millis(10);

/// Lowest priority work: AFR data saves.
#[embassy_executor::task]
pub async fn run(engine: &'static EngineCell) -> ! {
    let mut dropped = 0u32;
    loop {
        Timer::after(BACKGROUND_PERIOD).await;
        let mut guard = engine.lock().await;
        let Some(engine) = guard.as_mut() else {
            continue;
        };

        let before = engine.status();
        engine.run_background();
        let after = engine.status();
        if after.contains(StatusFlags::EEPROM_SAVE_ERROR)
            && !before.contains(StatusFlags::EEPROM_SAVE_ERROR)
        {
            defmt::warn!("storage: AFR save failed");
        }

        let lost = engine.io().dropped_messages();
        if lost != dropped {
            dropped = lost;
            defmt::warn!("link: {} outbound messages dropped", lost);
        }
    }
}
