use ecu_core::trigger::{CrankShared, PhaseTracker};
use embassy_stm32::exti::ExtiInput;
use embassy_stm32::peripherals::TIM2;
use embassy_stm32::timer::Channel;
use embassy_stm32::timer::input_capture::InputCapture;

use crate::board::CrankBoard;
use crate::capture::EdgeTimer;

/// Crank edges, highest priority. Owns the phase tracker outright.
#[embassy_executor::task]
pub async fn run(
    mut capture: InputCapture<'static, TIM2>,
    mut tracker: PhaseTracker,
    mut board: CrankBoard,
    shared: &'static CrankShared,
) -> ! {
    let mut edges = EdgeTimer::new();
    defmt::info!("crank: capture running");
    loop {
        let count = capture.wait_for_rising_edge(Channel::Ch1).await;
        if let Some(period) = edges.period_us(count) {
            tracker.handle_crank_pulse(period, shared, &mut board);
        }
    }
}

/// Camshaft sync input; consumed at the next TDC.
#[embassy_executor::task]
pub async fn camshaft(mut input: ExtiInput<'static>, shared: &'static CrankShared) -> ! {
    loop {
        input.wait_for_rising_edge().await;
        shared.signal_camshaft();
    }
}
