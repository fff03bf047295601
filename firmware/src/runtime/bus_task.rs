use embassy_stm32 as hal;
use embassy_stm32::Peri;
use embassy_stm32::can::frame::Frame;
use embassy_stm32::can::{self, CanConfigurator, OperatingMode};

use crate::link::BusQueue;

const BUS_BITRATE: u32 = 500_000;

embassy_stm32::bind_interrupts!(struct CanIrqs {
    FDCAN1_IT0 => can::IT0InterruptHandler<hal::peripherals::FDCAN1>;
    FDCAN1_IT1 => can::IT1InterruptHandler<hal::peripherals::FDCAN1>;
});

/// Drains the engine's bus frames onto FDCAN1.
#[embassy_executor::task]
pub async fn run(
    queue: &'static BusQueue,
    fdcan: Peri<'static, hal::peripherals::FDCAN1>,
    rx_pin: Peri<'static, hal::peripherals::PA11>,
    tx_pin: Peri<'static, hal::peripherals::PA12>,
) -> ! {
    let mut config = CanConfigurator::new(fdcan, rx_pin, tx_pin, CanIrqs);
    config.set_bitrate(BUS_BITRATE);
    let mut can = config.start(OperatingMode::NormalOperationMode);

    loop {
        let message = queue.receive().await;
        match Frame::new_standard(message.id, &message.data) {
            Ok(frame) => _ = can.write(&frame).await,
            Err(_) => defmt::warn!("bus: bad frame id={=u16:#x}", message.id),
        }
    }
}
