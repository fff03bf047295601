use ecu_core::console::commands::error_reply;
use ecu_core::console::{ConsoleSession, Reply, execute};
use embassy_futures::join::join;
use embassy_stm32 as hal;
use embassy_stm32::Peri;
use embassy_stm32::usart::{BufferedUart, Config as UartConfig, DataBits, Parity, StopBits};
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::mutex::Mutex;
use embassy_time::{Duration, Timer};
use embedded_io_async::{Read, Write};
use static_cell::StaticCell;

use super::EngineCell;
use crate::link::HostPipe;

const HOST_UART_BAUD: u32 = 115_200;
const UART_BUFFER_SIZE: usize = 256;

static UART_TX_BUFFER: StaticCell<[u8; UART_BUFFER_SIZE]> = StaticCell::new();
static UART_RX_BUFFER: StaticCell<[u8; UART_BUFFER_SIZE]> = StaticCell::new();

embassy_stm32::bind_interrupts!(struct UartIrqs {
    USART1 => embassy_stm32::usart::BufferedInterruptHandler<hal::peripherals::USART1>;
});

/// Host configuration link: commands in, replies and queued host bytes out.
#[embassy_executor::task]
pub async fn run(
    engine: &'static EngineCell,
    host: &'static HostPipe,
    usart: Peri<'static, hal::peripherals::USART1>,
    tx_pin: Peri<'static, hal::peripherals::PA9>,
    rx_pin: Peri<'static, hal::peripherals::PA10>,
) -> ! {
    let mut config = UartConfig::default();
    config.baudrate = HOST_UART_BAUD;
    config.data_bits = DataBits::DataBits8;
    config.stop_bits = StopBits::STOP1;
    config.parity = Parity::ParityNone;

    let uart = match BufferedUart::new(
        usart,
        rx_pin,
        tx_pin,
        UART_TX_BUFFER.init([0; UART_BUFFER_SIZE]),
        UART_RX_BUFFER.init([0; UART_BUFFER_SIZE]),
        UartIrqs,
        config,
    ) {
        Ok(uart) => uart,
        Err(_) => {
            defmt::error!("console: UART init failed");
            loop {
                core::future::pending::<()>().await;
            }
        }
    };
    let (uart_tx, mut uart_rx) = uart.split();
    let uart_tx = Mutex::<CriticalSectionRawMutex, _>::new(uart_tx);

    let commands = async {
        let mut session = ConsoleSession::new();
        let mut ingress = [0u8; 64];
        loop {
            let count = match uart_rx.read(&mut ingress).await {
                Ok(count) => count,
                Err(_) => {
                    defmt::warn!("console: UART read error");
                    Timer::after(Duration::from_millis(5)).await;
                    continue;
                }
            };
            for &byte in &ingress[..count] {
                let reply = match session.ingest(byte) {
                    Ok(None) => continue,
                    Ok(Some(command)) => {
                        let mut guard = engine.lock().await;
                        guard.as_mut().and_then(|engine| execute(engine, &command))
                    }
                    Err(err) => {
                        defmt::warn!("console: {}", defmt::Display2Format(&err));
                        error_reply(err)
                    }
                };
                if let Some(reply) = reply {
                    send(&uart_tx, &reply).await;
                }
            }
        }
    };

    let forward = async {
        let mut chunk = [0u8; 64];
        loop {
            let count = host.read(&mut chunk).await;
            write_all(&mut *uart_tx.lock().await, &chunk[..count]).await;
        }
    };

    join(commands, forward).await;
    loop {
        core::future::pending::<()>().await;
    }
}

async fn send<W: Write>(uart: &Mutex<CriticalSectionRawMutex, W>, reply: &Reply) {
    write_all(&mut *uart.lock().await, reply.as_bytes()).await;
}

async fn write_all<W: Write>(uart: &mut W, data: &[u8]) {
    let mut written = 0usize;
    while written < data.len() {
        match uart.write(&data[written..]).await {
            Ok(count) => written += count,
            Err(_) => {
                defmt::warn!("console: UART write error");
                Timer::after(Duration::from_millis(5)).await;
                return;
            }
        }
    }
    if uart.flush().await.is_err() {
        defmt::warn!("console: UART flush error");
    }
}
