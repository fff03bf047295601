//! Boot and task wiring.
//!
//! Three priority levels, highest first:
//!
//! 1. crank capture and the one-shot output timers (interrupt executor on
//!    the UART4 vector);
//! 2. the scheduler tick (interrupt executor on UART5);
//! 3. console, bus and background work (thread mode).
//!
//! The crank side owns its [`PhaseTracker`]; it meets the engine only
//! through [`CRANK_SHARED`].

use cortex_m::interrupt;
use cortex_m::register::primask;
use cortex_m_rt::entry;
use critical_section::{self, RawRestoreState};
use defmt_rtt as _;
use ecu_core::config::defaults;
use ecu_core::engine::Engine;
use ecu_core::sequencer::OutputLayout;
use ecu_core::trigger::{CrankShared, PhaseTracker, TriggerSettings};
use embassy_executor::{Executor, InterruptExecutor};
use embassy_stm32 as hal;
use embassy_stm32::adc::{Adc, AdcChannel};
use embassy_stm32::exti::ExtiInput;
use embassy_stm32::gpio::{Input, Level, Output, OutputType, Pull, Speed};
use embassy_stm32::i2c::I2c;
use embassy_stm32::interrupt::{InterruptExt, Priority};
use embassy_stm32::time::{hz, khz};
use embassy_stm32::timer::input_capture::{CapturePin, InputCapture};
use embassy_stm32::timer::low_level::CountingMode;
use embassy_stm32::timer::simple_pwm::{PwmPin, SimplePwm};
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::mutex::Mutex;
use embassy_time::Duration;
use static_cell::StaticCell;

use crate::board::{
    Actuators, AdcChannels, Board, CrankBoard, I2cEeprom, OUTPUTS, OutputPins,
};
use crate::capture::CAPTURE_HZ;
use crate::link::{BusQueue, HostPipe, LinkSink};

mod background_task;
mod bus_task;
mod console_task;
mod crank_task;
mod tick_task;
pub(crate) mod timers;

critical_section::set_impl!(InterruptCriticalSection);

struct InterruptCriticalSection;

unsafe impl critical_section::Impl for InterruptCriticalSection {
    unsafe fn acquire() -> RawRestoreState {
        let primask = primask::read();
        interrupt::disable();
        primask.is_active()
    }

    unsafe fn release(restore_state: RawRestoreState) {
        if restore_state {
            unsafe {
                interrupt::enable();
            }
        }
    }
}

pub(super) type EngineCell = Mutex<CriticalSectionRawMutex, Option<Engine<'static, Board>>>;

/// Scheduler tick period; matches `ecu_core::engine::TICK_MS`.
pub(super) const TICK: Duration = Duration::from_millis(1);

const LAYOUT: OutputLayout = OutputLayout::BankSelected;
const PWM_FREQUENCY_HZ: u32 = 400;

pub(super) static CRANK_SHARED: CrankShared = CrankShared::new();
static ENGINE: EngineCell = Mutex::new(None);
static HOST_PIPE: HostPipe = HostPipe::new();
static BUS_QUEUE: BusQueue = BusQueue::new();

static EXECUTOR_CRANK: InterruptExecutor = InterruptExecutor::new();
static EXECUTOR_TICK: InterruptExecutor = InterruptExecutor::new();
static EXECUTOR_THREAD: StaticCell<Executor> = StaticCell::new();

embassy_stm32::bind_interrupts!(struct CaptureIrqs {
    TIM2 => hal::timer::CaptureCompareInterruptHandler<hal::peripherals::TIM2>;
});

#[hal::interrupt]
unsafe fn UART4() {
    unsafe { EXECUTOR_CRANK.on_interrupt() }
}

#[hal::interrupt]
unsafe fn UART5() {
    unsafe { EXECUTOR_TICK.on_interrupt() }
}

#[entry]
fn main() -> ! {
    let p = hal::init(hal::Config::default());

    let injectors = [
        Output::new(p.PB12, Level::Low, Speed::VeryHigh),
        Output::new(p.PB13, Level::Low, Speed::VeryHigh),
        Output::new(p.PB14, Level::Low, Speed::VeryHigh),
        Output::new(p.PB15, Level::Low, Speed::VeryHigh),
    ];
    let coils = [
        Output::new(p.PC6, Level::High, Speed::VeryHigh),
        Output::new(p.PC7, Level::High, Speed::VeryHigh),
        Output::new(p.PC8, Level::High, Speed::VeryHigh),
        Output::new(p.PC9, Level::High, Speed::VeryHigh),
    ];
    OUTPUTS.lock(|cell| cell.replace(Some(OutputPins::new(injectors, coils))));

    let adc = AdcChannels::new(
        Adc::new(p.ADC1),
        [
            p.PC0.degrade_adc(),
            p.PC1.degrade_adc(),
            p.PC2.degrade_adc(),
            p.PC3.degrade_adc(),
            p.PA1.degrade_adc(),
            p.PB1.degrade_adc(),
        ],
    );
    let pwm = SimplePwm::new(
        p.TIM3,
        Some(PwmPin::new(p.PB4, OutputType::PushPull)),
        Some(PwmPin::new(p.PB5, OutputType::PushPull)),
        Some(PwmPin::new(p.PB0, OutputType::PushPull)),
        None,
        hz(PWM_FREQUENCY_HZ),
        Default::default(),
    );
    let actuators = Actuators::new(
        pwm,
        Output::new(p.PA5, Level::Low, Speed::Low),
        Input::new(p.PC13, Pull::Up),
    );
    let eeprom = I2cEeprom::new(I2c::new_blocking(
        p.I2C1,
        p.PB8,
        p.PB9,
        khz(400),
        Default::default(),
    ));
    let board = Board::new(
        adc,
        actuators,
        LinkSink::new(&HOST_PIPE, &BUS_QUEUE),
        eeprom,
        &defaults::PAGE,
    );

    let tracker = match Engine::boot(board, &CRANK_SHARED, LAYOUT) {
        Ok(engine) => {
            defmt::info!(
                "engine: booted, configuration {}, status {=u32:#x}",
                engine.config().current_configuration(),
                engine.status().bits()
            );
            let tracker = PhaseTracker::new(TriggerSettings::from_page(engine.page(), LAYOUT));
            if let Ok(mut slot) = ENGINE.try_lock() {
                *slot = Some(engine);
            }
            tracker
        }
        Err(_) => {
            defmt::error!("engine: scheduler rejected a task slot");
            PhaseTracker::new(TriggerSettings::from_page(&defaults::PAGE, LAYOUT))
        }
    };

    let capture = InputCapture::new(
        p.TIM2,
        Some(CapturePin::new(p.PA0, Pull::None)),
        None,
        None,
        None,
        CaptureIrqs,
        hz(CAPTURE_HZ),
        CountingMode::EdgeAlignedUp,
    );
    let crank_board = CrankBoard::new(Input::new(p.PA8, Pull::None), &CRANK_SHARED);
    let camshaft = ExtiInput::new(p.PB3, p.EXTI3, Pull::Down);

    hal::interrupt::UART4.set_priority(Priority::P1);
    let crank_spawner = EXECUTOR_CRANK.start(hal::interrupt::UART4);
    crank_spawner
        .spawn(crank_task::run(capture, tracker, crank_board, &CRANK_SHARED))
        .expect("failed to spawn crank task");
    crank_spawner
        .spawn(crank_task::camshaft(camshaft, &CRANK_SHARED))
        .expect("failed to spawn camshaft task");
    for channel in timers::CHANNELS {
        crank_spawner
            .spawn(timers::run(channel))
            .expect("failed to spawn output timer task");
    }

    hal::interrupt::UART5.set_priority(Priority::P3);
    EXECUTOR_TICK
        .start(hal::interrupt::UART5)
        .spawn(tick_task::run(&ENGINE))
        .expect("failed to spawn tick task");

    let executor = EXECUTOR_THREAD.init(Executor::new());
    executor.run(|spawner| {
        spawner
            .spawn(console_task::run(&ENGINE, &HOST_PIPE, p.USART1, p.PA9, p.PA10))
            .expect("failed to spawn console task");
        spawner
            .spawn(bus_task::run(&BUS_QUEUE, p.FDCAN1, p.PA11, p.PA12))
            .expect("failed to spawn bus task");
        spawner
            .spawn(background_task::run(&ENGINE))
            .expect("failed to spawn background task");
    })
}
