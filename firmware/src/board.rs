//! Hardware adapters implementing the `ecu-core` capability traits.
//!
//! Pin map (STM32G474RE):
//!
//! | function          | pin(s)                 |
//! |-------------------|------------------------|
//! | crank capture     | PA0 (TIM2 CH1)         |
//! | camshaft sync     | PB3 (EXTI3)            |
//! | bank select       | PA8                    |
//! | injectors 1-4     | PB12 PB13 PB14 PB15    |
//! | coils 1-4         | PC6 PC7 PC8 PC9        |
//! | VVT, idle, fan    | PB4 PB5 PB0 (TIM3)     |
//! | status LED        | PA5                    |
//! | idle switch       | PC13                   |
//! | ADC1              | PC0 PC1 PC2 PC3 PA1 PB1|
//! | host UART         | PA9 PA10 (USART1)      |
//! | EEPROM            | PB8 PB9 (I2C1)         |
//! | bus               | PA11 PA12 (FDCAN1)     |

#![allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]

use core::cell::RefCell;

use ecu_core::config::ConfigPage;
use ecu_core::io::{
    ActuatorOutputs, AdcSampler, COILS, Clock, ConditionedSensors, CrankInputs, DigitalInput,
    DigitalOutput, INJECTORS, Level, OneShotTimers, OutputAction, OutputDriver, PwmChannel,
    SensorSource, TelemetryChannel, TelemetrySink, TimerChannel,
};
use ecu_core::sensors::{RawSample, SensorFault, SensorFrame};
use ecu_core::storage::{
    ChecksummedStore, EEPROM_PAGE_SIZE, EepromDevice, Storage, StorageError,
};
use ecu_core::trigger::CrankShared;
use embassy_stm32::adc::{Adc, AnyAdcChannel};
use embassy_stm32::gpio::{self, Input, Output};
use embassy_stm32::i2c::I2c;
use embassy_stm32::mode::Blocking;
use embassy_stm32::peripherals::{ADC1, TIM3};
use embassy_stm32::timer::Channel;
use embassy_stm32::timer::simple_pwm::SimplePwm;
use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_time::{Duration, Instant, block_for};

use crate::link::LinkSink;
use crate::runtime::timers;

/// 24LC256 with all address pins low.
const EEPROM_ADDRESS: u8 = 0x50;
/// Write-cycle acknowledge polls before a page write counts as failed.
const WRITE_POLLS: u32 = 20;
const WRITE_POLL_INTERVAL: Duration = Duration::from_micros(500);

pub type OutputBank = Mutex<CriticalSectionRawMutex, RefCell<Option<OutputPins>>>;

/// Injector and coil pins. Shared by the crank handler, the one-shot timer
/// tasks and the engine's power reset.
pub static OUTPUTS: OutputBank = Mutex::new(RefCell::new(None));

pub struct OutputPins {
    injectors: [Output<'static>; INJECTORS],
    coils: [Output<'static>; COILS],
}

impl OutputPins {
    pub fn new(injectors: [Output<'static>; INJECTORS], coils: [Output<'static>; COILS]) -> Self {
        Self { injectors, coils }
    }
}

/// Handle onto [`OUTPUTS`]; each call holds the lock for one pin write.
#[derive(Copy, Clone, Default)]
pub struct SharedOutputs;

impl OutputDriver for SharedOutputs {
    fn set_injector(&mut self, index: u8, open: bool) {
        OUTPUTS.lock(|cell| {
            if let Some(pin) = cell
                .borrow_mut()
                .as_mut()
                .and_then(|pins| pins.injectors.get_mut(usize::from(index)))
            {
                pin.set_level(gpio::Level::from(open));
            }
        });
    }

    fn set_coil(&mut self, index: u8, level: Level) {
        OUTPUTS.lock(|cell| {
            if let Some(pin) = cell
                .borrow_mut()
                .as_mut()
                .and_then(|pins| pins.coils.get_mut(usize::from(index)))
            {
                pin.set_level(gpio::Level::from(level == Level::High));
            }
        });
    }
}

/// ADC1 channels in [`RawSample`] order.
pub struct AdcChannels {
    adc: Adc<'static, ADC1>,
    map: AnyAdcChannel<ADC1>,
    lambda: AnyAdcChannel<ADC1>,
    coolant: AnyAdcChannel<ADC1>,
    air: AnyAdcChannel<ADC1>,
    tps: AnyAdcChannel<ADC1>,
    battery: AnyAdcChannel<ADC1>,
}

impl AdcChannels {
    pub fn new(adc: Adc<'static, ADC1>, channels: [AnyAdcChannel<ADC1>; 6]) -> Self {
        let [map, lambda, coolant, air, tps, battery] = channels;
        Self {
            adc,
            map,
            lambda,
            coolant,
            air,
            tps,
            battery,
        }
    }
}

impl AdcSampler for AdcChannels {
    fn sample(&mut self) -> Result<RawSample, SensorFault> {
        Ok(RawSample {
            map: self.adc.blocking_read(&mut self.map),
            lambda: self.adc.blocking_read(&mut self.lambda),
            coolant: self.adc.blocking_read(&mut self.coolant),
            air: self.adc.blocking_read(&mut self.air),
            tps: self.adc.blocking_read(&mut self.tps),
            battery: self.adc.blocking_read(&mut self.battery),
        })
    }
}

/// PWM outputs, the heartbeat LED and the throttle switch.
pub struct Actuators {
    pwm: SimplePwm<'static, TIM3>,
    led: Output<'static>,
    idle_switch: Input<'static>,
}

impl Actuators {
    pub fn new(
        mut pwm: SimplePwm<'static, TIM3>,
        led: Output<'static>,
        idle_switch: Input<'static>,
    ) -> Self {
        for channel in [Channel::Ch1, Channel::Ch2, Channel::Ch3] {
            let mut output = pwm.channel(channel);
            output.set_duty_cycle_fully_off();
            output.enable();
        }
        Self {
            pwm,
            led,
            idle_switch,
        }
    }
}

impl ActuatorOutputs for Actuators {
    fn set_duty_cycle(&mut self, channel: PwmChannel, percent: f32) {
        let channel = match channel {
            PwmChannel::Vvt => Channel::Ch1,
            PwmChannel::IdleActuator => Channel::Ch2,
            PwmChannel::CoolingFan => Channel::Ch3,
        };
        self.pwm
            .channel(channel)
            .set_duty_cycle_percent(percent.clamp(0.0, 100.0) as u8);
    }

    fn set_digital(&mut self, output: DigitalOutput, level: Level) {
        match output {
            DigitalOutput::StatusLed => self.led.set_level(gpio::Level::from(level == Level::High)),
        }
    }

    fn read_digital(&mut self, input: DigitalInput) -> Level {
        match input {
            DigitalInput::IdleSwitch => {
                if self.idle_switch.is_high() {
                    Level::High
                } else {
                    Level::Low
                }
            }
        }
    }
}

/// 24LC256-class EEPROM on I2C1.
pub struct I2cEeprom {
    i2c: I2c<'static, Blocking>,
}

impl I2cEeprom {
    pub fn new(i2c: I2c<'static, Blocking>) -> Self {
        Self { i2c }
    }

    fn wait_write_cycle(&mut self, address: u16) -> Result<(), StorageError> {
        for _ in 0..WRITE_POLLS {
            if self.i2c.blocking_write(EEPROM_ADDRESS, &address.to_be_bytes()).is_ok() {
                return Ok(());
            }
            block_for(WRITE_POLL_INTERVAL);
        }
        Err(StorageError::Io)
    }
}

impl EepromDevice for I2cEeprom {
    fn is_ready(&mut self) -> bool {
        self.i2c.blocking_write(EEPROM_ADDRESS, &[0, 0]).is_ok()
    }

    fn write_page(&mut self, address: u16, data: &[u8]) -> Result<(), StorageError> {
        if data.len() > EEPROM_PAGE_SIZE {
            return Err(StorageError::OutOfBounds);
        }
        let mut frame = [0u8; 2 + EEPROM_PAGE_SIZE];
        frame[..2].copy_from_slice(&address.to_be_bytes());
        frame[2..2 + data.len()].copy_from_slice(data);
        self.i2c
            .blocking_write(EEPROM_ADDRESS, &frame[..2 + data.len()])
            .map_err(|_| StorageError::Io)?;
        self.wait_write_cycle(address)
    }

    fn read(&mut self, address: u16, buf: &mut [u8]) -> Result<(), StorageError> {
        self.i2c
            .blocking_write_read(EEPROM_ADDRESS, &address.to_be_bytes(), buf)
            .map_err(|_| StorageError::Io)
    }
}

/// Everything the engine's tasks drive.
pub struct Board {
    sensors: ConditionedSensors<AdcChannels>,
    actuators: Actuators,
    outputs: SharedOutputs,
    link: LinkSink<'static>,
    eeprom: ChecksummedStore<I2cEeprom>,
}

impl Board {
    pub fn new(
        adc: AdcChannels,
        actuators: Actuators,
        link: LinkSink<'static>,
        eeprom: I2cEeprom,
        page: &ConfigPage,
    ) -> Self {
        Self {
            sensors: ConditionedSensors::new(adc, page),
            actuators,
            outputs: SharedOutputs,
            link,
            eeprom: ChecksummedStore::new(eeprom),
        }
    }

    pub fn dropped_messages(&self) -> u32 {
        self.link.dropped()
    }
}

impl SensorSource for Board {
    fn read_filtered(&mut self) -> Result<SensorFrame, SensorFault> {
        self.sensors.read_filtered()
    }

    fn configure(&mut self, page: &ConfigPage) {
        self.sensors.configure(page);
    }
}

impl ActuatorOutputs for Board {
    fn set_duty_cycle(&mut self, channel: PwmChannel, percent: f32) {
        self.actuators.set_duty_cycle(channel, percent);
    }

    fn set_digital(&mut self, output: DigitalOutput, level: Level) {
        self.actuators.set_digital(output, level);
    }

    fn read_digital(&mut self, input: DigitalInput) -> Level {
        self.actuators.read_digital(input)
    }
}

impl OutputDriver for Board {
    fn set_injector(&mut self, index: u8, open: bool) {
        self.outputs.set_injector(index, open);
    }

    fn set_coil(&mut self, index: u8, level: Level) {
        self.outputs.set_coil(index, level);
    }
}

impl TelemetrySink for Board {
    fn transmit(&mut self, channel: TelemetryChannel, bytes: &[u8]) {
        self.link.transmit(channel, bytes);
    }
}

impl Clock for Board {
    fn now_ms(&self) -> u64 {
        Instant::now().as_millis()
    }
}

impl Storage for Board {
    fn is_available(&mut self) -> bool {
        self.eeprom.is_available()
    }

    fn persist_block(&mut self, address: u16, bytes: &[u8]) -> Result<(), StorageError> {
        self.eeprom.persist_block(address, bytes)
    }

    fn restore_block(&mut self, address: u16, buf: &mut [u8]) -> Result<(), StorageError> {
        self.eeprom.restore_block(address, buf)
    }
}

/// Everything the crank handler drives.
pub struct CrankBoard {
    outputs: SharedOutputs,
    bank: Input<'static>,
    shared: &'static CrankShared,
}

impl CrankBoard {
    pub fn new(bank: Input<'static>, shared: &'static CrankShared) -> Self {
        Self {
            outputs: SharedOutputs,
            bank,
            shared,
        }
    }
}

impl OneShotTimers for CrankBoard {
    fn schedule_one_shot(
        &mut self,
        channel: TimerChannel,
        delay_us: u32,
        duration_us: u32,
        on_fire: Option<OutputAction>,
        on_expire: OutputAction,
    ) {
        timers::arm(channel, delay_us, duration_us, on_fire, on_expire);
    }
}

impl OutputDriver for CrankBoard {
    fn set_injector(&mut self, index: u8, open: bool) {
        self.outputs.set_injector(index, open);
    }

    fn set_coil(&mut self, index: u8, level: Level) {
        self.outputs.set_coil(index, level);
    }
}

impl CrankInputs for CrankBoard {
    fn bank_select(&mut self) -> bool {
        self.bank.is_high()
    }

    fn take_camshaft_sync(&mut self) -> bool {
        self.shared.take_camshaft_sync()
    }
}
