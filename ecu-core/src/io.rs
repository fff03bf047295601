//! Hardware capabilities consumed by the control core.
//!
//! The firmware implements these over embassy peripherals, the emulator over
//! a simulated engine, and tests over small recording doubles.

use crate::sensors::{RawSample, SensorFault, SensorFrame};
use crate::storage::Storage;

/// Number of injector outputs.
pub const INJECTORS: usize = 4;
/// Number of ignition coil outputs.
pub const COILS: usize = 4;

/// Electrical level of a digital output.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Level {
    Low,
    High,
}

impl Level {
    #[must_use]
    pub const fn inverted(self) -> Self {
        match self {
            Level::Low => Level::High,
            Level::High => Level::Low,
        }
    }
}

/// PWM outputs driven by the slow control loops.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PwmChannel {
    Vvt,
    IdleActuator,
    CoolingFan,
}

/// Discrete inputs read by the slow loops.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum DigitalInput {
    /// Throttle-closed switch; reads Low when the throttle is shut.
    IdleSwitch,
}

/// Discrete outputs driven by the slow loops.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum DigitalOutput {
    /// Heartbeat toggled once per VLF cycle.
    StatusLed,
}

/// Independent one-shot timers used by the crank path.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TimerChannel {
    /// Injection events near TDC.
    InjectionA,
    /// Injection events near TDC + 180.
    InjectionB,
    Ignition,
}

/// Which injectors an action addresses.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum InjectorTarget {
    One(u8),
    All,
}

/// Output change performed when a one-shot timer fires or expires.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum OutputAction {
    Injector { target: InjectorTarget, open: bool },
    Coil { coil: u8, level: Level },
}

/// Where outbound bytes go.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TelemetryChannel {
    /// Host configuration link.
    Host,
    /// External bus frame with the given identifier.
    Bus(u16),
}

/// Filtered sensor readings.
pub trait SensorSource {
    /// # Errors
    ///
    /// Returns [`SensorFault`] when no fresh conversion is available.
    fn read_filtered(&mut self) -> Result<SensorFrame, SensorFault>;

    /// Called after the filter block or sensor calibration changes.
    fn configure(&mut self, _page: &crate::config::ConfigPage) {}
}

/// Raw multi-channel ADC access.
pub trait AdcSampler {
    /// # Errors
    ///
    /// Returns [`SensorFault::AdcTimeout`] when the conversion stalls.
    fn sample(&mut self) -> Result<RawSample, SensorFault>;
}

pub trait ActuatorOutputs {
    /// Sets a PWM duty cycle in percent, 0 to 100.
    fn set_duty_cycle(&mut self, channel: PwmChannel, percent: f32);
    fn set_digital(&mut self, output: DigitalOutput, level: Level);
    fn read_digital(&mut self, input: DigitalInput) -> Level;
}

/// Direct injector and coil control.
pub trait OutputDriver {
    fn set_injector(&mut self, index: u8, open: bool);
    fn set_coil(&mut self, index: u8, level: Level);

    /// Applies one timer action.
    fn apply(&mut self, action: OutputAction) {
        match action {
            OutputAction::Injector {
                target: InjectorTarget::One(index),
                open,
            } => self.set_injector(index, open),
            OutputAction::Injector {
                target: InjectorTarget::All,
                open,
            } => {
                for index in 0..INJECTORS as u8 {
                    self.set_injector(index, open);
                }
            }
            OutputAction::Coil { coil, level } => self.set_coil(coil, level),
        }
    }
}

pub trait OneShotTimers {
    /// Arms `channel`: after `delay_us` run `on_fire`, then after a further
    /// `duration_us` run `on_expire`. Re-arming replaces any pending schedule.
    fn schedule_one_shot(
        &mut self,
        channel: TimerChannel,
        delay_us: u32,
        duration_us: u32,
        on_fire: Option<OutputAction>,
        on_expire: OutputAction,
    );
}

/// Crank-side discrete inputs.
pub trait CrankInputs {
    /// Bank discriminator; `true` selects the first bank.
    fn bank_select(&mut self) -> bool;
    /// Returns and clears a pending camshaft sync pulse.
    fn take_camshaft_sync(&mut self) -> bool;
}

pub trait TelemetrySink {
    fn transmit(&mut self, channel: TelemetryChannel, bytes: &[u8]);
}

pub trait Clock {
    fn now_ms(&self) -> u64;
}

/// Everything the task side of the engine needs.
pub trait EngineIo:
    SensorSource + ActuatorOutputs + OutputDriver + TelemetrySink + Clock + Storage
{
}

impl<T> EngineIo for T where
    T: SensorSource + ActuatorOutputs + OutputDriver + TelemetrySink + Clock + Storage
{
}

/// Everything the crank pulse handler needs.
pub trait CrankIo: OneShotTimers + OutputDriver + CrankInputs {}

impl<T> CrankIo for T where T: OneShotTimers + OutputDriver + CrankInputs {}

/// [`SensorSource`] built from an [`AdcSampler`] and the conditioning stage.
pub struct ConditionedSensors<A> {
    sampler: A,
    conditioner: crate::sensors::SensorConditioner,
}

impl<A: AdcSampler> ConditionedSensors<A> {
    pub fn new(sampler: A, page: &crate::config::ConfigPage) -> Self {
        Self {
            sampler,
            conditioner: crate::sensors::SensorConditioner::new(page),
        }
    }

    pub fn sampler_mut(&mut self) -> &mut A {
        &mut self.sampler
    }
}

impl<A: AdcSampler> SensorSource for ConditionedSensors<A> {
    fn read_filtered(&mut self) -> Result<SensorFrame, SensorFault> {
        let raw = self.sampler.sample()?;
        Ok(self.conditioner.condition(&raw))
    }

    fn configure(&mut self, page: &crate::config::ConfigPage) {
        self.conditioner = crate::sensors::SensorConditioner::new(page);
    }
}
