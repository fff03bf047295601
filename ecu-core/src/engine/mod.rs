//! Task side of the controller.
//!
//! [`Engine`] owns the configuration, the control loops and the scheduler
//! that drives them. The crank side lives in [`crate::trigger`]; the two
//! meet only through [`CrankShared`]. Everything here runs from the tick
//! interrupt or the background loop, never from the crank handler.

#![allow(clippy::cast_precision_loss)]

mod tasks;

use crate::afr::AfrTrim;
use crate::config::{BlockId, ConfigError, ConfigPage, ConfigStore, ParamValue, ResetScope};
use crate::fuel::FuelCalculator;
use crate::idle::IdleController;
use crate::io::{EngineIo, Level};
use crate::scheduler::{Scheduler, SchedulerError, TaskStatus};
use crate::sensors::SensorFrame;
use crate::sequencer::{OutputLayout, power_reset};
use crate::status::StatusFlags;
use crate::storage::StorageError;
use crate::table::{Axis, MapLookup};
use crate::telemetry::TelemetrySnapshot;
use crate::trigger::{CrankShared, TriggerSettings};
use crate::vvt::VvtController;

pub const TICK_MS: f32 = 1.0;
pub const HF_PERIOD_MS: f32 = 5.0;
pub const LF_PERIOD_MS: f32 = 40.0;
pub const VLF_PERIOD_MS: f32 = 1000.0;

/// Scheduler slots.
pub const HF_TASK: usize = 0;
pub const LF_TASK: usize = 1;
pub const VLF_TASK: usize = 2;

/// Controller state plus the scheduler driving it.
pub struct Engine<'a, IO> {
    scheduler: Scheduler<Runtime<'a, IO>>,
    runtime: Runtime<'a, IO>,
}

/// State the periodic tasks work on.
pub(crate) struct Runtime<'a, IO> {
    pub(crate) io: IO,
    pub(crate) shared: &'a CrankShared,
    pub(crate) layout: OutputLayout,
    pub(crate) config: ConfigStore,
    pub(crate) status: StatusFlags,
    pub(crate) lookup: MapLookup,
    pub(crate) fuel: FuelCalculator,
    pub(crate) afr: AfrTrim,
    pub(crate) idle: IdleController,
    pub(crate) vvt: VvtController,
    /// Last good sensor frame.
    pub(crate) frame: SensorFrame,
    pub(crate) snapshot: TelemetrySnapshot,
    pub(crate) rpm: f32,
    pub(crate) last_in_sync: u32,
    pub(crate) save_afr_pending: bool,
    pub(crate) afr_saves: u32,
    pub(crate) heartbeat: Level,
}

impl<'a, IO: EngineIo> Engine<'a, IO> {
    /// Restores the configuration and AFR data, performs a full reset and
    /// starts the scheduler. The crank handler picks up the restored wheel
    /// settings on its next pulse.
    ///
    /// # Errors
    ///
    /// Fails only if a task slot cannot be registered.
    pub fn boot(
        io: IO,
        shared: &'a CrankShared,
        layout: OutputLayout,
    ) -> Result<Self, SchedulerError> {
        let mut runtime = Runtime::new(io, shared, layout);
        let available = runtime.io.is_available();
        runtime.status.assign(StatusFlags::EEPROM_AVAILABLE, available);
        runtime.restore_configuration();
        runtime.reset(ResetScope::Full);

        let mut scheduler = Scheduler::new(TICK_MS);
        scheduler.add_task(HF_TASK, tasks::high_frequency, HF_PERIOD_MS)?;
        scheduler.add_task(LF_TASK, tasks::low_frequency, LF_PERIOD_MS)?;
        scheduler.add_task(VLF_TASK, tasks::very_low_frequency, VLF_PERIOD_MS)?;
        scheduler.start();

        Ok(Self { scheduler, runtime })
    }

    /// One scheduler tick; call every [`TICK_MS`].
    pub fn on_tick(&mut self) {
        self.scheduler.tick(&mut self.runtime);
    }

    /// Work too slow for the tick context. Call from the lowest priority
    /// loop.
    pub fn run_background(&mut self) {
        let rt = &mut self.runtime;
        if !rt.save_afr_pending {
            return;
        }
        rt.save_afr_pending = false;

        let page = rt.config.page();
        let available = rt.status.contains(StatusFlags::EEPROM_AVAILABLE);
        if rt
            .afr
            .save_due(&page.p1, rt.rpm, rt.frame.coolant_c, available)
        {
            match rt.afr.persist(&mut rt.io) {
                Ok(()) => rt.afr_saves = rt.afr_saves.saturating_add(1),
                Err(_) => rt.status.set(StatusFlags::EEPROM_SAVE_ERROR),
            }
        }
    }

    /// Replaces one configuration block, persists it and applies the reset
    /// the block calls for.
    ///
    /// # Errors
    ///
    /// [`ConfigError::UnknownBlock`] and [`ConfigError::SizeMismatch`]
    /// leave everything untouched. [`ConfigError::WriteError`] means the new
    /// values are active but were not saved.
    pub fn apply_configuration_block(
        &mut self,
        block_id: i32,
        items: &[ParamValue],
    ) -> Result<ResetScope, ConfigError> {
        let rt = &mut self.runtime;
        let block = BlockId::from_raw(block_id).ok_or(ConfigError::UnknownBlock(block_id))?;
        let scope = rt.config.update_block(block, items)?;
        let saved = rt.config.persist_block(block, &mut rt.io);
        rt.reset(scope);
        saved.map_err(|err| {
            rt.status.set(StatusFlags::EEPROM_SAVE_ERROR);
            ConfigError::WriteError(err)
        })?;
        Ok(scope)
    }

    /// Selects configuration page `number`, records the choice, reloads the
    /// page and resets everything.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::OutOfRange`] outside 1..=8 and marks the
    /// configuration invalid; nothing else changes.
    pub fn request_configuration_switch(&mut self, number: i32) -> Result<(), ConfigError> {
        let rt = &mut self.runtime;
        if let Err(err) = rt.config.select(number) {
            rt.status.set(StatusFlags::INVALID_CONFIG);
            return Err(err);
        }
        rt.status.reset();
        let available = rt.io.is_available();
        rt.status.assign(StatusFlags::EEPROM_AVAILABLE, available);
        if available && rt.config.persist_descriptor(&mut rt.io).is_err() {
            rt.status.set(StatusFlags::EEPROM_SAVE_ERROR);
        }
        rt.restore_configuration();
        rt.reset(ResetScope::Full);
        Ok(())
    }

    /// Clears the AFR trim back to the target map and saves the cleared
    /// data when storage is present.
    ///
    /// # Errors
    ///
    /// Propagates the storage failure; the trim is cleared regardless.
    pub fn request_afr_reset(&mut self) -> Result<(), StorageError> {
        let rt = &mut self.runtime;
        let page = rt.config.page();
        let available = rt.status.contains(StatusFlags::EEPROM_AVAILABLE);
        let result = rt
            .afr
            .reset_and_persist(&page.target_afr_map, &mut rt.io, available);
        rt.fuel.reset_correction(&page.ve_map, rt.afr.correction());
        if result.is_err() {
            rt.status.set(StatusFlags::EEPROM_SAVE_ERROR);
        }
        result
    }

    /// Current telemetry record. Each call reports the next AFR cell.
    pub fn telemetry_snapshot(&mut self) -> TelemetrySnapshot {
        let sample = self.runtime.afr.next_sample();
        let mut snapshot = self.runtime.snapshot;
        snapshot.status = self.runtime.status;
        snapshot.afr_correction = sample.correction;
        snapshot.lambda_average = sample.average;
        snapshot.afr_index = sample.index as f32;
        snapshot.afr_saves = self.runtime.afr_saves as f32;
        snapshot.lambda_samples = sample.samples;
        snapshot
    }

    /// Adds `delta` percent to the idle target offset.
    pub fn adjust_idle_target(&mut self, delta: f32) {
        let idle = &mut self.runtime.idle;
        idle.set_target_adjust(idle.target_adjust() + delta);
    }

    #[must_use]
    pub fn status(&self) -> StatusFlags {
        self.runtime.status
    }

    #[must_use]
    pub fn config(&self) -> &ConfigStore {
        &self.runtime.config
    }

    #[must_use]
    pub fn page(&self) -> &ConfigPage {
        self.runtime.config.page()
    }

    #[must_use]
    pub fn rpm(&self) -> f32 {
        self.runtime.rpm
    }

    #[must_use]
    pub fn afr(&self) -> &AfrTrim {
        &self.runtime.afr
    }

    #[must_use]
    pub fn idle(&self) -> &IdleController {
        &self.runtime.idle
    }

    #[must_use]
    pub fn layout(&self) -> OutputLayout {
        self.runtime.layout
    }

    #[must_use]
    pub fn task_status(&self, index: usize) -> Option<TaskStatus> {
        self.scheduler.status(index)
    }

    #[must_use]
    pub fn shared(&self) -> &'a CrankShared {
        self.runtime.shared
    }

    #[must_use]
    pub fn io(&self) -> &IO {
        &self.runtime.io
    }

    pub fn io_mut(&mut self) -> &mut IO {
        &mut self.runtime.io
    }
}

impl<'a, IO: EngineIo> Runtime<'a, IO> {
    fn new(io: IO, shared: &'a CrankShared, layout: OutputLayout) -> Self {
        let config = ConfigStore::new();
        let page = config.page();
        let afr = AfrTrim::new(&page.target_afr_map, &page.p1, VLF_PERIOD_MS);
        Self {
            fuel: FuelCalculator::new(page, afr.correction(), HF_PERIOD_MS),
            idle: IdleController::new(&page.p1, page.p2.idle_actuator_type, LF_PERIOD_MS),
            vvt: VvtController::new(&page.p1),
            lookup: lookup_for(page),
            afr,
            config,
            io,
            shared,
            layout,
            status: StatusFlags::new(),
            frame: SensorFrame::default(),
            snapshot: TelemetrySnapshot::default(),
            rpm: 0.0,
            last_in_sync: 0,
            save_afr_pending: false,
            afr_saves: 0,
            heartbeat: Level::Low,
        }
    }

    /// Reloads the selected page. A missing device keeps the compiled-in
    /// defaults; a failed read marks the configuration invalid.
    fn restore_configuration(&mut self) {
        if !self.status.contains(StatusFlags::EEPROM_AVAILABLE) {
            return;
        }
        if let Err(err) = self.config.restore(&mut self.io) {
            self.status.set(StatusFlags::INVALID_CONFIG);
            match err {
                ConfigError::ReadError(StorageError::Checksum) => {
                    self.status.set(StatusFlags::EEPROM_CHECKSUM_ERROR);
                }
                ConfigError::ReadError(_) => self.status.set(StatusFlags::EEPROM_READ_ERROR),
                _ => {}
            }
        }
    }

    fn reset(&mut self, scope: ResetScope) {
        match scope {
            ResetScope::None => {}
            ResetScope::Sensors => self.io.configure(self.config.page()),
            ResetScope::Maps => self.reset_maps(),
            ResetScope::Full => self.reset_all(),
        }
    }

    fn reset_maps(&mut self) {
        let page = self.config.page();
        self.afr = AfrTrim::new(&page.target_afr_map, &page.p1, VLF_PERIOD_MS);
        if self.status.contains(StatusFlags::EEPROM_AVAILABLE) {
            // A device with no saved trim keeps the reset values.
            let _ = self.afr.restore(&mut self.io);
        }
        self.fuel = FuelCalculator::new(page, self.afr.correction(), HF_PERIOD_MS);
    }

    fn reset_all(&mut self) {
        let available = self.io.is_available();
        self.status.assign(StatusFlags::EEPROM_AVAILABLE, available);

        let settings = TriggerSettings::from_page(self.config.page(), self.layout);
        power_reset(&mut self.io, settings.coil_on.inverted());
        self.shared.offer_settings(settings);

        self.reset_maps();
        self.io.configure(self.config.page());

        let page = self.config.page();
        let adjust = self.idle.target_adjust();
        self.idle = IdleController::new(&page.p1, page.p2.idle_actuator_type, LF_PERIOD_MS);
        self.idle.set_target_adjust(adjust);
        self.vvt = VvtController::new(&page.p1);
        self.lookup = lookup_for(page);
    }
}

fn lookup_for(page: &ConfigPage) -> MapLookup {
    MapLookup::new(
        Axis::new(page.p2.rpm_axis_start, page.p2.rpm_axis_delta),
        Axis::new(page.p2.load_axis_start, page.p2.load_axis_delta),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Parameters1, defaults};
    use crate::io::{
        ActuatorOutputs, Clock, DigitalInput, DigitalOutput, INJECTORS, OutputDriver, PwmChannel,
        SensorSource, TelemetryChannel, TelemetrySink,
    };
    use crate::sensors::SensorFault;
    use crate::storage::{ChecksummedStore, RamEeprom, Storage};

    type Eeprom = ChecksummedStore<RamEeprom<16384>>;

    struct Bench {
        frame: Result<SensorFrame, SensorFault>,
        idle_switch: Level,
        duty: [f32; 3],
        led: Option<Level>,
        injectors: [bool; INJECTORS],
        coils: [Option<Level>; INJECTORS],
        bus_frames: usize,
        configured: usize,
        eeprom: Eeprom,
        now_ms: u64,
    }

    impl Bench {
        fn new() -> Self {
            Self {
                frame: Ok(SensorFrame {
                    map_kpa: 60.0,
                    lambda_mv: 450.0,
                    coolant_c: 20.0,
                    air_c: 25.0,
                    tps_mv: 3000.0,
                    battery_v: 13.8,
                    tps_percent: 5.0,
                    thermistor_ohms: 2500.0,
                }),
                idle_switch: Level::High,
                duty: [0.0; 3],
                led: None,
                injectors: [true; INJECTORS],
                coils: [None; INJECTORS],
                bus_frames: 0,
                configured: 0,
                eeprom: ChecksummedStore::new(RamEeprom::new()),
                now_ms: 0,
            }
        }

        fn warm(mut self) -> Self {
            if let Ok(frame) = self.frame.as_mut() {
                frame.coolant_c = 95.0;
            }
            self
        }
    }

    impl SensorSource for Bench {
        fn read_filtered(&mut self) -> Result<SensorFrame, SensorFault> {
            self.frame
        }

        fn configure(&mut self, _page: &ConfigPage) {
            self.configured += 1;
        }
    }

    impl ActuatorOutputs for Bench {
        fn set_duty_cycle(&mut self, channel: PwmChannel, percent: f32) {
            let index = match channel {
                PwmChannel::Vvt => 0,
                PwmChannel::IdleActuator => 1,
                PwmChannel::CoolingFan => 2,
            };
            self.duty[index] = percent;
        }

        fn set_digital(&mut self, _output: DigitalOutput, level: Level) {
            self.led = Some(level);
        }

        fn read_digital(&mut self, _input: DigitalInput) -> Level {
            self.idle_switch
        }
    }

    impl OutputDriver for Bench {
        fn set_injector(&mut self, index: u8, open: bool) {
            self.injectors[usize::from(index)] = open;
        }

        fn set_coil(&mut self, index: u8, level: Level) {
            self.coils[usize::from(index)] = Some(level);
        }
    }

    impl TelemetrySink for Bench {
        fn transmit(&mut self, channel: TelemetryChannel, _bytes: &[u8]) {
            if matches!(channel, TelemetryChannel::Bus(_)) {
                self.bus_frames += 1;
            }
        }
    }

    impl Clock for Bench {
        fn now_ms(&self) -> u64 {
            self.now_ms
        }
    }

    impl Storage for Bench {
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

    fn run(engine: &mut Engine<'_, Bench>, ticks: u32) {
        for _ in 0..ticks {
            engine.io_mut().now_ms += 1;
            engine.on_tick();
        }
    }

    fn p1_items(edit: impl FnOnce(&mut Parameters1)) -> [ParamValue; Parameters1::ITEMS] {
        let mut page = defaults::PAGE;
        edit(&mut page.p1);
        core::array::from_fn(|index| {
            page.item(BlockId::Parameters1, index)
                .expect("item in range")
        })
    }

    #[test]
    fn boot_on_blank_storage_keeps_defaults_and_flags_invalid() {
        let shared = CrankShared::new();
        let engine = Engine::boot(Bench::new(), &shared, OutputLayout::BankSelected).expect("boot");
        let status = engine.status();
        assert!(status.contains(StatusFlags::EEPROM_AVAILABLE));
        assert!(status.contains(StatusFlags::INVALID_CONFIG));
        assert!(status.contains(StatusFlags::EEPROM_CHECKSUM_ERROR));
        assert_eq!(engine.page(), &defaults::PAGE);
        assert_eq!(engine.io().injectors, [false; INJECTORS], "outputs de-energised");
        assert_eq!(engine.io().configured, 1);
        assert!(shared.take_settings().is_some(), "wheel settings offered");
    }

    #[test]
    fn boot_without_storage_is_valid() {
        let shared = CrankShared::new();
        let mut bench = Bench::new();
        bench.eeprom.device_mut().set_present(false);
        let engine = Engine::boot(bench, &shared, OutputLayout::BankSelected).expect("boot");
        assert_eq!(engine.status(), StatusFlags::new());
    }

    #[test]
    fn high_frequency_task_publishes_cranking_pulse_width() {
        let shared = CrankShared::new();
        let mut engine =
            Engine::boot(Bench::new(), &shared, OutputLayout::BankSelected).expect("boot");
        run(&mut engine, 4);
        assert!(engine.telemetry_snapshot().timestamp.abs() < f32::EPSILON);

        run(&mut engine, 1);
        let snapshot = engine.telemetry_snapshot();
        assert!((snapshot.timestamp - 0.005).abs() < 1e-6);
        assert!((snapshot.map_kpa - 60.0).abs() < f32::EPSILON);
        // 20 C sits 40% of the way from +10% to -5% engine compensation.
        let expected = 6000.0 * (1.0 + 2.0 * 0.04);
        assert!((shared.pulse_width_us() - expected).abs() < 1.0);
        assert!((snapshot.injector_pw_us - expected).abs() < 1.0);
    }

    #[test]
    fn adc_fault_keeps_last_good_frame() {
        let shared = CrankShared::new();
        let mut engine =
            Engine::boot(Bench::new(), &shared, OutputLayout::BankSelected).expect("boot");
        run(&mut engine, 5);
        engine.io_mut().frame = Err(SensorFault::AdcTimeout);
        run(&mut engine, 5);
        let snapshot = engine.telemetry_snapshot();
        assert!(snapshot.status.contains(StatusFlags::ADC_TIMEOUT));
        assert!((snapshot.lambda_mv - 450.0).abs() < f32::EPSILON);
    }

    #[test]
    fn low_frequency_task_reads_idle_switch_and_drives_vvt() {
        let shared = CrankShared::new();
        let mut bench = Bench::new();
        bench.idle_switch = Level::Low;
        let mut engine = Engine::boot(bench, &shared, OutputLayout::BankSelected).expect("boot");
        run(&mut engine, 40);
        assert!(engine.status().contains(StatusFlags::IDLE_SWITCH_ON));
        // Stationary engine sits below the first VVT point.
        assert!(engine.io().duty[0].abs() < f32::EPSILON);
        assert_eq!(engine.io().bus_frames, 1, "rpm frame");
        assert!(engine.telemetry_snapshot().target_tps > 0.0);
    }

    #[test]
    fn very_low_frequency_task_handles_stationary_crank_and_fan() {
        let shared = CrankShared::new();
        let mut engine =
            Engine::boot(Bench::new().warm(), &shared, OutputLayout::BankSelected).expect("boot");
        shared.note_in_sync();
        run(&mut engine, 1000);
        assert_eq!(shared.in_sync(), 1, "sync count moved since boot");
        assert!((engine.io().duty[2] - 100.0).abs() < f32::EPSILON);
        assert!(engine.status().contains(StatusFlags::COOLING_FAN_ON));
        assert_eq!(engine.io().led, Some(Level::High));

        engine.io_mut().injectors = [true; INJECTORS];
        run(&mut engine, 1000);
        assert_eq!(shared.in_sync(), 0);
        assert!(engine.rpm().abs() < f32::EPSILON);
        assert_eq!(engine.io().injectors, [false; INJECTORS]);
        assert_eq!(engine.io().coils[0], Some(Level::High), "firing sense -1 rests high");
        assert_eq!(engine.io().led, Some(Level::Low));
        assert_eq!(engine.task_status(VLF_TASK).map(|s| s.overruns), Some(0));
    }

    #[test]
    fn turning_crank_is_not_stationary() {
        let shared = CrankShared::new();
        let mut engine =
            Engine::boot(Bench::new(), &shared, OutputLayout::BankSelected).expect("boot");
        for _ in 0..3 {
            shared.note_in_sync();
            run(&mut engine, 1000);
        }
        assert_eq!(shared.in_sync(), 3);
    }

    #[test]
    fn unknown_block_and_wrong_size_change_nothing() {
        let shared = CrankShared::new();
        let mut engine =
            Engine::boot(Bench::new(), &shared, OutputLayout::BankSelected).expect("boot");
        let items = [ParamValue::from_f32(1.0); 8];
        assert_eq!(
            engine.apply_configuration_block(700, &items),
            Err(ConfigError::UnknownBlock(700))
        );
        assert_eq!(
            engine.apply_configuration_block(200, &items),
            Err(ConfigError::SizeMismatch {
                expected: 34,
                supplied: 8
            })
        );
        assert_eq!(engine.page(), &defaults::PAGE);
    }

    #[test]
    fn filter_block_persists_and_reconfigures_sensors() {
        let shared = CrankShared::new();
        let mut engine =
            Engine::boot(Bench::new(), &shared, OutputLayout::BankSelected).expect("boot");
        let before = engine.io().configured;
        let items = [
            ParamValue::from_f32(0.25),
            ParamValue::from_f32(0.5),
            ParamValue::from_f32(0.01),
            ParamValue::from_f32(0.1),
            ParamValue::from_f32(0.5),
            ParamValue::from_f32(0.01),
            ParamValue::from_i32(0),
            ParamValue::from_i32(4),
        ];
        assert_eq!(
            engine.apply_configuration_block(100, &items),
            Ok(ResetScope::Sensors)
        );
        assert_eq!(engine.io().configured, before + 1);
        assert!((engine.page().filters.map - 0.25).abs() < f32::EPSILON);

        let address = engine.config().block_address(BlockId::Filters);
        let mut bytes = [0u8; 32];
        engine
            .io_mut()
            .restore_block(address, &mut bytes)
            .expect("filters saved");
        assert_eq!(bytes[28], 4, "crank filter shift stored little-endian");
    }

    #[test]
    fn write_failure_keeps_new_values_active() {
        let shared = CrankShared::new();
        let mut engine =
            Engine::boot(Bench::new(), &shared, OutputLayout::BankSelected).expect("boot");
        engine.io_mut().eeprom.device_mut().set_fail_writes(true);
        let items = p1_items(|p1| p1.cooling_fan_on_temp = 70.0);
        assert!(matches!(
            engine.apply_configuration_block(200, &items),
            Err(ConfigError::WriteError(_))
        ));
        assert!(engine.status().contains(StatusFlags::EEPROM_SAVE_ERROR));
        assert!((engine.page().p1.cooling_fan_on_temp - 70.0).abs() < f32::EPSILON);
    }

    #[test]
    fn parameter_block_triggers_full_reset() {
        let shared = CrankShared::new();
        let mut engine =
            Engine::boot(Bench::new(), &shared, OutputLayout::Sequenced).expect("boot");
        let _ = shared.take_settings();
        let items = p1_items(|p1| p1.cranking_threshold = 400.0);
        assert_eq!(
            engine.apply_configuration_block(200, &items),
            Ok(ResetScope::Full)
        );
        let settings = shared.take_settings().expect("settings offered again");
        assert!((settings.cranking_threshold - 400.0).abs() < f32::EPSILON);
        assert_eq!(settings.layout, OutputLayout::Sequenced);
    }

    #[test]
    fn configuration_switch() {
        let shared = CrankShared::new();
        let mut engine =
            Engine::boot(Bench::new(), &shared, OutputLayout::BankSelected).expect("boot");

        assert_eq!(
            engine.request_configuration_switch(9),
            Err(ConfigError::OutOfRange(9))
        );
        assert!(engine.status().contains(StatusFlags::INVALID_CONFIG));
        assert_eq!(engine.config().current_configuration(), 1);

        assert_eq!(engine.request_configuration_switch(2), Ok(()));
        assert_eq!(engine.config().current_configuration(), 2);
        // Page 2 was never written, so its blocks fail their checksums.
        assert!(engine.status().contains(StatusFlags::INVALID_CONFIG));

        let mut store = ConfigStore::new();
        let _ = store.restore(engine.io_mut());
        assert_eq!(store.current_configuration(), 2, "descriptor persisted");
    }

    #[test]
    fn stored_reversed_axis_is_ignored_at_boot() {
        let mut bench = Bench::new();
        let mut page = defaults::PAGE;
        page.p2.rpm_axis_start = 6000.0;
        page.p2.rpm_axis_delta = -700.0;
        page.ignition_map[3][3] = 25.0;
        let stored = ConfigStore::with_page(page);
        stored.persist_descriptor(&mut bench).expect("descriptor");
        for block in BlockId::ALL {
            stored.persist_block(block, &mut bench).expect("persist");
        }

        let shared = CrankShared::new();
        let mut engine = Engine::boot(bench, &shared, OutputLayout::BankSelected).expect("boot");
        assert!(engine.status().contains(StatusFlags::INVALID_CONFIG));
        assert_eq!(engine.page().p2, defaults::PAGE.p2);
        assert!((engine.page().ignition_map[3][3] - 25.0).abs() < f32::EPSILON);

        shared.set_filtered_period_us(1000);
        shared.note_in_sync();
        run(&mut engine, 200);
        assert!(engine.page().p2.axes_valid());
    }

    #[test]
    fn afr_reset_saves_when_storage_present() {
        let shared = CrankShared::new();
        let mut engine =
            Engine::boot(Bench::new(), &shared, OutputLayout::BankSelected).expect("boot");
        assert_eq!(engine.request_afr_reset(), Ok(()));

        engine.io_mut().eeprom.device_mut().set_fail_writes(true);
        assert!(engine.request_afr_reset().is_err());
        assert!(engine.status().contains(StatusFlags::EEPROM_SAVE_ERROR));
    }

    #[test]
    fn background_saves_afr_data_when_due() {
        let shared = CrankShared::new();
        let mut engine =
            Engine::boot(Bench::new().warm(), &shared, OutputLayout::BankSelected).expect("boot");
        // 1.2 s save period, i.e. a save on every VLF cycle.
        let items = p1_items(|p1| p1.afr_data_save_period = 0.02);
        assert!(engine.apply_configuration_block(200, &items).is_ok());

        shared.set_filtered_period_us(1000);
        shared.note_in_sync();
        run(&mut engine, 1000);
        assert!(engine.rpm() > 1000.0);
        engine.run_background();
        assert!((engine.telemetry_snapshot().afr_saves - 1.0).abs() < f32::EPSILON);

        engine.run_background();
        assert!(
            (engine.telemetry_snapshot().afr_saves - 1.0).abs() < f32::EPSILON,
            "flag consumed"
        );
    }

    #[test]
    fn snapshot_walks_afr_cells() {
        let shared = CrankShared::new();
        let mut engine =
            Engine::boot(Bench::new(), &shared, OutputLayout::BankSelected).expect("boot");
        let first = engine.telemetry_snapshot();
        let second = engine.telemetry_snapshot();
        assert!(first.afr_index.abs() < f32::EPSILON);
        assert!((second.afr_index - 1.0).abs() < f32::EPSILON);
    }

    #[test]
    fn idle_target_adjust_accumulates() {
        let shared = CrankShared::new();
        let mut engine =
            Engine::boot(Bench::new(), &shared, OutputLayout::BankSelected).expect("boot");
        engine.adjust_idle_target(1.5);
        engine.adjust_idle_target(-0.5);
        assert!((engine.idle().target_adjust() - 1.0).abs() < f32::EPSILON);
    }
}
