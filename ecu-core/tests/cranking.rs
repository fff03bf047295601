use ecu_core::config::{
    BlockId, ConfigError, ConfigPage, ParamValue, Parameters2, ResetScope,
};
use ecu_core::engine::Engine;
use ecu_core::io::{
    ActuatorOutputs, Clock, CrankInputs, DigitalInput, DigitalOutput, INJECTORS, Level,
    OneShotTimers, OutputAction, OutputDriver, PwmChannel, SensorSource, TelemetryChannel,
    TelemetrySink, TimerChannel,
};
use ecu_core::sensors::{SensorFault, SensorFrame};
use ecu_core::sequencer::{OutputLayout, SoftTimers};
use ecu_core::storage::{ChecksummedStore, RamEeprom, Storage, StorageError};
use ecu_core::trigger::{CrankShared, PhaseTracker, TriggerSettings};

/// 36-1 wheel at about 167 rpm.
const TOOTH_PERIOD_US: u32 = 10_000;

#[test]
fn cranking_wheel_syncs_and_drives_outputs() {
    let shared = CrankShared::new();
    let mut engine =
        Engine::boot(Bench::new(), &shared, OutputLayout::BankSelected).expect("boot");
    let mut tracker =
        PhaseTracker::new(TriggerSettings::from_page(engine.page(), engine.layout()));
    let mut rig = CrankRig::default();

    let mut page = engine.page().clone();
    page.p2.tw_tdc_angle = 114.0;
    page.p2.injector_start_angle = 40.0;
    let items = block_items(&page, BlockId::Parameters2);
    assert!(
        engine
            .apply_configuration_block(BlockId::Parameters2.raw(), &items)
            .is_ok()
    );

    for _ in 0..8 {
        revolution(&mut engine, &mut tracker, &shared, &mut rig, TOOTH_PERIOD_US);
    }

    assert!(shared.in_sync() >= 6, "one sync per revolution after lock");
    let rpm = engine.rpm();
    assert!((rpm - 166.67).abs() < 0.5, "rpm {rpm}");

    // 20 C coolant: 4% engine compensation, doubled while cranking.
    let pulse_width = i64::from(tracker.plan().injector_pw_us);
    assert!((pulse_width - 6480).abs() <= 1, "pulse width {pulse_width}");
    // 74 degrees before TDC on a 10 degree wheel.
    assert_eq!(tracker.plan().injector_index1, 7);
    assert_eq!(tracker.plan().injector_index2, 25);

    assert!(
        rig.pins.injector_opens.iter().all(|&opens| opens > 0),
        "cranking opens every injector together"
    );
    assert_eq!(rig.pins.injectors, [false; INJECTORS], "pulses have ended");
    assert!(rig.pins.coil_fires > 0);
}

#[test]
fn stopped_wheel_drops_sync_and_outputs() {
    let shared = CrankShared::new();
    let mut engine =
        Engine::boot(Bench::new(), &shared, OutputLayout::BankSelected).expect("boot");
    let mut tracker =
        PhaseTracker::new(TriggerSettings::from_page(engine.page(), engine.layout()));
    let mut rig = CrankRig::default();

    for _ in 0..6 {
        revolution(&mut engine, &mut tracker, &shared, &mut rig, TOOTH_PERIOD_US);
    }
    assert!(shared.in_sync() > 0);

    engine.io_mut().injectors = [true; INJECTORS];
    run(&mut engine, 2500);

    assert_eq!(shared.in_sync(), 0);
    assert!(engine.rpm().abs() < f32::EPSILON);
    assert_eq!(engine.io().injectors, [false; INJECTORS]);
    let snapshot = engine.telemetry_snapshot();
    assert!(snapshot.rpm.abs() < f32::EPSILON);
}

#[test]
fn wheel_settings_reach_the_crank_handler_on_the_next_tooth() {
    let shared = CrankShared::new();
    let mut engine =
        Engine::boot(Bench::new(), &shared, OutputLayout::BankSelected).expect("boot");
    let mut tracker =
        PhaseTracker::new(TriggerSettings::from_page(engine.page(), engine.layout()));
    let mut rig = CrankRig::default();
    revolution(&mut engine, &mut tracker, &shared, &mut rig, TOOTH_PERIOD_US);

    let mut page = engine.page().clone();
    page.p2.injector_start_angle = 40.0;
    let items = block_items(&page, BlockId::Parameters2);
    assert_eq!(
        engine.apply_configuration_block(BlockId::Parameters2.raw(), &items),
        Ok(ResetScope::Full)
    );
    assert!((tracker.settings().injector_angle - 15.0).abs() < f32::EPSILON);

    tooth(&mut engine, &mut tracker, &shared, &mut rig, TOOTH_PERIOD_US);
    assert!((tracker.settings().injector_angle - 40.0).abs() < f32::EPSILON);
    // (138 - 40) degrees on a 10 degree wheel.
    assert_eq!(tracker.plan().injector_index1, 9);
    assert_eq!(tracker.plan().injector_index2, 27);
}

#[test]
fn running_wheel_counts_one_sync_per_revolution() {
    let shared = CrankShared::new();
    let mut engine =
        Engine::boot(Bench::new(), &shared, OutputLayout::BankSelected).expect("boot");
    let mut tracker =
        PhaseTracker::new(TriggerSettings::from_page(engine.page(), engine.layout()));
    let mut rig = CrankRig::default();
    for _ in 0..3 {
        revolution(&mut engine, &mut tracker, &shared, &mut rig, TOOTH_PERIOD_US);
    }
    let synced = shared.in_sync();
    let errors = shared.sync_errors();
    assert!(synced > 0, "locked after three revolutions");

    for turns in 1..=10 {
        revolution(&mut engine, &mut tracker, &shared, &mut rig, TOOTH_PERIOD_US);
        assert_eq!(shared.in_sync(), synced + turns);
        assert_eq!(shared.sync_errors(), errors);
    }
}

#[test]
fn reversed_rpm_axis_is_refused_and_the_engine_keeps_running() {
    let shared = CrankShared::new();
    let mut engine =
        Engine::boot(Bench::new(), &shared, OutputLayout::BankSelected).expect("boot");
    let mut tracker =
        PhaseTracker::new(TriggerSettings::from_page(engine.page(), engine.layout()));
    let mut rig = CrankRig::default();
    let before = engine.page().p2;

    let mut page = engine.page().clone();
    page.p2.rpm_axis_start = 6000.0;
    page.p2.rpm_axis_delta = -700.0;
    let items = block_items(&page, BlockId::Parameters2);
    assert_eq!(
        engine.apply_configuration_block(BlockId::Parameters2.raw(), &items),
        Err(ConfigError::InvalidAxis)
    );
    assert_eq!(engine.page().p2, before);

    page.p2.rpm_axis_start = 750.0;
    page.p2.rpm_axis_delta = 700.0;
    page.p2.load_axis_start = f32::NAN;
    let items = block_items(&page, BlockId::Parameters2);
    assert_eq!(
        engine.apply_configuration_block(BlockId::Parameters2.raw(), &items),
        Err(ConfigError::InvalidAxis)
    );

    for _ in 0..4 {
        revolution(&mut engine, &mut tracker, &shared, &mut rig, TOOTH_PERIOD_US);
    }
    run(&mut engine, 10);
    assert!(shared.in_sync() > 0);
    assert!((engine.rpm() - 166.67).abs() < 0.5);
}

fn block_items(page: &ConfigPage, block: BlockId) -> [ParamValue; Parameters2::ITEMS] {
    core::array::from_fn(|index| page.item(block, index).expect("item in range"))
}

/// One tooth edge: time passes, the edge is handled, and the tick loop
/// catches up.
fn tooth(
    engine: &mut Engine<'_, Bench>,
    tracker: &mut PhaseTracker,
    shared: &CrankShared,
    rig: &mut CrankRig,
    period_us: u32,
) {
    rig.timers.advance(period_us, &mut rig.pins);
    tracker.handle_crank_pulse(period_us, shared, rig);
    run(engine, period_us / 1000);
}

/// 35 teeth, the last one after the double-width gap.
fn revolution(
    engine: &mut Engine<'_, Bench>,
    tracker: &mut PhaseTracker,
    shared: &CrankShared,
    rig: &mut CrankRig,
    period_us: u32,
) {
    let settings = *tracker.settings();
    for _ in 1..settings.teeth - settings.missing_teeth {
        tooth(engine, tracker, shared, rig, period_us);
    }
    tooth(engine, tracker, shared, rig, period_us * 2);
}

fn run(engine: &mut Engine<'_, Bench>, ticks: u32) {
    for _ in 0..ticks {
        engine.io_mut().now_ms += 1;
        engine.on_tick();
    }
}

/// Injector and coil pins as seen by the crank handler.
#[derive(Default)]
struct Pins {
    injectors: [bool; INJECTORS],
    injector_opens: [u32; INJECTORS],
    coils: [Option<Level>; INJECTORS],
    coil_fires: u32,
}

impl OutputDriver for Pins {
    fn set_injector(&mut self, index: u8, open: bool) {
        let index = usize::from(index);
        if open && !self.injectors[index] {
            self.injector_opens[index] += 1;
        }
        self.injectors[index] = open;
    }

    fn set_coil(&mut self, index: u8, level: Level) {
        let index = usize::from(index);
        // Default firing sense: dwell pulls low, the spark releases high.
        if self.coils[index] == Some(Level::Low) && level == Level::High {
            self.coil_fires += 1;
        }
        self.coils[index] = Some(level);
    }
}

#[derive(Default)]
struct CrankRig {
    timers: SoftTimers,
    pins: Pins,
}

impl OneShotTimers for CrankRig {
    fn schedule_one_shot(
        &mut self,
        channel: TimerChannel,
        delay_us: u32,
        duration_us: u32,
        on_fire: Option<OutputAction>,
        on_expire: OutputAction,
    ) {
        self.timers
            .schedule_one_shot(channel, delay_us, duration_us, on_fire, on_expire);
    }
}

impl OutputDriver for CrankRig {
    fn set_injector(&mut self, index: u8, open: bool) {
        self.pins.set_injector(index, open);
    }

    fn set_coil(&mut self, index: u8, level: Level) {
        self.pins.set_coil(index, level);
    }
}

impl CrankInputs for CrankRig {
    fn bank_select(&mut self) -> bool {
        false
    }

    fn take_camshaft_sync(&mut self) -> bool {
        false
    }
}

/// Task-side hardware: fixed sensors, recorded outputs, RAM storage.
struct Bench {
    injectors: [bool; INJECTORS],
    eeprom: ChecksummedStore<RamEeprom<16384>>,
    now_ms: u64,
}

impl Bench {
    fn new() -> Self {
        Self {
            injectors: [false; INJECTORS],
            eeprom: ChecksummedStore::new(RamEeprom::new()),
            now_ms: 0,
        }
    }
}

impl SensorSource for Bench {
    fn read_filtered(&mut self) -> Result<SensorFrame, SensorFault> {
        Ok(SensorFrame {
            map_kpa: 95.0,
            lambda_mv: 450.0,
            coolant_c: 20.0,
            air_c: 20.0,
            tps_mv: 600.0,
            battery_v: 12.0,
            tps_percent: 2.0,
            thermistor_ohms: 2500.0,
        })
    }
}

impl ActuatorOutputs for Bench {
    fn set_duty_cycle(&mut self, _channel: PwmChannel, _percent: f32) {}

    fn set_digital(&mut self, _output: DigitalOutput, _level: Level) {}

    fn read_digital(&mut self, _input: DigitalInput) -> Level {
        Level::High
    }
}

impl OutputDriver for Bench {
    fn set_injector(&mut self, index: u8, open: bool) {
        self.injectors[usize::from(index)] = open;
    }

    fn set_coil(&mut self, _index: u8, _level: Level) {}
}

impl TelemetrySink for Bench {
    fn transmit(&mut self, _channel: TelemetryChannel, _bytes: &[u8]) {}
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
