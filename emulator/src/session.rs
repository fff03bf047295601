use std::fs::{self, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::time::{Duration, Instant as HostInstant};

use ecu_core::config::defaults;
use ecu_core::console::commands::error_reply;
use ecu_core::console::{ConsoleSession, execute};
use ecu_core::engine::Engine;
use ecu_core::io::{
    ActuatorOutputs, AdcSampler, Clock, ConditionedSensors, CrankInputs, DigitalInput,
    DigitalOutput, INJECTORS, Level, OneShotTimers, OutputAction, OutputDriver, PwmChannel,
    SensorSource, TelemetryChannel, TelemetrySink, TimerChannel,
};
use ecu_core::sensors::{RawSample, SensorFault, SensorFrame};
use ecu_core::sequencer::{OutputLayout, SoftTimers};
use ecu_core::storage::{ChecksummedStore, RamEeprom, Storage, StorageError};
use ecu_core::trigger::{CrankShared, PhaseTracker, TriggerSettings};

const EEPROM_SIZE: usize = 16 * 1024;
const BACKGROUND_PERIOD_MS: u64 = 10;
/// Longest single `run` request.
const MAX_RUN_MS: u64 = 600_000;

pub const HELP_TOPICS: &[(&str, &str)] = &[
    ("<cmd>#", "<cmd>#                     - send a host console command, e.g. si# or sd#"),
    ("rpm", "rpm <value>                - set the simulated crank speed (0 stops)"),
    ("run", "run <ms>                   - advance simulated time"),
    ("sensor", "sensor <channel> <counts>  - set a raw ADC reading"),
    ("status", "status                     - show engine state"),
    ("help", "help [topic]               - show help for a command"),
];

const SENSOR_CHANNELS: &[&str] = &["map", "lambda", "coolant", "air", "tps", "battery"];

/// Host console plus a simulated engine, with every exchange written to a
/// transcript.
pub struct Session {
    engine: Engine<'static, SimBoard>,
    shared: &'static CrankShared,
    tracker: PhaseTracker,
    rig: CrankRig,
    wheel: Wheel,
    console: ConsoleSession,
    transcript: TranscriptLogger,
    started_at: HostInstant,
    sim_ms: u64,
    last_background_ms: u64,
}

impl Session {
    pub fn new(transcript: &Path, rpm: f32) -> io::Result<Self> {
        let transcript = TranscriptLogger::new(transcript)?;
        // Lives as long as the process, like the firmware's static.
        let shared: &'static CrankShared = Box::leak(Box::new(CrankShared::new()));
        let engine = Engine::boot(SimBoard::new(), shared, OutputLayout::BankSelected)
            .map_err(|err| io::Error::other(format!("engine boot failed: {err:?}")))?;
        let tracker = PhaseTracker::new(TriggerSettings::from_page(engine.page(), engine.layout()));

        Ok(Self {
            engine,
            shared,
            tracker,
            rig: CrankRig::default(),
            wheel: Wheel::new(rpm),
            console: ConsoleSession::new(),
            transcript,
            started_at: HostInstant::now(),
            sim_ms: 0,
            last_background_ms: 0,
        })
    }

    pub fn handle_command(&mut self, line: &str) -> io::Result<Vec<String>> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return Ok(Vec::new());
        }

        let elapsed = self.started_at.elapsed();
        self.transcript
            .append_line(elapsed, TranscriptRole::Host, trimmed)?;

        let lines = if trimmed.contains('#') {
            self.console_bytes(trimmed.as_bytes())
        } else {
            self.meta_command(trimmed)
        };
        self.record_output(elapsed, &lines)?;
        Ok(lines)
    }

    fn console_bytes(&mut self, bytes: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        for &byte in bytes {
            let reply = match self.console.ingest(byte) {
                Ok(None) => continue,
                Ok(Some(command)) => execute(&mut self.engine, &command),
                Err(err) => {
                    lines.push(format!("(console: {err})"));
                    error_reply(err)
                }
            };
            if let Some(reply) = reply {
                lines.extend(
                    reply
                        .split("\r\n")
                        .filter(|part| !part.is_empty())
                        .map(str::to_string),
                );
            }
        }
        lines
    }

    fn meta_command(&mut self, line: &str) -> Vec<String> {
        let mut words = line.split_whitespace();
        let Some(command) = words.next() else {
            return Vec::new();
        };
        let args: Vec<&str> = words.collect();

        match (command.to_ascii_lowercase().as_str(), args.as_slice()) {
            ("help", []) => HELP_TOPICS.iter().map(|(_, text)| (*text).to_string()).collect(),
            ("help", [topic]) => match HELP_TOPICS.iter().find(|(name, _)| name == topic) {
                Some((_, text)) => vec![(*text).to_string()],
                None => vec![format!("ERR unknown topic `{topic}`; try {}", help_topic_list())],
            },
            ("rpm", [value]) => match value.parse::<f32>() {
                Ok(rpm) if rpm >= 0.0 => {
                    self.wheel.set_rpm(rpm);
                    vec![format!("OK rpm={rpm:.0}")]
                }
                _ => vec![format!("ERR rpm expects a non-negative number, got `{value}`")],
            },
            ("run", [value]) => match value.parse::<u64>() {
                Ok(ms) if ms <= MAX_RUN_MS => {
                    self.advance_ms(ms);
                    vec![format!("OK t=+{}ms rpm={:.0}", self.sim_ms, self.engine.rpm())]
                }
                _ => vec![format!("ERR run expects 0-{MAX_RUN_MS} ms, got `{value}`")],
            },
            ("sensor", [channel, counts]) => self.set_sensor(channel, counts),
            ("status", []) => self.status_lines(),
            _ => vec![format!("ERR syntax `{line}`; type `help`")],
        }
    }

    fn set_sensor(&mut self, channel: &str, counts: &str) -> Vec<String> {
        let Ok(counts) = counts.parse::<u16>() else {
            return vec![format!("ERR sensor counts must be 0-65535, got `{counts}`")];
        };
        let raw = &mut self.engine.io_mut().sensors.sampler_mut().raw;
        let slot = match channel {
            "map" => &mut raw.map,
            "lambda" => &mut raw.lambda,
            "coolant" => &mut raw.coolant,
            "air" => &mut raw.air,
            "tps" => &mut raw.tps,
            "battery" => &mut raw.battery,
            _ => {
                return vec![format!(
                    "ERR unknown channel `{channel}`; expected one of {}",
                    SENSOR_CHANNELS.join(", ")
                )];
            }
        };
        *slot = counts;
        vec![format!("OK {channel}={counts}")]
    }

    fn status_lines(&mut self) -> Vec<String> {
        let snapshot = self.engine.telemetry_snapshot();
        let board = self.engine.io();
        vec![
            format!(
                "t=+{}ms wheel={:.0}rpm engine={:.1}rpm sync={} sync-errors={}",
                self.sim_ms,
                self.wheel.rpm,
                self.engine.rpm(),
                self.shared.in_sync(),
                self.shared.sync_errors()
            ),
            format!(
                "status={:#010x} config={} pw={:.0}us advance={:.1}",
                self.engine.status().bits(),
                self.engine.config().current_configuration(),
                self.shared.pulse_width_us(),
                self.shared.advance()
            ),
            format!(
                "coolant={:.1}C map={:.1}kPa afr-saves={:.0}",
                snapshot.coolant_c, snapshot.map_kpa, snapshot.afr_saves
            ),
            format!(
                "injector-pulses={:?} sparks={} bus-frames={} led={:?}",
                self.rig.pins.injector_opens, self.rig.pins.coil_fires, board.bus_frames, board.led
            ),
        ]
    }

    /// Advances simulated time millisecond by millisecond: crank edges and
    /// timer actions first, then the scheduler tick, then background work.
    fn advance_ms(&mut self, ms: u64) {
        for _ in 0..ms {
            self.crank_millisecond();
            self.sim_ms += 1;
            self.engine.io_mut().now_ms = self.sim_ms;
            self.engine.on_tick();
            if self.sim_ms - self.last_background_ms >= BACKGROUND_PERIOD_MS {
                self.last_background_ms = self.sim_ms;
                self.engine.run_background();
            }
        }
    }

    fn crank_millisecond(&mut self) {
        let settings = *self.tracker.settings();
        let mut left = 1000u32;
        while let Some(edge) = self.wheel.next_edge_within(left, &settings) {
            self.rig.timers.advance(edge.after_us, &mut self.rig.pins);
            left -= edge.after_us;
            self.rig.bank = edge.bank;
            self.tracker
                .handle_crank_pulse(edge.period_us, self.shared, &mut self.rig);
        }
        self.rig.timers.advance(left, &mut self.rig.pins);
    }

    fn record_output(&mut self, elapsed: Duration, lines: &[String]) -> io::Result<()> {
        for line in lines {
            self.transcript
                .append_line(elapsed, TranscriptRole::Emulator, line)?;
        }
        Ok(())
    }
}

fn help_topic_list() -> String {
    HELP_TOPICS
        .iter()
        .map(|(name, _)| *name)
        .collect::<Vec<_>>()
        .join(", ")
}

/// A missing-tooth wheel turning at a fixed speed.
struct Wheel {
    rpm: f32,
    /// Edges since the gap.
    position: i32,
    /// Time to the next edge and the gap it closes.
    pending: Option<(u32, u32)>,
    bank: bool,
}

struct Edge {
    after_us: u32,
    period_us: u32,
    bank: bool,
}

impl Wheel {
    fn new(rpm: f32) -> Self {
        Self {
            rpm: rpm.max(0.0),
            position: 0,
            pending: None,
            bank: false,
        }
    }

    fn set_rpm(&mut self, rpm: f32) {
        self.rpm = rpm;
        self.pending = None;
    }

    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
    fn tooth_period_us(&self, teeth: i32) -> Option<u32> {
        (self.rpm > 0.0).then(|| (60_000_000.0 / (self.rpm * teeth as f32)) as u32)
    }

    /// Next edge if it lands within `budget_us`; otherwise consumes the
    /// budget.
    #[allow(clippy::cast_sign_loss)]
    fn next_edge_within(&mut self, budget_us: u32, settings: &TriggerSettings) -> Option<Edge> {
        let base = self.tooth_period_us(settings.teeth)?.max(1);
        let (remaining, period) = *self.pending.get_or_insert_with(|| {
            let gap = if self.position >= settings.teeth - settings.missing_teeth - 1 {
                base * (settings.missing_teeth as u32 + 1)
            } else {
                base
            };
            (gap, gap)
        });

        if remaining > budget_us {
            self.pending = Some((remaining - budget_us, period));
            return None;
        }

        self.pending = None;
        if period > base {
            self.position = 0;
            self.bank = !self.bank;
        } else {
            self.position += 1;
        }
        Some(Edge {
            after_us: remaining,
            period_us: period,
            bank: self.bank,
        })
    }
}

/// Injector and coil pins behind the crank handler's timers.
#[derive(Default)]
struct CrankPins {
    injectors: [bool; INJECTORS],
    injector_opens: [u32; INJECTORS],
    coils: [Option<Level>; INJECTORS],
    coil_fires: u32,
}

impl OutputDriver for CrankPins {
    fn set_injector(&mut self, index: u8, open: bool) {
        let index = usize::from(index);
        if open && !self.injectors[index] {
            self.injector_opens[index] += 1;
        }
        self.injectors[index] = open;
    }

    fn set_coil(&mut self, index: u8, level: Level) {
        let index = usize::from(index);
        if self.coils[index] == Some(Level::Low) && level == Level::High {
            self.coil_fires += 1;
        }
        self.coils[index] = Some(level);
    }
}

#[derive(Default)]
struct CrankRig {
    timers: SoftTimers,
    pins: CrankPins,
    bank: bool,
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
        self.bank
    }

    fn take_camshaft_sync(&mut self) -> bool {
        false
    }
}

/// Raw readings set from the prompt.
struct SimAdc {
    raw: RawSample,
}

impl AdcSampler for SimAdc {
    fn sample(&mut self) -> Result<RawSample, SensorFault> {
        Ok(self.raw)
    }
}

/// Task-side hardware of the simulated engine.
struct SimBoard {
    sensors: ConditionedSensors<SimAdc>,
    duty: [f32; 3],
    led: Level,
    idle_switch: Level,
    injectors: [bool; INJECTORS],
    bus_frames: usize,
    eeprom: ChecksummedStore<RamEeprom<EEPROM_SIZE>>,
    now_ms: u64,
}

impl SimBoard {
    fn new() -> Self {
        let raw = RawSample {
            map: 1200,
            lambda: 560,
            coolant: 1500,
            air: 2000,
            tps: 250,
            battery: 2700,
        };
        Self {
            sensors: ConditionedSensors::new(SimAdc { raw }, &defaults::PAGE),
            duty: [0.0; 3],
            led: Level::Low,
            idle_switch: Level::High,
            injectors: [false; INJECTORS],
            bus_frames: 0,
            eeprom: ChecksummedStore::new(RamEeprom::new()),
            now_ms: 0,
        }
    }
}

impl SensorSource for SimBoard {
    fn read_filtered(&mut self) -> Result<SensorFrame, SensorFault> {
        self.sensors.read_filtered()
    }

    fn configure(&mut self, page: &ecu_core::config::ConfigPage) {
        self.sensors.configure(page);
    }
}

impl ActuatorOutputs for SimBoard {
    fn set_duty_cycle(&mut self, channel: PwmChannel, percent: f32) {
        let index = match channel {
            PwmChannel::Vvt => 0,
            PwmChannel::IdleActuator => 1,
            PwmChannel::CoolingFan => 2,
        };
        self.duty[index] = percent;
    }

    fn set_digital(&mut self, output: DigitalOutput, level: Level) {
        match output {
            DigitalOutput::StatusLed => self.led = level,
        }
    }

    fn read_digital(&mut self, input: DigitalInput) -> Level {
        match input {
            DigitalInput::IdleSwitch => self.idle_switch,
        }
    }
}

impl OutputDriver for SimBoard {
    fn set_injector(&mut self, index: u8, open: bool) {
        self.injectors[usize::from(index)] = open;
    }

    fn set_coil(&mut self, _index: u8, _level: Level) {}
}

impl TelemetrySink for SimBoard {
    fn transmit(&mut self, channel: TelemetryChannel, _bytes: &[u8]) {
        if let TelemetryChannel::Bus(_) = channel {
            self.bus_frames += 1;
        }
    }
}

impl Clock for SimBoard {
    fn now_ms(&self) -> u64 {
        self.now_ms
    }
}

impl Storage for SimBoard {
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

struct TranscriptLogger {
    writer: BufWriter<std::fs::File>,
}

impl TranscriptLogger {
    fn new(path: &Path) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)?;
        let mut logger = Self {
            writer: BufWriter::new(file),
        };
        logger.write_header()?;
        Ok(logger)
    }

    fn write_header(&mut self) -> io::Result<()> {
        writeln!(self.writer, "# ECU emulator transcript")?;
        writeln!(
            self.writer,
            "# Timestamps are milliseconds since session start"
        )?;
        writeln!(self.writer)?;
        self.writer.flush()
    }

    fn append_line(
        &mut self,
        elapsed: Duration,
        role: TranscriptRole,
        line: &str,
    ) -> io::Result<()> {
        writeln!(
            self.writer,
            "[+{:>6} ms] {} {}",
            elapsed.as_millis(),
            role.prefix(),
            line
        )?;
        self.writer.flush()
    }
}

enum TranscriptRole {
    Host,
    Emulator,
}

impl TranscriptRole {
    fn prefix(&self) -> &'static str {
        match self {
            TranscriptRole::Host => "HOST>",
            TranscriptRole::Emulator => "EMU <",
        }
    }
}
