use ecu_core::console::commands::error_reply;
use ecu_core::console::{ConsoleSession, Reply, execute};
use ecu_core::engine::Engine;
use ecu_core::io::{
    ActuatorOutputs, Clock, DigitalInput, DigitalOutput, Level, OutputDriver, PwmChannel,
    SensorSource, TelemetryChannel, TelemetrySink,
};
use ecu_core::sensors::{SensorFault, SensorFrame};
use ecu_core::sequencer::OutputLayout;
use ecu_core::status::StatusFlags;
use ecu_core::storage::{ChecksummedStore, RamEeprom, Storage, StorageError};
use ecu_core::trigger::CrankShared;

#[test]
fn identify_reports_invalid_blank_storage() {
    let shared = CrankShared::new();
    let mut host = Host::boot(&shared);
    let reply = host.send("si#").expect("identification line");
    assert!(reply.starts_with(">EFI Controller, stm32 MPU: 3202.030 "));
    assert!(reply.ends_with("selected configuration 1 | NVM CONFIGURATION DATA INVALID\r\n"));
}

#[test]
fn sync_and_data_lines() {
    let shared = CrankShared::new();
    let mut host = Host::boot(&shared);
    assert_eq!(host.send("sy#").as_deref(), Some("<\r\n"));

    let line = host.send("\r\nsd#").expect("data line");
    assert!(line.starts_with("*,"));
    assert!(line.ends_with("\r\n"));
    assert_eq!(line.trim_end().split(',').count(), 2 + 27);
}

#[test]
fn written_filter_block_reads_back() {
    let shared = CrankShared::new();
    let mut host = Host::boot(&shared);
    assert_eq!(
        host.send("wf100,8,5.37,0.25,0.5,0.01,0.1,0.5,0.01,0,4#")
            .as_deref(),
        Some(">NVM: FILTER written successfully\r\n")
    );
    assert_eq!(
        host.send("sn100#").as_deref(),
        Some("$32:3202.030:1,8,100,0.25,0.50,0.01,0.10,0.50,0.01,0,4\r\n")
    );
}

#[test]
fn block_write_errors_are_reported() {
    let shared = CrankShared::new();
    let mut host = Host::boot(&shared);
    assert_eq!(
        host.send("wf100,8,9.0,0.25,0.5,0.01,0.1,0.5,0.01,0,4#")
            .as_deref(),
        Some(">NVM: Error in checksum\r\n")
    );
    assert_eq!(
        host.send("wf100,9,5.37,0.25,0.5,0.01,0.1,0.5,0.01,0,4#")
            .as_deref(),
        Some(">NVM: Error in number of data items received\r\n")
    );
    assert_eq!(
        host.send("wf100,2,3,1,2#").as_deref(),
        Some(">NVM: Number of data items does not match data block\r\n")
    );
    assert_eq!(
        host.send("wf900,1,1,1#").as_deref(),
        Some(">NVM: Data Block ID invalid\r\n")
    );

    host.engine.io_mut().eeprom.device_mut().set_fail_writes(true);
    assert_eq!(
        host.send("wf100,8,5.37,0.25,0.5,0.01,0.1,0.5,0.01,0,4#")
            .as_deref(),
        Some(">NVM: Page write error\r\n")
    );
    assert!(host.engine.status().contains(StatusFlags::EEPROM_SAVE_ERROR));
}

#[test]
fn unknown_block_dump_is_silent() {
    let shared = CrankShared::new();
    let mut host = Host::boot(&shared);
    assert_eq!(host.send("sn700#"), None);
    assert_eq!(host.send("zz#"), None);
}

#[test]
fn configuration_switch_is_silent_and_selects_the_page() {
    let shared = CrankShared::new();
    let mut host = Host::boot(&shared);
    assert_eq!(host.send("sc3#"), None);
    assert_eq!(host.engine.config().current_configuration(), 3);
    let reply = host.send("si#").expect("identification line");
    assert!(reply.contains("selected configuration 3"));
}

#[test]
fn afr_reset_and_idle_adjust() {
    let shared = CrankShared::new();
    let mut host = Host::boot(&shared);
    assert_eq!(
        host.send("ra#").as_deref(),
        Some(">Lambda Sensor AFR reset success\r\n")
    );
    host.engine.io_mut().eeprom.device_mut().set_fail_writes(true);
    assert_eq!(
        host.send("ra#").as_deref(),
        Some(">Lambda Sensor AFR data failed to store data to NVM\r\n")
    );

    assert_eq!(host.send("tt2.5#"), None);
    assert_eq!(host.send("tt-1#"), None);
    assert!((host.engine.idle().target_adjust() - 1.5).abs() < f32::EPSILON);
}

/// Console session wired to an engine the way the firmware wires it.
struct Host<'a> {
    session: ConsoleSession,
    engine: Engine<'a, Bench>,
}

impl<'a> Host<'a> {
    fn boot(shared: &'a CrankShared) -> Self {
        Self {
            session: ConsoleSession::new(),
            engine: Engine::boot(Bench::new(), shared, OutputLayout::BankSelected)
                .expect("boot"),
        }
    }

    /// Feeds `text` and returns the reply to the last completed command.
    fn send(&mut self, text: &str) -> Option<Reply> {
        let mut reply = None;
        for &byte in text.as_bytes() {
            reply = match self.session.ingest(byte) {
                Ok(None) => continue,
                Ok(Some(command)) => execute(&mut self.engine, &command),
                Err(err) => error_reply(err),
            };
        }
        reply
    }
}

struct Bench {
    eeprom: ChecksummedStore<RamEeprom<16384>>,
}

impl Bench {
    fn new() -> Self {
        Self {
            eeprom: ChecksummedStore::new(RamEeprom::new()),
        }
    }
}

impl SensorSource for Bench {
    fn read_filtered(&mut self) -> Result<SensorFrame, SensorFault> {
        Ok(SensorFrame::default())
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
    fn set_injector(&mut self, _index: u8, _open: bool) {}

    fn set_coil(&mut self, _index: u8, _level: Level) {}
}

impl TelemetrySink for Bench {
    fn transmit(&mut self, _channel: TelemetryChannel, _bytes: &[u8]) {}
}

impl Clock for Bench {
    fn now_ms(&self) -> u64 {
        0
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
