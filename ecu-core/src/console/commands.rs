//! Command execution and host replies.

#![allow(clippy::cast_possible_truncation)]

use core::fmt::Write;

use heapless::String;

use super::ConsoleError;
use super::grammar::HostCommand;
use crate::config::{BlockId, ConfigError, ItemKind};
use crate::engine::Engine;
use crate::io::EngineIo;
use crate::status::StatusFlags;
use crate::telemetry::DATA_RANGE;

pub const REPLY_CAPACITY: usize = 1024;

pub type Reply = String<REPLY_CAPACITY>;

/// Version reported to the host.
pub const FIRMWARE_VERSION: f32 = 3202.03;

const BUILD: &str = env!("CARGO_PKG_VERSION");

/// Runs `command` and renders its reply. Commands that change state
/// silently return `None`.
pub fn execute<IO: EngineIo>(engine: &mut Engine<'_, IO>, command: &HostCommand) -> Option<Reply> {
    match command {
        HostCommand::TargetIdleAdjust(delta) => {
            engine.adjust_idle_target(*delta);
            None
        }
        HostCommand::SendData => text(engine.telemetry_snapshot().data_line().ok()?.as_str()),
        HostCommand::Sync => text("<\r\n"),
        HostCommand::Identify => identify(engine),
        HostCommand::SwitchConfig(number) => {
            // The outcome shows up in the status word of the next data line.
            let _ = engine.request_configuration_switch(*number);
            None
        }
        HostCommand::WriteBlock { block, items } => {
            let outcome = engine.apply_configuration_block(*block, items);
            text(write_outcome(*block, outcome.map(|_| ())))
        }
        HostCommand::SendBlock(block) => dump_block(engine, BlockId::from_raw(*block)?),
        HostCommand::ResetAfr => text(match engine.request_afr_reset() {
            Ok(()) => ">Lambda Sensor AFR reset success\r\n",
            Err(_) => ">Lambda Sensor AFR data failed to store data to NVM\r\n",
        }),
    }
}

/// Reply for a command that failed to decode, where the host expects one.
#[must_use]
pub fn error_reply(error: ConsoleError) -> Option<Reply> {
    match error {
        ConsoleError::ItemCount { .. } => text(">NVM: Error in number of data items received\r\n"),
        ConsoleError::Checksum => text(">NVM: Error in checksum\r\n"),
        _ => None,
    }
}

fn write_outcome(block: i32, outcome: Result<(), ConfigError>) -> &'static str {
    match outcome {
        Ok(()) => match BlockId::from_raw(block) {
            Some(BlockId::Filters) => ">NVM: FILTER written successfully\r\n",
            Some(BlockId::Parameters1) => ">NVM: PAR 1 written successfully\r\n",
            Some(BlockId::Parameters2) => ">NVM: PAR 2 written successfully\r\n",
            Some(BlockId::VeMap) => ">NVM: VE MAP written successfully\r\n",
            Some(BlockId::IgnitionMap) => ">NVM: IG MAP written successfully\r\n",
            Some(BlockId::TargetAfrMap) => ">NVM: TGT AFR written successfully\r\n",
            None => ">NVM: Data Block ID invalid\r\n",
        },
        Err(ConfigError::SizeMismatch { .. }) => {
            ">NVM: Number of data items does not match data block\r\n"
        }
        Err(ConfigError::UnknownBlock(_)) => ">NVM: Data Block ID invalid\r\n",
        Err(_) => ">NVM: Page write error\r\n",
    }
}

fn identify<IO: EngineIo>(engine: &Engine<'_, IO>) -> Option<Reply> {
    let mut reply = Reply::new();
    write!(
        reply,
        ">EFI Controller, stm32 MPU: {FIRMWARE_VERSION:.3} {BUILD}, selected configuration {}",
        engine.config().current_configuration()
    )
    .ok()?;
    if engine.status().contains(StatusFlags::INVALID_CONFIG) {
        reply.write_str(" | NVM CONFIGURATION DATA INVALID").ok()?;
    }
    reply.write_str("\r\n").ok()?;
    Some(reply)
}

/// `$<ecu id>:<version>:<config>,<items>,<block>,<item>...`
fn dump_block<IO: EngineIo>(engine: &Engine<'_, IO>, block: BlockId) -> Option<Reply> {
    let page = engine.page();
    let decimals = dump_decimals(block);
    let mut reply = Reply::new();
    write!(
        reply,
        "${}:{FIRMWARE_VERSION:.3}:{},{},{}",
        page.p2.ecu_id,
        engine.config().current_configuration(),
        block.items(),
        block.raw()
    )
    .ok()?;
    for index in 0..block.items() {
        let item = page.item(block, index)?;
        match block.kind(index) {
            ItemKind::Int => {
                let limit = DATA_RANGE as i32;
                write!(reply, ",{}", item.int.clamp(-limit, limit)).ok()?;
            }
            ItemKind::Float => {
                let value = item.float.clamp(-DATA_RANGE, DATA_RANGE);
                write!(reply, ",{value:.decimals$}").ok()?;
            }
        }
    }
    reply.write_str("\r\n").ok()?;
    Some(reply)
}

const fn dump_decimals(block: BlockId) -> usize {
    match block {
        BlockId::Filters => 2,
        BlockId::Parameters1 => 4,
        BlockId::Parameters2 | BlockId::VeMap | BlockId::IgnitionMap => 1,
        BlockId::TargetAfrMap => 0,
    }
}

fn text(line: &str) -> Option<Reply> {
    let mut reply = Reply::new();
    reply.write_str(line).ok()?;
    Some(reply)
}
