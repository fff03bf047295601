//! Host command grammar.
//!
//! A command is a two letter code followed by comma separated numeric
//! fields, e.g. `wf100,8,1.5,...`. The first field follows the code
//! directly. Every field is read both as a float and as a leading integer;
//! the command decides which one it wants.

use heapless::Vec;
use winnow::ascii::dec_int;
use winnow::combinator::{alt, eof, opt, preceded, repeat, terminated};
use winnow::error::{ContextError, ErrMode, ModalResult};
use winnow::prelude::*;
use winnow::token::take_while;

use super::ConsoleError;
use crate::config::ParamValue;

/// Most fields accepted on one command.
pub const MAX_FIELDS: usize = 70;

/// Allowed gap between a write's checksum and the sum of its items.
pub const CHECKSUM_TOLERANCE: f32 = 0.05;

pub type Fields = Vec<ParamValue, MAX_FIELDS>;

/// Decoded host command.
#[derive(Clone, Debug, PartialEq)]
pub enum HostCommand {
    /// `tt<f>`: add to the idle target offset.
    TargetIdleAdjust(f32),
    /// `sd`: send one data line.
    SendData,
    /// `sy`: answer with the sync marker.
    Sync,
    /// `si`: send the identification line.
    Identify,
    /// `sc<n>`: switch to configuration `n`.
    SwitchConfig(i32),
    /// `wf<block>,<n>,<checksum>,items...`: write a configuration block.
    WriteBlock { block: i32, items: Fields },
    /// `sn<block>`: dump a configuration block.
    SendBlock(i32),
    /// `ra`: reset the AFR trim data.
    ResetAfr,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum Code {
    TargetIdle,
    SendData,
    Sync,
    Identify,
    SwitchConfig,
    WriteBlock,
    SendBlock,
    ResetAfr,
}

/// Parses one command with the terminator already removed.
///
/// # Errors
///
/// [`ConsoleError::UnknownCommand`] for an unrecognised code,
/// [`ConsoleError::Malformed`] for bad or missing fields,
/// [`ConsoleError::Overflow`] past [`MAX_FIELDS`], and the item count and
/// checksum errors for a block write.
pub fn parse_command(line: &str) -> Result<HostCommand, ConsoleError> {
    let mut input = line.trim();
    let code = code
        .parse_next(&mut input)
        .map_err(|_: ErrMode<ContextError>| ConsoleError::UnknownCommand)?;
    let fields = terminated(fields, eof)
        .parse_next(&mut input)
        .map_err(|_: ErrMode<ContextError>| ConsoleError::Malformed)?
        .ok_or(ConsoleError::Overflow)?;

    let first = fields.first().copied();
    match code {
        Code::TargetIdle => first
            .map(|value| HostCommand::TargetIdleAdjust(value.float))
            .ok_or(ConsoleError::Malformed),
        Code::SendData => Ok(HostCommand::SendData),
        Code::Sync => Ok(HostCommand::Sync),
        Code::Identify => Ok(HostCommand::Identify),
        Code::SwitchConfig => first
            .map(|value| HostCommand::SwitchConfig(value.int))
            .ok_or(ConsoleError::Malformed),
        Code::SendBlock => first
            .map(|value| HostCommand::SendBlock(value.int))
            .ok_or(ConsoleError::Malformed),
        Code::ResetAfr => Ok(HostCommand::ResetAfr),
        Code::WriteBlock => write_block(&fields),
    }
}

fn write_block(fields: &[ParamValue]) -> Result<HostCommand, ConsoleError> {
    let [block, count, checksum, items @ ..] = fields else {
        return Err(ConsoleError::Malformed);
    };
    if usize::try_from(count.int).ok() != Some(items.len()) {
        return Err(ConsoleError::ItemCount {
            declared: count.int,
            received: items.len(),
        });
    }
    let sum: f32 = items.iter().map(|item| item.float).sum();
    if libm::fabsf(sum - checksum.float) > CHECKSUM_TOLERANCE {
        return Err(ConsoleError::Checksum);
    }
    Ok(HostCommand::WriteBlock {
        block: block.int,
        items: Vec::from_slice(items).map_err(|_| ConsoleError::Overflow)?,
    })
}

fn code(input: &mut &str) -> ModalResult<Code> {
    alt((
        "tt".value(Code::TargetIdle),
        "sd".value(Code::SendData),
        "sy".value(Code::Sync),
        "si".value(Code::Identify),
        "sc".value(Code::SwitchConfig),
        "wf".value(Code::WriteBlock),
        "sn".value(Code::SendBlock),
        "ra".value(Code::ResetAfr),
    ))
    .parse_next(input)
}

/// Fields after the code; `None` when there are more than [`MAX_FIELDS`].
fn fields(input: &mut &str) -> ModalResult<Option<Fields>> {
    let Some(first) = opt(field).parse_next(input)? else {
        return Ok(Some(Fields::new()));
    };
    repeat(0.., preceded(',', field))
        .fold(
            move || {
                let mut fields = Fields::new();
                fields.push(first).ok().map(|()| fields)
            },
            |fields: Option<Fields>, value| {
                fields.and_then(|mut fields| fields.push(value).ok().map(|()| fields))
            },
        )
        .parse_next(input)
}

fn field(input: &mut &str) -> ModalResult<ParamValue> {
    take_while(1.., |c: char| {
        c.is_ascii_digit() || matches!(c, '+' | '-' | '.' | 'e' | 'E')
    })
    .verify_map(numeric)
    .parse_next(input)
}

fn numeric(text: &str) -> Option<ParamValue> {
    let float = text.parse::<f32>().ok()?;
    let int = dec_int::<_, i32, ContextError>
        .parse_peek(text)
        .map_or(0, |(_, value)| value);
    Some(ParamValue::new(float, int))
}
