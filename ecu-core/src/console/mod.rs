//! Host configuration console.
//!
//! The host sends short ASCII commands terminated by `#`. A
//! [`ConsoleSession`] collects bytes from the link, [`grammar`] decodes each
//! completed command and [`commands`] runs it against the engine and renders
//! the reply.

pub mod commands;
pub mod grammar;

use core::fmt;
use core::str;

use heapless::Vec;

pub use commands::{Reply, execute};
pub use grammar::{HostCommand, parse_command};

/// Longest command accepted, terminator excluded.
pub const MAX_LINE_LEN: usize = 1024;

/// Command terminator.
pub const TERMINATOR: u8 = b'#';

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ConsoleError {
    UnknownCommand,
    /// A field is missing or is not a number.
    Malformed,
    /// Too many fields, or the line outgrew [`MAX_LINE_LEN`].
    Overflow,
    /// A block write declared a different item count than it carried.
    ItemCount { declared: i32, received: usize },
    /// A block write's checksum does not match its items.
    Checksum,
    InvalidUtf8,
}

impl fmt::Display for ConsoleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConsoleError::UnknownCommand => f.write_str("unknown command"),
            ConsoleError::Malformed => f.write_str("malformed command"),
            ConsoleError::Overflow => f.write_str("command too long"),
            ConsoleError::ItemCount { declared, received } => {
                write!(f, "declared {declared} items, received {received}")
            }
            ConsoleError::Checksum => f.write_str("checksum mismatch"),
            ConsoleError::InvalidUtf8 => f.write_str("command is not valid UTF-8"),
        }
    }
}

/// Assembles host commands from a byte stream.
#[derive(Debug, Default)]
pub struct ConsoleSession {
    buffer: Vec<u8, MAX_LINE_LEN>,
    overflowed: bool,
}

impl ConsoleSession {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            buffer: Vec::new(),
            overflowed: false,
        }
    }

    /// Feeds one byte. Returns the decoded command once the terminator
    /// arrives; line breaks between commands are ignored.
    ///
    /// # Errors
    ///
    /// Reports a parse failure, or [`ConsoleError::Overflow`] when the
    /// command outgrew the buffer, at the terminator. The buffer is cleared
    /// either way.
    pub fn ingest(&mut self, byte: u8) -> Result<Option<HostCommand>, ConsoleError> {
        match byte {
            TERMINATOR => {
                let result = self.finish();
                self.buffer.clear();
                self.overflowed = false;
                result.map(Some)
            }
            b'\r' | b'\n' => Ok(None),
            value => {
                if self.buffer.push(value).is_err() {
                    self.overflowed = true;
                }
                Ok(None)
            }
        }
    }

    /// Bytes waiting for a terminator.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    fn finish(&self) -> Result<HostCommand, ConsoleError> {
        if self.overflowed {
            return Err(ConsoleError::Overflow);
        }
        let line = str::from_utf8(&self.buffer).map_err(|_| ConsoleError::InvalidUtf8)?;
        parse_command(line)
    }
}
