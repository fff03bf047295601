//! ECU status word.
//!
//! A single 32-bit word reported at the head of every telemetry line. Bit
//! positions are part of the host protocol and must not move.

use core::fmt;

/// Bit flags carried by the status word.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct StatusFlags(u32);

impl StatusFlags {
    pub const CPU_HARD_FAULT: u32 = 0x0000_0001;
    pub const CPU_MEM_MGT_FAULT: u32 = 0x0000_0002;
    pub const CPU_BUS_FAULT: u32 = 0x0000_0004;
    pub const CPU_USAGE_FAULT: u32 = 0x0000_0008;
    pub const ADC_TIMEOUT: u32 = 0x0000_0010;
    pub const EEPROM_AVAILABLE: u32 = 0x0000_0100;
    pub const EEPROM_SAVE_ERROR: u32 = 0x0000_0200;
    pub const EEPROM_READ_ERROR: u32 = 0x0000_0400;
    pub const EEPROM_CHECKSUM_ERROR: u32 = 0x0000_0800;
    pub const IDLE_SWITCH_ON: u32 = 0x0000_1000;
    pub const COOLING_FAN_ON: u32 = 0x0000_2000;
    pub const AFR_ACTIVE: u32 = 0x0000_4000;
    pub const INVALID_CONFIG: u32 = 0x0000_8000;

    /// Creates an empty status word.
    #[must_use]
    pub const fn new() -> Self {
        Self(0)
    }

    #[must_use]
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    #[must_use]
    pub const fn bits(self) -> u32 {
        self.0
    }

    #[must_use]
    pub const fn contains(self, flag: u32) -> bool {
        self.0 & flag == flag
    }

    pub fn set(&mut self, flag: u32) {
        self.0 |= flag;
    }

    pub fn clear(&mut self, flag: u32) {
        self.0 &= !flag;
    }

    /// Sets or clears `flag` depending on `on`.
    pub fn assign(&mut self, flag: u32, on: bool) {
        if on {
            self.set(flag);
        } else {
            self.clear(flag);
        }
    }

    pub fn reset(&mut self) {
        self.0 = 0;
    }

    /// Returns `true` when any storage fault bit is raised.
    #[must_use]
    pub const fn has_storage_fault(self) -> bool {
        self.0 & (Self::EEPROM_READ_ERROR | Self::EEPROM_CHECKSUM_ERROR) != 0
    }
}

impl fmt::Display for StatusFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
