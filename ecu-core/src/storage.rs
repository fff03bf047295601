//! Checksummed block persistence.
//!
//! Every block written through [`ChecksummedStore`] is followed on the device
//! by a little-endian `u32` holding the byte sum of the block. Reads verify
//! the sum so a torn or blank block is reported as [`StorageError::Checksum`]
//! rather than silently loaded.

use core::fmt;

/// Page size of the 24LC256-class devices the layout was planned around.
pub const EEPROM_PAGE_SIZE: usize = 64;

/// Bytes appended after each block to hold its checksum.
pub const CHECKSUM_LEN: usize = 4;

/// Largest block the store will stage on the stack.
pub const MAX_BLOCK_LEN: usize = 512;

/// Failures reported by persistent storage.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum StorageError {
    /// No device answered the readiness check.
    Unavailable,
    /// The transfer itself failed.
    Io,
    /// Data was read back but its checksum did not match.
    Checksum,
    /// The requested block exceeds the staging buffer or device bounds.
    OutOfBounds,
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageError::Unavailable => f.write_str("storage unavailable"),
            StorageError::Io => f.write_str("storage i/o error"),
            StorageError::Checksum => f.write_str("storage checksum mismatch"),
            StorageError::OutOfBounds => f.write_str("storage block out of bounds"),
        }
    }
}

/// Block-level persistence consumed by the engine.
pub trait Storage {
    /// Checks that the device answers. Called once per software reset.
    fn is_available(&mut self) -> bool;

    /// Writes `bytes` at `address`, followed by their checksum.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] when the device is missing or the write fails.
    fn persist_block(&mut self, address: u16, bytes: &[u8]) -> Result<(), StorageError>;

    /// Fills `buf` from `address` and verifies the trailing checksum.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Checksum`] when the data does not match its
    /// stored sum and [`StorageError::Io`] when the read fails outright.
    fn restore_block(&mut self, address: u16, buf: &mut [u8]) -> Result<(), StorageError>;
}

/// Raw byte-addressed device behind a [`ChecksummedStore`].
pub trait EepromDevice {
    /// Returns `true` once the device acknowledges its address.
    fn is_ready(&mut self) -> bool;

    /// Writes up to one page. `data` never crosses a page boundary.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Io`] on a failed transfer.
    fn write_page(&mut self, address: u16, data: &[u8]) -> Result<(), StorageError>;

    /// Sequential read starting at `address`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Io`] on a failed transfer.
    fn read(&mut self, address: u16, buf: &mut [u8]) -> Result<(), StorageError>;
}

/// Sums every byte as an unsigned 8-bit value.
#[must_use]
pub fn checksum(bytes: &[u8]) -> u32 {
    bytes
        .iter()
        .fold(0u32, |sum, byte| sum.wrapping_add(u32::from(*byte)))
}

/// [`Storage`] implementation that adds page splitting and checksums on top
/// of an [`EepromDevice`].
pub struct ChecksummedStore<D> {
    device: D,
}

impl<D: EepromDevice> ChecksummedStore<D> {
    pub const fn new(device: D) -> Self {
        Self { device }
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn device_mut(&mut self) -> &mut D {
        &mut self.device
    }

    pub fn into_inner(self) -> D {
        self.device
    }

    fn write_paged(&mut self, address: u16, data: &[u8]) -> Result<(), StorageError> {
        let mut offset = 0usize;
        let mut cursor = usize::from(address);
        while offset < data.len() {
            let room = EEPROM_PAGE_SIZE - cursor % EEPROM_PAGE_SIZE;
            let len = room.min(data.len() - offset);
            let page_address = u16::try_from(cursor).map_err(|_| StorageError::OutOfBounds)?;
            self.device
                .write_page(page_address, &data[offset..offset + len])?;
            offset += len;
            cursor += len;
        }
        Ok(())
    }
}

impl<D: EepromDevice> Storage for ChecksummedStore<D> {
    fn is_available(&mut self) -> bool {
        self.device.is_ready()
    }

    fn persist_block(&mut self, address: u16, bytes: &[u8]) -> Result<(), StorageError> {
        if !self.device.is_ready() {
            return Err(StorageError::Unavailable);
        }
        let end = usize::from(address) + bytes.len();
        let sum_address = u16::try_from(end).map_err(|_| StorageError::OutOfBounds)?;
        self.write_paged(address, bytes)?;
        self.write_paged(sum_address, &checksum(bytes).to_le_bytes())
    }

    fn restore_block(&mut self, address: u16, buf: &mut [u8]) -> Result<(), StorageError> {
        if !self.device.is_ready() {
            return Err(StorageError::Unavailable);
        }
        if buf.len() > MAX_BLOCK_LEN {
            return Err(StorageError::OutOfBounds);
        }
        let end = usize::from(address) + buf.len();
        let sum_address = u16::try_from(end).map_err(|_| StorageError::OutOfBounds)?;

        self.device.read(address, buf)?;
        let mut stored = [0u8; CHECKSUM_LEN];
        self.device.read(sum_address, &mut stored)?;

        if checksum(buf) == u32::from_le_bytes(stored) {
            Ok(())
        } else {
            Err(StorageError::Checksum)
        }
    }
}

/// In-memory device used by the emulator and tests.
pub struct RamEeprom<const N: usize> {
    cells: [u8; N],
    present: bool,
    fail_writes: bool,
    writes: usize,
}

impl<const N: usize> RamEeprom<N> {
    /// Creates an erased (all `0xFF`) device.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            cells: [0xFF; N],
            present: true,
            fail_writes: false,
            writes: 0,
        }
    }

    /// Creates a device that never acknowledges.
    #[must_use]
    pub const fn absent() -> Self {
        let mut device = Self::new();
        device.present = false;
        device
    }

    pub fn set_present(&mut self, present: bool) {
        self.present = present;
    }

    /// Makes every subsequent page write fail with [`StorageError::Io`].
    pub fn set_fail_writes(&mut self, fail: bool) {
        self.fail_writes = fail;
    }

    /// Number of successful page writes.
    #[must_use]
    pub const fn page_writes(&self) -> usize {
        self.writes
    }

    #[must_use]
    pub fn contents(&self) -> &[u8] {
        &self.cells
    }

    /// Overwrites raw cells, bypassing checksums. Used to simulate corruption.
    pub fn poke(&mut self, address: usize, byte: u8) {
        if let Some(cell) = self.cells.get_mut(address) {
            *cell = byte;
        }
    }
}

impl<const N: usize> Default for RamEeprom<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> EepromDevice for RamEeprom<N> {
    fn is_ready(&mut self) -> bool {
        self.present
    }

    fn write_page(&mut self, address: u16, data: &[u8]) -> Result<(), StorageError> {
        if !self.present || self.fail_writes {
            return Err(StorageError::Io);
        }
        let start = usize::from(address);
        let target = self
            .cells
            .get_mut(start..start + data.len())
            .ok_or(StorageError::OutOfBounds)?;
        target.copy_from_slice(data);
        self.writes += 1;
        Ok(())
    }

    fn read(&mut self, address: u16, buf: &mut [u8]) -> Result<(), StorageError> {
        if !self.present {
            return Err(StorageError::Io);
        }
        let start = usize::from(address);
        let source = self
            .cells
            .get(start..start + buf.len())
            .ok_or(StorageError::OutOfBounds)?;
        buf.copy_from_slice(source);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type Device = RamEeprom<4096>;

    #[test]
    fn persisted_block_round_trips_with_checksum() {
        let mut store = ChecksummedStore::new(Device::new());
        let block = [1u8, 2, 3, 250];
        store.persist_block(640, &block).expect("write succeeds");

        let mut back = [0u8; 4];
        store.restore_block(640, &mut back).expect("read succeeds");
        assert_eq!(back, block);
        assert_eq!(&store.device().contents()[644..648], &256u32.to_le_bytes());
    }

    #[test]
    fn corruption_is_reported_as_checksum_error() {
        let mut store = ChecksummedStore::new(Device::new());
        store.persist_block(64, &[9u8; 16]).expect("write succeeds");
        store.device_mut().poke(70, 0);

        let mut back = [0u8; 16];
        assert_eq!(store.restore_block(64, &mut back), Err(StorageError::Checksum));
    }

    #[test]
    fn blank_device_fails_checksum_not_io() {
        let mut store = ChecksummedStore::new(Device::new());
        let mut back = [0u8; 32];
        assert_eq!(store.restore_block(0, &mut back), Err(StorageError::Checksum));
    }

    #[test]
    fn writes_are_split_on_page_boundaries() {
        let mut store = ChecksummedStore::new(Device::new());
        let block = [7u8; 100];
        store.persist_block(60, &block).expect("write succeeds");
        // 4 bytes to the first boundary, one full page, 32 bytes, then the checksum.
        assert_eq!(store.device().page_writes(), 4);
    }

    #[test]
    fn missing_device_is_unavailable() {
        let mut store = ChecksummedStore::new(Device::absent());
        assert!(!store.is_available());
        assert_eq!(store.persist_block(0, &[1]), Err(StorageError::Unavailable));
    }
}
