//! Configuration store.
//!
//! Storage holds up to eight configuration pages. A descriptor block at
//! address 0 records which page is selected; every block read or written
//! goes to the selected page. Blocks are exchanged with the host as lists of
//! [`ParamValue`] items and kept in storage as little-endian 32-bit words.

mod blocks;
pub mod defaults;

use core::fmt;

pub use blocks::{Filters, Parameters1, Parameters2};

use crate::storage::{Storage, StorageError};
use crate::table::{LOAD_CELLS, Map, RPM_CELLS};

/// Number of selectable configuration pages.
pub const CONFIGURATION_COUNT: i32 = 8;

pub const DESCRIPTOR_ADDRESS: u16 = 0;
pub const AFR_DATA_ADDRESS: u16 = 64;
const PAGE_START_ADDRESS: u16 = 640;
const PAGE_SIZE: u16 = 1344;

const DESCRIPTOR_WORDS: usize = 15;
const MAP_ITEMS: usize = RPM_CELLS * LOAD_CELLS;

/// Largest block in words.
pub const MAX_BLOCK_WORDS: usize = MAP_ITEMS;

/// How a host item is stored.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ItemKind {
    Float,
    Int,
}

/// One host-supplied item, carried in both representations so the block's
/// type string can pick the right one.
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct ParamValue {
    pub float: f32,
    pub int: i32,
}

impl ParamValue {
    #[must_use]
    pub const fn new(float: f32, int: i32) -> Self {
        Self { float, int }
    }

    #[allow(clippy::cast_possible_truncation)]
    #[must_use]
    pub fn from_f32(value: f32) -> Self {
        Self {
            float: value,
            int: value as i32,
        }
    }

    #[allow(clippy::cast_precision_loss)]
    #[must_use]
    pub fn from_i32(value: i32) -> Self {
        Self {
            float: value as f32,
            int: value,
        }
    }

    fn word(self, kind: ItemKind) -> u32 {
        match kind {
            ItemKind::Float => self.float.to_bits(),
            ItemKind::Int => u32::from_le_bytes(self.int.to_le_bytes()),
        }
    }
}

/// Host block identifiers.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum BlockId {
    Filters,
    Parameters1,
    Parameters2,
    VeMap,
    IgnitionMap,
    TargetAfrMap,
}

impl BlockId {
    pub const ALL: [BlockId; 6] = [
        BlockId::Filters,
        BlockId::Parameters1,
        BlockId::Parameters2,
        BlockId::VeMap,
        BlockId::IgnitionMap,
        BlockId::TargetAfrMap,
    ];

    #[must_use]
    pub const fn from_raw(raw: i32) -> Option<Self> {
        match raw {
            100 => Some(BlockId::Filters),
            200 => Some(BlockId::Parameters1),
            300 => Some(BlockId::Parameters2),
            400 => Some(BlockId::VeMap),
            500 => Some(BlockId::IgnitionMap),
            600 => Some(BlockId::TargetAfrMap),
            _ => None,
        }
    }

    #[must_use]
    pub const fn raw(self) -> i32 {
        match self {
            BlockId::Filters => 100,
            BlockId::Parameters1 => 200,
            BlockId::Parameters2 => 300,
            BlockId::VeMap => 400,
            BlockId::IgnitionMap => 500,
            BlockId::TargetAfrMap => 600,
        }
    }

    /// Number of items the host must supply.
    #[must_use]
    pub const fn items(self) -> usize {
        match self {
            BlockId::Filters => Filters::ITEMS,
            BlockId::Parameters1 => Parameters1::ITEMS,
            BlockId::Parameters2 => Parameters2::ITEMS,
            BlockId::VeMap | BlockId::IgnitionMap | BlockId::TargetAfrMap => MAP_ITEMS,
        }
    }

    /// Storage type of item `index`.
    #[must_use]
    pub fn kind(self, index: usize) -> ItemKind {
        let kinds = match self {
            BlockId::Filters => Filters::KINDS,
            BlockId::Parameters1 => Parameters1::KINDS,
            BlockId::Parameters2 => Parameters2::KINDS,
            BlockId::VeMap | BlockId::IgnitionMap | BlockId::TargetAfrMap => {
                return ItemKind::Float;
            }
        };
        kinds.get(index).copied().unwrap_or(ItemKind::Float)
    }

    /// Offset from the start of a configuration page.
    #[must_use]
    pub const fn relative_address(self) -> u16 {
        match self {
            BlockId::Filters => 0,
            BlockId::Parameters1 => 64,
            BlockId::Parameters2 => 256,
            BlockId::VeMap => 384,
            BlockId::IgnitionMap => 704,
            BlockId::TargetAfrMap => 1024,
        }
    }

    /// Reset required after this block changes.
    #[must_use]
    pub const fn reset_scope(self) -> ResetScope {
        match self {
            BlockId::Filters => ResetScope::Sensors,
            BlockId::Parameters1 | BlockId::Parameters2 => ResetScope::Full,
            BlockId::VeMap | BlockId::TargetAfrMap => ResetScope::Maps,
            BlockId::IgnitionMap => ResetScope::None,
        }
    }
}

/// Portion of the runtime state rebuilt after a configuration change.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ResetScope {
    /// Nothing derived from the block is cached.
    None,
    /// Sensor filters only.
    Sensors,
    /// AFR trim and fuel computation.
    Maps,
    /// Every subsystem, as after power-up.
    Full,
}

/// Errors reported by configuration operations.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ConfigError {
    /// Item count does not match the block.
    SizeMismatch { expected: usize, supplied: usize },
    UnknownBlock(i32),
    /// RAM was updated but the block could not be persisted.
    WriteError(StorageError),
    /// A stored block could not be read back; defaults stay in effect.
    ReadError(StorageError),
    /// Configuration number outside 1..=8.
    OutOfRange(i32),
    /// A table axis start is not finite or its spacing is not positive.
    InvalidAxis,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::SizeMismatch { expected, supplied } => {
                write!(f, "expected {expected} items, got {supplied}")
            }
            ConfigError::UnknownBlock(id) => write!(f, "unknown block id {id}"),
            ConfigError::WriteError(err) => write!(f, "write failed: {err}"),
            ConfigError::ReadError(err) => write!(f, "read failed: {err}"),
            ConfigError::OutOfRange(n) => write!(f, "configuration {n} out of range"),
            ConfigError::InvalidAxis => f.write_str("table axis out of range"),
        }
    }
}

/// One complete configuration page.
#[derive(Clone, Debug, PartialEq)]
pub struct ConfigPage {
    pub filters: Filters,
    pub p1: Parameters1,
    pub p2: Parameters2,
    pub ve_map: Map,
    pub ignition_map: Map,
    pub target_afr_map: Map,
}

impl ConfigPage {
    /// Serializes `block` into `out`, returning the word count.
    pub fn block_words(&self, block: BlockId, out: &mut [u32; MAX_BLOCK_WORDS]) -> usize {
        match block {
            BlockId::Filters => self.filters.write_words(out),
            BlockId::Parameters1 => self.p1.write_words(out),
            BlockId::Parameters2 => self.p2.write_words(out),
            BlockId::VeMap => map_to_words(&self.ve_map, out),
            BlockId::IgnitionMap => map_to_words(&self.ignition_map, out),
            BlockId::TargetAfrMap => map_to_words(&self.target_afr_map, out),
        }
        block.items()
    }

    /// Replaces `block` from raw words.
    pub fn load_words(&mut self, block: BlockId, words: &[u32]) {
        match block {
            BlockId::Filters => self.filters = Filters::read_words(words),
            BlockId::Parameters1 => self.p1 = Parameters1::read_words(words),
            BlockId::Parameters2 => self.p2 = Parameters2::read_words(words),
            BlockId::VeMap => map_from_words(&mut self.ve_map, words),
            BlockId::IgnitionMap => map_from_words(&mut self.ignition_map, words),
            BlockId::TargetAfrMap => map_from_words(&mut self.target_afr_map, words),
        }
    }

    /// Item `index` of `block` in host representation.
    #[must_use]
    pub fn item(&self, block: BlockId, index: usize) -> Option<ParamValue> {
        let mut words = [0u32; MAX_BLOCK_WORDS];
        let count = self.block_words(block, &mut words);
        if index >= count {
            return None;
        }
        let word = words[index];
        Some(match block.kind(index) {
            ItemKind::Float => ParamValue::from_f32(f32::from_bits(word)),
            ItemKind::Int => ParamValue::from_i32(i32::from_le_bytes(word.to_le_bytes())),
        })
    }
}

impl Default for ConfigPage {
    fn default() -> Self {
        defaults::PAGE
    }
}

fn check_block(block: BlockId, words: &[u32]) -> Result<(), ConfigError> {
    match block {
        BlockId::Parameters2 if !Parameters2::read_words(words).axes_valid() => {
            Err(ConfigError::InvalidAxis)
        }
        _ => Ok(()),
    }
}

fn map_to_words(map: &Map, out: &mut [u32]) {
    for (slot, value) in out.iter_mut().zip(map.iter().flatten()) {
        *slot = value.to_bits();
    }
}

fn map_from_words(map: &mut Map, words: &[u32]) {
    for (cell, word) in map.iter_mut().flatten().zip(words) {
        *cell = f32::from_bits(*word);
    }
}

fn words_to_bytes(words: &[u32], out: &mut [u8]) -> usize {
    for (chunk, word) in out.chunks_exact_mut(4).zip(words) {
        chunk.copy_from_slice(&word.to_le_bytes());
    }
    words.len() * 4
}

fn bytes_to_words(bytes: &[u8], out: &mut [u32]) {
    for (word, chunk) in out.iter_mut().zip(bytes.chunks_exact(4)) {
        *word = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
    }
}

/// Active configuration page plus the selected page number.
#[derive(Clone, Debug)]
pub struct ConfigStore {
    page: ConfigPage,
    current: i32,
}

impl ConfigStore {
    /// Store holding the compiled-in defaults with page 1 selected.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            page: defaults::PAGE,
            current: 1,
        }
    }

    #[must_use]
    pub fn with_page(page: ConfigPage) -> Self {
        Self { page, current: 1 }
    }

    #[must_use]
    pub const fn page(&self) -> &ConfigPage {
        &self.page
    }

    #[must_use]
    pub const fn current_configuration(&self) -> i32 {
        self.current
    }

    /// Absolute storage address of `block` in the selected page.
    #[must_use]
    pub fn block_address(&self, block: BlockId) -> u16 {
        let page = u16::try_from(self.current - 1).unwrap_or(0);
        page * PAGE_SIZE + PAGE_START_ADDRESS + block.relative_address()
    }

    /// Copies host items into the in-RAM block.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::SizeMismatch`] when the item count is wrong
    /// and [`ConfigError::InvalidAxis`] when a parameter block carries a
    /// table axis the lookup cannot use. RAM is left untouched in both cases.
    pub fn update_block(
        &mut self,
        block: BlockId,
        items: &[ParamValue],
    ) -> Result<ResetScope, ConfigError> {
        if items.len() != block.items() {
            return Err(ConfigError::SizeMismatch {
                expected: block.items(),
                supplied: items.len(),
            });
        }
        let mut words = [0u32; MAX_BLOCK_WORDS];
        for (index, (slot, item)) in words.iter_mut().zip(items).enumerate() {
            *slot = item.word(block.kind(index));
        }
        check_block(block, &words)?;
        self.page.load_words(block, &words[..items.len()]);
        Ok(block.reset_scope())
    }

    /// Writes the in-RAM copy of `block` to the selected page.
    ///
    /// # Errors
    ///
    /// Propagates the storage failure.
    pub fn persist_block<S: Storage + ?Sized>(
        &self,
        block: BlockId,
        storage: &mut S,
    ) -> Result<(), StorageError> {
        let mut words = [0u32; MAX_BLOCK_WORDS];
        let count = self.page.block_words(block, &mut words);
        let mut bytes = [0u8; MAX_BLOCK_WORDS * 4];
        let len = words_to_bytes(&words[..count], &mut bytes);
        storage.persist_block(self.block_address(block), &bytes[..len])
    }

    /// Selects page `number` without touching storage.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::OutOfRange`] outside 1..=8.
    pub fn select(&mut self, number: i32) -> Result<(), ConfigError> {
        if !(1..=CONFIGURATION_COUNT).contains(&number) {
            return Err(ConfigError::OutOfRange(number));
        }
        self.current = number;
        Ok(())
    }

    /// Writes the descriptor block recording the selected page.
    ///
    /// # Errors
    ///
    /// Propagates the storage failure.
    pub fn persist_descriptor<S: Storage + ?Sized>(
        &self,
        storage: &mut S,
    ) -> Result<(), StorageError> {
        let mut words = [0u32; DESCRIPTOR_WORDS];
        words[0] = u32::from_le_bytes(self.current.to_le_bytes());
        for (slot, filler) in words[1..].iter_mut().zip(1u32..) {
            *slot = filler;
        }
        let mut bytes = [0u8; DESCRIPTOR_WORDS * 4];
        words_to_bytes(&words, &mut bytes);
        storage.persist_block(DESCRIPTOR_ADDRESS, &bytes)
    }

    /// Restores the descriptor then every block of the selected page.
    ///
    /// Blocks that fail to read or carry an unusable table axis keep their
    /// current in-RAM values; the remaining blocks are still restored.
    ///
    /// # Errors
    ///
    /// Returns the first failure: [`ConfigError::ReadError`] for a storage
    /// fault, [`ConfigError::InvalidAxis`] for a bad stored axis or
    /// [`ConfigError::OutOfRange`] for a bad descriptor.
    pub fn restore<S: Storage + ?Sized>(&mut self, storage: &mut S) -> Result<(), ConfigError> {
        let mut descriptor = [0u8; DESCRIPTOR_WORDS * 4];
        storage
            .restore_block(DESCRIPTOR_ADDRESS, &mut descriptor)
            .map_err(ConfigError::ReadError)?;
        let number =
            i32::from_le_bytes([descriptor[0], descriptor[1], descriptor[2], descriptor[3]]);
        self.select(number)?;

        let mut first_error = None;
        for block in BlockId::ALL {
            let len = block.items() * 4;
            let mut bytes = [0u8; MAX_BLOCK_WORDS * 4];
            match storage.restore_block(self.block_address(block), &mut bytes[..len]) {
                Ok(()) => {
                    let mut words = [0u32; MAX_BLOCK_WORDS];
                    bytes_to_words(&bytes[..len], &mut words);
                    match check_block(block, &words) {
                        Ok(()) => self.page.load_words(block, &words[..block.items()]),
                        Err(err) => {
                            first_error.get_or_insert(err);
                        }
                    }
                }
                Err(err) => {
                    first_error.get_or_insert(ConfigError::ReadError(err));
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

impl Default for ConfigStore {
    fn default() -> Self {
        Self::new()
    }
}
