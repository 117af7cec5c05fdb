#![doc = include_str!("../README.md")]
#![cfg_attr(not(feature = "std"), no_std)]

pub mod error;
mod gc;
mod get;
mod internal;
mod mapping;
pub mod platform;
mod raw;
mod set;
#[cfg(feature = "std")]
mod shared;

pub use gc::{GcObserver, GcOutcome};
pub use get::Get;
pub use raw::{BLOCK_SIZE, BlockState, MAX_BLOCKS, MAX_KEY_LEN, MAX_VALUE_LEN, crc8};
pub use set::Set;
#[cfg(feature = "std")]
pub use shared::SharedKv;

extern crate alloc;

use crate::error::Error;
use crate::internal::{BlockInfo, validate_key};
use crate::mapping::MappingTable;
use crate::platform::Platform;
use crate::raw::{ITEM_ALIGN, ITEM_HEADER_SIZE};
use alloc::boxed::Box;
use alloc::vec::Vec;

/// Runtime switches of the store.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Config {
    /// Keep an in-memory map from key to item offset, rebuilt on every start.
    pub mapping_table: bool,
    /// Number of distinct keys the mapping table accepts before `set` fails with `NoSpace`.
    pub mapping_capacity: usize,
    /// CLEAN blocks held back as garbage collection destinations.
    pub gc_reserved_blocks: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mapping_table: true,
            mapping_capacity: 200,
            gc_reserved_blocks: 1,
        }
    }
}

/// A live key/value pair as returned by [`Kv::list`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub offset: usize,
}

/// Where the live item of a key is stored, relative to the store base address.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ItemLocation {
    pub offset: usize,
    pub value_len: usize,
    pub(crate) key_len: usize,
}

impl ItemLocation {
    pub(crate) fn value_offset(&self) -> usize {
        self.offset + ITEM_HEADER_SIZE + self.key_len
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct KvStatistics {
    pub blocks: BlockStatistics,
    pub per_block: Vec<BlockUsage>,
    pub live_items: usize,
    pub write_position: usize,
    /// `None` if the mapping table is disabled.
    pub mapping_entries: Option<usize>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BlockStatistics {
    pub clean: usize,
    pub used: usize,
    pub dirty: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BlockUsage {
    pub state: BlockState,
    pub free: usize,
    pub live_items: usize,
}

/// The Kv struct keeps the state and free space of every block in memory, plus the optional
/// mapping table. Dropping it loses nothing, all data lives on flash.
pub struct Kv<T: Platform> {
    pub(crate) hal: T,
    pub(crate) base_address: usize,
    pub(crate) config: Config,
    pub(crate) faulted: Option<Error>,

    // set after calling self.load_blocks
    pub(crate) blocks: Vec<BlockInfo>,
    pub(crate) clean_blocks: usize,
    pub(crate) write_pos: usize,

    pub(crate) gc_triggered: bool,
    pub(crate) gc_cycles: u32,
    pub(crate) mapping: Option<MappingTable>,
    pub(crate) observer: Option<Box<dyn GcObserver>>,
}

impl<T: Platform> Kv<T> {
    /// Opens the store in `size` bytes of flash starting at `base_address` and recovers it:
    /// 1. Blocks without a valid header are formatted
    /// 2. Items failing their CRC are dropped
    /// 3. Updates interrupted by a power loss are completed
    /// 4. An interrupted garbage collection cycle is rolled back
    ///
    /// A blank flash region is formatted on first use.
    pub fn new(base_address: usize, size: usize, hal: T, config: Config) -> Result<Kv<T>, Error> {
        if !base_address.is_multiple_of(BLOCK_SIZE) || !size.is_multiple_of(BLOCK_SIZE) {
            return Err(Error::InvalidParameter);
        }

        let count = size / BLOCK_SIZE;
        if count > MAX_BLOCKS || config.gc_reserved_blocks == 0 || count <= config.gc_reserved_blocks
        {
            return Err(Error::InvalidParameter);
        }

        if !ITEM_ALIGN.is_multiple_of(T::READ_SIZE)
            || !ITEM_ALIGN.is_multiple_of(T::WRITE_SIZE)
            || !BLOCK_SIZE.is_multiple_of(T::ERASE_SIZE)
        {
            return Err(Error::InvalidParameter);
        }

        let mut blocks = Vec::new();
        blocks
            .try_reserve_exact(count)
            .map_err(|_| Error::AllocationFailed)?;
        blocks.resize(count, BlockInfo::clean());

        let mut kv: Kv<T> = Self {
            hal,
            base_address,
            config,
            faulted: None,
            blocks,
            clean_blocks: 0,
            write_pos: raw::BLOCK_HEADER_SIZE,
            gc_triggered: false,
            gc_cycles: 0,
            mapping: config
                .mapping_table
                .then(|| MappingTable::new(config.mapping_capacity)),
            observer: None,
        };

        kv.load_blocks()?;
        kv.rebuild_mapping()?;
        kv.gc_after_load()?;

        Ok(kv)
    }

    /// Gives the flash driver back.
    pub fn deinit(self) -> T {
        self.hal
    }

    /// Get a value from the flash.
    ///
    /// Supported types are bool, signed and unsigned integers up to 64-bit width, String and Vec.
    pub fn get<R>(&mut self, key: impl AsRef<[u8]>) -> Result<R, Error>
    where
        Kv<T>: Get<R>,
    {
        let result = Get::get(self, key.as_ref());
        self.latch(result)
    }

    /// Copies the value into `buf` and returns its length. Fails with `BufferTooSmall` carrying
    /// the required length if `buf` is too short.
    pub fn get_into(&mut self, key: impl AsRef<[u8]>, buf: &mut [u8]) -> Result<usize, Error> {
        let result = self.read_into(key.as_ref(), buf);
        self.latch(result)
    }

    /// Set a value and write it to the flash
    ///
    /// Integers are stored little-endian in their native width, bool as a single byte. Values
    /// may be up to 2048 bytes long, keys up to 255 bytes.
    pub fn set<R>(&mut self, key: impl AsRef<[u8]>, value: R) -> Result<(), Error>
    where
        Kv<T>: Set<R>,
    {
        self.ensure_healthy()?;
        let result = Set::set(self, key.as_ref(), value);
        self.latch(result)
    }

    /// Delete a key
    pub fn delete(&mut self, key: impl AsRef<[u8]>) -> Result<(), Error> {
        self.ensure_healthy()?;
        let result = self.delete_key(key.as_ref());
        self.latch(result)
    }

    /// Read errors count as a missing key. Like any flash error they still latch the store, check
    /// [`Kv::is_faulted`] to tell a missing key from a failed read.
    pub fn key_exists(&mut self, key: impl AsRef<[u8]>) -> bool {
        matches!(self.lookup(key), Ok(Some(_)))
    }

    /// Where the live item of `key` is stored, `None` if the key does not exist.
    pub fn lookup(&mut self, key: impl AsRef<[u8]>) -> Result<Option<ItemLocation>, Error> {
        let key = key.as_ref();
        validate_key(key)?;
        let result = self.locate(key);
        self.latch(result)
    }

    /// Erases every block and starts over with an empty store. Also clears a previous flash fault.
    pub fn delete_all(&mut self) -> Result<(), Error> {
        let result = self.reset_blocks();
        if result.is_ok() {
            self.faulted = None;
        }
        self.latch(result)
    }

    /// Runs a single garbage collection cycle.
    pub fn collect_garbage(&mut self) -> Result<GcOutcome, Error> {
        self.ensure_healthy()?;
        let result = self.trigger_gc();
        self.latch(result)
    }

    /// All live items in block order.
    pub fn list(&mut self) -> Result<Vec<Entry>, Error> {
        let result = self.collect_entries();
        self.latch(result)
    }

    /// Installs a hook called around every garbage collection cycle.
    pub fn set_gc_observer(&mut self, observer: Option<Box<dyn GcObserver>>) {
        self.observer = observer;
    }

    /// Whether a flash error has been seen. Mutating calls are refused until `delete_all`
    /// succeeds or the store is opened again.
    pub fn is_faulted(&self) -> bool {
        self.faulted.is_some()
    }

    /// Returns detailed statistics about the block usage
    pub fn statistics(&mut self) -> Result<KvStatistics, Error> {
        let per_block = match self.block_usage() {
            Ok(usage) => usage,
            Err(e) => return self.latch(Err(e)),
        };

        let mut blocks = BlockStatistics {
            clean: 0,
            used: 0,
            dirty: 0,
        };
        for usage in &per_block {
            match usage.state {
                BlockState::Clean => blocks.clean += 1,
                BlockState::Used => blocks.used += 1,
                BlockState::Dirty => blocks.dirty += 1,
            }
        }

        Ok(KvStatistics {
            blocks,
            live_items: per_block.iter().map(|usage| usage.live_items).sum(),
            per_block,
            write_position: self.write_pos,
            mapping_entries: self.mapping.as_ref().map(|mapping| mapping.len()),
        })
    }

    pub(crate) fn read_into(&mut self, key: &[u8], buf: &mut [u8]) -> Result<usize, Error> {
        validate_key(key)?;
        let location = self.locate(key)?.ok_or(Error::ItemNotFound)?;
        if buf.len() < location.value_len {
            return Err(Error::BufferTooSmall(location.value_len));
        }
        self.read_value_into(&location, buf)?;
        Ok(location.value_len)
    }

    fn ensure_healthy(&self) -> Result<(), Error> {
        match self.faulted {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn latch<R>(&mut self, result: Result<R, Error>) -> Result<R, Error> {
        if let Err(e) = &result {
            if e.is_flash_error() {
                self.faulted = Some(*e);
            }
        }
        result
    }
}
