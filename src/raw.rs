//! On-flash layout: block headers, item headers, CRC8 and the low-level flash accessors.
//!
//! Every block starts with a 4 byte header (`magic`, `state`, 2 reserved bytes) followed by
//! items. An item is an 8 byte header followed by the key bytes, the value bytes and zero
//! padding up to the next 4 byte boundary. All multi-byte fields are little-endian and items
//! never cross a block boundary.

use crate::error::Error;
use crate::platform::{AlignedOps, Platform, align_ceil};
use alloc::vec::Vec;
#[cfg(feature = "defmt")]
use defmt::trace;

/// Size of a block, the unit of erase and garbage collection.
pub const BLOCK_SIZE: usize = 4096;
pub(crate) const BLOCK_HEADER_SIZE: usize = 4;
pub(crate) const ITEM_HEADER_SIZE: usize = 8;
pub(crate) const ITEM_ALIGN: usize = 4;

/// Offset of the state byte within both the block header and the item header.
pub(crate) const STATE_OFFSET: usize = 1;

/// Maximum key length in bytes.
pub const MAX_KEY_LEN: usize = 255;
/// Maximum value length in bytes.
pub const MAX_VALUE_LEN: usize = 2048;
pub(crate) const MAX_ITEM_LEN: usize = ITEM_HEADER_SIZE + MAX_KEY_LEN + MAX_VALUE_LEN;

/// Item offsets are persisted as `origin_off: u16`, which limits the store to 64 KiB.
pub const MAX_BLOCKS: usize = (u16::MAX as usize + 1) / BLOCK_SIZE;

pub(crate) const BLOCK_MAGIC: u8 = b'K';
pub(crate) const ITEM_MAGIC: u8 = b'I';
pub(crate) const ERASED: u8 = 0xFF;

const _: () = assert!(
    BLOCK_HEADER_SIZE.is_multiple_of(ITEM_ALIGN),
    "items following the block header must stay aligned"
);
const _: () = assert!(
    MAX_ITEM_LEN < BLOCK_SIZE - BLOCK_HEADER_SIZE,
    "a maximum sized item has to fit into an empty block"
);

#[derive(strum::FromRepr, strum::Display, Debug, PartialEq, Eq, Copy, Clone)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum BlockState {
    // Block only holds live items.
    Used = 0xCC,

    // Erased and initialized, ready to take items.
    Clean = 0xEE,

    // Block holds at least one deleted or corrupted item and is a candidate for garbage collection.
    Dirty = 0x44,
}

#[derive(strum::FromRepr, Debug, PartialEq, Eq, Copy, Clone)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub(crate) enum ItemState {
    Normal = 0xEE,
    Delete = 0x00,
}

pub(crate) const CLEAN_BLOCK_HEADER: [u8; BLOCK_HEADER_SIZE] =
    [BLOCK_MAGIC, BlockState::Clean as u8, 0, 0];

/// Returns `None` if the header does not describe an initialized block.
pub(crate) fn parse_block_header(raw: &[u8; BLOCK_HEADER_SIZE]) -> Option<BlockState> {
    if raw[0] != BLOCK_MAGIC {
        return None;
    }
    BlockState::from_repr(raw[STATE_OFFSET])
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub(crate) struct ItemHeader {
    pub(crate) magic: u8,
    pub(crate) state: u8,
    pub(crate) crc: u8,
    pub(crate) key_len: u8,
    pub(crate) value_len: u16,
    pub(crate) origin_off: u16,
}

impl ItemHeader {
    pub(crate) fn new(key: &[u8], value: &[u8], origin_off: u16) -> Self {
        Self {
            magic: ITEM_MAGIC,
            state: ItemState::Normal as u8,
            crc: crc8_update(crc8(key), value),
            key_len: key.len() as u8,
            value_len: value.len() as u16,
            origin_off,
        }
    }

    pub(crate) fn from_bytes(raw: [u8; ITEM_HEADER_SIZE]) -> Self {
        Self {
            magic: raw[0],
            state: raw[1],
            crc: raw[2],
            key_len: raw[3],
            value_len: u16::from_le_bytes([raw[4], raw[5]]),
            origin_off: u16::from_le_bytes([raw[6], raw[7]]),
        }
    }

    pub(crate) fn to_bytes(self) -> [u8; ITEM_HEADER_SIZE] {
        let [v0, v1] = self.value_len.to_le_bytes();
        let [o0, o1] = self.origin_off.to_le_bytes();
        [
            self.magic,
            self.state,
            self.crc,
            self.key_len,
            v0,
            v1,
            o0,
            o1,
        ]
    }

    /// Both magic and state still hold the erased pattern: the end of the written area.
    pub(crate) fn is_erased(&self) -> bool {
        self.magic == ERASED && self.state == ERASED
    }

    /// A header is only trusted if its magic matches and the declared lengths are in range.
    /// `key_len` is a `u8` so it can never exceed `MAX_KEY_LEN`.
    pub(crate) fn is_well_formed(&self) -> bool {
        self.magic == ITEM_MAGIC && self.value_len as usize <= MAX_VALUE_LEN
    }

    pub(crate) fn is_normal(&self) -> bool {
        ItemState::from_repr(self.state) == Some(ItemState::Normal)
    }

    pub(crate) fn payload_len(&self) -> usize {
        self.key_len as usize + self.value_len as usize
    }

    pub(crate) fn stored_len(&self) -> usize {
        stored_len(self.key_len as usize, self.value_len as usize)
    }
}

/// Length of an item on flash including header and padding.
pub(crate) const fn stored_len(key_len: usize, value_len: usize) -> usize {
    align_ceil(ITEM_HEADER_SIZE + key_len + value_len, ITEM_ALIGN)
}

/// CRC-8 with polynomial 0x31 (x^8 + x^5 + x^4 + 1), initial value 0, no reflection.
pub fn crc8(data: &[u8]) -> u8 {
    crc8_update(0, data)
}

/// Continues a [`crc8`] computation, `crc8_update(crc8(a), b) == crc8(a ++ b)`.
pub fn crc8_update(mut crc: u8, data: &[u8]) -> u8 {
    for &byte in data {
        crc ^= byte;
        for _ in 0..8 {
            if crc & 0x80 != 0 {
                crc = (crc << 1) ^ 0x31;
            } else {
                crc <<= 1;
            }
        }
    }
    crc
}

/// Serializes a complete item (header, key, value, zero padding).
pub(crate) fn encode_item(key: &[u8], value: &[u8], origin_off: u16) -> Result<Vec<u8>, Error> {
    let header = ItemHeader::new(key, value, origin_off);
    let mut buf = alloc_buffer(header.stored_len(), 0)?;
    buf[..ITEM_HEADER_SIZE].copy_from_slice(&header.to_bytes());
    buf[ITEM_HEADER_SIZE..ITEM_HEADER_SIZE + key.len()].copy_from_slice(key);
    buf[ITEM_HEADER_SIZE + key.len()..ITEM_HEADER_SIZE + key.len() + value.len()]
        .copy_from_slice(value);
    Ok(buf)
}

/// Heap buffers are reserved fallibly so an exhausted heap surfaces as `AllocationFailed`.
pub(crate) fn alloc_buffer(len: usize, fill: u8) -> Result<Vec<u8>, Error> {
    let mut buf = Vec::new();
    buf.try_reserve_exact(len)
        .map_err(|_| Error::AllocationFailed)?;
    buf.resize(len, fill);
    Ok(buf)
}

/// Reads `buf.len()` bytes at an absolute flash address, widening the access to the driver's
/// read granularity if necessary.
pub(crate) fn read_bytes<T: Platform>(
    hal: &mut T,
    address: usize,
    buf: &mut [u8],
) -> Result<(), Error> {
    if buf.is_empty() {
        return Ok(());
    }

    let start = T::align_read_floor(address);
    let end = T::align_read_ceil(address + buf.len());
    if start == address && end == address + buf.len() {
        return hal
            .read(address as u32, buf)
            .map_err(|_| Error::FlashReadError);
    }

    let mut widened = alloc_buffer(end - start, ERASED)?;
    hal.read(start as u32, &mut widened)
        .map_err(|_| Error::FlashReadError)?;
    let skip = address - start;
    buf.copy_from_slice(&widened[skip..skip + buf.len()]);
    Ok(())
}

/// Writes whole words. Block headers and padded items are multiples of `ITEM_ALIGN`, which
/// `Kv::new` only accepts if it is a multiple of the driver's write size.
pub(crate) fn write_aligned<T: Platform>(
    hal: &mut T,
    address: usize,
    bytes: &[u8],
) -> Result<(), Error> {
    #[cfg(feature = "defmt")]
    trace!("write_aligned @{:#08x}: [{}]", address, bytes.len());

    debug_assert!(address.is_multiple_of(T::WRITE_SIZE));
    debug_assert!(bytes.len().is_multiple_of(T::WRITE_SIZE));

    hal.write(address as u32, bytes)
        .map_err(|_| Error::FlashWriteError)
}

/// Programs a single state byte in place. The surrounding bytes of the write word are sent as
/// 0xFF so they keep their current content.
pub(crate) fn write_state<T: Platform>(
    hal: &mut T,
    address: usize,
    state: u8,
) -> Result<(), Error> {
    #[cfg(feature = "defmt")]
    trace!("write_state @{:#08x}: {:#04x}", address, state);

    let aligned = T::align_write_floor(address);
    let mut word = alloc_buffer(T::WRITE_SIZE, ERASED)?;
    word[address - aligned] = state;
    hal.write(aligned as u32, &word)
        .map_err(|_| Error::FlashWriteError)
}

/// Erases the block containing `address`. The address is rounded down to the erase granularity.
pub(crate) fn erase_block<T: Platform>(hal: &mut T, address: usize) -> Result<(), Error> {
    let from = T::align_erase_floor(address);
    let to = from + BLOCK_SIZE;

    #[cfg(feature = "defmt")]
    trace!("erase_block: {:#08x}..{:#08x}", from, to);

    hal.erase(from as u32, to as u32)
        .map_err(|_| Error::FlashEraseError)
}
