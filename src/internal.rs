use crate::error::Error;
use crate::platform::Platform;
use crate::raw::{
    self, BLOCK_HEADER_SIZE, BLOCK_SIZE, BlockState, CLEAN_BLOCK_HEADER, ITEM_ALIGN,
    ITEM_HEADER_SIZE, ITEM_MAGIC, ItemHeader, ItemState, MAX_ITEM_LEN, MAX_KEY_LEN,
    MAX_VALUE_LEN, STATE_OFFSET,
};
use crate::{BlockUsage, Entry, ItemLocation, Kv};
use alloc::vec::Vec;
#[cfg(feature = "defmt")]
use defmt::{trace, warn};

/// Bytes available for items in an empty block.
pub(crate) const BLOCK_CAPACITY: usize = BLOCK_SIZE - BLOCK_HEADER_SIZE;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) struct BlockInfo {
    pub(crate) state: BlockState,
    pub(crate) space: usize,
}

impl BlockInfo {
    pub(crate) fn clean() -> Self {
        Self {
            state: BlockState::Clean,
            space: BLOCK_CAPACITY,
        }
    }
}

/// A live item found by the traversal engine.
pub(crate) struct ItemRef {
    pub(crate) offset: usize,
    pub(crate) header: ItemHeader,
}

impl ItemRef {
    fn key_offset(&self) -> usize {
        self.offset + ITEM_HEADER_SIZE
    }

    fn key_len(&self) -> usize {
        self.header.key_len as usize
    }

    pub(crate) fn location(&self) -> ItemLocation {
        ItemLocation {
            offset: self.offset,
            key_len: self.key_len(),
            value_len: self.header.value_len as usize,
        }
    }
}

/// What a traversal visitor wants to happen next. Errors abort the walk.
pub(crate) enum Visit<R> {
    Stop(R),
    Continue,
}

pub(crate) fn validate_key(key: &[u8]) -> Result<(), Error> {
    if key.is_empty() || key.len() > MAX_KEY_LEN {
        return Err(Error::InvalidParameter);
    }
    Ok(())
}

impl<T> Kv<T>
where
    T: Platform,
{
    pub(crate) fn read_at(&mut self, offset: usize, buf: &mut [u8]) -> Result<(), Error> {
        raw::read_bytes(&mut self.hal, self.base_address + offset, buf)
    }

    fn read_vec(&mut self, offset: usize, len: usize) -> Result<Vec<u8>, Error> {
        let mut buf = raw::alloc_buffer(len, 0)?;
        self.read_at(offset, &mut buf)?;
        Ok(buf)
    }

    pub(crate) fn read_item_header(&mut self, offset: usize) -> Result<ItemHeader, Error> {
        let mut raw = [0u8; ITEM_HEADER_SIZE];
        self.read_at(offset, &mut raw)?;
        Ok(ItemHeader::from_bytes(raw))
    }

    pub(crate) fn read_key(&mut self, item: &ItemRef) -> Result<Vec<u8>, Error> {
        self.read_vec(item.key_offset(), item.key_len())
    }

    /// Key followed by value, the bytes covered by the item CRC.
    pub(crate) fn read_payload(&mut self, item: &ItemRef) -> Result<Vec<u8>, Error> {
        self.read_vec(item.key_offset(), item.header.payload_len())
    }

    pub(crate) fn read_value(&mut self, location: &ItemLocation) -> Result<Vec<u8>, Error> {
        self.read_vec(location.value_offset(), location.value_len)
    }

    pub(crate) fn read_value_into(
        &mut self,
        location: &ItemLocation,
        buf: &mut [u8],
    ) -> Result<(), Error> {
        self.read_at(location.value_offset(), &mut buf[..location.value_len])
    }

    fn write_state_byte(&mut self, offset: usize, state: u8) -> Result<(), Error> {
        raw::write_state(
            &mut self.hal,
            self.base_address + offset + STATE_OFFSET,
            state,
        )
    }

    pub(crate) fn set_block_state(&mut self, index: usize, state: BlockState) -> Result<(), Error> {
        #[cfg(feature = "defmt")]
        trace!("set_block_state: block {}: {}", index, state);

        self.write_state_byte(index * BLOCK_SIZE, state as u8)?;
        self.blocks[index].state = state;
        Ok(())
    }

    /// The first stale item of a block flips it from USED to DIRTY.
    fn mark_dirty(&mut self, index: usize) -> Result<(), Error> {
        if self.blocks[index].state == BlockState::Used {
            self.set_block_state(index, BlockState::Dirty)?;
        }
        Ok(())
    }

    /// Erases a block and writes a CLEAN header.
    pub(crate) fn format_block(&mut self, index: usize) -> Result<(), Error> {
        #[cfg(feature = "defmt")]
        trace!("format_block: block {}", index);

        let address = self.base_address + index * BLOCK_SIZE;
        raw::erase_block(&mut self.hal, address)?;
        raw::write_aligned(&mut self.hal, address, &CLEAN_BLOCK_HEADER)?;

        self.blocks[index] = BlockInfo::clean();
        self.clean_blocks += 1;
        Ok(())
    }

    /// Walks all items of a block, calling `visitor` for every item in NORMAL state.
    ///
    /// The walk ends at the first erased header. A header that is not well formed or runs past the
    /// block end is skipped header by header, deleted items are skipped by their length. Both mark
    /// a USED block as DIRTY. A completed walk recomputes the free space of the block.
    pub(crate) fn traverse<R, F>(&mut self, index: usize, mut visitor: F) -> Result<Option<R>, Error>
    where
        F: FnMut(&mut Self, &ItemRef) -> Result<Visit<R>, Error>,
    {
        #[cfg(feature = "defmt")]
        trace!("traverse: block {}", index);

        let start = index * BLOCK_SIZE;
        let end = start + BLOCK_SIZE;
        let mut offset = start + BLOCK_HEADER_SIZE;

        loop {
            let header = self.read_item_header(offset)?;
            if header.is_erased() {
                break;
            }

            if !header.is_well_formed() || offset + header.stored_len() > end {
                #[cfg(feature = "defmt")]
                warn!("traverse: malformed item header @{:#06x}", offset);

                offset += ITEM_HEADER_SIZE;
                self.mark_dirty(index)?;
            } else {
                let item = ItemRef { offset, header };
                if header.is_normal() {
                    if let Visit::Stop(result) = visitor(self, &item)? {
                        return Ok(Some(result));
                    }
                } else {
                    self.mark_dirty(index)?;
                }
                offset += header.stored_len();
            }

            if offset + ITEM_HEADER_SIZE >= end {
                break;
            }
        }

        self.blocks[index].space = if end > offset {
            end - offset
        } else {
            ITEM_HEADER_SIZE
        };
        Ok(None)
    }

    /// Resolves a key through the mapping table if enabled, by scanning flash otherwise.
    pub(crate) fn locate(&mut self, key: &[u8]) -> Result<Option<ItemLocation>, Error> {
        if let Some(mapping) = &self.mapping {
            return Ok(mapping.get(key).map(|entry| ItemLocation {
                offset: entry.offset,
                key_len: key.len(),
                value_len: entry.value_len,
            }));
        }
        self.scan_for_key(key)
    }

    /// Scans all non-clean blocks in ascending order and returns the first live item with `key`.
    pub(crate) fn scan_for_key(&mut self, key: &[u8]) -> Result<Option<ItemLocation>, Error> {
        for index in 0..self.blocks.len() {
            if self.blocks[index].state == BlockState::Clean {
                continue;
            }

            let found = self.traverse(index, |kv, item| {
                if item.key_len() != key.len() {
                    return Ok(Visit::Continue);
                }
                if kv.read_key(item)? == key {
                    Ok(Visit::Stop(item.location()))
                } else {
                    Ok(Visit::Continue)
                }
            })?;

            if found.is_some() {
                return Ok(found);
            }
        }
        Ok(None)
    }

    /// Finds the offset for an item of `len` bytes and may run a garbage collection cycle as a
    /// side effect. Returns `None` if no block has room.
    pub(crate) fn allocate(&mut self, len: usize) -> Result<Option<usize>, Error> {
        let index = self.write_pos / BLOCK_SIZE;
        let space = self.blocks[index].space;

        if space > len {
            if space - len < MAX_ITEM_LEN && self.clean_blocks <= self.config.gc_reserved_blocks {
                self.trigger_gc()?;
                // a finished cycle moves the cursor into its destination block
                return self.find_space(len);
            }
            return Ok(Some(self.write_pos));
        }

        if let Some(offset) = self.find_space(len)? {
            return Ok(Some(offset));
        }

        self.trigger_gc()?;
        Ok(None)
    }

    /// Scans forward from the cursor block, wrapping around, for the first block with room.
    /// The reserved CLEAN blocks are left for garbage collection.
    fn find_space(&mut self, len: usize) -> Result<Option<usize>, Error> {
        let count = self.blocks.len();
        let start = self.write_pos / BLOCK_SIZE;

        for step in 0..count {
            let index = (start + step) % count;
            let block = self.blocks[index];
            if block.space <= len {
                continue;
            }
            if block.state == BlockState::Clean
                && self.clean_blocks <= self.config.gc_reserved_blocks
            {
                continue;
            }

            if block.state == BlockState::Clean {
                self.set_block_state(index, BlockState::Used)?;
                self.clean_blocks -= 1;
            }
            self.write_pos = index * BLOCK_SIZE + BLOCK_SIZE - block.space;
            return Ok(Some(self.write_pos));
        }

        Ok(None)
    }

    /// Appends a new item superseding the live item at `origin`, if any. Returns the origin the
    /// item was written with: a garbage collection cycle run by the allocation relocates it.
    pub(crate) fn store_item(
        &mut self,
        key: &[u8],
        value: &[u8],
        origin: Option<usize>,
    ) -> Result<Option<usize>, Error> {
        // refuse before touching flash, an item missing from the cache would be invisible
        if let Some(mapping) = &self.mapping {
            if !mapping.has_room_for(key) {
                return Err(Error::NoSpace);
            }
        }

        let len = raw::stored_len(key.len(), value.len());
        let gc_cycles = self.gc_cycles;
        let offset = self.allocate(len)?.ok_or(Error::NoSpace)?;

        // recovery follows the origin to finish the update, it has to name the current copy
        let origin = match origin {
            Some(_) if gc_cycles != self.gc_cycles => {
                self.locate(key)?.map(|location| location.offset)
            }
            origin => origin,
        };

        let item = raw::encode_item(key, value, origin.unwrap_or(0) as u16)?;

        #[cfg(feature = "defmt")]
        trace!("store_item: @{:#06x} [{}]", offset, item.len());

        raw::write_aligned(&mut self.hal, self.base_address + offset, &item)?;

        self.write_pos = offset + item.len();
        let block = &mut self.blocks[offset / BLOCK_SIZE];
        block.space = block.space.saturating_sub(item.len());

        if let Some(mapping) = &mut self.mapping {
            mapping.insert(key, value.len(), offset)?;
        }

        Ok(origin)
    }

    pub(crate) fn get_bytes(&mut self, key: &[u8]) -> Result<Vec<u8>, Error> {
        validate_key(key)?;
        let location = self.locate(key)?.ok_or(Error::ItemNotFound)?;
        self.read_value(&location)
    }

    pub(crate) fn set_bytes(&mut self, key: &[u8], value: &[u8]) -> Result<(), Error> {
        validate_key(key)?;
        if value.len() > MAX_VALUE_LEN {
            return Err(Error::InvalidParameter);
        }

        match self.locate(key)? {
            Some(existing) => self.update_item(key, value, existing),
            None => self.store_item(key, value, None).map(|_| ()),
        }
    }

    /// Replace-by-append: write the new item pointing back at the old one, then delete the old one.
    /// A power loss in between leaves both on flash and recovery finishes the delete.
    fn update_item(
        &mut self,
        key: &[u8],
        value: &[u8],
        existing: ItemLocation,
    ) -> Result<(), Error> {
        if existing.value_len == value.len() && self.read_value(&existing)? == value {
            #[cfg(feature = "defmt")]
            trace!("update_item: value unchanged @{:#06x}", existing.offset);
            return Ok(());
        }

        if let Some(origin) = self.store_item(key, value, Some(existing.offset))? {
            self.remove_origin(key, origin)?;
        }

        Ok(())
    }

    pub(crate) fn delete_key(&mut self, key: &[u8]) -> Result<(), Error> {
        validate_key(key)?;
        let location = self.locate(key)?.ok_or(Error::ItemNotFound)?;
        self.remove_item(location.offset)
    }

    /// Marks the item at `offset` as deleted.
    pub(crate) fn remove_item(&mut self, offset: usize) -> Result<(), Error> {
        #[cfg(feature = "defmt")]
        trace!("remove_item: @{:#06x}", offset);

        self.write_state_byte(offset, ItemState::Delete as u8)?;
        if let Some(mapping) = &mut self.mapping {
            mapping.remove_at(offset);
        }
        self.mark_dirty(offset / BLOCK_SIZE)
    }

    /// Deletes the item an update superseded. The slot at `origin` is only touched if it still
    /// holds a live item with the same key, it might have been reclaimed and reused meanwhile.
    pub(crate) fn remove_origin(&mut self, key: &[u8], origin: usize) -> Result<bool, Error> {
        if !self.is_item_offset(origin) {
            return Ok(false);
        }

        let header = self.read_item_header(origin)?;
        if header.magic != ITEM_MAGIC
            || !header.is_normal()
            || header.key_len as usize != key.len()
        {
            return Ok(false);
        }

        let origin_item = ItemRef {
            offset: origin,
            header,
        };
        if self.read_key(&origin_item)? != key {
            return Ok(false);
        }

        self.remove_item(origin)?;
        Ok(true)
    }

    fn is_item_offset(&self, offset: usize) -> bool {
        let in_block = offset % BLOCK_SIZE;
        offset.is_multiple_of(ITEM_ALIGN)
            && offset / BLOCK_SIZE < self.blocks.len()
            && in_block >= BLOCK_HEADER_SIZE
            && in_block + ITEM_HEADER_SIZE <= BLOCK_SIZE
    }

    /// Reads all block headers, reformats the invalid ones and recovers the items of the rest.
    pub(crate) fn load_blocks(&mut self) -> Result<(), Error> {
        #[cfg(feature = "defmt")]
        trace!("load_blocks");

        let count = self.blocks.len();
        self.clean_blocks = 0;

        let mut headers = Vec::with_capacity(count);
        for index in 0..count {
            let mut raw = [0u8; BLOCK_HEADER_SIZE];
            self.read_at(index * BLOCK_SIZE, &mut raw)?;
            let state = raw::parse_block_header(&raw);
            self.blocks[index] = BlockInfo {
                state: state.unwrap_or(BlockState::Clean),
                space: BLOCK_CAPACITY,
            };
            headers.push(state);
        }

        let mut interrupted = Vec::new();
        for (index, state) in headers.into_iter().enumerate() {
            let Some(state) = state else {
                #[cfg(feature = "defmt")]
                warn!("load_blocks: block {} has no valid header, formatting", index);

                self.format_block(index)?;
                continue;
            };

            self.traverse(index, |kv, item| kv.recover_item(item))?;

            if state == BlockState::Clean {
                if self.blocks[index].space != BLOCK_CAPACITY {
                    interrupted.push(index);
                } else {
                    self.clean_blocks += 1;
                }
            }
        }

        for index in interrupted.into_iter().rev() {
            self.settle_interrupted_block(index)?;
        }

        if self.clean_blocks == 0 {
            #[cfg(feature = "defmt")]
            warn!("load_blocks: no clean block left, formatting block 0");

            self.format_block(0)?;
        }

        self.place_write_cursor()
    }

    /// Recovery visitor: drops items failing their CRC and completes interrupted updates.
    fn recover_item(&mut self, item: &ItemRef) -> Result<Visit<()>, Error> {
        let payload = self.read_payload(item)?;

        if raw::crc8(&payload) != item.header.crc {
            #[cfg(feature = "defmt")]
            warn!("recover_item: dropping corrupted item @{:#06x}", item.offset);

            self.remove_item(item.offset)?;
            return Ok(Visit::Continue);
        }

        let origin = item.header.origin_off as usize;
        if origin != 0 && origin != item.offset {
            let key = &payload[..item.key_len()];
            if self.remove_origin(key, origin)? {
                #[cfg(feature = "defmt")]
                trace!("recover_item: removed superseded item @{:#06x}", origin);
            }
        }

        Ok(Visit::Continue)
    }

    /// A block labelled CLEAN that holds items is the destination of an interrupted garbage
    /// collection cycle. Copies of keys still live elsewhere are dropped, then the block is either
    /// kept for collection or reformatted.
    fn settle_interrupted_block(&mut self, index: usize) -> Result<(), Error> {
        #[cfg(feature = "defmt")]
        warn!("settle_interrupted_block: block {} is labelled clean but holds items", index);

        let mut copies = Vec::new();
        self.traverse(index, |kv, item| {
            copies.push((item.offset, kv.read_key(item)?));
            Ok(Visit::<()>::Continue)
        })?;

        let mut kept = copies.len();
        for (offset, key) in copies {
            if self.scan_for_key(&key)?.is_some() {
                self.remove_item(offset)?;
                kept -= 1;
            }
        }

        if kept > 0 && self.clean_blocks >= self.config.gc_reserved_blocks {
            self.set_block_state(index, BlockState::Dirty)
        } else {
            self.format_block(index)
        }
    }

    /// Puts the cursor right behind the content of the last written block, that is the non-clean
    /// block followed by a clean one.
    fn place_write_cursor(&mut self) -> Result<(), Error> {
        let count = self.blocks.len();

        if self.clean_blocks == count {
            self.set_block_state(0, BlockState::Used)?;
            self.clean_blocks -= 1;
            self.write_pos = BLOCK_HEADER_SIZE;
            return Ok(());
        }

        for index in 0..count {
            let next = (index + 1) % count;
            if self.blocks[index].state != BlockState::Clean
                && self.blocks[next].state == BlockState::Clean
            {
                self.write_pos = index * BLOCK_SIZE + BLOCK_SIZE - self.blocks[index].space;
                break;
            }
        }

        Ok(())
    }

    /// Formats every block and leaves an empty store with the cursor at the start of block 0.
    pub(crate) fn reset_blocks(&mut self) -> Result<(), Error> {
        #[cfg(feature = "defmt")]
        trace!("reset_blocks");

        self.clean_blocks = 0;
        if let Some(mapping) = &mut self.mapping {
            mapping.clear();
        }
        for index in 0..self.blocks.len() {
            self.format_block(index)?;
        }
        self.place_write_cursor()
    }

    pub(crate) fn rebuild_mapping(&mut self) -> Result<(), Error> {
        let Some(mapping) = &mut self.mapping else {
            return Ok(());
        };
        mapping.clear();

        for index in 0..self.blocks.len() {
            if self.blocks[index].state == BlockState::Clean {
                continue;
            }
            self.traverse(index, |kv, item| {
                let key = kv.read_key(item)?;
                if let Some(mapping) = &mut kv.mapping {
                    mapping.insert_unbounded(&key, item.header.value_len as usize, item.offset)?;
                }
                Ok(Visit::<()>::Continue)
            })?;
        }
        Ok(())
    }

    /// The check `Kv::new` runs once the cursor is placed: collect early if the cursor block
    /// cannot take a maximum sized item and the clean reserve is exhausted.
    pub(crate) fn gc_after_load(&mut self) -> Result<(), Error> {
        let index = self.write_pos / BLOCK_SIZE;
        if self.blocks[index].space < MAX_ITEM_LEN
            && self.clean_blocks < self.config.gc_reserved_blocks + 1
        {
            self.trigger_gc()?;
        }
        Ok(())
    }

    pub(crate) fn collect_entries(&mut self) -> Result<Vec<Entry>, Error> {
        let mut entries = Vec::new();
        for index in 0..self.blocks.len() {
            if self.blocks[index].state == BlockState::Clean {
                continue;
            }
            self.traverse(index, |kv, item| {
                let mut payload = kv.read_payload(item)?;
                let value = payload.split_off(item.key_len());
                entries.push(Entry {
                    key: payload,
                    value,
                    offset: item.offset,
                });
                Ok(Visit::<()>::Continue)
            })?;
        }
        Ok(entries)
    }

    pub(crate) fn block_usage(&mut self) -> Result<Vec<BlockUsage>, Error> {
        let mut usage = Vec::with_capacity(self.blocks.len());
        for index in 0..self.blocks.len() {
            let mut live_items = 0;
            if self.blocks[index].state != BlockState::Clean {
                self.traverse(index, |_, _| {
                    live_items += 1;
                    Ok(Visit::<()>::Continue)
                })?;
            }
            let block = self.blocks[index];
            usage.push(BlockUsage {
                state: block.state,
                free: block.space,
                live_items,
            });
        }
        Ok(usage)
    }
}
