//! Optional in-memory cache mapping keys to the offset of their live item. It is rebuilt from
//! flash on every start and never persisted.

use crate::error::Error;
use alloc::collections::BTreeMap;
use alloc::vec::Vec;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) struct MappingEntry {
    pub(crate) value_len: usize,
    pub(crate) offset: usize,
}

pub(crate) struct MappingTable {
    entries: BTreeMap<Vec<u8>, MappingEntry>,
    capacity: usize,
}

impl MappingTable {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            entries: BTreeMap::new(),
            capacity,
        }
    }

    pub(crate) fn get(&self, key: &[u8]) -> Option<MappingEntry> {
        self.entries.get(key).copied()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn clear(&mut self) {
        self.entries.clear();
    }

    /// Whether `insert` would succeed for this key.
    pub(crate) fn has_room_for(&self, key: &[u8]) -> bool {
        self.entries.contains_key(key) || self.entries.len() < self.capacity
    }

    /// Updates the entry of an existing key in place or adds a new one while below capacity.
    pub(crate) fn insert(
        &mut self,
        key: &[u8],
        value_len: usize,
        offset: usize,
    ) -> Result<(), Error> {
        if !self.has_room_for(key) {
            return Err(Error::NoSpace);
        }
        self.insert_unbounded(key, value_len, offset)
    }

    /// Used when rebuilding from flash, where the cache has to reflect every live item.
    pub(crate) fn insert_unbounded(
        &mut self,
        key: &[u8],
        value_len: usize,
        offset: usize,
    ) -> Result<(), Error> {
        let entry = MappingEntry { value_len, offset };
        if let Some(existing) = self.entries.get_mut(key) {
            *existing = entry;
            return Ok(());
        }

        let mut owned = Vec::new();
        owned
            .try_reserve_exact(key.len())
            .map_err(|_| Error::AllocationFailed)?;
        owned.extend_from_slice(key);
        self.entries.insert(owned, entry);
        Ok(())
    }

    /// Drops the entry pointing at `offset`, if any.
    pub(crate) fn remove_at(&mut self, offset: usize) -> bool {
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.offset != offset);
        before != self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn update_in_place_does_not_consume_capacity() {
        let mut table = MappingTable::new(2);
        table.insert(b"a", 1, 4).unwrap();
        table.insert(b"b", 2, 16).unwrap();
        table.insert(b"a", 3, 28).unwrap();

        assert_eq!(table.len(), 2);
        assert_eq!(
            table.get(b"a"),
            Some(MappingEntry {
                value_len: 3,
                offset: 28
            })
        );
    }

    #[test]
    fn insert_past_capacity_fails() {
        let mut table = MappingTable::new(1);
        table.insert(b"a", 1, 4).unwrap();

        assert!(!table.has_room_for(b"b"));
        assert_eq!(table.insert(b"b", 1, 16), Err(Error::NoSpace));
        assert!(table.get(b"b").is_none());

        table.insert_unbounded(b"b", 1, 16).unwrap();
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn remove_by_offset() {
        let mut table = MappingTable::new(4);
        table.insert(b"a", 1, 4).unwrap();
        table.insert(b"b", 1, 16).unwrap();

        assert!(table.remove_at(16));
        assert!(!table.remove_at(16));
        assert!(table.get(b"b").is_none());
        assert!(table.get(b"a").is_some());
    }
}
