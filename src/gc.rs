//! Garbage collection: drains one DIRTY block into a CLEAN one and reformats it.

use crate::error::Error;
use crate::internal::{ItemRef, Visit};
use crate::platform::Platform;
use crate::raw::{self, BLOCK_HEADER_SIZE, BLOCK_SIZE, BlockState, ITEM_HEADER_SIZE};
use crate::Kv;
#[cfg(feature = "defmt")]
use defmt::{trace, warn};

/// Result of a garbage collection request.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum GcOutcome {
    /// The live items of `block` were copied to `destination` and `block` is CLEAN again.
    Reclaimed { block: usize, destination: usize },
    /// There is nothing to reclaim.
    NoDirtyBlock,
    /// No CLEAN block is available as destination.
    NoCleanBlock,
    /// A cycle is already running.
    InProgress,
}

/// Notified around every garbage collection cycle. Callbacks run on the caller's thread while
/// the cycle holds the store, they must not call back into it.
pub trait GcObserver: Send {
    fn gc_started(&self) {}
    fn gc_finished(&self) {}
}

impl<T> Kv<T>
where
    T: Platform,
{
    /// Runs one cycle unless one is already in flight.
    pub(crate) fn trigger_gc(&mut self) -> Result<GcOutcome, Error> {
        if self.gc_triggered {
            return Ok(GcOutcome::InProgress);
        }

        self.gc_triggered = true;
        if let Some(observer) = &self.observer {
            observer.gc_started();
        }

        let result = self.collect();

        self.gc_triggered = false;
        if let Some(observer) = &self.observer {
            observer.gc_finished();
        }

        if let Ok(GcOutcome::Reclaimed { .. }) = result {
            self.gc_cycles = self.gc_cycles.wrapping_add(1);
        }
        result
    }

    fn collect(&mut self) -> Result<GcOutcome, Error> {
        let Some(destination) = self
            .blocks
            .iter()
            .position(|block| block.state == BlockState::Clean)
        else {
            return Ok(GcOutcome::NoCleanBlock);
        };

        // oldest data first: start right after the cursor block and visit the cursor block last
        let count = self.blocks.len();
        let cursor = self.write_pos / BLOCK_SIZE;
        let Some(victim) = (1..=count)
            .map(|step| (cursor + step) % count)
            .find(|&index| self.blocks[index].state == BlockState::Dirty)
        else {
            return Ok(GcOutcome::NoDirtyBlock);
        };

        #[cfg(feature = "defmt")]
        trace!("collect: block {} -> block {}", victim, destination);

        let write_pos = self.write_pos;
        self.write_pos = destination * BLOCK_SIZE + BLOCK_HEADER_SIZE;

        if let Err(e) = self.drain_block(victim, destination) {
            self.write_pos = write_pos;
            return Err(e);
        }

        Ok(GcOutcome::Reclaimed {
            block: victim,
            destination,
        })
    }

    fn drain_block(&mut self, victim: usize, destination: usize) -> Result<(), Error> {
        if let Err(e) = self.traverse(victim, |kv, item| kv.relocate_item(item, destination)) {
            self.discard_copies(destination)?;
            return Err(e);
        }
        self.format_block(victim)?;

        // the destination stays labelled CLEAN until the copy is complete, recovery relies on it
        self.set_block_state(destination, BlockState::Used)?;
        self.clean_blocks -= 1;
        Ok(())
    }

    /// Undoes a partial copy. The victim still holds every item, so the destination is wiped and
    /// the mapping table pointed back at the victim.
    fn discard_copies(&mut self, destination: usize) -> Result<(), Error> {
        #[cfg(feature = "defmt")]
        warn!("discard_copies: block {} holds a partial copy, formatting", destination);

        self.format_block(destination)?;
        // the destination was counted as CLEAN already
        self.clean_blocks -= 1;
        self.rebuild_mapping()
    }

    /// Copies the stored bytes of a live item unchanged to the cursor.
    fn relocate_item(&mut self, item: &ItemRef, destination: usize) -> Result<Visit<()>, Error> {
        let len = item.header.stored_len();
        let mut bytes = raw::alloc_buffer(len, 0)?;
        self.read_at(item.offset, &mut bytes)?;

        let offset = self.write_pos;
        raw::write_aligned(&mut self.hal, self.base_address + offset, &bytes)?;

        self.write_pos += len;
        let block = &mut self.blocks[destination];
        block.space = block.space.saturating_sub(len);

        if let Some(mapping) = &mut self.mapping {
            let key = &bytes[ITEM_HEADER_SIZE..ITEM_HEADER_SIZE + item.header.key_len as usize];
            mapping.insert_unbounded(key, item.header.value_len as usize, offset)?;
        }

        Ok(Visit::Continue)
    }
}
