//! Handle tables: small integer handles for objects that go over the wire.
//!
//! A [`HandleTable`] is a slot array allocated in blocks. `alloc` hands out
//! the lowest free slot, growing by one block when every slot is taken;
//! `release` puts the slot back on the free list. Handles are plain
//! indices, so a released handle is reused by the next allocation.

use crate::error::{MxError, MxResult};
use crate::limits::MAX_HANDLE;

/// Block-allocated slot table.
#[derive(Debug, Clone)]
pub struct HandleTable<T> {
    slots: Vec<Option<T>>,
    block_size: usize,
    growable: bool,
    in_use: usize,
}

impl<T> HandleTable<T> {
    /// Preallocate `num_blocks` blocks of `block_size` slots.
    pub fn new(block_size: usize, num_blocks: usize) -> MxResult<Self> {
        if block_size == 0 || num_blocks == 0 {
            return Err(MxError::IllegalArgument(format!(
                "handle table needs a nonzero block size and block count (got {} x {})",
                block_size, num_blocks
            )));
        }
        let capacity = block_size
            .checked_mul(num_blocks)
            .filter(|capacity| *capacity <= MAX_HANDLE + 1)
            .ok_or_else(|| {
                MxError::WouldExceedLimit(format!(
                    "handle table of {} x {} slots exceeds the handle space",
                    block_size, num_blocks
                ))
            })?;
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);
        Ok(Self {
            slots,
            block_size,
            growable: true,
            in_use: 0,
        })
    }

    /// A table that never grows past `capacity` slots.
    pub fn fixed(capacity: usize) -> MxResult<Self> {
        let mut table = Self::new(capacity, 1)?;
        table.growable = false;
        Ok(table)
    }

    /// Store `value` in the lowest free slot and return its handle.
    pub fn alloc(&mut self, value: T) -> MxResult<usize> {
        let handle = match self.slots.iter().position(Option::is_none) {
            Some(handle) => handle,
            None => {
                self.grow()?;
                self.slots.len() - self.block_size
            }
        };
        self.slots[handle] = Some(value);
        self.in_use += 1;
        Ok(handle)
    }

    fn grow(&mut self) -> MxResult<()> {
        if !self.growable {
            return Err(MxError::WouldExceedLimit(format!(
                "all {} handles are in use",
                self.slots.len()
            )));
        }
        let new_len = self
            .slots
            .len()
            .checked_add(self.block_size)
            .filter(|len| *len <= MAX_HANDLE + 1)
            .ok_or_else(|| MxError::WouldExceedLimit("handle space exhausted".to_string()))?;
        self.slots.resize_with(new_len, || None);
        Ok(())
    }

    /// Value stored under `handle`.
    pub fn get(&self, handle: usize) -> MxResult<&T> {
        self.slots
            .get(handle)
            .and_then(Option::as_ref)
            .ok_or_else(|| not_found(handle))
    }

    /// Mutable value stored under `handle`.
    pub fn get_mut(&mut self, handle: usize) -> MxResult<&mut T> {
        self.slots
            .get_mut(handle)
            .and_then(Option::as_mut)
            .ok_or_else(|| not_found(handle))
    }

    /// Free `handle` and return what it held.
    pub fn release(&mut self, handle: usize) -> MxResult<T> {
        let value = self
            .slots
            .get_mut(handle)
            .and_then(Option::take)
            .ok_or_else(|| not_found(handle))?;
        self.in_use -= 1;
        Ok(value)
    }

    /// True if `handle` is in use.
    pub fn contains(&self, handle: usize) -> bool {
        matches!(self.slots.get(handle), Some(Some(_)))
    }

    /// Number of handles in use.
    pub fn len(&self) -> usize {
        self.in_use
    }

    /// True if no handle is in use.
    pub fn is_empty(&self) -> bool {
        self.in_use == 0
    }

    /// Number of slots currently allocated.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// `(handle, value)` pairs in handle order.
    pub fn iter(&self) -> impl Iterator<Item = (usize, &T)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(handle, slot)| slot.as_ref().map(|value| (handle, value)))
    }

    /// Handles in use, in order.
    pub fn handles(&self) -> Vec<usize> {
        self.iter().map(|(handle, _)| handle).collect()
    }
}

fn not_found(handle: usize) -> MxError {
    MxError::NotFound(format!("handle {} is not in use", handle))
}
