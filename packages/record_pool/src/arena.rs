use std::mem;

use crate::pool::PoolError;

/// A single contiguous block of fixed-size record slots.
///
/// Vacant slots form an intrusive free list: each vacant slot stores the index
/// of the next vacant slot, with the arena holding the head index. Think of it
/// as a stack of the most recently released slots, stored inside the slots
/// themselves.
///
/// Arenas are owned exclusively by a `RecordPool` and never outlive it. The
/// `id` is assigned by the pool and stays stable even when other arenas are
/// removed, which is what keeps `RecordKey` values valid across arena
/// reclamation.
#[derive(Debug)]
pub(crate) struct Arena<T> {
    id: u32,

    slots: Box<[Slot<T>]>,

    /// Index of the most recently released slot, `None` when the arena is full.
    free_head: Option<u32>,

    used: usize,
}

#[derive(Debug)]
pub(crate) enum Slot<T> {
    Occupied(T),

    Vacant { next_free: Option<u32> },
}

impl<T> Arena<T> {
    /// Allocates an arena of `length` vacant slots.
    ///
    /// Allocation failure is reported as [`PoolError::OutOfMemory`]; the
    /// caller decides whether the operation that needed the arena can proceed
    /// without it.
    pub(crate) fn new(id: u32, length: usize) -> Result<Self, PoolError> {
        assert!(length > 0, "arena must have at least one slot");
        assert!(
            length <= u32::MAX as usize,
            "arena length must fit slot indexing"
        );

        let mut slots = Vec::new();
        slots
            .try_reserve_exact(length)
            .map_err(|_| PoolError::OutOfMemory)?;

        for index in 0..length {
            let next = index.checked_add(1).expect("guarded by length <= u32::MAX");
            slots.push(Slot::Vacant {
                next_free: if next < length {
                    // Truncation is impossible, `next < length <= u32::MAX`.
                    Some(next as u32)
                } else {
                    None
                },
            });
        }

        Ok(Self {
            id,
            slots: slots.into_boxed_slice(),
            free_head: Some(0),
            used: 0,
        })
    }

    #[must_use]
    pub(crate) fn id(&self) -> u32 {
        self.id
    }

    #[must_use]
    pub(crate) fn len(&self) -> usize {
        self.slots.len()
    }

    #[must_use]
    pub(crate) fn used(&self) -> usize {
        self.used
    }

    #[must_use]
    pub(crate) fn is_empty(&self) -> bool {
        self.used == 0
    }

    #[must_use]
    pub(crate) fn is_full(&self) -> bool {
        self.free_head.is_none()
    }

    /// Pops a slot off the free list and fills it with `value`.
    ///
    /// If the arena is full, `value` is handed back in the error position for
    /// the caller to retry in another arena.
    pub(crate) fn insert(&mut self, value: T) -> Result<u32, T> {
        let Some(slot_index) = self.free_head else {
            debug_assert_eq!(self.used, self.slots.len());
            return Err(value);
        };

        let slot = self
            .slots
            .get_mut(slot_index as usize)
            .expect("free list indices always point inside the arena");

        let previous = mem::replace(slot, Slot::Occupied(value));
        self.free_head = match previous {
            Slot::Vacant { next_free } => next_free,
            Slot::Occupied(_) => {
                panic!("free list head {slot_index} pointed at an occupied slot")
            }
        };

        self.used = self
            .used
            .checked_add(1)
            .expect("used is bounded by the arena length");

        Ok(slot_index)
    }

    /// Releases an occupied slot back onto the free list.
    ///
    /// # Panics
    ///
    /// Panics if the slot is out of bounds or vacant.
    pub(crate) fn remove(&mut self, slot_index: u32) -> T {
        let free_head = self.free_head;

        let slot = self
            .slots
            .get_mut(slot_index as usize)
            .expect("record key slot out of bounds for its arena");

        let previous = mem::replace(slot, Slot::Vacant { next_free: free_head });
        let value = match previous {
            Slot::Occupied(value) => value,
            Slot::Vacant { .. } => panic!("remove({slot_index}) slot was vacant"),
        };

        self.free_head = Some(slot_index);
        self.used = self
            .used
            .checked_sub(1)
            .expect("slot was occupied so used must be non-zero");

        value
    }

    #[must_use]
    pub(crate) fn get(&self, slot_index: u32) -> Option<&T> {
        match self.slots.get(slot_index as usize) {
            Some(Slot::Occupied(value)) => Some(value),
            _ => None,
        }
    }

    #[must_use]
    pub(crate) fn get_mut(&mut self, slot_index: u32) -> Option<&mut T> {
        match self.slots.get_mut(slot_index as usize) {
            Some(Slot::Occupied(value)) => Some(value),
            _ => None,
        }
    }
}
