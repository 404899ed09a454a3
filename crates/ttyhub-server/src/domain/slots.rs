//! Per-device terminal slot allocation.

use ttyhub_core::{Slot, MAX_SLOTS};

/// Which of a device's terminal slots are in use.
///
/// Allocation always picks the lowest free slot, so a slot released by a
/// logout is the first one handed out again.
#[derive(Debug, Clone)]
pub struct SlotTable {
    capacity: usize,
    occupied: [bool; MAX_SLOTS],
}

impl SlotTable {
    /// `capacity` is clamped to `1..=MAX_SLOTS`.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.clamp(1, MAX_SLOTS),
            occupied: [false; MAX_SLOTS],
        }
    }

    /// Claims the lowest free slot, or `None` when the device is full.
    pub fn allocate(&mut self) -> Option<Slot> {
        let index = self.occupied[..self.capacity].iter().position(|used| !used)?;
        self.occupied[index] = true;
        Slot::new(index as u8)
    }

    /// Frees `slot`.  Returns `false` if it was not occupied.
    pub fn release(&mut self, slot: Slot) -> bool {
        std::mem::replace(&mut self.occupied[slot.index()], false)
    }

    pub fn is_occupied(&self, slot: Slot) -> bool {
        self.occupied[slot.index()]
    }

    pub fn in_use(&self) -> usize {
        self.occupied.iter().filter(|used| **used).count()
    }

    pub fn occupied(&self) -> impl Iterator<Item = Slot> + '_ {
        self.occupied
            .iter()
            .enumerate()
            .filter(|(_, used)| **used)
            .filter_map(|(i, _)| Slot::new(i as u8))
    }
}
