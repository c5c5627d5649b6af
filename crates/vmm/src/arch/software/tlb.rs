//! Software-managed translation cache.

use crate::{FaultKind, PageEntry, PhysicalAddress, TranslationCache, VirtualAddress};

use super::interrupts_enabled;

/// Number of slots in the emulated TLB.
pub const NUM_TLB: usize = 64;

/// An emulated software-managed TLB.
///
/// Each slot holds a page-aligned tag and the page-table entry installed for it. The cache
/// picks the slot for a new translation itself: the first invalid slot if there is one,
/// otherwise the next victim in round-robin order. Updates must happen with interrupts
/// masked, which is checked in debug builds.
pub struct SoftwareTlb {
    slots: [Option<(VirtualAddress, PageEntry)>; NUM_TLB],
    next_victim: usize,
}

impl SoftwareTlb {
    /// Creates a TLB with every slot invalid.
    pub const fn new() -> Self {
        Self {
            slots: [None; NUM_TLB],
            next_victim: 0,
        }
    }

    /// Returns the entry cached for the page containing `address`, if any.
    pub fn lookup(&self, address: VirtualAddress) -> Option<PageEntry> {
        let tag = address.page_base();
        self.slots
            .iter()
            .flatten()
            .find(|(slot_tag, entry)| *slot_tag == tag && entry.is_valid())
            .map(|(_, entry)| *entry)
    }

    /// Performs an access the way the hardware would.
    ///
    /// Returns the physical address on a hit. A miss reports [`FaultKind::Read`] or
    /// [`FaultKind::Write`]; a write hitting a translation without the dirty bit reports
    /// [`FaultKind::ReadOnly`].
    pub fn probe(&self, address: VirtualAddress, write: bool) -> Result<PhysicalAddress, FaultKind> {
        let Some(entry) = self.lookup(address) else {
            return Err(if write { FaultKind::Write } else { FaultKind::Read });
        };
        if write && !entry.is_dirty() {
            return Err(FaultKind::ReadOnly);
        }
        let frame = entry.frame().ok_or(FaultKind::Read)?;
        Ok(PhysicalAddress::new(frame.start().as_usize() + address.page_offset()))
    }

    /// Returns the number of slots holding a translation.
    pub fn valid_slots(&self) -> usize {
        self.slots.iter().flatten().count()
    }
}

impl Default for SoftwareTlb {
    fn default() -> Self {
        Self::new()
    }
}

impl TranslationCache for SoftwareTlb {
    fn slot_count(&self) -> usize {
        NUM_TLB
    }

    fn invalidate_slot(&mut self, index: usize) {
        debug_assert!(!interrupts_enabled(), "tlb updated with interrupts enabled");
        self.slots[index] = None;
    }

    fn install(&mut self, tag: VirtualAddress, entry: PageEntry) -> usize {
        debug_assert!(!interrupts_enabled(), "tlb updated with interrupts enabled");
        let index = match self.slots.iter().position(Option::is_none) {
            Some(free) => free,
            None => {
                let victim = self.next_victim;
                self.next_victim = (victim + 1) % NUM_TLB;
                victim
            }
        };
        self.slots[index] = Some((tag, entry));
        index
    }
}
