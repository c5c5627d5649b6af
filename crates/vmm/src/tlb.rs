//! Translation cache (TLB) interface.
//!
//! The translation cache is owned by the trap layer. This module only needs three things
//! from it: how many slots it has, how to invalidate one, and how to install a translation
//! into a slot of its own choosing. Every update goes through [`flush`] or [`refill`], which
//! run the update with interrupts masked on the local CPU and nothing else.

use crate::{PageEntry, VirtualAddress, arch};

/// A software-managed translation cache.
pub trait TranslationCache {
    /// Returns the number of slots in the cache.
    fn slot_count(&self) -> usize;

    /// Invalidates the slot at `index`.
    fn invalidate_slot(&mut self, index: usize);

    /// Installs a translation for the page tagged `tag` into a slot chosen by the cache's
    /// replacement policy, returning the slot used.
    fn install(&mut self, tag: VirtualAddress, entry: PageEntry) -> usize;
}

/// Invalidates every slot of the cache atomically with respect to local interrupts.
pub fn flush<C: TranslationCache + ?Sized>(cache: &mut C) {
    arch::without_interrupts(|| {
        for index in 0..cache.slot_count() {
            cache.invalidate_slot(index);
        }
    });
}

/// Installs one translation atomically with respect to local interrupts.
///
/// `tag` is aligned down to its page before installation.
pub fn refill<C: TranslationCache + ?Sized>(
    cache: &mut C,
    tag: VirtualAddress,
    entry: PageEntry,
) -> usize {
    let tag = tag.page_base();
    arch::without_interrupts(|| cache.install(tag, entry))
}

/// A request from another CPU to invalidate translations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShootdownRequest {
    /// The page whose translation should be dropped, or None for the whole cache.
    pub page: Option<VirtualAddress>,
}

/// Handles a cross-CPU invalidation request.
///
/// Translation caches are per CPU and this subsystem runs on exactly one, so there is no
/// way to honour the request. Receiving one means the kernel is misconfigured; halt.
pub fn shootdown(request: &ShootdownRequest) -> ! {
    log::error!("tlb shootdown requested: {:?}", request);
    panic!("vm tried to do tlb shootdown");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::SoftwareTlb;
    use crate::{AddressTranslator, FrameNumber, layout::PAGE_SIZE};

    fn setup() {
        AddressTranslator::set_current(AddressTranslator::emulated(4 * PAGE_SIZE));
    }

    #[test]
    fn refill_tags_the_page_base() {
        setup();
        let mut tlb = SoftwareTlb::new();
        let entry = PageEntry::new(FrameNumber::new(1), true);
        refill(&mut tlb, VirtualAddress::new(0x1234), entry);
        assert_eq!(tlb.lookup(VirtualAddress::new(0x1000)), Some(entry));
    }

    #[test]
    fn flush_invalidates_every_slot() {
        setup();
        let mut tlb = SoftwareTlb::new();
        for page in 0..4 {
            let entry = PageEntry::new(FrameNumber::new(page), false);
            refill(&mut tlb, VirtualAddress::new(page * PAGE_SIZE), entry);
        }
        assert_eq!(tlb.valid_slots(), 4);

        flush(&mut tlb);
        assert_eq!(tlb.valid_slots(), 0);
    }

    #[test]
    #[should_panic(expected = "vm tried to do tlb shootdown")]
    fn shootdown_is_fatal() {
        shootdown(&ShootdownRequest { page: None });
    }
}
