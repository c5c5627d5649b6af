//! Translation-miss handling.
//!
//! The trap layer calls [`handle_raw_fault`] when the translation cache misses or rejects a
//! write. On success the faulting page has a page-table entry and a cache slot, and the
//! trap layer retries the instruction. On failure nothing is left behind: a second-level
//! table created for a fault that then fails is discarded again.

use crate::{
    AddressSpace, FrameAllocator, TranslationCache, VirtualAddress, VmError, VmResult,
    page_table::TableGuard, tlb,
};

/// Raw trap code for a read that missed the translation cache.
pub const VM_FAULT_READ: u32 = 0;
/// Raw trap code for a write that missed the translation cache.
pub const VM_FAULT_WRITE: u32 = 1;
/// Raw trap code for a write hitting a translation without the dirty bit.
pub const VM_FAULT_READONLY: u32 = 2;

/// Why the translation cache trapped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    Read,
    Write,
    /// A write to a page mapped without write permission.
    ReadOnly,
}

impl FaultKind {
    /// Decodes a raw trap code.
    pub const fn from_raw(code: u32) -> Option<Self> {
        match code {
            VM_FAULT_READ => Some(FaultKind::Read),
            VM_FAULT_WRITE => Some(FaultKind::Write),
            VM_FAULT_READONLY => Some(FaultKind::ReadOnly),
            _ => None,
        }
    }

    pub const fn as_raw(self) -> u32 {
        match self {
            FaultKind::Read => VM_FAULT_READ,
            FaultKind::Write => VM_FAULT_WRITE,
            FaultKind::ReadOnly => VM_FAULT_READONLY,
        }
    }
}

/// Handles a fault as delivered by the trap layer.
///
/// Read-only violations are rejected outright. An unknown code is an
/// [`VmError::InvalidRequest`]; an address that does not fit in 32 bits can never be mapped
/// and is a [`VmError::ProtectionFault`].
pub fn handle_raw_fault<A, C>(
    code: u32,
    address: usize,
    space: Option<&mut AddressSpace<A>>,
    cache: &mut C,
) -> VmResult<()>
where
    A: FrameAllocator,
    C: TranslationCache + ?Sized,
{
    let Some(kind) = FaultKind::from_raw(code) else {
        log::warn!("unknown fault code {} at {:#x}", code, address);
        return Err(VmError::InvalidRequest);
    };
    if kind == FaultKind::ReadOnly {
        log::warn!("write to read-only page at {:#x}", address);
        return Err(VmError::ProtectionFault);
    }
    let Some(address) = VirtualAddress::try_new(address) else {
        log::warn!("{:?} fault at unmappable address {:#x}", kind, address);
        return Err(VmError::ProtectionFault);
    };
    handle_fault(kind, address, space, cache)
}

/// Resolves a translation fault at `address` in `space`.
///
/// If the page is already mapped its existing entry is reloaded into the cache. Otherwise
/// the page must lie in a region of `space`; a zero-filled frame is mapped for it,
/// write-permitted iff the region is currently writable, and the new entry is loaded into
/// the cache.
///
/// # Errors
///
/// - [`VmError::ProtectionFault`] for read-only violations, when there is no address
///   space, or when no region contains `address`.
/// - [`VmError::OutOfMemory`] if a table or frame cannot be allocated.
pub fn handle_fault<A, C>(
    kind: FaultKind,
    address: VirtualAddress,
    space: Option<&mut AddressSpace<A>>,
    cache: &mut C,
) -> VmResult<()>
where
    A: FrameAllocator,
    C: TranslationCache + ?Sized,
{
    log::trace!("{:?} fault at {}", kind, address);
    if kind == FaultKind::ReadOnly {
        log::warn!("write to read-only page at {}", address);
        return Err(VmError::ProtectionFault);
    }
    let Some(space) = space else {
        log::warn!("{:?} fault at {} with no address space", kind, address);
        return Err(VmError::ProtectionFault);
    };

    let page = address.page_base();
    let (top, bottom) = (page.top_index(), page.bottom_index());
    let (regions, table) = space.parts_mut();

    let entry = match table.entry(top, bottom) {
        Some(entry) => entry,
        None => {
            let created = table.ensure_top_level(top)?;
            let mut guard = TableGuard::new(table, top, created);
            let Some(region) = regions.find_containing(address) else {
                log::warn!("{:?} fault at {} outside every region", kind, address);
                return Err(VmError::ProtectionFault);
            };
            let entry = guard.table().install_entry(top, bottom, region.is_writable())?;
            guard.commit();
            log::trace!("mapped {} to {:?}", page, entry);
            entry
        }
    };

    tlb::refill(cache, page, entry);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        AddressTranslator, EmulatedFrameAllocator, FrameAllocator, FrameNumber, PhysicalAddress,
        SoftwareTlb, layout::PAGE_SIZE,
    };

    type Space<'f> = AddressSpace<&'f EmulatedFrameAllocator>;

    fn setup(frames: usize) -> EmulatedFrameAllocator {
        AddressTranslator::set_current(AddressTranslator::emulated(frames * PAGE_SIZE));
        EmulatedFrameAllocator::new()
    }

    fn va(addr: usize) -> VirtualAddress {
        VirtualAddress::new(addr)
    }

    /// Performs an access the way a process would: probe the cache, take the fault the
    /// cache reports, and retry until the access succeeds or the fault is rejected.
    fn access(
        space: &mut Space<'_>,
        tlb: &mut SoftwareTlb,
        addr: usize,
        write: bool,
    ) -> VmResult<PhysicalAddress> {
        loop {
            match tlb.probe(va(addr), write) {
                Ok(phys) => return Ok(phys),
                Err(kind) => handle_raw_fault(kind.as_raw(), addr, Some(&mut *space), &mut *tlb)?,
            }
        }
    }

    #[test]
    fn raw_codes() {
        assert_eq!(FaultKind::from_raw(0), Some(FaultKind::Read));
        assert_eq!(FaultKind::from_raw(1), Some(FaultKind::Write));
        assert_eq!(FaultKind::from_raw(2), Some(FaultKind::ReadOnly));
        assert_eq!(FaultKind::from_raw(3), None);
        assert_eq!(FaultKind::ReadOnly.as_raw(), VM_FAULT_READONLY);
    }

    #[test]
    fn fault_maps_zeroed_page() {
        let frames = setup(8);
        let mut tlb = SoftwareTlb::new();
        let mut space = Space::create(&frames).unwrap();
        space.define_region(va(0x1000), 0x1000, true, true, false).unwrap();

        handle_fault(FaultKind::Read, va(0x1234), Some(&mut space), &mut tlb).unwrap();
        let entry = space.page_table().lookup(va(0x1000)).unwrap();
        assert!(entry.is_dirty());
        assert_eq!(tlb.lookup(va(0x1000)), Some(entry));
        let contents = unsafe { entry.frame().unwrap().contents() };
        assert!(contents.iter().all(|&b| b == 0));
    }

    #[test]
    fn second_fault_reuses_mapping() {
        let frames = setup(8);
        let mut tlb = SoftwareTlb::new();
        let mut space = Space::create(&frames).unwrap();
        space.define_region(va(0x1000), 0x1000, true, true, false).unwrap();

        handle_fault(FaultKind::Write, va(0x1000), Some(&mut space), &mut tlb).unwrap();
        let first = space.translate(va(0x1000));
        let outstanding = frames.outstanding();

        crate::tlb::flush(&mut tlb);
        handle_fault(FaultKind::Read, va(0x1ffc), Some(&mut space), &mut tlb).unwrap();
        assert_eq!(space.translate(va(0x1000)), first);
        assert_eq!(frames.outstanding(), outstanding);
        assert_eq!(space.mapped_pages(), 1);
        assert_eq!(tlb.valid_slots(), 1);
    }

    #[test]
    fn fault_outside_regions_changes_nothing() {
        let frames = setup(8);
        let mut tlb = SoftwareTlb::new();
        let mut space = Space::create(&frames).unwrap();
        space.define_region(va(0x1000), 0x1000, true, true, false).unwrap();

        assert_eq!(
            handle_fault(FaultKind::Read, va(0x0080_0000), Some(&mut space), &mut tlb),
            Err(VmError::ProtectionFault)
        );
        assert_eq!(frames.outstanding(), 0);
        assert_eq!(space.page_table().table_count(), 0);
        assert_eq!(tlb.valid_slots(), 0);

        // The table for top index 0 already exists once 0x1000 is mapped; it stays.
        handle_fault(FaultKind::Read, va(0x1000), Some(&mut space), &mut tlb).unwrap();
        let outstanding = frames.outstanding();
        assert_eq!(
            handle_fault(FaultKind::Write, va(0x3000), Some(&mut space), &mut tlb),
            Err(VmError::ProtectionFault)
        );
        assert_eq!(frames.outstanding(), outstanding);
        assert_eq!(space.page_table().table_count(), 1);
    }

    #[test]
    fn read_only_fault_is_rejected() {
        let frames = setup(8);
        let mut tlb = SoftwareTlb::new();
        let mut space = Space::create(&frames).unwrap();
        space.define_region(va(0x1000), 0x1000, true, true, false).unwrap();

        assert_eq!(
            handle_fault(FaultKind::ReadOnly, va(0x1000), Some(&mut space), &mut tlb),
            Err(VmError::ProtectionFault)
        );
        assert_eq!(space.mapped_pages(), 0);
    }

    #[test]
    fn missing_space_is_protection_fault() {
        let _frames = setup(4);
        let mut tlb = SoftwareTlb::new();
        assert_eq!(
            handle_fault::<&EmulatedFrameAllocator, _>(FaultKind::Read, va(0x1000), None, &mut tlb),
            Err(VmError::ProtectionFault)
        );
    }

    #[test]
    fn raw_fault_validation() {
        let frames = setup(4);
        let mut tlb = SoftwareTlb::new();
        let mut space = Space::create(&frames).unwrap();
        space.define_region(va(0x1000), 0x1000, true, true, false).unwrap();

        assert_eq!(
            handle_raw_fault(7, 0x1000, Some(&mut space), &mut tlb),
            Err(VmError::InvalidRequest)
        );
        assert_eq!(
            handle_raw_fault(VM_FAULT_READ, 1 << 40, Some(&mut space), &mut tlb),
            Err(VmError::ProtectionFault)
        );
        assert_eq!(
            handle_raw_fault(VM_FAULT_READONLY, 1 << 40, Some(&mut space), &mut tlb),
            Err(VmError::ProtectionFault)
        );
        handle_raw_fault(VM_FAULT_WRITE, 0x1000, Some(&mut space), &mut tlb).unwrap();
        assert_eq!(space.mapped_pages(), 1);
    }

    #[test]
    fn read_only_region_end_to_end() {
        let frames = setup(16);
        let mut tlb = SoftwareTlb::new();
        let mut space = Space::create(&frames).unwrap();
        space.define_region(va(0x1000), 0x1000, true, true, false).unwrap();
        space.define_region(va(0x2000), 0x1000, true, false, false).unwrap();

        assert_eq!(
            access(&mut space, &mut tlb, 0x2500, true),
            Err(VmError::ProtectionFault)
        );
        let entry = space.page_table().lookup(va(0x2000)).unwrap();
        assert!(!entry.is_dirty());

        let phys = access(&mut space, &mut tlb, 0x1500, true).unwrap();
        assert_eq!(space.translate(va(0x1500)), Some(phys));
        assert!(access(&mut space, &mut tlb, 0x2500, false).is_ok());
    }

    #[test]
    fn loading_maps_read_only_region_writable() {
        let frames = setup(16);
        let mut tlb = SoftwareTlb::new();
        let mut space = Space::create(&frames).unwrap();
        space.define_region(va(0x2000), 0x1000, true, false, true).unwrap();

        space.prepare_load();
        access(&mut space, &mut tlb, 0x2000, true).unwrap();
        space.complete_load(&mut tlb);

        // The page keeps the entry it was created with; the region is read-only again for
        // pages mapped from now on.
        assert!(space.page_table().lookup(va(0x2000)).unwrap().is_dirty());
        assert!(!space.find_containing(va(0x2000)).unwrap().is_writable());
    }

    #[test]
    fn out_of_memory_on_table_leaves_nothing() {
        let frames = setup(8);
        let mut tlb = SoftwareTlb::new();
        let mut space = Space::create(&frames).unwrap();
        space.define_region(va(0x1000), 0x1000, true, true, false).unwrap();

        frames.fail_after(1);
        assert_eq!(
            handle_fault(FaultKind::Write, va(0x1000), Some(&mut space), &mut tlb),
            Err(VmError::OutOfMemory)
        );
        assert_eq!(frames.outstanding(), 0);
        assert_eq!(tlb.valid_slots(), 0);
    }

    #[test]
    fn out_of_memory_on_frame_discards_new_table() {
        let frames = setup(8);
        let mut tlb = SoftwareTlb::new();
        let mut space = Space::create(&frames).unwrap();
        space.define_region(va(0x1000), 0x1000, true, true, false).unwrap();

        frames.fail_after(2);
        assert_eq!(
            handle_fault(FaultKind::Write, va(0x1000), Some(&mut space), &mut tlb),
            Err(VmError::OutOfMemory)
        );
        assert_eq!(frames.outstanding(), 0);
        assert_eq!(space.page_table().table_count(), 0);

        handle_fault(FaultKind::Write, va(0x1000), Some(&mut space), &mut tlb).unwrap();
        assert_eq!(space.mapped_pages(), 1);
    }

    #[test]
    fn frame_zero_is_a_mapping() {
        let frames = setup(8);
        let mut tlb = SoftwareTlb::new();
        let mut space = Space::create(&frames).unwrap();
        space.define_region(va(0x1000), 0x1000, true, true, false).unwrap();

        // Recycled frames come back last-released first: the table gets frame 1 and the
        // data page frame 0.
        let zero = frames.allocate_frame().unwrap();
        let one = frames.allocate_frame().unwrap();
        assert_eq!(zero, FrameNumber::new(0));
        unsafe {
            frames.release_frame(zero);
            frames.release_frame(one);
        }

        handle_fault(FaultKind::Read, va(0x1234), Some(&mut space), &mut tlb).unwrap();
        let entry = space.page_table().lookup(va(0x1000)).unwrap();
        assert_eq!(entry.frame(), Some(zero));
        assert_eq!(space.translate(va(0x1234)), Some(PhysicalAddress::new(0x234)));
        assert_eq!(tlb.probe(va(0x1234), true), Ok(PhysicalAddress::new(0x234)));
    }
}
