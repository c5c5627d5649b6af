//! Region bookkeeping.
//!
//! A region is a page-aligned range of user virtual addresses the program is allowed to
//! touch, together with the permissions it was declared with. Only the writable permission
//! is enforced (through the dirty bit of the entries created for it); readable and
//! executable are recorded as declared.

use alloc::vec::Vec;
use core::fmt;

use crate::{
    VirtualAddress, VmError, VmResult,
    layout::{MAX_VIRTUAL_BITS, PAGE_SIZE},
};

/// A declared range of user virtual addresses.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Region {
    base: VirtualAddress,
    page_count: usize,
    readable: bool,
    writable: bool,
    executable: bool,
    /// The writable flag to restore when loading completes.
    writable_saved: bool,
}

impl Region {
    /// Returns the first address of the region.
    pub fn base(&self) -> VirtualAddress {
        self.base
    }

    /// Returns the number of pages the region spans.
    pub fn page_count(&self) -> usize {
        self.page_count
    }

    /// Returns the region's length in bytes.
    pub fn size(&self) -> usize {
        self.page_count * PAGE_SIZE
    }

    /// Returns the first address past the region.
    ///
    /// A region may end exactly at the top of the 32-bit space, so this is not a
    /// [`VirtualAddress`].
    pub fn end(&self) -> usize {
        self.base.as_usize() + self.size()
    }

    /// Returns whether `address` lies in `[base, end)`.
    pub fn contains(&self, address: VirtualAddress) -> bool {
        (self.base.as_usize()..self.end()).contains(&address.as_usize())
    }

    /// Returns whether the region shares any page with `[base, end)`.
    fn intersects(&self, base: usize, end: usize) -> bool {
        self.base.as_usize() < end && base < self.end()
    }

    pub fn is_readable(&self) -> bool {
        self.readable
    }

    /// Returns whether pages of this region are mapped write-permitted.
    pub fn is_writable(&self) -> bool {
        self.writable
    }

    pub fn is_executable(&self) -> bool {
        self.executable
    }

    /// Returns the writable flag as originally declared.
    pub fn writable_saved(&self) -> bool {
        self.writable_saved
    }
}

impl fmt::Debug for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Region({}..{:#010x}, {}{}{})",
            self.base,
            self.end(),
            if self.readable { 'r' } else { '-' },
            if self.writable { 'w' } else { '-' },
            if self.executable { 'x' } else { '-' },
        )
    }
}

/// What [`RegionList::define`] does with a region that overlaps an existing one.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum RegionPolicy {
    /// Accept the region. Lookups resolve overlapping addresses to the earliest defined
    /// region.
    #[default]
    AllowOverlap,
    /// Fail with [`VmError::RegionOverlap`].
    RejectOverlap,
}

/// The regions of one address space, in definition order.
#[derive(Debug)]
pub struct RegionList {
    regions: Vec<Region>,
    policy: RegionPolicy,
}

impl RegionList {
    pub fn new(policy: RegionPolicy) -> Self {
        Self {
            regions: Vec::new(),
            policy,
        }
    }

    pub fn policy(&self) -> RegionPolicy {
        self.policy
    }

    /// Declares a region covering `[address, address + size)`.
    ///
    /// The base is aligned down to its page and the size grown by the base's page offset,
    /// then rounded up to a whole number of pages. A zero size, or a range running past the
    /// 32-bit space, is an [`VmError::InvalidRequest`]. Allocation failure is reported as
    /// [`VmError::OutOfMemory`] with the list unchanged.
    pub fn define(
        &mut self,
        address: VirtualAddress,
        size: usize,
        readable: bool,
        writable: bool,
        executable: bool,
    ) -> VmResult<&Region> {
        if size == 0 {
            return Err(VmError::InvalidRequest);
        }
        let base = address.page_base();
        let bytes = size
            .checked_add(address.page_offset())
            .and_then(|bytes| bytes.checked_next_multiple_of(PAGE_SIZE))
            .ok_or(VmError::InvalidRequest)?;
        let end = base
            .as_usize()
            .checked_add(bytes)
            .filter(|&end| end <= 1 << MAX_VIRTUAL_BITS)
            .ok_or(VmError::InvalidRequest)?;

        if let Some(existing) = self.overlapping(base, end) {
            match self.policy {
                RegionPolicy::AllowOverlap => {
                    log::debug!("region {}..{:#010x} overlaps {:?}", base, end, existing)
                }
                RegionPolicy::RejectOverlap => return Err(VmError::RegionOverlap),
            }
        }

        self.regions.try_reserve(1)?;
        self.regions.push(Region {
            base,
            page_count: bytes / PAGE_SIZE,
            readable,
            writable,
            executable,
            writable_saved: writable,
        });
        Ok(&self.regions[self.regions.len() - 1])
    }

    /// Marks every region writable so the loader can fill it. The declared flag stays in
    /// `writable_saved`, which only [`RegionList::define`] sets.
    pub fn prepare_load(&mut self) {
        for region in &mut self.regions {
            region.writable = true;
        }
    }

    /// Restores every region's declared writable flag.
    pub fn complete_load(&mut self) {
        for region in &mut self.regions {
            region.writable = region.writable_saved;
        }
    }

    /// Returns the first region containing `address`, in definition order.
    pub fn find_containing(&self, address: VirtualAddress) -> Option<&Region> {
        self.regions.iter().find(|region| region.contains(address))
    }

    /// Returns the first region sharing any address with `[base, end)`.
    pub fn overlapping(&self, base: VirtualAddress, end: usize) -> Option<&Region> {
        self.regions
            .iter()
            .find(|region| region.intersects(base.as_usize(), end))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Region> {
        self.regions.iter()
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    /// Copies the list, failing with [`VmError::OutOfMemory`] instead of aborting.
    pub fn try_clone(&self) -> VmResult<Self> {
        let mut regions = Vec::new();
        regions.try_reserve_exact(self.regions.len())?;
        regions.extend_from_slice(&self.regions);
        Ok(Self {
            regions,
            policy: self.policy,
        })
    }
}

impl Default for RegionList {
    fn default() -> Self {
        Self::new(RegionPolicy::default())
    }
}
