//! User address spaces.
//!
//! An [`AddressSpace`] pairs the regions a process has declared with the page table that is
//! filled in as the process touches them. It is exclusively owned by its process: every
//! mutation takes `&mut self`, and dropping it returns every frame it holds.
//!
//! The free functions at the bottom of this module serve call sites where the current
//! thread may not have an address space at all (kernel-only threads).

use crate::{
    FrameAllocator, PageTable, PhysicalAddress, Region, RegionList, RegionPolicy,
    TranslationCache, VirtualAddress, VmError, VmResult,
    layout::{USER_STACK_SIZE, USERSTACK},
    tlb,
};

/// The virtual memory of one user process.
pub struct AddressSpace<A: FrameAllocator> {
    // Field order is drop order: regions go before the page table.
    regions: RegionList,
    page_table: PageTable<A>,
}

impl<A: FrameAllocator> AddressSpace<A> {
    /// Creates an empty address space that accepts overlapping regions.
    pub fn create(frames: A) -> VmResult<Self> {
        Self::with_policy(frames, RegionPolicy::default())
    }

    /// Creates an empty address space with the given overlap policy.
    pub fn with_policy(frames: A, policy: RegionPolicy) -> VmResult<Self> {
        let space = Self {
            regions: RegionList::new(policy),
            page_table: PageTable::new(frames)?,
        };
        log::debug!("created address space ({:?})", policy);
        Ok(space)
    }

    /// Tears the address space down, returning every frame and table it holds.
    ///
    /// Dropping the address space does the same; this exists so that teardown reads as
    /// an explicit step at call sites.
    pub fn destroy(self) {
        log::debug!(
            "destroying address space: {} regions, {} pages, {} tables",
            self.regions.len(),
            self.page_table.mapped_pages(),
            self.page_table.table_count()
        );
    }

    /// Makes this the address space the translation cache serves.
    ///
    /// The cache holds no address-space tags, so every slot is invalidated.
    pub fn activate<C: TranslationCache + ?Sized>(&self, cache: &mut C) {
        tlb::flush(cache);
    }

    /// Stops this address space from being served by the translation cache.
    pub fn deactivate<C: TranslationCache + ?Sized>(&self, cache: &mut C) {
        tlb::flush(cache);
    }

    /// Declares a region; see [`RegionList::define`].
    pub fn define_region(
        &mut self,
        address: VirtualAddress,
        size: usize,
        readable: bool,
        writable: bool,
        executable: bool,
    ) -> VmResult<()> {
        let region = self
            .regions
            .define(address, size, readable, writable, executable)?;
        log::debug!("defined {:?}", region);
        Ok(())
    }

    /// Opens the load window: every region becomes writable until [`complete_load`].
    ///
    /// [`complete_load`]: Self::complete_load
    pub fn prepare_load(&mut self) {
        self.regions.prepare_load();
    }

    /// Closes the load window, restoring each region's declared writable flag.
    ///
    /// Translations cached during loading may carry the dirty bit for pages that are now
    /// read-only, so the whole cache is flushed. Entries already in the page table keep
    /// the permission they were created with.
    pub fn complete_load<C: TranslationCache + ?Sized>(&mut self, cache: &mut C) {
        self.regions.complete_load();
        tlb::flush(cache);
    }

    /// Declares the user stack just below [`USERSTACK`] and returns the initial stack
    /// pointer.
    pub fn define_stack(&mut self) -> VmResult<VirtualAddress> {
        let top = VirtualAddress::new(USERSTACK);
        self.define_region(top - USER_STACK_SIZE, USER_STACK_SIZE, true, true, true)?;
        Ok(top)
    }

    /// Returns the first region, in definition order, containing `address`.
    pub fn find_containing(&self, address: VirtualAddress) -> Option<&Region> {
        self.regions.find_containing(address)
    }

    /// Returns the physical address currently backing `address`, if mapped.
    pub fn translate(&self, address: VirtualAddress) -> Option<PhysicalAddress> {
        self.page_table.translate(address)
    }

    /// Returns the number of pages with a backing frame.
    pub fn mapped_pages(&self) -> usize {
        self.page_table.mapped_pages()
    }

    pub fn regions(&self) -> &RegionList {
        &self.regions
    }

    pub fn page_table(&self) -> &PageTable<A> {
        &self.page_table
    }

    /// Splits the address space for the fault handler, which reads regions while it
    /// extends the page table.
    pub(crate) fn parts_mut(&mut self) -> (&RegionList, &mut PageTable<A>) {
        (&self.regions, &mut self.page_table)
    }
}

impl<A: FrameAllocator + Clone> AddressSpace<A> {
    /// Builds an independent copy: the same regions and a private copy of every mapped
    /// page.
    ///
    /// The source is never modified. If any allocation fails, everything built for the
    /// copy is released and [`VmError::OutOfMemory`] is returned.
    pub fn duplicate(&self) -> VmResult<Self> {
        let regions = self.regions.try_clone()?;
        let page_table = self.page_table.try_clone()?;
        log::debug!(
            "duplicated address space: {} regions, {} pages",
            regions.len(),
            page_table.mapped_pages()
        );
        Ok(Self {
            regions,
            page_table,
        })
    }
}

/// Activates `current`, if there is one.
pub fn activate<A, C>(current: Option<&AddressSpace<A>>, cache: &mut C)
where
    A: FrameAllocator,
    C: TranslationCache + ?Sized,
{
    if let Some(space) = current {
        space.activate(cache);
    }
}

/// Deactivates `current`, if there is one.
pub fn deactivate<A, C>(current: Option<&AddressSpace<A>>, cache: &mut C)
where
    A: FrameAllocator,
    C: TranslationCache + ?Sized,
{
    if let Some(space) = current {
        space.deactivate(cache);
    }
}

/// Declares a region in `current`; a thread without an address space gets
/// [`VmError::InvalidRequest`].
pub fn define_region<A: FrameAllocator>(
    current: Option<&mut AddressSpace<A>>,
    address: VirtualAddress,
    size: usize,
    readable: bool,
    writable: bool,
    executable: bool,
) -> VmResult<()> {
    let space = current.ok_or(VmError::InvalidRequest)?;
    space.define_region(address, size, readable, writable, executable)
}
