//! Two-level page tables.
//!
//! The top-level table has one optional slot per 4 MiB of user address space. A slot points
//! at a second-level table, which is a single frame holding [`ENTRIES_PER_TABLE`] packed
//! [`PageEntry`] words. Both levels are filled in on demand by the fault handler.
//!
//! A `PageTable` owns every frame it refers to, second-level tables included, and returns
//! them all to its [`FrameAllocator`] when dropped. That makes rollback structural: a table
//! that is being built and hits an allocation failure is simply dropped.

use alloc::vec::Vec;
use core::ptr::{self, NonNull};

use crate::{
    FrameAllocator, PageEntry, PhysicalAddress, VirtualAddress, VmError, VmResult,
    layout::{ENTRIES_PER_TABLE, INDEX_BITS, PAGE_SHIFT, PAGE_SIZE, TOP_LEVEL_ENTRIES},
};

/// A second-level table living in one frame.
struct EntryTable {
    entries: NonNull<[PageEntry; ENTRIES_PER_TABLE]>,
}

impl EntryTable {
    fn entries(&self) -> &[PageEntry; ENTRIES_PER_TABLE] {
        // SAFETY: The frame is owned by the page table holding this EntryTable and is only
        // reached through it.
        unsafe { self.entries.as_ref() }
    }

    fn entries_mut(&mut self) -> &mut [PageEntry; ENTRIES_PER_TABLE] {
        // SAFETY: As above; `&mut self` guarantees exclusivity.
        unsafe { self.entries.as_mut() }
    }
}

/// A lazily populated two-level page table for one user address space.
pub struct PageTable<A: FrameAllocator> {
    /// Top-level table; empty once the table has been released.
    directory: Vec<Option<EntryTable>>,
    /// Where every frame referenced by this table comes from and goes back to.
    frames: A,
    /// Number of valid entries across all second-level tables.
    mapped: usize,
}

// SAFETY: A PageTable exclusively owns the frames its raw pointers refer to.
unsafe impl<A: FrameAllocator + Send> Send for PageTable<A> {}

impl<A: FrameAllocator> PageTable<A> {
    /// Creates an empty page table: every top-level slot absent.
    pub fn new(frames: A) -> VmResult<Self> {
        let mut directory = Vec::new();
        directory.try_reserve_exact(TOP_LEVEL_ENTRIES)?;
        directory.resize_with(TOP_LEVEL_ENTRIES, || None);
        Ok(Self {
            directory,
            frames,
            mapped: 0,
        })
    }

    /// Makes sure the second-level table for `top` exists.
    ///
    /// Returns `Ok(true)` if the table was created by this call and `Ok(false)` if it was
    /// already present. On failure nothing is modified.
    pub fn ensure_top_level(&mut self, top: usize) -> VmResult<bool> {
        let slot = self.directory.get_mut(top).ok_or(VmError::InvalidRequest)?;
        if slot.is_some() {
            return Ok(false);
        }

        let alias = self.frames.allocate_frames(1).ok_or(VmError::OutOfMemory)?;
        // SAFETY: The frame is freshly allocated, page-aligned and PAGE_SIZE long. Zero is
        // the absent entry.
        unsafe { ptr::write_bytes(alias.as_ptr(), 0, PAGE_SIZE) };
        *slot = Some(EntryTable {
            entries: alias.cast(),
        });
        Ok(true)
    }

    /// Maps a fresh frame at `(top, bottom)`, write-permitted if `dirty`.
    ///
    /// The second-level table must exist and the entry must be absent; otherwise the call
    /// fails with [`VmError::InvalidRequest`]. If no frame is available the call fails with
    /// [`VmError::OutOfMemory`] and the table is unchanged. The new frame is zero-filled by
    /// the allocator.
    pub fn install_entry(&mut self, top: usize, bottom: usize, dirty: bool) -> VmResult<PageEntry> {
        let slot = self
            .directory
            .get_mut(top)
            .and_then(Option::as_mut)
            .and_then(|table| table.entries_mut().get_mut(bottom))
            .ok_or(VmError::InvalidRequest)?;
        if slot.is_valid() {
            return Err(VmError::InvalidRequest);
        }

        let frame = self.frames.allocate_frame().ok_or(VmError::OutOfMemory)?;
        let entry = PageEntry::new(frame, dirty);
        *slot = entry;
        self.mapped += 1;
        Ok(entry)
    }

    /// Returns the entry translating `address`, or None if it is not mapped.
    pub fn lookup(&self, address: VirtualAddress) -> Option<PageEntry> {
        self.entry(address.top_index(), address.bottom_index())
    }

    /// Returns the entry at `(top, bottom)`, or None if either level is absent.
    pub fn entry(&self, top: usize, bottom: usize) -> Option<PageEntry> {
        let table = self.directory.get(top)?.as_ref()?;
        table
            .entries()
            .get(bottom)
            .copied()
            .filter(|entry| entry.is_valid())
    }

    /// Translates `address` to the physical address backing it, if mapped.
    pub fn translate(&self, address: VirtualAddress) -> Option<PhysicalAddress> {
        let frame = self.lookup(address)?.frame()?;
        Some(PhysicalAddress::new(frame.start().as_usize() + address.page_offset()))
    }

    /// Returns whether the second-level table for `top` exists.
    pub fn has_table(&self, top: usize) -> bool {
        self.directory.get(top).is_some_and(Option::is_some)
    }

    /// Returns the number of mapped pages.
    pub fn mapped_pages(&self) -> usize {
        self.mapped
    }

    /// Returns the number of second-level tables.
    pub fn table_count(&self) -> usize {
        self.directory.iter().flatten().count()
    }

    /// Returns every mapping as `(page address, entry)`, in address order.
    pub fn mappings(&self) -> impl Iterator<Item = (VirtualAddress, PageEntry)> + '_ {
        self.directory
            .iter()
            .enumerate()
            .filter_map(|(top, table)| table.as_ref().map(|table| (top, table)))
            .flat_map(|(top, table)| {
                table
                    .entries()
                    .iter()
                    .enumerate()
                    .filter(|(_, entry)| entry.is_valid())
                    .map(move |(bottom, entry)| (page_address(top, bottom), *entry))
            })
    }

    /// Removes the second-level table for `top`, releasing any frames it maps.
    pub(crate) fn discard_table(&mut self, top: usize) {
        let Some(table) = self.directory.get_mut(top).and_then(Option::take) else {
            return;
        };
        self.mapped -= release_table(&self.frames, table);
    }

    /// Returns every mapped frame, then every second-level table, then the top-level table
    /// itself to the allocator. Afterwards the table maps nothing. Calling it again is a
    /// no-op.
    pub fn release_all(&mut self) {
        let mut released = 0;
        for table in self.directory.iter_mut().filter_map(Option::take) {
            released += release_table(&self.frames, table);
        }
        self.directory = Vec::new();
        self.mapped -= released;
    }

    /// Builds a private copy of this table: a fresh frame for every mapped page, with the
    /// page contents and dirty bit copied.
    ///
    /// If any allocation fails, everything allocated for the copy is released and
    /// [`VmError::OutOfMemory`] is returned. `self` is never modified.
    pub fn try_clone(&self) -> VmResult<Self>
    where
        A: Clone,
    {
        // Dropping `copy` on an early return releases whatever it holds so far.
        let mut copy = Self::new(self.frames.clone())?;
        for (top, source) in self.directory.iter().enumerate() {
            let Some(source) = source else { continue };
            copy.ensure_top_level(top)?;

            for (bottom, entry) in source.entries().iter().enumerate() {
                let Some(frame) = entry.frame() else { continue };
                let new_frame = copy.frames.allocate_frame().ok_or(VmError::OutOfMemory)?;
                // SAFETY: Both frames are owned by page tables reachable only from here, and
                // they are distinct.
                unsafe { new_frame.contents_mut().copy_from_slice(frame.contents()) };
                copy.store(top, bottom, entry.with_frame(new_frame));
            }
        }
        log::trace!(
            "copied page table: {} tables, {} pages",
            copy.table_count(),
            copy.mapped
        );
        Ok(copy)
    }

    fn store(&mut self, top: usize, bottom: usize, entry: PageEntry) {
        if let Some(table) = self.directory[top].as_mut() {
            table.entries_mut()[bottom] = entry;
            self.mapped += 1;
        }
    }
}

impl<A: FrameAllocator> Drop for PageTable<A> {
    fn drop(&mut self) {
        self.release_all();
    }
}

/// Releases the frames mapped by `table` and then `table` itself; returns the number of
/// mapped frames released.
fn release_table<A: FrameAllocator>(frames: &A, table: EntryTable) -> usize {
    let mut released = 0;
    for entry in table.entries().iter() {
        if let Some(frame) = entry.frame() {
            // SAFETY: The frame was allocated for this entry and is referenced nowhere else.
            unsafe { frames.release_frame(frame) };
            released += 1;
        }
    }
    // SAFETY: The table frame came from this allocator and `table` is consumed here.
    unsafe { frames.release_frames(table.entries.cast()) };
    released
}

fn page_address(top: usize, bottom: usize) -> VirtualAddress {
    VirtualAddress::new((top << (PAGE_SHIFT + INDEX_BITS)) | (bottom << PAGE_SHIFT))
}

/// Discards a second-level table created for a mapping that did not complete.
///
/// The fault handler creates a second-level table before it knows whether the faulting
/// address is legal. The guard removes that table again on drop unless the mapping was
/// committed, so a failed fault leaves no empty table behind.
pub(crate) struct TableGuard<'t, A: FrameAllocator> {
    table: &'t mut PageTable<A>,
    top: usize,
    created: bool,
}

impl<'t, A: FrameAllocator> TableGuard<'t, A> {
    /// Guards the table at `top`; only a table `created` by the caller is discarded.
    pub(crate) fn new(table: &'t mut PageTable<A>, top: usize, created: bool) -> Self {
        Self {
            table,
            top,
            created,
        }
    }

    pub(crate) fn table(&mut self) -> &mut PageTable<A> {
        self.table
    }

    /// Keeps the table.
    pub(crate) fn commit(mut self) {
        self.created = false;
    }
}

impl<A: FrameAllocator> Drop for TableGuard<'_, A> {
    fn drop(&mut self) {
        if self.created {
            log::trace!("discarding second-level table {}", self.top);
            self.table.discard_table(self.top);
        }
    }
}
