//! The frame allocator interface consumed by the page tables.

use core::ptr::NonNull;

use crate::{FrameNumber, PhysicalAddress};

/// A source of physical page frames.
///
/// Frames are handed out through their kernel alias. The allocator contract is that every
/// frame it returns is zero-filled, and that allocation never blocks: when no frame is
/// available it returns None immediately.
pub trait FrameAllocator {
    /// Allocates `count` contiguous zeroed frames and returns the kernel alias of the first.
    fn allocate_frames(&self, count: usize) -> Option<NonNull<u8>>;

    /// Returns frames previously obtained from [`FrameAllocator::allocate_frames`].
    ///
    /// # Safety
    ///
    /// `frames` must have come from this allocator, must not have been released already, and
    /// must not be accessed after this call.
    unsafe fn release_frames(&self, frames: NonNull<u8>);

    /// Allocates a single zeroed frame and returns its number.
    ///
    /// Page-table entries hold 32-bit physical addresses. A frame the allocator hands out
    /// above that range is given back and the call returns None, the same as running out
    /// of frames.
    fn allocate_frame(&self) -> Option<FrameNumber> {
        let alias = self.allocate_frames(1)?;
        match PhysicalAddress::try_from_kernel_ptr(alias) {
            Some(phys) => Some(phys.frame_number()),
            None => {
                log::warn!("frame at {:p} is beyond the 32-bit physical range", alias);
                // SAFETY: The frame was just allocated from this allocator and is not shared.
                unsafe { self.release_frames(alias) };
                None
            }
        }
    }

    /// Releases a single frame by number.
    ///
    /// # Safety
    ///
    /// Same contract as [`FrameAllocator::release_frames`].
    unsafe fn release_frame(&self, frame: FrameNumber) {
        // SAFETY: Forwarded to the caller.
        unsafe { self.release_frames(frame.start().kernel_ptr()) }
    }
}

impl<T: FrameAllocator + ?Sized> FrameAllocator for &T {
    fn allocate_frames(&self, count: usize) -> Option<NonNull<u8>> {
        (**self).allocate_frames(count)
    }

    unsafe fn release_frames(&self, frames: NonNull<u8>) {
        // SAFETY: Forwarded to the caller.
        unsafe { (**self).release_frames(frames) }
    }
}

impl<T: FrameAllocator + ?Sized> FrameAllocator for alloc::sync::Arc<T> {
    fn allocate_frames(&self, count: usize) -> Option<NonNull<u8>> {
        (**self).allocate_frames(count)
    }

    unsafe fn release_frames(&self, frames: NonNull<u8>) {
        // SAFETY: Forwarded to the caller.
        unsafe { (**self).release_frames(frames) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::AddressTranslator;
    use core::cell::Cell;

    const HIGH_ALIAS: usize = 0x1_0000_0000;

    /// Hands out the same frame above 4 GiB every time.
    #[derive(Default)]
    struct HighFrames {
        released: Cell<usize>,
    }

    impl FrameAllocator for HighFrames {
        fn allocate_frames(&self, _count: usize) -> Option<NonNull<u8>> {
            NonNull::new(HIGH_ALIAS as *mut u8)
        }

        unsafe fn release_frames(&self, frames: NonNull<u8>) {
            assert_eq!(frames.as_ptr() as usize, HIGH_ALIAS);
            self.released.set(self.released.get() + 1);
        }
    }

    #[test]
    fn frame_beyond_32_bits_is_returned() {
        AddressTranslator::set_current(AddressTranslator::hardware(0));
        let frames = HighFrames::default();
        assert_eq!(frames.allocate_frame(), None);
        assert_eq!(frames.released.get(), 1);
    }
}
