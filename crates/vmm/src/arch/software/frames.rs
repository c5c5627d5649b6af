//! Frame allocator over emulated physical memory.

use alloc::{collections::BTreeMap, vec::Vec};
use core::ptr::NonNull;

use crate::{AddressTranslator, FrameAllocator, FrameNumber, PhysicalAddress, layout::PAGE_SIZE};

/// A frame allocator backed by the current thread's emulated memory.
///
/// Fresh frames are carved out of the [`AddressTranslator`]'s emulated memory; released
/// single frames are recycled and re-zeroed before being handed out again. The allocator
/// keeps running totals so tests can check that every frame handed out came back, and it
/// can be told to fail a specific future request to exercise out-of-memory paths.
pub struct EmulatedFrameAllocator {
    state: spin::Mutex<FrameState>,
}

#[derive(Default)]
struct FrameState {
    /// Frames currently handed out, keyed by first frame, with their run length.
    live: BTreeMap<FrameNumber, usize>,
    /// Recycled single frames.
    free: Vec<FrameNumber>,
    /// Frames handed out since creation.
    allocated: usize,
    /// Frames returned since creation.
    released: usize,
    /// Allocation requests seen since creation, including failed ones.
    requests: usize,
    /// Request number (1-based) that will fail.
    fail_at: Option<usize>,
    /// Maximum number of frames outstanding at once.
    limit: Option<usize>,
}

impl EmulatedFrameAllocator {
    /// Creates an allocator with no limit beyond the size of the emulated memory.
    pub fn new() -> Self {
        Self {
            state: spin::Mutex::new(FrameState::default()),
        }
    }

    /// Creates an allocator that refuses to have more than `limit` frames outstanding.
    pub fn with_limit(limit: usize) -> Self {
        let allocator = Self::new();
        allocator.state.lock().limit = Some(limit);
        allocator
    }

    /// Makes the `n`th allocation request from now fail (`n = 1` fails the next one).
    pub fn fail_after(&self, n: usize) {
        let mut state = self.state.lock();
        state.fail_at = Some(state.requests + n);
    }

    /// Returns the number of frames currently handed out.
    pub fn outstanding(&self) -> usize {
        let state = self.state.lock();
        state.allocated - state.released
    }

    /// Returns the number of frames handed out since creation.
    pub fn allocated(&self) -> usize {
        self.state.lock().allocated
    }

    /// Returns the number of frames returned since creation.
    pub fn released(&self) -> usize {
        self.state.lock().released
    }

    /// Returns the number of allocation requests seen since creation.
    pub fn requests(&self) -> usize {
        self.state.lock().requests
    }
}

impl Default for EmulatedFrameAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameState {
    fn take(&mut self, count: usize) -> Option<FrameNumber> {
        self.requests += 1;
        if self.fail_at == Some(self.requests) {
            self.fail_at = None;
            log::trace!("emulated frame request {} failed by injection", self.requests);
            return None;
        }
        if let Some(limit) = self.limit {
            if self.allocated - self.released + count > limit {
                return None;
            }
        }

        let translator = AddressTranslator::current();
        if count == 1 {
            if let Some(frame) = self.free.pop() {
                // SAFETY: The frame is free, so nothing else refers to its contents.
                unsafe { frame.contents_mut().fill(0) };
                return Some(frame);
            }
        }

        // Fresh emulated memory is zeroed at creation and never handed out twice.
        translator
            .allocate(count * PAGE_SIZE, PAGE_SIZE)
            .map(|phys| PhysicalAddress::new(phys).frame_number())
    }
}

impl FrameAllocator for EmulatedFrameAllocator {
    fn allocate_frames(&self, count: usize) -> Option<NonNull<u8>> {
        if count == 0 {
            return None;
        }
        let mut state = self.state.lock();
        let first = state.take(count)?;
        state.live.insert(first, count);
        state.allocated += count;
        Some(first.start().kernel_ptr())
    }

    unsafe fn release_frames(&self, frames: NonNull<u8>) {
        let first = PhysicalAddress::from_kernel_ptr(frames).frame_number();
        let mut state = self.state.lock();
        let Some(count) = state.live.remove(&first) else {
            panic!("release of frame {:?} that is not allocated", first);
        };
        state.released += count;
        for i in 0..count {
            state.free.push(first + i);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup(frames: usize) -> EmulatedFrameAllocator {
        AddressTranslator::set_current(AddressTranslator::emulated(frames * PAGE_SIZE));
        EmulatedFrameAllocator::new()
    }

    #[test]
    fn counts_allocations_and_releases() {
        let frames = setup(8);
        let a = frames.allocate_frame().unwrap();
        let b = frames.allocate_frame().unwrap();
        assert_ne!(a, b);
        assert_eq!(frames.outstanding(), 2);

        unsafe { frames.release_frame(a) };
        assert_eq!(frames.allocated(), 2);
        assert_eq!(frames.released(), 1);
        assert_eq!(frames.outstanding(), 1);
    }

    #[test]
    fn recycled_frames_are_zeroed() {
        let frames = setup(1);
        let frame = frames.allocate_frame().unwrap();
        unsafe { frame.contents_mut()[17] = 0xaa };
        unsafe { frames.release_frame(frame) };

        let again = frames.allocate_frame().unwrap();
        assert_eq!(again, frame);
        assert!(unsafe { again.contents_mut() }.iter().all(|&b| b == 0));
    }

    #[test]
    fn exhausts_emulated_memory() {
        let frames = setup(2);
        assert!(frames.allocate_frame().is_some());
        assert!(frames.allocate_frame().is_some());
        assert!(frames.allocate_frame().is_none());
        assert_eq!(frames.requests(), 3);
    }

    #[test]
    fn injected_failure_hits_only_the_chosen_request() {
        let frames = setup(8);
        frames.fail_after(2);
        assert!(frames.allocate_frame().is_some());
        assert!(frames.allocate_frame().is_none());
        assert!(frames.allocate_frame().is_some());
        assert_eq!(frames.outstanding(), 2);
    }

    #[test]
    fn limit_caps_outstanding_frames() {
        AddressTranslator::set_current(AddressTranslator::emulated(8 * PAGE_SIZE));
        let frames = EmulatedFrameAllocator::with_limit(1);
        let frame = frames.allocate_frame().unwrap();
        assert!(frames.allocate_frame().is_none());
        unsafe { frames.release_frame(frame) };
        assert!(frames.allocate_frame().is_some());
    }

    #[test]
    fn contiguous_runs_release_as_a_unit() {
        let frames = setup(8);
        let run = frames.allocate_frames(3).unwrap();
        assert_eq!(frames.outstanding(), 3);
        unsafe { frames.release_frames(run) };
        assert_eq!(frames.outstanding(), 0);
    }

    #[test]
    #[should_panic(expected = "that is not allocated")]
    fn double_release_panics() {
        let frames = setup(2);
        let frame = frames.allocate_frame().unwrap();
        unsafe { frames.release_frame(frame) };
        unsafe { frames.release_frame(frame) };
    }
}
