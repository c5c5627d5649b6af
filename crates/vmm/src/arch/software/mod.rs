//! Software emulation implementation for testing and development.
//!
//! This module provides a software-emulated machine that runs on any host:
//! - physical memory is a page-aligned host buffer ([`EmulatedMemory`])
//! - frames are carved out of that buffer by [`EmulatedFrameAllocator`], which also counts
//!   allocations and can be told to fail
//! - the translation cache is a software-managed TLB ([`SoftwareTlb`])
//! - interrupt masking is a per-thread flag, so tests can check that cache updates happen
//!   inside the critical section

mod frames;
mod memory;
mod tlb;

use core::cell::Cell;

pub use frames::EmulatedFrameAllocator;
pub use memory::EmulatedMemory;
pub use tlb::{NUM_TLB, SoftwareTlb};

std::thread_local! {
    static INTERRUPTS_ENABLED: Cell<bool> = const { Cell::new(true) };
}

/// Runs `f` with emulated interrupts disabled, restoring the previous state after.
pub fn without_interrupts<F, R>(f: F) -> R
where
    F: FnOnce() -> R,
{
    let previous = INTERRUPTS_ENABLED.with(|enabled| enabled.replace(false));
    let result = f();
    INTERRUPTS_ENABLED.with(|enabled| enabled.set(previous));
    result
}

/// Returns whether emulated interrupts are enabled on this thread.
pub fn interrupts_enabled() -> bool {
    INTERRUPTS_ENABLED.with(|enabled| enabled.get())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn masks_and_restores() {
        assert!(interrupts_enabled());
        let inside = without_interrupts(interrupts_enabled);
        assert!(!inside);
        assert!(interrupts_enabled());
    }

    #[test]
    fn nested_sections_keep_interrupts_masked() {
        without_interrupts(|| {
            without_interrupts(|| assert!(!interrupts_enabled()));
            assert!(!interrupts_enabled());
        });
        assert!(interrupts_enabled());
    }
}
