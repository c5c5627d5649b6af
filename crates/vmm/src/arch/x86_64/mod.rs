//! x86_64 architecture-specific implementation.
//!
//! Translation-cache updates run with maskable interrupts disabled on the local CPU.

/// Runs `f` with interrupts disabled on the local CPU, restoring the previous state after.
#[inline]
pub fn without_interrupts<F, R>(f: F) -> R
where
    F: FnOnce() -> R,
{
    x86_64::instructions::interrupts::without_interrupts(f)
}
