//! Physical frame numbers.

use crate::{address::PhysicalAddress, layout};
use core::{fmt, ops::Add};

macro_rules! impl_frame_number {
    ($name:ident, $doc:expr) => {
        #[doc = $doc]
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        #[repr(transparent)]
        pub struct $name(usize);

        impl $name {
            /// Creates a new frame number.
            #[inline]
            pub const fn new(number: usize) -> Self {
                Self(number)
            }

            /// Returns the raw frame number.
            #[inline]
            pub const fn as_usize(self) -> usize {
                self.0
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({:#x})", stringify!($name), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{:#x}", self.0)
            }
        }

        impl Add<usize> for $name {
            type Output = Self;

            #[inline]
            fn add(self, rhs: usize) -> Self::Output {
                Self(self.0 + rhs)
            }
        }
    };
}

impl_frame_number!(
    FrameNumber,
    "A physical memory frame number.\n\n\
     Frame numbers correspond to PAGE_SIZE-aligned physical addresses. Frame zero is a\n\
     legal mapping target."
);

impl FrameNumber {
    /// Returns the physical address at the start of this frame.
    #[inline]
    pub const fn start(self) -> PhysicalAddress {
        PhysicalAddress::new(self.0 * layout::PAGE_SIZE)
    }

    /// Returns the frame's contents through its kernel alias, for reading.
    ///
    /// # Safety
    ///
    /// The frame must be allocated, and must not be written through any other path for the
    /// returned lifetime.
    #[inline]
    pub unsafe fn contents<'a>(self) -> &'a [u8; layout::PAGE_SIZE] {
        let ptr = self.start().kernel_ptr::<[u8; layout::PAGE_SIZE]>();
        // SAFETY: The caller guarantees the frame is allocated and not being written.
        unsafe { &*ptr.as_ptr() }
    }

    /// Returns the frame's contents through its kernel alias.
    ///
    /// # Safety
    ///
    /// The frame must be allocated and owned by the caller, and no other reference to its
    /// contents may be live for the returned lifetime.
    #[inline]
    pub unsafe fn contents_mut<'a>(self) -> &'a mut [u8; layout::PAGE_SIZE] {
        let ptr = self.start().kernel_ptr::<[u8; layout::PAGE_SIZE]>();
        // SAFETY: The caller guarantees ownership and exclusivity; frames are PAGE_SIZE long.
        unsafe { &mut *ptr.as_ptr() }
    }
}

impl From<PhysicalAddress> for FrameNumber {
    #[inline]
    fn from(addr: PhysicalAddress) -> Self {
        Self::new(addr.as_usize() / layout::PAGE_SIZE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_start_address() {
        let frame = FrameNumber::new(3);
        assert_eq!(frame.start().as_usize(), 3 * layout::PAGE_SIZE);
    }

    #[test]
    fn frame_round_trip() {
        let frame = FrameNumber::new(42);
        assert_eq!(FrameNumber::from(frame.start()), frame);
    }

    #[test]
    fn arithmetic() {
        let frame = FrameNumber::new(10);
        assert_eq!((frame + 5).as_usize(), 15);
    }

    #[test]
    fn debug_format_names_the_type() {
        assert_eq!(format!("{:?}", FrameNumber::new(0x10)), "FrameNumber(0x10)");
    }
}
