//! Page-table entries.

use core::fmt;

use crate::{FrameNumber, PhysicalAddress, layout};

/// A single page-table entry.
///
/// The entry is one 32-bit word laid out like a software-managed TLB's `EntryLo`, so it can
/// be handed to the translation cache as-is:
/// - Bits 0-7: Reserved
/// - Bit 8: Global
/// - Bit 9: Valid
/// - Bit 10: Dirty (write permitted)
/// - Bit 11: No-cache
/// - Bits 12-31: Physical frame number
///
/// An entry without the valid bit is absent. Mapped entries always carry the valid bit, so
/// a mapping of frame zero is distinct from an absent entry.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
#[repr(transparent)]
pub struct PageEntry(u32);

impl PageEntry {
    /// Physical frame mask (bits 12-31).
    pub const FRAME_MASK: u32 = layout::PAGE_FRAME as u32;

    /// Valid bit: the entry holds a translation.
    pub const VALID: u32 = 1 << 9;

    /// Dirty bit: writes through this translation are permitted.
    pub const DIRTY: u32 = 1 << 10;

    /// The absent entry.
    pub const ABSENT: Self = Self(0);

    /// Creates a valid entry mapping `frame`, write-permitted if `dirty` is set.
    ///
    /// # Panics
    /// Panics if the frame lies beyond the 32-bit physical range.
    pub fn new(frame: FrameNumber, dirty: bool) -> Self {
        let frame_bits = frame.start().as_usize() as u32 & Self::FRAME_MASK;
        let dirty_bit = if dirty { Self::DIRTY } else { 0 };
        Self(frame_bits | dirty_bit | Self::VALID)
    }

    /// Returns the frame this entry maps, or None if the entry is absent.
    pub fn frame(self) -> Option<FrameNumber> {
        if self.is_valid() {
            Some(PhysicalAddress::from(self.0 & Self::FRAME_MASK).frame_number())
        } else {
            None
        }
    }

    /// Returns whether this entry holds a translation.
    pub const fn is_valid(self) -> bool {
        self.0 & Self::VALID != 0
    }

    /// Returns whether writes through this entry are permitted.
    pub const fn is_dirty(self) -> bool {
        self.0 & Self::DIRTY != 0
    }

    /// Returns the same mapping pointed at a different frame, keeping the status bits.
    pub fn with_frame(self, frame: FrameNumber) -> Self {
        let frame_bits = frame.start().as_usize() as u32 & Self::FRAME_MASK;
        Self((self.0 & !Self::FRAME_MASK) | frame_bits)
    }

    /// Returns the raw value of this entry.
    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Debug for PageEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.frame() {
            Some(frame) => write!(
                f,
                "PageEntry({:?}, {})",
                frame,
                if self.is_dirty() { "rw" } else { "ro" }
            ),
            None => f.write_str("PageEntry(absent)"),
        }
    }
}
