//! User address-space layout constants.
//!
//! User virtual addresses are 32 bits wide and split as `| top: 10 | bottom: 10 | offset: 12 |`.
//! The top index selects a second-level table, the bottom index selects an entry in it.

/// Page size in bytes (4 KiB).
pub const PAGE_SIZE: usize = 4096;

/// Number of bits in the in-page byte offset.
pub const PAGE_SHIFT: usize = 12;

/// Mask selecting the page-frame part of an address or entry.
pub const PAGE_FRAME: usize = 0xffff_f000;

/// Number of bits used by each page table index.
pub const INDEX_BITS: usize = 10;

/// Number of slots in the top-level table.
pub const TOP_LEVEL_ENTRIES: usize = 1 << INDEX_BITS;

/// Number of entries in a second-level table. A second-level table fills exactly one frame.
pub const ENTRIES_PER_TABLE: usize = 1 << INDEX_BITS;

/// Maximum number of bits in a user virtual address.
pub const MAX_VIRTUAL_BITS: usize = 32;

/// Maximum number of bits in a physical address reachable from a page-table entry.
pub const MAX_PHYSICAL_BITS: usize = 32;

/// First address above user space.
pub const USERSPACE_TOP: usize = 0x8000_0000;

/// Initial user stack pointer; the stack grows down from here.
pub const USERSTACK: usize = USERSPACE_TOP;

/// Number of pages in the user stack region.
pub const USER_STACK_PAGES: usize = 16;

/// Size of the user stack region in bytes.
pub const USER_STACK_SIZE: usize = USER_STACK_PAGES * PAGE_SIZE;

/// Returns the top-level table index for an address.
#[inline]
pub const fn top_index(address: usize) -> usize {
    (address >> (PAGE_SHIFT + INDEX_BITS)) & (TOP_LEVEL_ENTRIES - 1)
}

/// Returns the second-level table index for an address.
#[inline]
pub const fn bottom_index(address: usize) -> usize {
    (address >> PAGE_SHIFT) & (ENTRIES_PER_TABLE - 1)
}

/// Returns true if the address fits in a user virtual address.
#[inline]
pub const fn validate_virtual(addr: usize) -> bool {
    addr <= u32::MAX as usize
}

/// Returns true if the address can be stored in a page-table entry.
#[inline]
pub const fn validate_physical(addr: usize) -> bool {
    addr <= u32::MAX as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_indices() {
        // 0x1234_5678 = top 0x048, bottom 0x345, offset 0x678
        assert_eq!(top_index(0x1234_5678), 0x048);
        assert_eq!(bottom_index(0x1234_5678), 0x345);
    }

    #[test]
    fn highest_address_uses_last_slots() {
        assert_eq!(top_index(0xffff_ffff), TOP_LEVEL_ENTRIES - 1);
        assert_eq!(bottom_index(0xffff_ffff), ENTRIES_PER_TABLE - 1);
    }

    #[test]
    fn second_level_table_fills_a_page() {
        assert_eq!(ENTRIES_PER_TABLE * core::mem::size_of::<u32>(), PAGE_SIZE);
    }

    #[test]
    fn stack_sits_below_user_top() {
        assert_eq!(USERSTACK - USER_STACK_SIZE, 0x7fff_0000);
    }
}
