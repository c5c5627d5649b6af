//! Address types for user virtual memory and the frames backing it.
//!
//! User virtual addresses are what the trap layer reports and what regions describe. Physical
//! addresses are what page-table entries store. The kernel reaches a frame's contents through
//! its kernel alias, a pointer obtained from the [`AddressTranslator`].

use core::fmt;
use core::ops::{Add, Sub};
use core::ptr::NonNull;

use crate::{FrameNumber, layout};

#[cfg(any(test, feature = "software-emulation"))]
use crate::arch::EmulatedMemory;

/// Address translator for converting between physical addresses and kernel aliases.
///
/// This enum supports two modes:
/// - Hardware: physical memory is direct-mapped at a fixed offset (kernel mode)
/// - Emulated: physical memory is a host buffer (testing mode)
pub enum AddressTranslator {
    /// Hardware translation using a direct-map offset.
    Hardware { direct_map_offset: usize },
    /// Emulated translation using a simulated memory region.
    #[cfg(any(test, feature = "software-emulation"))]
    Emulated(EmulatedMemory),
}

impl AddressTranslator {
    /// Creates a new hardware translator with the given direct-map offset.
    pub const fn hardware(direct_map_offset: usize) -> Self {
        Self::Hardware { direct_map_offset }
    }

    /// Creates a new emulated translator backed by `size` bytes of zeroed host memory.
    #[cfg(any(test, feature = "software-emulation"))]
    pub fn emulated(size: usize) -> Self {
        Self::Emulated(EmulatedMemory::new(size))
    }

    /// Sets the global address translator.
    ///
    /// This function must be called exactly once during initialization.
    ///
    /// # Panics
    ///
    /// Panics if the translator has already been set.
    pub fn set_current(translator: AddressTranslator) {
        #[cfg(not(any(test, feature = "software-emulation")))]
        {
            if ADDRESS_TRANSLATOR.get().is_some() {
                panic!("address translator already set");
            }
            ADDRESS_TRANSLATOR.call_once(|| translator);
        }

        #[cfg(any(test, feature = "software-emulation"))]
        {
            ADDRESS_TRANSLATOR.with(|t| {
                if t.get().is_some() {
                    panic!("address translator already set");
                }
                t.call_once(|| translator);
            });
        }
    }

    /// Returns a reference to the current global address translator.
    ///
    /// # Panics
    ///
    /// Panics if the translator has not been set yet.
    pub fn current() -> &'static AddressTranslator {
        Self::try_current().expect(
            "address translator not set; call AddressTranslator::set_current during initialization",
        )
    }

    /// Returns a reference to the current global address translator if it has been set.
    pub fn try_current() -> Option<&'static AddressTranslator> {
        #[cfg(not(any(test, feature = "software-emulation")))]
        {
            ADDRESS_TRANSLATOR.get()
        }

        #[cfg(any(test, feature = "software-emulation"))]
        {
            ADDRESS_TRANSLATOR.with(|t| {
                t.get().map(|translator| {
                    // SAFETY: Each thread owns its translator, it is never replaced once set,
                    // and the thread-local outlives every caller running on that thread.
                    unsafe { &*(translator as *const AddressTranslator) }
                })
            })
        }
    }

    /// Translates a physical address to its kernel alias.
    pub fn phys_to_virt(&self, phys: usize) -> usize {
        match self {
            Self::Hardware { direct_map_offset } => phys.wrapping_add(*direct_map_offset),
            #[cfg(any(test, feature = "software-emulation"))]
            Self::Emulated(mem) => mem.translate(phys) as usize,
        }
    }

    /// Translates a kernel alias back to a physical address.
    pub fn virt_to_phys(&self, virt: usize) -> usize {
        match self {
            Self::Hardware { direct_map_offset } => virt.wrapping_sub(*direct_map_offset),
            #[cfg(any(test, feature = "software-emulation"))]
            Self::Emulated(mem) => mem.ptr_to_phys(virt as *const u8),
        }
    }

    /// Reserves `size` bytes of emulated physical memory aligned to `align`.
    ///
    /// Returns the physical address of the block, or None if the emulated memory is exhausted.
    #[cfg(any(test, feature = "software-emulation"))]
    pub fn allocate(&self, size: usize, align: usize) -> Option<usize> {
        match self {
            Self::Hardware { .. } => {
                panic!("cannot allocate from hardware translator")
            }
            Self::Emulated(mem) => mem.allocate(size, align),
        }
    }
}

/// Global address translator.
///
/// This is initialized once during kernel initialization (with the Hardware variant).
/// In test/software-emulation mode, this is thread-local so each test gets its own
/// emulated physical memory.
#[cfg(not(any(test, feature = "software-emulation")))]
static ADDRESS_TRANSLATOR: spin::Once<AddressTranslator> = spin::Once::new();

#[cfg(any(test, feature = "software-emulation"))]
std::thread_local! {
    static ADDRESS_TRANSLATOR: spin::Once<AddressTranslator> = spin::Once::new();
}

macro_rules! impl_address_common {
    ($name:ident, $validate:path, $doc:expr) => {
        #[doc = $doc]
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
        #[repr(transparent)]
        pub struct $name(usize);

        impl $name {
            /// Creates a new address.
            ///
            /// # Panics
            ///
            /// Panics if the address does not fit in 32 bits.
            #[inline]
            pub const fn new(addr: usize) -> Self {
                assert!($validate(addr), "address exceeds 32 bits");
                Self(addr)
            }

            /// Creates a new address, or None if it does not fit in 32 bits.
            #[inline]
            pub const fn try_new(addr: usize) -> Option<Self> {
                if $validate(addr) {
                    Some(Self(addr))
                } else {
                    None
                }
            }

            /// Returns the raw address value.
            #[inline]
            pub const fn as_usize(self) -> usize {
                self.0
            }

            /// Checks if the address is aligned to the given alignment.
            ///
            /// # Panics
            ///
            /// Panics if `align` is not a power of two.
            #[inline]
            pub const fn is_aligned(self, align: usize) -> bool {
                assert!(align.is_power_of_two(), "alignment must be a power of two");
                self.0 & (align - 1) == 0
            }

            /// Aligns the address down to the given alignment.
            ///
            /// # Panics
            ///
            /// Panics if `align` is not a power of two.
            #[inline]
            pub const fn align_down(self, align: usize) -> Self {
                assert!(align.is_power_of_two(), "alignment must be a power of two");
                Self(self.0 & !(align - 1))
            }

            /// Returns the offset of this address within its page.
            #[inline]
            pub const fn page_offset(self) -> usize {
                self.0 & (layout::PAGE_SIZE - 1)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({:#x})", stringify!($name), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{:#010x}", self.0)
            }
        }

        impl From<u32> for $name {
            #[inline]
            fn from(addr: u32) -> Self {
                Self(addr as usize)
            }
        }

        impl Add<usize> for $name {
            type Output = Self;

            #[inline]
            fn add(self, rhs: usize) -> Self::Output {
                Self::new(self.0 + rhs)
            }
        }

        impl Sub<usize> for $name {
            type Output = Self;

            #[inline]
            fn sub(self, rhs: usize) -> Self::Output {
                Self::new(self.0 - rhs)
            }
        }

        impl Sub<$name> for $name {
            type Output = usize;

            #[inline]
            fn sub(self, rhs: $name) -> Self::Output {
                self.0 - rhs.0
            }
        }
    };
}

impl_address_common!(
    PhysicalAddress,
    layout::validate_physical,
    "A physical memory address.\n\n\
     Page-table entries store the frame part of a physical address; the kernel reaches the\n\
     memory itself through [`PhysicalAddress::kernel_ptr`]."
);

impl PhysicalAddress {
    /// Converts a kernel alias back to the physical address it maps.
    ///
    /// # Panics
    ///
    /// Panics if the address translator has not been set via [`AddressTranslator::set_current`].
    #[inline]
    pub fn from_kernel_ptr<T>(ptr: NonNull<T>) -> Self {
        let translator = AddressTranslator::current();
        Self::new(translator.virt_to_phys(ptr.as_ptr() as usize))
    }

    /// Converts a kernel alias back to the physical address it maps, or None if that address
    /// does not fit in 32 bits.
    ///
    /// # Panics
    ///
    /// Panics if the address translator has not been set via [`AddressTranslator::set_current`].
    #[inline]
    pub fn try_from_kernel_ptr<T>(ptr: NonNull<T>) -> Option<Self> {
        let translator = AddressTranslator::current();
        Self::try_new(translator.virt_to_phys(ptr.as_ptr() as usize))
    }

    /// Returns the kernel alias of this physical address.
    ///
    /// # Panics
    ///
    /// Panics if the address translator has not been set, or if it translates to null.
    #[inline]
    pub fn kernel_ptr<T>(self) -> NonNull<T> {
        let translator = AddressTranslator::current();
        NonNull::new(translator.phys_to_virt(self.0) as *mut T)
            .expect("physical address translated to a null kernel alias")
    }

    /// Returns the frame containing this physical address.
    #[inline]
    pub fn frame_number(self) -> FrameNumber {
        FrameNumber::from(self)
    }
}

impl_address_common!(
    VirtualAddress,
    layout::validate_virtual,
    "A user virtual address.\n\n\
     User virtual addresses are 32 bits wide. Use [`VirtualAddress::top_index`] and\n\
     [`VirtualAddress::bottom_index`] to locate the page-table entry translating one."
);

impl VirtualAddress {
    /// Returns the address of the first byte of the page containing this address.
    #[inline]
    pub const fn page_base(self) -> Self {
        self.align_down(layout::PAGE_SIZE)
    }

    /// Returns the index into the top-level table.
    #[inline]
    pub const fn top_index(self) -> usize {
        layout::top_index(self.0)
    }

    /// Returns the index into the second-level table.
    #[inline]
    pub const fn bottom_index(self) -> usize {
        layout::bottom_index(self.0)
    }
}
