#![cfg_attr(not(any(test, feature = "software-emulation")), no_std)]

//! # Polaris Virtual Memory Manager (VMM)
//!
//! The Polaris Virtual Memory Manager gives each user process its own virtual address
//! space on a machine with a software-managed translation cache. It provides:
//!
//! - Address spaces built from declared regions, with load-time write access.
//! - Two-level page tables filled in on demand by the translation-miss handler.
//! - Deep copies of address spaces and leak-free teardown.
//! - Software emulation of physical memory and the TLB for testing in non-kernel
//!   environments.
//!
//! Virtual and physical addresses are 32 bits wide. A virtual address splits into a 10-bit
//! top-level index, a 10-bit second-level index and a 12-bit page offset.

extern crate alloc;

mod address;
pub mod address_space;
mod arch;
mod entry;
mod error;
pub mod fault;
mod frame;
pub mod layout;
mod numbers;
mod page_table;
mod region;
pub mod tlb;

pub use address::{AddressTranslator, PhysicalAddress, VirtualAddress};
pub use address_space::AddressSpace;
pub use entry::PageEntry;
pub use error::{VmError, VmResult};
pub use fault::{FaultKind, handle_fault, handle_raw_fault};
pub use frame::FrameAllocator;
pub use numbers::FrameNumber;
pub use page_table::PageTable;
pub use region::{Region, RegionList, RegionPolicy};
pub use tlb::TranslationCache;

#[cfg(any(test, feature = "software-emulation"))]
pub use arch::{EmulatedFrameAllocator, EmulatedMemory, NUM_TLB, SoftwareTlb};
