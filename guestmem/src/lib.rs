//! An emulated guest virtual address space.
//!
//! This crate models the memory of a target process being run under a dynamic
//! binary translator: a page-granular collection of mapped ranges with
//! read/write/execute permission tracking, copy-on-write forking, scalar and
//! bulk access fast paths, hole allocation for `mmap`-style requests, and
//! self-modifying-code detection via per-range "code versions".
//!
//! The address space is a synchronous, single-owner structure: one logical
//! task owns one [AddressSpace] and no internal locking is performed. A task
//! that needs an independent view takes a deep copy with
//! [AddressSpace::fork], after which the two spaces share nothing.

#![allow(clippy::new_without_default)]

pub mod log;
mod range;
mod snapshot;
mod space;

pub use range::{CodeVersion, MappedRange};
pub use snapshot::{PageKind, PageLoader, PageRange, SnapshotError};
pub use space::AddressSpace;

/// The granularity of mapping, permission and cache bookkeeping.
pub const PAGE_SIZE: u64 = 4096;
const PAGE_SHIFT: u64 = PAGE_SIZE - 1;
const PAGE_MASK: u64 = !PAGE_SHIFT;
pub(crate) const PAGE_BITS: u32 = PAGE_SIZE.trailing_zeros();

/// Round `addr` down to the base of its page.
pub const fn align_down_to_page(addr: u64) -> u64 {
    addr & PAGE_MASK
}

/// Round `size` up to a whole number of pages.
pub const fn round_up_to_page(size: u64) -> u64 {
    (size + PAGE_SHIFT) & PAGE_MASK
}

/// The pointer width of the guest architecture.
///
/// This determines the address mask applied to every guest address before it
/// is used: a 32-bit guest cannot name addresses above `0xFFFF_FFFF`, even
/// when hosted by a 64-bit translator.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum WordSize {
    Bits32,
    Bits64,
}

impl WordSize {
    pub(crate) fn addr_mask(self) -> u64 {
        match self {
            WordSize::Bits32 => 0xFFFF_FFFF,
            WordSize::Bits64 => u64::MAX,
        }
    }

    /// The number of hex digits needed to print an address of this width.
    pub(crate) fn hex_digits(self) -> usize {
        match self {
            WordSize::Bits32 => 8,
            WordSize::Bits64 => 16,
        }
    }
}
