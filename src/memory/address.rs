//! Bit extraction and address decomposition.
//!
//! Every address is split into `levels` equal-width index fields above a
//! `offset_bits` wide page offset. Index 0 addresses the root directory and
//! comes from the most significant field.

use arrayvec::ArrayVec;
use x86_64::VirtAddr;

use crate::constants::memory::MAX_PAGE_TABLE_LEVELS;

/// Per-level directory indices of one virtual address, root first.
pub type LevelIndices = ArrayVec<usize, MAX_PAGE_TABLE_LEVELS>;

/// Extracts bits `[begin, end)` of `value`, counting from the least
/// significant bit.
pub const fn extract_bits(value: u64, begin: u32, end: u32) -> u64 {
    if begin >= u64::BITS || end <= begin {
        return 0;
    }
    let width = end - begin;
    let shifted = value >> begin;
    if width >= u64::BITS {
        shifted
    } else {
        shifted & ((1 << width) - 1)
    }
}

/// Field widths of the simulated address format, derived once from a
/// validated [`VmConfig`](super::config::VmConfig).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressLayout {
    offset_bits: u32,
    bits_per_level: u32,
    levels: usize,
    address_bits: u32,
}

impl AddressLayout {
    /// Callers must have checked that the index bits divide evenly.
    pub(crate) const fn new(page_size: usize, address_bits: u32, levels: usize) -> Self {
        let offset_bits = page_size.trailing_zeros();
        let bits_per_level = (address_bits - offset_bits) / levels as u32;
        AddressLayout {
            offset_bits,
            bits_per_level,
            levels,
            address_bits,
        }
    }

    pub const fn offset_bits(&self) -> u32 {
        self.offset_bits
    }

    pub const fn bits_per_level(&self) -> u32 {
        self.bits_per_level
    }

    pub const fn levels(&self) -> usize {
        self.levels
    }

    pub const fn page_size(&self) -> usize {
        1 << self.offset_bits
    }

    /// Number of entries held by one directory at any level.
    pub const fn entries_per_directory(&self) -> usize {
        1 << self.bits_per_level
    }

    /// Page number of an address, i.e. everything above the offset.
    pub const fn page_number(&self, addr: u64) -> u64 {
        extract_bits(addr, self.offset_bits, self.address_bits)
    }

    pub const fn page_offset(&self, addr: u64) -> u64 {
        extract_bits(addr, 0, self.offset_bits)
    }

    /// First address of page `page_number`.
    pub const fn page_base(&self, page_number: u64) -> u64 {
        page_number << self.offset_bits
    }

    /// Directory index for every level, root first.
    pub fn indices(&self, va: VirtAddr) -> LevelIndices {
        let addr = va.as_u64();
        (0..self.levels)
            .map(|level| {
                let field = (self.levels - 1 - level) as u32;
                let start = self.offset_bits + field * self.bits_per_level;
                extract_bits(addr, start, start + self.bits_per_level) as usize
            })
            .collect()
    }
}
