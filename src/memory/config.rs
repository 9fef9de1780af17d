use crate::constants::memory::{
    ADDRESS_SPACE_BITS, CANONICAL_USER_LIMIT, MAX_DIRECTORY_BITS, MAX_PAGE_TABLE_LEVELS,
    PAGE_SIZE, PAGE_TABLE_LEVELS, PHYSICAL_MEMORY_SIZE, TLB_ENTRIES, VIRTUAL_MEMORY_SIZE,
};

use super::{address::AddressLayout, error::VmError};

/// Sizing of one simulated machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmConfig {
    pub page_size: usize,
    pub physical_size: usize,
    pub virtual_size: u64,
    pub address_bits: u32,
    pub levels: usize,
    pub tlb_entries: usize,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl VmConfig {
    pub const fn new() -> Self {
        VmConfig {
            page_size: PAGE_SIZE,
            physical_size: PHYSICAL_MEMORY_SIZE,
            virtual_size: VIRTUAL_MEMORY_SIZE,
            address_bits: ADDRESS_SPACE_BITS,
            levels: PAGE_TABLE_LEVELS,
            tlb_entries: TLB_ENTRIES,
        }
    }

    pub const fn with_page_size(self, page_size: usize) -> Self {
        VmConfig { page_size, ..self }
    }

    pub const fn with_physical_size(self, physical_size: usize) -> Self {
        VmConfig {
            physical_size,
            ..self
        }
    }

    pub const fn with_virtual_size(self, virtual_size: u64) -> Self {
        VmConfig {
            virtual_size,
            ..self
        }
    }

    pub const fn with_address_bits(self, address_bits: u32) -> Self {
        VmConfig {
            address_bits,
            ..self
        }
    }

    pub const fn with_levels(self, levels: usize) -> Self {
        VmConfig { levels, ..self }
    }

    pub const fn with_tlb_entries(self, tlb_entries: usize) -> Self {
        VmConfig {
            tlb_entries,
            ..self
        }
    }

    pub const fn physical_pages(&self) -> usize {
        self.physical_size / self.page_size
    }

    /// Only meaningful once [`validate`](Self::validate) has passed.
    pub const fn virtual_pages(&self) -> usize {
        (self.virtual_size / self.page_size as u64) as usize
    }

    /// Checks that the sizes describe a consistent machine and derives the
    /// address layout from them.
    pub fn validate(&self) -> Result<AddressLayout, VmError> {
        if !self.page_size.is_power_of_two() || self.page_size < 2 {
            return Err(VmError::InvalidConfig("page size must be a power of two"));
        }
        let offset_bits = self.page_size.trailing_zeros();

        if self.address_bits > u64::BITS || self.address_bits <= offset_bits {
            return Err(VmError::InvalidConfig(
                "address width must exceed the page offset and be at most 64 bits",
            ));
        }
        if self.levels == 0 || self.levels > MAX_PAGE_TABLE_LEVELS {
            return Err(VmError::InvalidConfig("unsupported number of page table levels"));
        }
        let index_bits = self.address_bits - offset_bits;
        if index_bits % self.levels as u32 != 0 {
            return Err(VmError::InvalidConfig(
                "index bits must divide evenly between levels",
            ));
        }
        if index_bits / self.levels as u32 > MAX_DIRECTORY_BITS {
            return Err(VmError::InvalidConfig("page directories would be too large"));
        }

        if self.physical_size % self.page_size != 0 || self.physical_pages() < 2 {
            return Err(VmError::InvalidConfig(
                "physical size must be a page multiple of at least two pages",
            ));
        }

        let page_size = self.page_size as u64;
        if self.virtual_size % page_size != 0 || self.virtual_size / page_size < 2 {
            return Err(VmError::InvalidConfig(
                "virtual size must be a page multiple of at least two pages",
            ));
        }
        if self.virtual_size > CANONICAL_USER_LIMIT
            || (self.address_bits < u64::BITS && self.virtual_size > 1 << self.address_bits)
        {
            return Err(VmError::InvalidConfig(
                "virtual size exceeds the addressable range",
            ));
        }
        if usize::try_from(self.virtual_size / page_size).is_err() {
            return Err(VmError::InvalidConfig("too many virtual pages for this host"));
        }

        if !self.tlb_entries.is_power_of_two() {
            return Err(VmError::InvalidConfig(
                "TLB capacity must be a non-zero power of two",
            ));
        }

        Ok(AddressLayout::new(
            self.page_size,
            self.address_bits,
            self.levels,
        ))
    }
}
