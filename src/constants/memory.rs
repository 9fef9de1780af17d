pub const PAGE_SIZE: usize = 4096;

// Backing store standing in for RAM
pub const PHYSICAL_MEMORY_SIZE: usize = 64 * 1024 * 1024; // 64 MB
// Addressable range handed out by alloc
pub const VIRTUAL_MEMORY_SIZE: u64 = 4 * 1024 * 1024 * 1024; // 4 GB

// 64-bit addresses, 12 offset bits, 4 levels of 13 index bits each
pub const ADDRESS_SPACE_BITS: u32 = 64;
pub const PAGE_TABLE_LEVELS: usize = 4;
pub const MAX_PAGE_TABLE_LEVELS: usize = 8;
pub const MAX_DIRECTORY_BITS: u32 = 24;

// Highest virtual address accepted by VirtAddr without sign extension
pub const CANONICAL_USER_LIMIT: u64 = 1 << 47;

pub const TLB_ENTRIES: usize = 512;
