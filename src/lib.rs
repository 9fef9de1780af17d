//! A user-space simulator of paged virtual memory.
//!
//! A flat byte buffer stands in for physical RAM and is addressed through a
//! much larger virtual space via a multi-level page table, a direct-mapped TLB
//! and bitmap page allocators. See [`memory::VirtualMemory`].

#![cfg_attr(feature = "strict", deny(warnings))]

pub mod constants;
pub mod global;
pub mod logging;
pub mod memory;

pub use memory::{MemoryUsage, TlbStats, VirtualMemory, VmConfig, VmError};
pub use x86_64::{PhysAddr, VirtAddr};
