//! Process-wide machine for callers that do not want to carry a handle.
//!
//! The instance uses [`VmConfig::default`] and is built on first use; its
//! backing store is only reserved by the first [`alloc`].

use lazy_static::lazy_static;
use x86_64::VirtAddr;

use crate::memory::{TlbStats, VirtualMemory, VmConfig, VmError};

lazy_static! {
    pub static ref VIRTUAL_MEMORY: VirtualMemory =
        VirtualMemory::new(VmConfig::default()).expect("default configuration is valid");
}

pub fn alloc(num_bytes: usize) -> Result<VirtAddr, VmError> {
    VIRTUAL_MEMORY.alloc(num_bytes)
}

pub fn free(va: VirtAddr, size: usize) -> Result<(), VmError> {
    VIRTUAL_MEMORY.free(va, size)
}

pub fn write(va: VirtAddr, src: &[u8]) -> Result<(), VmError> {
    VIRTUAL_MEMORY.write(va, src)
}

pub fn read(va: VirtAddr, dst: &mut [u8]) -> Result<(), VmError> {
    VIRTUAL_MEMORY.read(va, dst)
}

pub fn tlb_stats() -> TlbStats {
    VIRTUAL_MEMORY.tlb_stats()
}
