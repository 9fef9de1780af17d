use thiserror::Error;

/// Failures reported by the memory manager and its components.
///
/// Multi-page operations stop at the first failing page; see the individual
/// operations for what has already been applied at that point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum VmError {
    #[error("no run of {pages} contiguous free virtual pages")]
    OutOfVirtualSpace { pages: usize },
    #[error("out of physical memory ({needed} pages needed, {available} free)")]
    OutOfPhysicalSpace { needed: usize, available: usize },
    #[error("virtual address {0:#x} is already mapped")]
    AlreadyMapped(u64),
    #[error("virtual address {0:#x} is not mapped")]
    NotMapped(u64),
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    #[error("memory manager is not initialized, allocate first")]
    NotInitialized,
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
}
