//! The memory manager.
//!
//! [`VirtualMemory`] owns a simulated machine: a flat byte buffer standing in
//! for RAM, a virtual and a physical page bitmap, a TLB and a multi-level page
//! table. Every public operation takes one lock for its whole duration, so
//! concurrent callers never receive overlapping allocations. The lock is not
//! reentrant.
//!
//! The machine is built on the first [`VirtualMemory::alloc`]; until then
//! [`read`](VirtualMemory::read), [`write`](VirtualMemory::write) and
//! [`free`](VirtualMemory::free) report [`VmError::NotInitialized`].

pub mod address;
pub mod bitmap_page_allocator;
pub mod config;
pub mod error;
mod machine;
pub mod paging;
pub mod tlb;

pub use address::AddressLayout;
pub use config::VmConfig;
pub use error::VmError;
pub use machine::MemoryUsage;
pub use tlb::TlbStats;

use machine::Machine;
use spin::Mutex;
use x86_64::{PhysAddr, VirtAddr};

pub struct VirtualMemory {
    config: VmConfig,
    layout: AddressLayout,
    machine: Mutex<Option<Machine>>,
}

impl VirtualMemory {
    /// Validates `config`; no memory is reserved until the first allocation.
    pub fn new(config: VmConfig) -> Result<Self, VmError> {
        let layout = config.validate()?;
        Ok(VirtualMemory {
            config,
            layout,
            machine: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    pub fn is_initialized(&self) -> bool {
        self.machine.lock().is_some()
    }

    /// Runs `f` on the machine, failing if nothing was allocated yet.
    fn with_machine<F, R>(&self, f: F) -> Result<R, VmError>
    where
        F: FnOnce(&mut Machine) -> Result<R, VmError>,
    {
        let mut guard = self.machine.lock();
        let machine = guard.as_mut().ok_or(VmError::NotInitialized)?;
        f(machine)
    }

    /// Allocates `num_bytes` rounded up to whole pages and returns the start
    /// of the contiguous virtual range. Physical frames need not be
    /// contiguous and are zero-filled.
    pub fn alloc(&self, num_bytes: usize) -> Result<VirtAddr, VmError> {
        if num_bytes == 0 {
            log::warn!("alloc: size must be positive");
            return Err(VmError::InvalidArgument("allocation size must be positive"));
        }

        let mut guard = self.machine.lock();
        let machine = guard.get_or_insert_with(|| Machine::new(&self.config, self.layout));

        machine
            .alloc(num_bytes)
            .inspect_err(|err| log::warn!("alloc of {} bytes failed: {}", num_bytes, err))
    }

    /// Releases the pages covering `[va, va + size)`. If any of them is not
    /// mapped the call fails and nothing is released.
    pub fn free(&self, va: VirtAddr, size: usize) -> Result<(), VmError> {
        if va.is_null() || size == 0 {
            log::warn!("free: invalid pointer or size");
            return Err(VmError::InvalidArgument("null address or zero size"));
        }

        self.with_machine(|machine| machine.free(va, size))
            .inspect_err(|err| log::warn!("free of {:#x} failed: {}", va.as_u64(), err))
    }

    /// Copies `src` into virtual memory starting at `va`, crossing pages as
    /// needed. Bytes written before an unmapped page is reached stay written.
    pub fn write(&self, va: VirtAddr, src: &[u8]) -> Result<(), VmError> {
        if va.is_null() || src.is_empty() {
            log::warn!("write: invalid pointer or size");
            return Err(VmError::InvalidArgument("null address or zero size"));
        }

        self.with_machine(|machine| machine.write(va, src))
            .inspect_err(|err| log::warn!("write to {:#x} failed: {}", va.as_u64(), err))
    }

    /// Fills `dst` from virtual memory starting at `va`.
    pub fn read(&self, va: VirtAddr, dst: &mut [u8]) -> Result<(), VmError> {
        if va.is_null() || dst.is_empty() {
            log::warn!("read: invalid pointer or size");
            return Err(VmError::InvalidArgument("null address or zero size"));
        }

        self.with_machine(|machine| machine.read(va, dst))
            .inspect_err(|err| log::warn!("read from {:#x} failed: {}", va.as_u64(), err))
    }

    /// Physical address currently backing `va`. Counts as a TLB lookup.
    pub fn translate(&self, va: VirtAddr) -> Result<PhysAddr, VmError> {
        self.with_machine(|machine| machine.translate(va))
    }

    pub fn tlb_stats(&self) -> TlbStats {
        self.machine
            .lock()
            .as_ref()
            .map(Machine::tlb_stats)
            .unwrap_or_default()
    }

    pub fn usage(&self) -> MemoryUsage {
        self.machine
            .lock()
            .as_ref()
            .map(Machine::usage)
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: usize = 4096;

    fn small_vm() -> VirtualMemory {
        VirtualMemory::new(
            VmConfig::new()
                .with_physical_size(16 * PAGE)
                .with_virtual_size(64 * PAGE as u64)
                .with_address_bits(32)
                .with_levels(2)
                .with_tlb_entries(4),
        )
        .expect("valid config")
    }

    #[test]
    fn test_lazy_initialization() {
        let vm = small_vm();
        assert!(!vm.is_initialized());
        assert_eq!(vm.usage(), MemoryUsage::default());

        let mut buf = [0u8; 4];
        assert_eq!(
            vm.read(VirtAddr::new(0x1000), &mut buf),
            Err(VmError::NotInitialized)
        );
        assert_eq!(
            vm.write(VirtAddr::new(0x1000), &buf),
            Err(VmError::NotInitialized)
        );
        assert_eq!(
            vm.free(VirtAddr::new(0x1000), 4),
            Err(VmError::NotInitialized)
        );

        vm.alloc(1).expect("first alloc");
        assert!(vm.is_initialized());
    }

    #[test]
    fn test_invalid_arguments() {
        let vm = small_vm();
        assert!(matches!(vm.alloc(0), Err(VmError::InvalidArgument(_))));

        let va = vm.alloc(8).expect("alloc");
        let mut empty: [u8; 0] = [];
        assert!(matches!(
            vm.free(VirtAddr::zero(), 8),
            Err(VmError::InvalidArgument(_))
        ));
        assert!(matches!(vm.free(va, 0), Err(VmError::InvalidArgument(_))));
        assert!(matches!(
            vm.read(va, &mut empty),
            Err(VmError::InvalidArgument(_))
        ));
        assert!(matches!(
            vm.write(VirtAddr::zero(), &[1]),
            Err(VmError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_first_allocations_skip_page_zero() {
        let vm = small_vm();
        let first = vm.alloc(1).expect("alloc");
        let second = vm.alloc(1).expect("alloc");
        assert_eq!(first.as_u64(), PAGE as u64);
        assert_eq!(second.as_u64(), 2 * PAGE as u64);

        let first_frame = vm.translate(first).expect("mapped");
        let second_frame = vm.translate(second).expect("mapped");
        assert_ne!(first_frame, second_frame);
        assert_ne!(first_frame.as_u64(), 0);
    }

    #[test]
    fn test_multi_page_alloc_is_contiguous() {
        let vm = small_vm();
        let va = vm.alloc(3 * PAGE + 1).expect("alloc");
        for page in 0..4u64 {
            assert!(vm.translate(va + page * PAGE as u64).is_ok());
        }
        assert!(vm.translate(va + 4 * PAGE as u64).is_err());
        assert_eq!(vm.usage().virtual_pages_used, 4);
        assert_eq!(vm.usage().physical_pages_used, 4);
    }

    #[test]
    fn test_out_of_physical_memory_leaves_no_trace() {
        let vm = small_vm();
        // 15 usable frames
        let va = vm.alloc(10 * PAGE).expect("alloc");
        let before = vm.usage();

        assert_eq!(
            vm.alloc(6 * PAGE),
            Err(VmError::OutOfPhysicalSpace {
                needed: 6,
                available: 5
            })
        );
        assert_eq!(vm.usage(), before);

        vm.free(va, 10 * PAGE).expect("free");
        vm.alloc(15 * PAGE).expect("all frames free again");
    }

    #[test]
    fn test_out_of_virtual_space() {
        let vm = VirtualMemory::new(
            VmConfig::new()
                .with_physical_size(64 * PAGE)
                .with_virtual_size(8 * PAGE as u64)
                .with_address_bits(32)
                .with_levels(2),
        )
        .expect("valid config");

        let first = vm.alloc(3 * PAGE).expect("alloc");
        vm.alloc(3 * PAGE).expect("alloc");
        vm.free(first, 3 * PAGE).expect("free");

        // 4 free virtual pages, but no run of 4
        assert_eq!(
            vm.alloc(4 * PAGE),
            Err(VmError::OutOfVirtualSpace { pages: 4 })
        );
        assert_eq!(vm.alloc(3 * PAGE), Ok(first));
    }

    #[test]
    fn test_free_unknown_address_changes_nothing() {
        let vm = small_vm();
        let va = vm.alloc(2 * PAGE).expect("alloc");
        let before = vm.usage();

        assert_eq!(
            vm.free(VirtAddr::new(0x20000), PAGE),
            Err(VmError::NotMapped(0x20000))
        );
        // second page is mapped, third is not
        assert_eq!(
            vm.free(va + PAGE as u64, 2 * PAGE),
            Err(VmError::NotMapped(va.as_u64() + 2 * PAGE as u64))
        );
        assert_eq!(vm.usage(), before);
        assert!(vm.translate(va + PAGE as u64).is_ok());
    }

    #[test]
    fn test_addresses_above_address_width_do_not_alias() {
        let vm = small_vm();
        let live = vm.alloc(PAGE).expect("alloc");
        vm.write(live, b"live").expect("write");
        let before = vm.usage();

        // same low 32 bits as `live`
        let alias = VirtAddr::new(live.as_u64() + (1 << 32));
        let not_mapped = Err(VmError::NotMapped(alias.as_u64()));

        assert_eq!(vm.translate(alias).map(|_| ()), not_mapped);
        let mut buf = [0u8; 4];
        assert_eq!(vm.read(alias, &mut buf), not_mapped);
        assert_eq!(buf, [0u8; 4]);
        assert_eq!(vm.write(alias, b"evil"), not_mapped);
        assert_eq!(vm.free(alias, PAGE), not_mapped);

        assert_eq!(vm.usage(), before);
        vm.read(live, &mut buf).expect("live page still mapped");
        assert_eq!(&buf, b"live");
    }

    #[test]
    fn test_addresses_past_virtual_space_are_rejected() {
        let vm = small_vm();
        let va = vm.alloc(PAGE).expect("alloc");
        let before = vm.usage();

        // 64 virtual pages, inside the 32-bit width but past the space
        let end = 64 * PAGE as u64;
        for addr in [end, end + 0x1234, (1 << 32) - 1] {
            let outside = VirtAddr::new(addr);
            let not_mapped = Err(VmError::NotMapped(addr));
            let mut buf = [0u8; 8];

            assert_eq!(vm.translate(outside).map(|_| ()), not_mapped);
            assert_eq!(vm.read(outside, &mut buf), not_mapped);
            assert_eq!(vm.write(outside, &buf), not_mapped);
            assert_eq!(vm.free(outside, PAGE), not_mapped);
        }

        assert_eq!(vm.usage(), before);
        assert!(vm.translate(va).is_ok());
    }

    #[test]
    fn test_free_unmaps_and_clears_bitmaps() {
        let vm = small_vm();
        let va = vm.alloc(2 * PAGE).expect("alloc");
        let frames: Vec<u64> = (0..2u64)
            .map(|page| vm.translate(va + page * PAGE as u64).expect("mapped").as_u64())
            .collect();

        vm.free(va, 2 * PAGE).expect("free");

        for page in 0..2u64 {
            assert_eq!(
                vm.translate(va + page * PAGE as u64),
                Err(VmError::NotMapped(va.as_u64() + page * PAGE as u64))
            );
        }
        let guard = vm.machine.lock();
        let machine = guard.as_ref().expect("initialized");
        assert!(!machine.is_virtual_page_used(1));
        assert!(!machine.is_virtual_page_used(2));
        for frame in frames {
            assert!(!machine.is_physical_page_used(frame as usize / PAGE));
        }
    }

    #[test]
    fn test_freed_range_is_reused() {
        let vm = small_vm();
        let first = vm.alloc(PAGE).expect("alloc");
        vm.alloc(PAGE).expect("alloc");
        vm.free(first, PAGE).expect("free");
        assert_eq!(vm.alloc(PAGE), Ok(first));
    }

    #[test]
    fn test_write_read_across_page_boundary() {
        let vm = small_vm();
        let va = vm.alloc(5000).expect("alloc");
        let data: Vec<u8> = (0..5000).map(|i| (i % 251) as u8).collect();

        vm.write(va, &data).expect("write");
        let mut buf = vec![0u8; 5000];
        vm.read(va, &mut buf).expect("read");
        assert_eq!(buf, data);
    }

    #[test]
    fn test_unaligned_access() {
        let vm = small_vm();
        let va = vm.alloc(2 * PAGE).expect("alloc");
        let start = va + (PAGE as u64 - 3);

        vm.write(start, &[1, 2, 3, 4, 5, 6]).expect("write");
        let mut buf = [0u8; 6];
        vm.read(start, &mut buf).expect("read");
        assert_eq!(buf, [1, 2, 3, 4, 5, 6]);

        let mut head = [0u8; 4];
        vm.read(va + (PAGE as u64 - 4), &mut head).expect("read");
        assert_eq!(head, [0, 1, 2, 3]);
    }

    #[test]
    fn test_fresh_allocation_reads_zero() {
        let vm = small_vm();
        let va = vm.alloc(PAGE).expect("alloc");
        vm.write(va, &[0xAA; PAGE]).expect("write");
        vm.free(va, PAGE).expect("free");

        let again = vm.alloc(PAGE).expect("alloc");
        let mut buf = [0xFFu8; 16];
        vm.read(again, &mut buf).expect("read");
        assert_eq!(buf, [0u8; 16]);
    }

    #[test]
    fn test_write_past_allocation_is_partial() {
        let vm = small_vm();
        let va = vm.alloc(PAGE).expect("alloc");
        let data = vec![7u8; PAGE + 10];

        assert_eq!(
            vm.write(va, &data),
            Err(VmError::NotMapped(va.as_u64() + PAGE as u64))
        );
        let mut buf = [0u8; 8];
        vm.read(va, &mut buf).expect("read");
        assert_eq!(buf, [7u8; 8]);
    }

    #[test]
    fn test_tlb_counters_add_up() {
        let vm = small_vm();
        assert_eq!(vm.tlb_stats(), TlbStats::default());

        let va = vm.alloc(3 * PAGE).expect("alloc");
        let mut buf = vec![0u8; 3 * PAGE];
        vm.write(va, &buf).expect("write");
        vm.read(va, &mut buf).expect("read");

        let stats = vm.tlb_stats();
        // one lookup per page touched by each copy
        assert_eq!(stats.lookups(), 6);
        assert_eq!(stats.hits, 6);
        assert_eq!(stats.misses, 0);

        let _ = vm.translate(VirtAddr::new(0x30000));
        assert_eq!(vm.tlb_stats().misses, 1);
    }

    #[test]
    fn test_tlb_conflicts_fall_back_to_walk() {
        let vm = small_vm();
        // 4 TLB slots, 6 pages: the last two evict the first two
        let va = vm.alloc(6 * PAGE).expect("alloc");
        for page in 0..6u64 {
            vm.write(va + page * PAGE as u64, &[page as u8]).expect("write");
        }
        for page in 0..6u64 {
            let mut byte = [0u8];
            vm.read(va + page * PAGE as u64, &mut byte).expect("read");
            assert_eq!(byte[0], page as u8);
        }
        assert!(vm.tlb_stats().misses > 0);
    }

    #[test]
    fn test_directories_reclaimed_after_free() {
        let vm = small_vm();
        let va = vm.alloc(PAGE).expect("alloc");
        assert_eq!(vm.usage().directories, 2);
        vm.free(va, PAGE).expect("free");
        assert_eq!(vm.usage().directories, 1);
    }
}
