//! State of one simulated machine and the unlocked operations on it.
//!
//! Everything here assumes the caller holds the manager lock.

use core::ops::Range;

use x86_64::{PhysAddr, VirtAddr};

use super::{
    address::AddressLayout, bitmap_page_allocator::BitmapPageAllocator, config::VmConfig,
    error::VmError, paging::PageTable, tlb::Tlb, tlb::TlbStats,
};

/// Page accounting snapshot of a manager.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryUsage {
    pub virtual_pages_used: usize,
    pub physical_pages_used: usize,
    pub physical_pages_free: usize,
    /// Page directories in the table, root included
    pub directories: usize,
}

pub(crate) struct Machine {
    layout: AddressLayout,
    /// First address past the virtual space
    virtual_limit: u64,
    physical_memory: Box<[u8]>,
    virtual_pages: BitmapPageAllocator,
    physical_pages: BitmapPageAllocator,
    tlb: Tlb,
    page_table: PageTable,
}

impl Machine {
    pub fn new(config: &VmConfig, layout: AddressLayout) -> Self {
        log::info!(
            "initializing simulated machine: {} physical pages, {} virtual pages, {} levels, {} TLB slots",
            config.physical_pages(),
            config.virtual_pages(),
            layout.levels(),
            config.tlb_entries
        );
        let tlb = Tlb::new(layout, config.tlb_entries);
        log::debug!("TLB holds {} translations", tlb.capacity());

        Machine {
            layout,
            virtual_limit: config.virtual_size,
            physical_memory: vec![0; config.physical_size].into_boxed_slice(),
            virtual_pages: BitmapPageAllocator::new(config.virtual_pages()),
            physical_pages: BitmapPageAllocator::new(config.physical_pages()),
            tlb,
            page_table: PageTable::new(layout),
        }
    }

    fn page_address(&self, page_number: u64) -> Result<VirtAddr, VmError> {
        let addr = self.layout.page_base(page_number);
        VirtAddr::try_new(addr).map_err(|_| VmError::NotMapped(addr))
    }

    /// Resolves `va` through the TLB, falling back to a table walk that
    /// refills the TLB. The walk never creates directories. Addresses past the
    /// virtual space are never mapped, whatever their low bits alias to.
    pub fn translate(&mut self, va: VirtAddr) -> Result<PhysAddr, VmError> {
        if va.as_u64() >= self.virtual_limit {
            return Err(VmError::NotMapped(va.as_u64()));
        }
        let offset = self.layout.page_offset(va.as_u64());
        if let Some(frame) = self.tlb.lookup(va) {
            return Ok(frame + offset);
        }

        let physical_page = self
            .page_table
            .lookup(va)
            .ok_or(VmError::NotMapped(va.as_u64()))?;
        let pa = PhysAddr::new(self.layout.page_base(physical_page) + offset);
        self.tlb.insert(va, pa);
        Ok(pa)
    }

    /// Installs a mapping for one page and zero-fills its frame.
    fn map_page(&mut self, va: VirtAddr, physical_page: u64) -> Result<(), VmError> {
        self.page_table.map(va, physical_page)?;

        let frame = PhysAddr::new(self.layout.page_base(physical_page));
        let start = frame.as_u64() as usize;
        self.physical_memory[start..start + self.layout.page_size()].fill(0);

        if self.tlb.probe(va).is_none() {
            self.tlb.insert(va, frame);
        }
        log::trace!("mapped {:#x} -> {:#x}", va.as_u64(), frame.as_u64());
        Ok(())
    }

    /// Backs virtual page `virtual_page` with any free frame.
    fn commit_page(&mut self, virtual_page: usize) -> Result<(), VmError> {
        let physical_page =
            self.physical_pages
                .find_free_page()
                .ok_or(VmError::OutOfPhysicalSpace {
                    needed: 1,
                    available: 0,
                })?;
        let va = self.page_address(virtual_page as u64)?;
        self.map_page(va, physical_page as u64)?;

        self.virtual_pages.set_bit(virtual_page);
        self.physical_pages.set_bit(physical_page);
        Ok(())
    }

    /// Drops the mapping of one page along with both bitmap bits and its
    /// cached translation.
    fn release_page(&mut self, va: VirtAddr) -> Result<(), VmError> {
        let physical_page = self.page_table.unmap(va)?;
        let virtual_page = self.layout.page_number(va.as_u64());

        self.virtual_pages.clear_bit(virtual_page as usize);
        self.physical_pages.clear_bit(physical_page as usize);
        self.tlb.remove(va);
        Ok(())
    }

    /// Reserves a contiguous virtual run large enough for `num_bytes` and backs
    /// each page with an arbitrary frame. On failure the pages committed by
    /// this call are released again.
    pub fn alloc(&mut self, num_bytes: usize) -> Result<VirtAddr, VmError> {
        let pages = num_bytes.div_ceil(self.layout.page_size());

        let available = self.physical_pages.free_pages();
        if pages > available {
            return Err(VmError::OutOfPhysicalSpace {
                needed: pages,
                available,
            });
        }

        let start = self
            .virtual_pages
            .find_free_run(pages)
            .ok_or(VmError::OutOfVirtualSpace { pages })?;

        for committed in 0..pages {
            if let Err(err) = self.commit_page(start + committed) {
                self.rollback(start, committed);
                return Err(err);
            }
        }

        let base = self.page_address(start as u64)?;
        log::debug!(
            "allocated {} pages at {:#x} for {} bytes",
            pages,
            base.as_u64(),
            num_bytes
        );
        Ok(base)
    }

    fn rollback(&mut self, start: usize, committed: usize) {
        for page in start..start + committed {
            let released = self
                .page_address(page as u64)
                .and_then(|va| self.release_page(va));
            if let Err(err) = released {
                log::error!("rollback of virtual page {} failed: {}", page, err);
            }
        }
    }

    /// Releases every page overlapping `[va, va + size)`. All pages are
    /// translated first; if any is unmapped nothing is released.
    pub fn free(&mut self, va: VirtAddr, size: usize) -> Result<(), VmError> {
        // page numbers drop the bits above the address width
        if va.as_u64() >= self.virtual_limit {
            return Err(VmError::NotMapped(va.as_u64()));
        }
        let first_page = self.layout.page_number(va.as_u64());
        let pages = size.div_ceil(self.layout.page_size()) as u64;

        for page in first_page..first_page + pages {
            let page_va = self.page_address(page)?;
            self.translate(page_va)?;
        }

        for page in first_page..first_page + pages {
            let page_va = self.page_address(page)?;
            self.release_page(page_va)?;
        }

        log::debug!("freed {} pages at {:#x}", pages, va.as_u64());
        Ok(())
    }

    /// Walks `[va, va + len)` page by page, handing `copy` the physical bytes
    /// of each piece along with the matching range of the caller's buffer.
    /// Pieces copied before an unmapped page are kept.
    fn copy_pages<F>(&mut self, va: VirtAddr, len: usize, mut copy: F) -> Result<(), VmError>
    where
        F: FnMut(&mut [u8], Range<usize>),
    {
        let page_size = self.layout.page_size();
        let mut cursor = va.as_u64();
        let mut done = 0;

        while done < len {
            let current = VirtAddr::try_new(cursor).map_err(|_| VmError::NotMapped(cursor))?;
            let pa = self.translate(current)?.as_u64() as usize;
            let offset = self.layout.page_offset(cursor) as usize;
            let chunk = (len - done).min(page_size - offset);

            copy(&mut self.physical_memory[pa..pa + chunk], done..done + chunk);

            done += chunk;
            cursor += chunk as u64;
        }
        Ok(())
    }

    pub fn write(&mut self, va: VirtAddr, src: &[u8]) -> Result<(), VmError> {
        self.copy_pages(va, src.len(), |frame, range| {
            frame.copy_from_slice(&src[range]);
        })
    }

    pub fn read(&mut self, va: VirtAddr, dst: &mut [u8]) -> Result<(), VmError> {
        let len = dst.len();
        self.copy_pages(va, len, |frame, range| {
            dst[range].copy_from_slice(frame);
        })
    }

    pub fn tlb_stats(&self) -> TlbStats {
        self.tlb.stats()
    }

    pub fn usage(&self) -> MemoryUsage {
        MemoryUsage {
            virtual_pages_used: self.virtual_pages.used_pages(),
            physical_pages_used: self.physical_pages.used_pages(),
            physical_pages_free: self.physical_pages.free_pages(),
            directories: self.page_table.directory_count(),
        }
    }

    #[cfg(test)]
    pub fn is_virtual_page_used(&self, page: usize) -> bool {
        self.virtual_pages.is_bit_set(page)
    }

    #[cfg(test)]
    pub fn is_physical_page_used(&self, page: usize) -> bool {
        self.physical_pages.is_bit_set(page)
    }
}
