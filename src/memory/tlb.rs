//! Direct-mapped translation cache.
//!
//! A virtual page always lands in slot `vpn % capacity`; inserting a page that
//! collides with a cached one silently evicts it.

use core::fmt;

use x86_64::{PhysAddr, VirtAddr};

use super::address::AddressLayout;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct TlbEntry {
    virtual_page: u64,
    physical_page: u64,
    valid: bool,
}

/// Lookup counters of a [`Tlb`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TlbStats {
    pub hits: u64,
    pub misses: u64,
}

impl TlbStats {
    pub const fn lookups(&self) -> u64 {
        self.hits + self.misses
    }

    /// Percentage of lookups that missed, 0 when nothing was looked up.
    pub fn miss_rate(&self) -> f64 {
        match self.lookups() {
            0 => 0.0,
            total => self.misses as f64 / total as f64 * 100.0,
        }
    }
}

impl fmt::Display for TlbStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Hits: {}, Misses: {}, miss rate: {:.2}%",
            self.hits,
            self.misses,
            self.miss_rate()
        )
    }
}

pub struct Tlb {
    layout: AddressLayout,
    entries: Box<[TlbEntry]>,
    stats: TlbStats,
}

impl Tlb {
    /// `capacity` must be a non-zero power of two.
    pub fn new(layout: AddressLayout, capacity: usize) -> Self {
        debug_assert!(capacity.is_power_of_two());
        Tlb {
            layout,
            entries: vec![TlbEntry::default(); capacity].into_boxed_slice(),
            stats: TlbStats::default(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    fn slot(&self, virtual_page: u64) -> usize {
        (virtual_page % self.entries.len() as u64) as usize
    }

    /// Caches the translation of the page holding `va` to the frame holding `pa`.
    pub fn insert(&mut self, va: VirtAddr, pa: PhysAddr) {
        let virtual_page = self.layout.page_number(va.as_u64());
        let physical_page = self.layout.page_number(pa.as_u64());
        let slot = self.slot(virtual_page);

        self.entries[slot] = TlbEntry {
            virtual_page,
            physical_page,
            valid: true,
        };
    }

    /// Returns the base address of the frame backing `va` on a hit. The page
    /// offset of `va` is not added back.
    pub fn lookup(&mut self, va: VirtAddr) -> Option<PhysAddr> {
        match self.probe(va) {
            Some(base) => {
                self.stats.hits += 1;
                Some(base)
            }
            None => {
                self.stats.misses += 1;
                None
            }
        }
    }

    /// Same as [`lookup`](Self::lookup) without touching the counters.
    pub fn probe(&self, va: VirtAddr) -> Option<PhysAddr> {
        let virtual_page = self.layout.page_number(va.as_u64());
        let entry = &self.entries[self.slot(virtual_page)];

        if entry.valid && entry.virtual_page == virtual_page {
            Some(PhysAddr::new(self.layout.page_base(entry.physical_page)))
        } else {
            None
        }
    }

    /// Invalidates the cached translation of `va`. A slot currently holding a
    /// different page is left alone. Returns whether anything was evicted.
    pub fn remove(&mut self, va: VirtAddr) -> bool {
        let virtual_page = self.layout.page_number(va.as_u64());
        let slot = self.slot(virtual_page);
        let entry = &mut self.entries[slot];

        if entry.valid && entry.virtual_page == virtual_page {
            entry.valid = false;
            true
        } else {
            false
        }
    }

    pub fn stats(&self) -> TlbStats {
        self.stats
    }
}
