//! Multi-level software page table.
//!
//! Directories live in an arena and refer to each other by [`DirectoryId`].
//! Whether a slot is a directory link or a frame is carried by
//! [`PageTableEntry`]; only the last level holds frames.

use arrayvec::ArrayVec;
use x86_64::VirtAddr;

use crate::constants::memory::MAX_PAGE_TABLE_LEVELS;

use super::{address::AddressLayout, error::VmError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DirectoryId(usize);

impl DirectoryId {
    pub const ROOT: DirectoryId = DirectoryId(0);
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PageTableEntry {
    #[default]
    Absent,
    /// Next-level directory
    Table(DirectoryId),
    /// Physical page number
    Frame(u64),
}

struct Directory {
    entries: Box<[PageTableEntry]>,
    /// Non-absent entries
    present: usize,
}

impl Directory {
    fn new(size: usize) -> Self {
        Directory {
            entries: vec![PageTableEntry::Absent; size].into_boxed_slice(),
            present: 0,
        }
    }
}

pub struct PageTable {
    layout: AddressLayout,
    directories: Vec<Directory>,
    reclaimed: Vec<DirectoryId>,
}

impl PageTable {
    pub fn new(layout: AddressLayout) -> Self {
        PageTable {
            layout,
            directories: vec![Directory::new(layout.entries_per_directory())],
            reclaimed: Vec::new(),
        }
    }

    /// Directories currently reachable from the root, root included.
    pub fn directory_count(&self) -> usize {
        self.directories.len() - self.reclaimed.len()
    }

    pub fn entry(&self, directory: DirectoryId, index: usize) -> PageTableEntry {
        self.directories[directory.0].entries[index]
    }

    /// Reuses a reclaimed directory (already all absent) or grows the arena.
    fn new_directory(&mut self) -> DirectoryId {
        if let Some(id) = self.reclaimed.pop() {
            return id;
        }
        self.directories
            .push(Directory::new(self.layout.entries_per_directory()));
        log::trace!("page table grew to {} directories", self.directories.len());
        DirectoryId(self.directories.len() - 1)
    }

    /// Frame backing `va`, without creating anything on the way.
    pub fn lookup(&self, va: VirtAddr) -> Option<u64> {
        let mut indices = self.layout.indices(va);
        let leaf = indices.pop().unwrap_or_default();

        let mut current = DirectoryId::ROOT;
        for index in indices {
            match self.entry(current, index) {
                PageTableEntry::Table(next) => current = next,
                _ => return None,
            }
        }

        match self.entry(current, leaf) {
            PageTableEntry::Frame(physical_page) => Some(physical_page),
            _ => None,
        }
    }

    /// Installs `va -> physical_page`, creating missing directories. An
    /// existing mapping is never overwritten.
    pub fn map(&mut self, va: VirtAddr, physical_page: u64) -> Result<(), VmError> {
        let mut indices = self.layout.indices(va);
        let leaf = indices.pop().unwrap_or_default();

        let mut current = DirectoryId::ROOT;
        for index in indices {
            current = match self.entry(current, index) {
                PageTableEntry::Table(next) => next,
                PageTableEntry::Absent => {
                    let next = self.new_directory();
                    let directory = &mut self.directories[current.0];
                    directory.entries[index] = PageTableEntry::Table(next);
                    directory.present += 1;
                    next
                }
                PageTableEntry::Frame(_) => return Err(VmError::AlreadyMapped(va.as_u64())),
            };
        }

        let directory = &mut self.directories[current.0];
        if directory.entries[leaf] != PageTableEntry::Absent {
            return Err(VmError::AlreadyMapped(va.as_u64()));
        }
        directory.entries[leaf] = PageTableEntry::Frame(physical_page);
        directory.present += 1;
        Ok(())
    }

    /// Clears the mapping of `va` and returns the frame it pointed at.
    /// Directories left empty by the removal are reclaimed, the root never is.
    pub fn unmap(&mut self, va: VirtAddr) -> Result<u64, VmError> {
        let mut indices = self.layout.indices(va);
        let leaf = indices.pop().unwrap_or_default();

        let mut path: ArrayVec<(DirectoryId, usize), MAX_PAGE_TABLE_LEVELS> = ArrayVec::new();
        let mut current = DirectoryId::ROOT;
        for index in indices {
            match self.entry(current, index) {
                PageTableEntry::Table(next) => {
                    path.push((current, index));
                    current = next;
                }
                _ => return Err(VmError::NotMapped(va.as_u64())),
            }
        }

        let directory = &mut self.directories[current.0];
        let PageTableEntry::Frame(physical_page) = directory.entries[leaf] else {
            return Err(VmError::NotMapped(va.as_u64()));
        };
        directory.entries[leaf] = PageTableEntry::Absent;
        directory.present -= 1;

        let mut child = current;
        for (parent, index) in path.into_iter().rev() {
            if self.directories[child.0].present != 0 {
                break;
            }
            let directory = &mut self.directories[parent.0];
            directory.entries[index] = PageTableEntry::Absent;
            directory.present -= 1;
            self.reclaimed.push(child);
            log::trace!("reclaimed empty directory {:?}", child);
            child = parent;
        }

        Ok(physical_page)
    }
}
