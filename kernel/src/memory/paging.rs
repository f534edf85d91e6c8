// =============================================================================
// Cirrus: Two-Level Paging (i386, no PAE)
// =============================================================================
//
// Virtual addresses are translated through two levels:
//
//   Page Directory (1024 entries) → Page Table (1024 entries) → 4 KiB page
//
// Each entry is 4 bytes:
//
//   ```text
//   31                 12 11..9  8   7   6   5   4   3   2   1   0
//   ┌────────────────────┬──────┬───┬───┬───┬───┬───┬───┬───┬───┬───┐
//   │ Phys Addr [31:12]  │Avail │ G │PS │ D │ A │PCD│PWT│U/S│R/W│ P │
//   └────────────────────┴──────┴───┴───┴───┴───┴───┴───┴───┴───┴───┘
//   ```
//
// OWNERSHIP:
//   A process owns its page directory and the page tables for directory
//   slots 0..0x300 (user space). Slots 0x300..0x400 point at kernel page
//   tables owned by the frame allocator and shared by every process.
//
// There is no NX bit without PAE, so "executable" only means "present".
//
// =============================================================================

use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use bitflags::bitflags;

use crate::config::{PAGE_TABLE_ENTRIES, USER_PAGE_TABLES};
use crate::error::AllocError;
use crate::memory::address::{PhysAddr, VirtAddr};
use crate::memory::frame::PhysicalMemory;

// =============================================================================
// Page Table Flags
// =============================================================================

bitflags! {
    /// i386 page directory / page table entry flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageTableFlags: u32 {
        /// Page is present in physical memory.
        const PRESENT       = 1 << 0;
        /// Page is writable. If clear, user writes cause a page fault.
        const WRITABLE      = 1 << 1;
        /// Page is accessible from user mode (Ring 3).
        const USER          = 1 << 2;
        const WRITE_THROUGH = 1 << 3;
        const NO_CACHE      = 1 << 4;
        /// Set by the CPU on any access.
        const ACCESSED      = 1 << 5;
        /// Set by the CPU on a write.
        const DIRTY         = 1 << 6;
        /// In directory entries: a 4 MiB page, no page table.
        const HUGE_PAGE     = 1 << 7;
        /// TLB entry survives a directory switch.
        const GLOBAL        = 1 << 8;
    }
}

impl PageTableFlags {
    /// Kernel data page shared by every address space.
    pub const KERNEL_DATA: Self = Self::PRESENT.union(Self::WRITABLE).union(Self::GLOBAL);

    /// Directory entry for a kernel page table.
    pub const INTERMEDIATE: Self = Self::PRESENT.union(Self::WRITABLE);

    /// Directory entry for a user page table (`0x07`). Restrictions are
    /// applied at the leaf.
    pub const INTERMEDIATE_USER: Self = Self::PRESENT.union(Self::WRITABLE).union(Self::USER);
}

// =============================================================================
// Page Table Entry
// =============================================================================

/// A single directory or table entry.
#[derive(Clone, Copy)]
#[repr(transparent)]
pub struct PageTableEntry(u32);

/// Bits 12 through 31 hold the page frame number.
const ADDR_MASK: u32 = 0xFFFF_F000;

impl PageTableEntry {
    pub const EMPTY: Self = Self(0);

    #[inline]
    pub const fn raw(self) -> u32 {
        self.0
    }

    #[inline]
    pub fn flags(self) -> PageTableFlags {
        PageTableFlags::from_bits_truncate(self.0)
    }

    /// Only meaningful if the entry is present.
    #[inline]
    pub fn addr(self) -> PhysAddr {
        PhysAddr::new(self.0 & ADDR_MASK)
    }

    #[inline]
    pub fn is_present(self) -> bool {
        self.0 & PageTableFlags::PRESENT.bits() != 0
    }

    #[inline]
    pub fn is_huge(self) -> bool {
        self.0 & PageTableFlags::HUGE_PAGE.bits() != 0
    }

    /// Sets this entry to map `addr` with the given `flags`.
    #[inline]
    pub fn set(&mut self, addr: PhysAddr, flags: PageTableFlags) {
        debug_assert!(
            addr.is_page_aligned(),
            "page table entry address must be page-aligned"
        );
        self.0 = (addr.as_u32() & ADDR_MASK) | flags.bits();
    }

    #[inline]
    pub fn clear(&mut self) {
        self.0 = 0;
    }
}

impl core::fmt::Debug for PageTableEntry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        if self.is_present() {
            write!(f, "PTE({} {:?})", self.addr(), self.flags())
        } else {
            write!(f, "PTE(empty)")
        }
    }
}

// =============================================================================
// Page Table
// =============================================================================

/// A page directory or page table: 1024 entries, one frame.
#[repr(C, align(4096))]
pub struct PageTable {
    entries: [PageTableEntry; PAGE_TABLE_ENTRIES],
}

impl PageTable {
    pub fn zero(&mut self) {
        for entry in self.entries.iter_mut() {
            entry.clear();
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &PageTableEntry> {
        self.entries.iter()
    }
}

impl core::ops::Index<usize> for PageTable {
    type Output = PageTableEntry;
    fn index(&self, index: usize) -> &Self::Output {
        &self.entries[index]
    }
}

impl core::ops::IndexMut<usize> for PageTable {
    fn index_mut(&mut self, index: usize) -> &mut Self::Output {
        &mut self.entries[index]
    }
}

// =============================================================================
// Page Directory
// =============================================================================

/// A process's paging structures: its directory plus the user page tables.
///
/// Dropping it returns every owned frame to the allocator. Leaf frames
/// belong to mappings and are not touched here.
pub struct PageDirectory {
    memory: Arc<PhysicalMemory>,
    directory: PhysAddr,
    tables: Vec<Option<PhysAddr>>,
}

impl PageDirectory {
    /// Allocate an empty directory with the kernel half filled in.
    pub fn new(memory: &Arc<PhysicalMemory>) -> Self {
        let directory = match memory.allocate() {
            Ok(frame) => frame,
            Err(_) => panic!("failed to allocate a page directory"),
        };
        memory.with_frame_mut(directory, |frame| {
            let dir = frame.as_table_mut();
            dir.zero();
            memory.fill_kernel_pages(dir);
        });
        Self {
            memory: Arc::clone(memory),
            directory,
            tables: vec![None; USER_PAGE_TABLES],
        }
    }

    /// Physical address loaded into the MMU when this directory is active.
    pub fn physical_address(&self) -> PhysAddr {
        self.directory
    }

    pub fn memory(&self) -> &Arc<PhysicalMemory> {
        &self.memory
    }

    /// The user page table for directory slot `i`, if one exists yet.
    pub fn get_page_table(&self, i: usize) -> Option<PhysAddr> {
        if i >= USER_PAGE_TABLES {
            panic!("page table {:#x} is not owned by the process", i);
        }
        self.tables[i]
    }

    /// The user page table for directory slot `i`, allocated on first use.
    pub fn ensure_page_table(&mut self, i: usize) -> Result<PhysAddr, AllocError> {
        if let Some(table) = self.get_page_table(i) {
            return Ok(table);
        }
        let table = self.memory.allocate()?;
        if !table.is_page_aligned() {
            panic!("page table {} is not page aligned", table);
        }
        self.memory.with_frame_mut(self.directory, |frame| {
            frame.as_table_mut()[i].set(table, PageTableFlags::INTERMEDIATE_USER);
        });
        self.tables[i] = Some(table);
        Ok(table)
    }

    /// Point the leaf entry for `virt` at `frame`.
    pub fn map_page(
        &mut self,
        virt: VirtAddr,
        frame: PhysAddr,
        flags: PageTableFlags,
    ) -> Result<(), AllocError> {
        debug_assert!(virt.is_page_aligned());
        let table = self.ensure_page_table(virt.directory_index())?;
        self.memory.with_frame_mut(table, |t| {
            t.as_table_mut()[virt.table_index()].set(frame, flags | PageTableFlags::PRESENT);
        });
        Ok(())
    }

    /// Clear the leaf entry for `virt`, returning the frame it pointed at.
    pub fn unmap_page(&mut self, virt: VirtAddr) -> Option<PhysAddr> {
        let table = self.get_page_table(virt.directory_index())?;
        self.memory
            .with_frame_mut(table, |t| {
                let entry = &mut t.as_table_mut()[virt.table_index()];
                let old = *entry;
                entry.clear();
                old.is_present().then(|| old.addr())
            })
            .flatten()
    }

    /// Leaf flags for `virt`, if mapped.
    pub fn page_flags(&self, virt: VirtAddr) -> Option<PageTableFlags> {
        let table = self.tables.get(virt.directory_index()).copied().flatten()?;
        self.memory
            .with_frame(table, |t| {
                let entry = t.as_table()[virt.table_index()];
                entry.is_present().then(|| entry.flags())
            })
            .flatten()
    }

    pub fn translate(&self, virt: VirtAddr) -> Option<PhysAddr> {
        self.memory.translate(self.directory, virt)
    }
}

impl Drop for PageDirectory {
    fn drop(&mut self) {
        for table in self.tables.iter().flatten() {
            self.memory.deallocate(*table);
        }
        self.memory.deallocate(self.directory);
    }
}
