//! Physical frame allocator, the page allocator every address space uses.
//!
//! Frames are 4 KiB, zeroed on allocation, and addressed by physical
//! address. Frame numbering starts above the low memory that the shared
//! kernel page table maps at `KERNEL_BASE`, so a user frame never aliases
//! kernel low memory.
//!
//! The allocator also owns the kernel half of every page directory
//! (`fill_kernel_pages`) and the active-directory register that
//! `AddressSpace::install` writes.

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use spin::Mutex;

use crate::config::{FRAME_BASE, KERNEL_LOW_MEMORY, PAGE_SIZE, PAGE_TABLE_ENTRIES, USER_PAGE_TABLES};
use crate::error::AllocError;
use crate::memory::address::{PhysAddr, VirtAddr};
use crate::memory::paging::{PageTable, PageTableEntry, PageTableFlags};

/// One physical page.
#[repr(C, align(4096))]
pub struct PageFrame(pub [u8; PAGE_SIZE]);

impl PageFrame {
    fn zeroed() -> Box<Self> {
        Box::new(PageFrame([0; PAGE_SIZE]))
    }

    /// View this frame as a page directory or page table.
    pub fn as_table(&self) -> &PageTable {
        // SAFETY: PageTable is 1024 transparent u32 entries with the same
        // size and alignment as a frame, and every bit pattern is a valid entry.
        unsafe { &*(self as *const PageFrame).cast::<PageTable>() }
    }

    pub fn as_table_mut(&mut self) -> &mut PageTable {
        // SAFETY: as above.
        unsafe { &mut *(self as *mut PageFrame).cast::<PageTable>() }
    }
}

struct FrameState {
    frames: BTreeMap<u32, Box<PageFrame>>,
    free: Vec<u32>,
    next: u32,
}

impl FrameState {
    fn allocate(&mut self, limit: usize) -> Result<PhysAddr, AllocError> {
        if self.frames.len() >= limit {
            return Err(AllocError);
        }
        let addr = match self.free.pop() {
            Some(addr) => addr,
            None => {
                let addr = self.next;
                self.next += PAGE_SIZE as u32;
                addr
            }
        };
        self.frames.insert(addr, PageFrame::zeroed());
        Ok(PhysAddr::new(addr))
    }
}

/// The machine's physical memory.
pub struct PhysicalMemory {
    state: Mutex<FrameState>,
    limit: usize,
    /// Page table mapping `KERNEL_BASE + x → x` for the low 4 MiB.
    kernel_table: PhysAddr,
    /// The page directory the MMU currently walks.
    active_directory: Mutex<Option<PhysAddr>>,
}

impl PhysicalMemory {
    /// Create a machine with room for `limit` frames, one of which holds
    /// the shared kernel page table.
    pub fn new(limit: usize) -> Self {
        let max = ((u32::MAX - FRAME_BASE) as usize) / PAGE_SIZE;
        let limit = limit.clamp(1, max);

        let mut state = FrameState {
            frames: BTreeMap::new(),
            free: Vec::new(),
            next: FRAME_BASE,
        };
        let kernel_table = match state.allocate(limit) {
            Ok(frame) => frame,
            Err(_) => panic!("no frame left for the kernel page table"),
        };
        if let Some(frame) = state.frames.get_mut(&kernel_table.as_u32()) {
            let table = frame.as_table_mut();
            let pages = KERNEL_LOW_MEMORY as usize / PAGE_SIZE;
            for i in 0..pages.min(PAGE_TABLE_ENTRIES) {
                table[i].set(
                    PhysAddr::new((i * PAGE_SIZE) as u32),
                    PageTableFlags::KERNEL_DATA,
                );
            }
        }

        log::debug!(
            "physical memory: {} frames, kernel table at {}",
            limit,
            kernel_table
        );

        Self {
            state: Mutex::new(state),
            limit,
            kernel_table,
            active_directory: Mutex::new(None),
        }
    }

    /// Allocate a zeroed frame.
    pub fn allocate(&self) -> Result<PhysAddr, AllocError> {
        let result = self.state.lock().allocate(self.limit);
        if result.is_err() {
            log::error!("physical memory exhausted ({} frames)", self.limit);
        }
        result
    }

    /// Return a frame to the allocator.
    pub fn deallocate(&self, frame: PhysAddr) {
        let mut state = self.state.lock();
        if state.frames.remove(&frame.as_u32()).is_none() {
            panic!("deallocate of unallocated frame {}", frame);
        }
        state.free.push(frame.as_u32());
    }

    /// Run `f` on the contents of `frame`, if it is an allocated frame.
    ///
    /// `f` must not call back into the allocator.
    pub fn with_frame<R>(&self, frame: PhysAddr, f: impl FnOnce(&PageFrame) -> R) -> Option<R> {
        let state = self.state.lock();
        state.frames.get(&frame.page_align_down().as_u32()).map(|page| f(page))
    }

    pub fn with_frame_mut<R>(
        &self,
        frame: PhysAddr,
        f: impl FnOnce(&mut PageFrame) -> R,
    ) -> Option<R> {
        let mut state = self.state.lock();
        state
            .frames
            .get_mut(&frame.page_align_down().as_u32())
            .map(|page| f(page))
    }

    /// Fill the kernel half of a fresh page directory.
    ///
    /// Does not take the allocator lock, so it may run inside `with_frame_mut`.
    pub fn fill_kernel_pages(&self, directory: &mut PageTable) {
        for i in USER_PAGE_TABLES..PAGE_TABLE_ENTRIES {
            directory[i].clear();
        }
        directory[USER_PAGE_TABLES].set(self.kernel_table, PageTableFlags::INTERMEDIATE);
    }

    /// Walk `directory` and translate `virt` to a physical address.
    pub fn translate(&self, directory: PhysAddr, virt: VirtAddr) -> Option<PhysAddr> {
        let pde: PageTableEntry =
            self.with_frame(directory, |frame| frame.as_table()[virt.directory_index()])?;
        if !pde.is_present() {
            return None;
        }
        if pde.is_huge() {
            return Some(PhysAddr::new(
                (pde.raw() & 0xFFC0_0000) | (virt.as_u32() & 0x003F_FFFF),
            ));
        }
        let pte: PageTableEntry =
            self.with_frame(pde.addr(), |frame| frame.as_table()[virt.table_index()])?;
        if !pte.is_present() {
            return None;
        }
        Some(pte.addr() + virt.page_offset() as u32)
    }

    /// Point the MMU at `directory`.
    pub fn load_page_directory(&self, directory: PhysAddr) {
        log::trace!("loading page directory {}", directory);
        *self.active_directory.lock() = Some(directory);
    }

    /// The directory the MMU currently walks, if any was loaded.
    pub fn active_page_directory(&self) -> Option<PhysAddr> {
        *self.active_directory.lock()
    }

    /// Frames currently allocated, the kernel page table included.
    pub fn frames_in_use(&self) -> usize {
        self.state.lock().frames.len()
    }

    /// Frames that can still be allocated.
    pub fn frames_free(&self) -> usize {
        self.limit.saturating_sub(self.frames_in_use())
    }
}
