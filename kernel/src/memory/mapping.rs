//! Memory mappings: one virtual range of a process and what backs it.
//!
//! A mapping starts with no physical pages at all. Pages are allocated
//! (and filled from the backing source) on first touch, either through a
//! page fault or an explicit `ensure_backed` call.

use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use bitflags::bitflags;

use crate::config::PAGE_SIZE;
use crate::error::Errno;
use crate::fs::FileDescriptor;
use crate::memory::address::{PhysAddr, VirtAddr};
use crate::memory::paging::{PageDirectory, PageTableFlags};

bitflags! {
    /// Mapping protection, as passed by `mem_map` (CloudABI `PROT_*` bits).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Protection: u8 {
        const EXEC  = 1 << 0;
        const WRITE = 1 << 1;
        const READ  = 1 << 2;
    }
}

/// Where the contents of a mapping come from.
#[derive(Clone)]
pub enum Backing {
    /// Zero-filled memory.
    Anonymous,
    /// Bytes read from a descriptor, page `i` starting at `offset + i * PAGE_SIZE`.
    Descriptor {
        fd: Arc<dyn FileDescriptor>,
        offset: usize,
    },
}

impl Backing {
    /// The same source, starting `bytes` further in.
    fn advanced(&self, bytes: usize) -> Backing {
        match self {
            Backing::Anonymous => Backing::Anonymous,
            Backing::Descriptor { fd, offset } => Backing::Descriptor {
                fd: Arc::clone(fd),
                offset: offset + bytes,
            },
        }
    }
}

impl core::fmt::Debug for Backing {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Backing::Anonymous => write!(f, "anonymous"),
            Backing::Descriptor { fd, offset } => write!(f, "{}+{:#x}", fd.name(), offset),
        }
    }
}

pub struct MemMapping {
    virtual_address: VirtAddr,
    number_of_pages: usize,
    backing: Backing,
    protection: Protection,
    /// Frame behind each page, once backed.
    frames: Vec<Option<PhysAddr>>,
}

impl MemMapping {
    pub fn new(
        virtual_address: VirtAddr,
        number_of_pages: usize,
        backing: Backing,
        protection: Protection,
    ) -> Self {
        assert!(
            virtual_address.is_page_aligned(),
            "mapping at {} is not page aligned",
            virtual_address
        );
        Self {
            virtual_address,
            number_of_pages,
            backing,
            protection,
            frames: vec![None; number_of_pages],
        }
    }

    pub fn anonymous(virtual_address: VirtAddr, number_of_pages: usize, protection: Protection) -> Self {
        Self::new(virtual_address, number_of_pages, Backing::Anonymous, protection)
    }

    /// A new, unbacked record for the same range and source.
    pub fn duplicate(&self) -> Self {
        Self::new(
            self.virtual_address,
            self.number_of_pages,
            self.backing.clone(),
            self.protection,
        )
    }

    #[inline]
    pub fn virtual_address(&self) -> VirtAddr {
        self.virtual_address
    }

    #[inline]
    pub fn number_of_pages(&self) -> usize {
        self.number_of_pages
    }

    #[inline]
    pub fn protection(&self) -> Protection {
        self.protection
    }

    pub fn backing(&self) -> &Backing {
        &self.backing
    }

    /// First address past the mapping.
    #[inline]
    pub fn end(&self) -> u64 {
        self.virtual_address.as_u64() + (self.number_of_pages * PAGE_SIZE) as u64
    }

    pub fn covers(&self, addr: VirtAddr) -> bool {
        addr.as_u64() >= self.virtual_address.as_u64() && addr.as_u64() < self.end()
    }

    /// Does `[start, end)` intersect this mapping?
    pub fn overlaps(&self, start: u64, end: u64) -> bool {
        start < self.end() && self.virtual_address.as_u64() < end
    }

    /// Frame behind `page`, if it has been backed.
    pub fn frame(&self, page: usize) -> Option<PhysAddr> {
        self.frames.get(page).copied().flatten()
    }

    pub fn backed_pages(&self) -> usize {
        self.frames.iter().filter(|f| f.is_some()).count()
    }

    fn page_address(&self, page: usize) -> VirtAddr {
        self.virtual_address + (page * PAGE_SIZE) as u32
    }

    fn page_flags(&self) -> PageTableFlags {
        let mut flags = PageTableFlags::PRESENT | PageTableFlags::USER;
        if self.protection.contains(Protection::WRITE) {
            flags |= PageTableFlags::WRITABLE;
        }
        flags
    }

    /// Allocate a frame for `page`, fill it with `contents` and map it.
    fn install(
        &mut self,
        page: usize,
        dir: &mut PageDirectory,
        contents: Option<&[u8; PAGE_SIZE]>,
    ) -> Result<PhysAddr, Errno> {
        let memory = Arc::clone(dir.memory());
        let frame = memory.allocate()?;
        if let Some(contents) = contents {
            memory.with_frame_mut(frame, |f| f.0.copy_from_slice(contents));
        }
        if let Err(e) = dir.map_page(self.page_address(page), frame, self.page_flags()) {
            memory.deallocate(frame);
            return Err(e.into());
        }
        self.frames[page] = Some(frame);
        Ok(frame)
    }

    /// Make sure `page` has a frame behind it, returning that frame.
    ///
    /// A descriptor that fails to read leaves the page unbacked and the
    /// error is passed on.
    pub fn ensure_backed(&mut self, page: usize, dir: &mut PageDirectory) -> Result<PhysAddr, Errno> {
        assert!(page < self.number_of_pages, "page {} outside mapping", page);
        if let Some(frame) = self.frames[page] {
            return Ok(frame);
        }
        let (fd, offset) = match &self.backing {
            Backing::Anonymous => return self.install(page, dir, None),
            Backing::Descriptor { fd, offset } => (Arc::clone(fd), *offset),
        };
        let mut contents = [0u8; PAGE_SIZE];
        let start = offset + page * PAGE_SIZE;
        let mut filled = 0;
        while filled < PAGE_SIZE {
            match fd.read(start + filled, &mut contents[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) => {
                    log::warn!("backing {} from {}: {}", self.page_address(page), fd.name(), e);
                    return Err(e);
                }
            }
        }
        self.install(page, dir, Some(&contents))
    }

    pub fn ensure_completely_backed(&mut self, dir: &mut PageDirectory) -> Result<(), Errno> {
        for page in 0..self.number_of_pages {
            self.ensure_backed(page, dir)?;
        }
        Ok(())
    }

    /// Unmap every backed page and give its frame back.
    pub fn unmap_completely(&mut self, dir: &mut PageDirectory) {
        let base = self.virtual_address;
        let memory = Arc::clone(dir.memory());
        for (page, slot) in self.frames.iter_mut().enumerate() {
            if let Some(frame) = slot.take() {
                dir.unmap_page(base + (page * PAGE_SIZE) as u32);
                memory.deallocate(frame);
            }
        }
    }

    /// Give this mapping private copies of every page `other` has backed.
    ///
    /// Pages `other` never touched stay lazy here too.
    pub fn copy_from(&mut self, other: &MemMapping, dir: &mut PageDirectory) -> Result<(), Errno> {
        let memory = Arc::clone(dir.memory());
        let pages = self.number_of_pages.min(other.number_of_pages);
        let mut contents = [0u8; PAGE_SIZE];
        for page in 0..pages {
            let Some(source) = other.frame(page) else {
                continue;
            };
            memory.with_frame(source, |f| contents.copy_from_slice(&f.0));
            match self.frames[page] {
                Some(frame) => {
                    memory.with_frame_mut(frame, |f| f.0.copy_from_slice(&contents));
                }
                None => {
                    self.install(page, dir, Some(&contents))?;
                }
            }
        }
        Ok(())
    }

    /// Cut the mapping after `at` pages, returning the tail.
    ///
    /// Page table entries stay as they are; both halves keep their frames.
    pub fn split_off(&mut self, at: usize) -> MemMapping {
        assert!(
            at > 0 && at < self.number_of_pages,
            "split of a {}-page mapping at {}",
            self.number_of_pages,
            at
        );
        let tail = MemMapping {
            virtual_address: self.page_address(at),
            number_of_pages: self.number_of_pages - at,
            backing: self.backing.advanced(at * PAGE_SIZE),
            protection: self.protection,
            frames: self.frames.split_off(at),
        };
        self.number_of_pages = at;
        tail
    }
}

impl core::fmt::Debug for MemMapping {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "MemMapping({}..{:#x} {:?} {:?})",
            self.virtual_address,
            self.end(),
            self.protection,
            self.backing
        )
    }
}
