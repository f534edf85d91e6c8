//! Per-process address space: paging structures plus the mapping list.
//!
//! Mappings of one address space never overlap. Adding a mapping over an
//! existing one without `overwrite` is a kernel bug and panics; with
//! `overwrite`, the old mappings are split around the new range and the
//! covered pages released.

use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::config::{FREE_RANGE_END, FREE_RANGE_START, PAGE_SIZE, PAGING_PROBES};
use crate::error::Errno;
use crate::memory::address::{PhysAddr, VirtAddr};
use crate::memory::frame::PhysicalMemory;
use crate::memory::mapping::MemMapping;
use crate::memory::paging::PageDirectory;

pub struct AddressSpace {
    directory: PageDirectory,
    mappings: Vec<MemMapping>,
}

impl AddressSpace {
    pub fn new(memory: &Arc<PhysicalMemory>) -> Self {
        Self {
            directory: PageDirectory::new(memory),
            mappings: Vec::new(),
        }
    }

    pub fn page_directory(&self) -> &PageDirectory {
        &self.directory
    }

    pub fn mappings(&self) -> &[MemMapping] {
        &self.mappings
    }

    /// The mapping covering `addr`.
    pub fn mapping_at(&self, addr: VirtAddr) -> Option<&MemMapping> {
        self.mappings.iter().find(|m| m.covers(addr))
    }

    pub fn translate(&self, addr: VirtAddr) -> Option<PhysAddr> {
        self.directory.translate(addr)
    }

    /// Make this the active address space.
    ///
    /// The kernel half is checked first: if the two probe addresses don't
    /// resolve to their known physical addresses, paging is corrupt.
    pub fn install(&self) {
        let memory = self.directory.memory();
        let directory = self.directory.physical_address();
        for (virt, phys) in PAGING_PROBES {
            let resolved = memory.translate(directory, VirtAddr::new(virt));
            if resolved != Some(PhysAddr::new(phys)) {
                panic!(
                    "paging sanity check failed: {:#010x} resolves to {:?}, expected {:#010x}",
                    virt, resolved, phys
                );
            }
        }
        memory.load_page_directory(directory);
    }

    /// True if no mapping intersects `pages` pages starting at `start`.
    pub fn is_range_free(&self, start: VirtAddr, pages: usize) -> bool {
        let end = start.as_u64() + (pages * PAGE_SIZE) as u64;
        !self.mappings.iter().any(|m| m.overlaps(start.as_u64(), end))
    }

    /// Record `mapping` in this address space. Nothing is backed yet.
    pub fn add_mem_mapping(&mut self, mapping: MemMapping, overwrite: bool) {
        let start = mapping.virtual_address().as_u64();
        let end = mapping.end();

        if !overwrite {
            if let Some(existing) = self.mappings.iter().find(|m| m.overlaps(start, end)) {
                panic!("{:?} overlaps existing {:?}", mapping, existing);
            }
            self.mappings.push(mapping);
            return;
        }

        let old = core::mem::take(&mut self.mappings);
        let mut kept = Vec::with_capacity(old.len() + 2);
        for mut m in old {
            if !m.overlaps(start, end) {
                kept.push(m);
                continue;
            }
            let m_start = m.virtual_address().as_u64();
            if m_start < start {
                let rest = m.split_off(((start - m_start) / PAGE_SIZE as u64) as usize);
                kept.push(m);
                m = rest;
            }
            if m.end() > end {
                let covered = ((end - m.virtual_address().as_u64()) / PAGE_SIZE as u64) as usize;
                kept.push(m.split_off(covered));
            }
            log::debug!("{:?} replaced by {:?}", m, mapping);
            m.unmap_completely(&mut self.directory);
        }
        kept.push(mapping);
        self.mappings = kept;
    }

    /// Remove the mappings that start exactly at `addr` and release their pages.
    pub fn mem_unmap(&mut self, addr: VirtAddr, num_pages: usize) {
        let mut i = 0;
        while i < self.mappings.len() {
            if self.mappings[i].virtual_address() != addr {
                i += 1;
                continue;
            }
            let mut mapping = self.mappings.remove(i);
            if mapping.number_of_pages() != num_pages {
                log::warn!(
                    "mem_unmap of {} pages at {} removes a {}-page mapping",
                    num_pages,
                    addr,
                    mapping.number_of_pages()
                );
            }
            mapping.unmap_completely(&mut self.directory);
        }
    }

    /// First-fit search for `num_pages` unmapped pages in the free range.
    pub fn find_free_virtual_range(&self, num_pages: usize) -> Option<VirtAddr> {
        let size = (num_pages * PAGE_SIZE) as u64;
        let mut addr = FREE_RANGE_START as u64;
        while addr + size <= FREE_RANGE_END as u64 {
            // The lowest mapping still in the way of `addr`.
            let next = self
                .mappings
                .iter()
                .filter(|m| m.end() > addr)
                .min_by_key(|m| m.virtual_address());
            match next {
                Some(m) if m.virtual_address().as_u64() < addr + size => addr = m.end(),
                _ => return Some(VirtAddr::new(addr as u32)),
            }
        }
        None
    }

    /// Back the page containing `addr`, returning its frame.
    fn backed_frame(&mut self, addr: VirtAddr) -> Result<PhysAddr, Errno> {
        let index = self
            .mappings
            .iter()
            .position(|m| m.covers(addr))
            .ok_or(Errno::Fault)?;
        let mapping = &mut self.mappings[index];
        let page = ((addr.as_u64() - mapping.virtual_address().as_u64()) / PAGE_SIZE as u64) as usize;
        let frame = mapping.ensure_backed(page, &mut self.directory)?;
        Ok(frame + addr.page_offset() as u32)
    }

    /// Resolve a fault at `addr`. Faults outside every mapping are errors.
    pub fn handle_page_fault(&mut self, addr: VirtAddr) -> Result<(), Errno> {
        match self.backed_frame(addr) {
            Ok(_) => Ok(()),
            Err(e) => {
                log::debug!("unresolved page fault at {}", addr);
                Err(e)
            }
        }
    }

    /// Back every page of the mapping starting at `addr`.
    pub fn ensure_completely_backed(&mut self, addr: VirtAddr) -> Result<(), Errno> {
        match self.mappings.iter_mut().find(|m| m.virtual_address() == addr) {
            Some(mapping) => mapping.ensure_completely_backed(&mut self.directory),
            None => Ok(()),
        }
    }

    /// Fault unless every page of `[addr, addr + len)` lies in some mapping.
    fn check_range(&self, addr: VirtAddr, len: usize) -> Result<(), Errno> {
        let end = addr.as_u64() + len as u64;
        if end > u32::MAX as u64 + 1 {
            return Err(Errno::Fault);
        }
        let mut cur = addr.as_u64();
        while cur < end {
            let mapping = self
                .mappings
                .iter()
                .find(|m| m.covers(VirtAddr::new(cur as u32)))
                .ok_or(Errno::Fault)?;
            cur = mapping.end();
        }
        Ok(())
    }

    /// Walk `[addr, addr + len)` page by page, backing pages as they're touched.
    ///
    /// The whole range is checked first, so an unmapped page anywhere in it
    /// faults before a single byte is copied.
    fn for_each_chunk(
        &mut self,
        addr: VirtAddr,
        len: usize,
        mut f: impl FnMut(&mut [u8], usize),
    ) -> Result<(), Errno> {
        self.check_range(addr, len)?;
        let mut done = 0;
        while done < len {
            let cur = VirtAddr::new((addr.as_u64() + done as u64) as u32);
            let frame = self.backed_frame(cur)?;
            let offset = cur.page_offset();
            let n = (PAGE_SIZE - offset).min(len - done);
            self.directory
                .memory()
                .with_frame_mut(frame, |page| f(&mut page.0[offset..offset + n], done));
            done += n;
        }
        Ok(())
    }

    /// Kernel write into process memory. Protection is not checked.
    pub fn write_bytes(&mut self, addr: VirtAddr, data: &[u8]) -> Result<(), Errno> {
        self.for_each_chunk(addr, data.len(), |chunk, done| {
            chunk.copy_from_slice(&data[done..done + chunk.len()]);
        })
    }

    pub fn zero_bytes(&mut self, addr: VirtAddr, len: usize) -> Result<(), Errno> {
        self.for_each_chunk(addr, len, |chunk, _| chunk.fill(0))
    }

    pub fn read_bytes(&mut self, addr: VirtAddr, buf: &mut [u8]) -> Result<(), Errno> {
        self.for_each_chunk(addr, buf.len(), |chunk, done| {
            buf[done..done + chunk.len()].copy_from_slice(chunk);
        })
    }

    /// Give this (empty) address space private copies of every mapping in `other`.
    pub fn copy_mappings_from(&mut self, other: &AddressSpace) -> Result<(), Errno> {
        for source in &other.mappings {
            let mut copy = source.duplicate();
            if let Err(e) = copy.copy_from(source, &mut self.directory) {
                copy.unmap_completely(&mut self.directory);
                return Err(e);
            }
            self.add_mem_mapping(copy, false);
        }
        Ok(())
    }
}

impl Drop for AddressSpace {
    fn drop(&mut self) {
        for mapping in self.mappings.iter_mut() {
            mapping.unmap_completely(&mut self.directory);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::USER_PAGE_TABLES;
    use crate::memory::mapping::Protection;

    fn space() -> (Arc<PhysicalMemory>, AddressSpace) {
        let memory = Arc::new(PhysicalMemory::new(128));
        let space = AddressSpace::new(&memory);
        (memory, space)
    }

    fn anon(addr: u32, pages: usize) -> MemMapping {
        MemMapping::anonymous(VirtAddr::new(addr), pages, Protection::READ | Protection::WRITE)
    }

    fn ranges(space: &AddressSpace) -> Vec<(u32, usize)> {
        let mut r: Vec<_> = space
            .mappings()
            .iter()
            .map(|m| (m.virtual_address().as_u32(), m.number_of_pages()))
            .collect();
        r.sort();
        r
    }

    #[test]
    fn test_add_is_lazy() {
        let (memory, mut space) = space();
        let before = memory.frames_in_use();
        space.add_mem_mapping(anon(0x1000_0000, 16), false);
        space.add_mem_mapping(anon(0x1001_0000, 1), false);
        assert_eq!(memory.frames_in_use(), before);
        assert_eq!(ranges(&space), vec![(0x1000_0000, 16), (0x1001_0000, 1)]);
    }

    #[test]
    #[should_panic(expected = "overlaps existing")]
    fn test_overlap_without_overwrite_panics() {
        let (_memory, mut space) = space();
        space.add_mem_mapping(anon(0x1000_0000, 4), false);
        space.add_mem_mapping(anon(0x1000_3000, 4), false);
    }

    #[test]
    fn test_overwrite_splits_around_new_range() {
        let (_memory, mut space) = space();
        space.add_mem_mapping(anon(0x1000_0000, 8), false);
        space.write_bytes(VirtAddr::new(0x1000_0000), b"head").unwrap();
        space.write_bytes(VirtAddr::new(0x1000_3000), b"gone").unwrap();
        space.write_bytes(VirtAddr::new(0x1000_7000), b"tail").unwrap();
        let covered = space.translate(VirtAddr::new(0x1000_3000));
        assert!(covered.is_some());

        space.add_mem_mapping(anon(0x1000_2000, 3), true);
        assert_eq!(
            ranges(&space),
            vec![(0x1000_0000, 2), (0x1000_2000, 3), (0x1000_5000, 3)]
        );
        // The covered page was released; the new mapping is lazy.
        assert_eq!(space.translate(VirtAddr::new(0x1000_3000)), None);

        let mut buf = [0u8; 4];
        space.read_bytes(VirtAddr::new(0x1000_0000), &mut buf).unwrap();
        assert_eq!(&buf, b"head");
        space.read_bytes(VirtAddr::new(0x1000_7000), &mut buf).unwrap();
        assert_eq!(&buf, b"tail");
        space.read_bytes(VirtAddr::new(0x1000_3000), &mut buf).unwrap();
        assert_eq!(buf, [0; 4]);
    }

    #[test]
    fn test_overwrite_swallows_whole_mappings() {
        let (memory, mut space) = space();
        space.add_mem_mapping(anon(0x1000_1000, 1), false);
        space.add_mem_mapping(anon(0x1000_3000, 2), false);
        space.ensure_completely_backed(VirtAddr::new(0x1000_3000)).unwrap();
        let backed = memory.frames_in_use();

        space.add_mem_mapping(anon(0x1000_0000, 8), true);
        assert_eq!(ranges(&space), vec![(0x1000_0000, 8)]);
        assert_eq!(memory.frames_in_use(), backed - 2);
    }

    #[test]
    fn test_find_free_virtual_range_first_fit() {
        let (_memory, mut space) = space();
        assert_eq!(space.find_free_virtual_range(4), Some(VirtAddr::new(FREE_RANGE_START)));

        space.add_mem_mapping(anon(FREE_RANGE_START, 2), false);
        space.add_mem_mapping(anon(FREE_RANGE_START + 0x4000, 2), false);
        // A 2-page hole sits between the two mappings.
        assert_eq!(
            space.find_free_virtual_range(2),
            Some(VirtAddr::new(FREE_RANGE_START + 0x2000))
        );
        let found = space.find_free_virtual_range(3).unwrap();
        assert_eq!(found, VirtAddr::new(FREE_RANGE_START + 0x6000));
        assert!(space.is_range_free(found, 3));
    }

    #[test]
    fn test_find_free_virtual_range_exhausted() {
        let (_memory, mut space) = space();
        let window = ((FREE_RANGE_END - FREE_RANGE_START) as usize) / PAGE_SIZE;
        space.add_mem_mapping(anon(FREE_RANGE_START + 0x1000, window - 1), false);
        assert_eq!(space.find_free_virtual_range(1), Some(VirtAddr::new(FREE_RANGE_START)));
        assert_eq!(space.find_free_virtual_range(2), None);
    }

    #[test]
    fn test_mem_unmap_exact_start_only() {
        let (memory, mut space) = space();
        let baseline = memory.frames_in_use();
        space.add_mem_mapping(anon(0x2000_0000, 2), false);
        space.ensure_completely_backed(VirtAddr::new(0x2000_0000)).unwrap();
        assert!(memory.frames_in_use() > baseline);

        space.mem_unmap(VirtAddr::new(0x2000_1000), 1);
        assert_eq!(space.mappings().len(), 1);

        space.mem_unmap(VirtAddr::new(0x2000_0000), 2);
        assert!(space.mappings().is_empty());
        assert_eq!(space.translate(VirtAddr::new(0x2000_0000)), None);
        // Only the page table stays behind.
        assert_eq!(memory.frames_in_use(), baseline + 1);
    }

    #[test]
    fn test_page_fault_backs_or_faults() {
        let (_memory, mut space) = space();
        space.add_mem_mapping(anon(0x3000_0000, 1), false);
        assert_eq!(space.translate(VirtAddr::new(0x3000_0010)), None);
        space.handle_page_fault(VirtAddr::new(0x3000_0010)).unwrap();
        assert!(space.translate(VirtAddr::new(0x3000_0010)).is_some());
        assert_eq!(space.handle_page_fault(VirtAddr::new(0x3000_1000)), Err(Errno::Fault));
    }

    #[test]
    fn test_install_checks_and_loads() {
        let (memory, space) = space();
        space.install();
        assert_eq!(
            memory.active_page_directory(),
            Some(space.page_directory().physical_address())
        );
    }

    #[test]
    #[should_panic(expected = "paging sanity check failed")]
    fn test_install_rejects_corrupt_kernel_half() {
        let (memory, space) = space();
        let directory = space.page_directory().physical_address();
        // Drop the shared kernel table from this directory.
        memory
            .with_frame_mut(directory, |frame| frame.as_table_mut()[USER_PAGE_TABLES].clear())
            .unwrap();
        space.install();
    }

    #[test]
    fn test_cross_page_write() {
        let (_memory, mut space) = space();
        space.add_mem_mapping(anon(0x3000_0000, 2), false);
        space.write_bytes(VirtAddr::new(0x3000_0FFE), b"wxyz").unwrap();
        let mut buf = [0u8; 4];
        space.read_bytes(VirtAddr::new(0x3000_0FFE), &mut buf).unwrap();
        assert_eq!(&buf, b"wxyz");
        assert_eq!(space.write_bytes(VirtAddr::new(0x3000_1FFF), b"ab"), Err(Errno::Fault));
    }

    #[test]
    fn test_write_into_a_hole_copies_nothing() {
        let (_memory, mut space) = space();
        space.add_mem_mapping(anon(0x3000_0000, 1), false);
        space.add_mem_mapping(anon(0x3000_2000, 1), false);
        let data = [0xEEu8; 3 * PAGE_SIZE];
        assert_eq!(space.write_bytes(VirtAddr::new(0x3000_0000), &data), Err(Errno::Fault));
        let mut buf = [0u8; 8];
        space.read_bytes(VirtAddr::new(0x3000_0000), &mut buf).unwrap();
        assert_eq!(buf, [0; 8]);
        assert_eq!(space.read_bytes(VirtAddr::new(0x3000_1000), &mut buf), Err(Errno::Fault));

        // Adjacent mappings form one range.
        space.add_mem_mapping(anon(0x3000_1000, 1), false);
        space.write_bytes(VirtAddr::new(0x3000_0000), &data).unwrap();
        space.read_bytes(VirtAddr::new(0x3000_2FF8), &mut buf).unwrap();
        assert_eq!(buf, [0xEE; 8]);
    }

    #[test]
    fn test_drop_releases_everything() {
        let memory = Arc::new(PhysicalMemory::new(64));
        let baseline = memory.frames_in_use();
        {
            let mut space = AddressSpace::new(&memory);
            space.add_mem_mapping(anon(0x1000_0000, 3), false);
            space.ensure_completely_backed(VirtAddr::new(0x1000_0000)).unwrap();
        }
        assert_eq!(memory.frames_in_use(), baseline);
    }
}
