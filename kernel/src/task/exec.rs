//! Loading an executable image into a fresh address space.
//!
//! Fixed user layout below the kernel:
//!
//! ```text
//!   0x7FFF_0000 .. 0x8000_0000   stack (64 KiB, grows down)
//!   0x8001_0000                  auxiliary vector
//!   0x8004_0000                  vDSO
//!   0x8006_0000                  program header copy
//!   0x8010_0000                  argument data
//! ```
//!
//! Loadable segments go wherever the image asks, as long as they stay
//! clear of the ranges above and of each other.

use alloc::collections::BTreeSet;
use alloc::vec::Vec;

use crate::config::{
    ARGDATA_ADDR, AUXV_ADDR, EXEC_READ_CHUNK, MAX_EXEC_IMAGE, PAGE_SIZE, PHDR_ADDR, STACK_SIZE,
    STACK_TOP, USER_PAGE_TABLES, VDSO_ADDR,
};
use crate::error::Errno;
use crate::fs::FileDescriptor;
use crate::fs::elf::{self, ElfError};
use crate::memory::{AddressSpace, MemMapping, Protection, VirtAddr, pages_for};

// Auxiliary vector entry types (CloudABI).
pub const AT_NULL: u32 = 0;
pub const AT_PHDR: u32 = 3;
pub const AT_PHNUM: u32 = 4;
pub const AT_PAGESZ: u32 = 6;
pub const AT_BASE: u32 = 7;
pub const AT_ARGDATA: u32 = 256;
pub const AT_ARGDATALEN: u32 = 257;
pub const AT_SYSINFO_EHDR: u32 = 262;

/// Entries in the auxiliary vector, including the terminator.
pub const AUXV_ENTRIES: usize = 8;

/// Where the new main thread starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadedImage {
    pub entry: u32,
    pub stack_pointer: u32,
    pub auxv: VirtAddr,
}

/// Read all of `fd` into memory.
pub fn read_image(fd: &dyn FileDescriptor) -> Result<Vec<u8>, Errno> {
    let mut image = Vec::new();
    let mut chunk = [0u8; EXEC_READ_CHUNK];
    loop {
        let read = fd.read(image.len(), &mut chunk)?;
        if read == 0 {
            return Ok(image);
        }
        if image.len() + read > MAX_EXEC_IMAGE {
            log::warn!("{}: image larger than {} bytes", fd.name(), MAX_EXEC_IMAGE);
            return Err(Errno::TooBig);
        }
        image.extend_from_slice(&chunk[..read]);
    }
}

fn rejected(err: ElfError) -> Errno {
    log::info!("bad executable: {}", err);
    err.into()
}

/// Back the whole mapping and copy `data` to its start.
fn map_filled(
    space: &mut AddressSpace,
    addr: u32,
    len: usize,
    protection: Protection,
    data: &[u8],
) -> Result<(), Errno> {
    if len == 0 {
        return Ok(());
    }
    let addr = VirtAddr::new(addr);
    space.add_mem_mapping(MemMapping::anonymous(addr, pages_for(len), protection), false);
    space.ensure_completely_backed(addr)?;
    space.write_bytes(addr, data)
}

/// Refuse up front when backing every `(address, length)` range, plus the
/// page tables they need, would take more frames than are left.
fn reserve_frames(
    space: &AddressSpace,
    ranges: impl Iterator<Item = (u32, usize)>,
) -> Result<(), Errno> {
    let directory = space.page_directory();
    let mut pages = 0usize;
    let mut tables = BTreeSet::new();
    for (addr, len) in ranges.filter(|&(_, len)| len > 0) {
        let count = pages_for(len);
        pages = pages.saturating_add(count);
        let first = VirtAddr::new(addr).directory_index();
        let last = ((addr as u64 + count as u64 * PAGE_SIZE as u64 - 1) >> 22) as usize;
        for i in first..=last.min(USER_PAGE_TABLES - 1) {
            if directory.get_page_table(i).is_none() {
                tables.insert(i);
            }
        }
    }
    let needed = pages.saturating_add(tables.len());
    let free = directory.memory().frames_free();
    if needed > free {
        log::warn!("image needs {} frames, {} left", needed, free);
        return Err(Errno::NoMem);
    }
    Ok(())
}

fn auxv_bytes(argdata_len: usize, phnum: usize) -> Vec<u8> {
    let entries: [(u32, u32); AUXV_ENTRIES] = [
        (AT_ARGDATA, ARGDATA_ADDR),
        (AT_ARGDATALEN, argdata_len as u32),
        // No address randomization.
        (AT_BASE, 0),
        (AT_PAGESZ, PAGE_SIZE as u32),
        (AT_SYSINFO_EHDR, VDSO_ADDR),
        (AT_PHDR, PHDR_ADDR),
        (AT_PHNUM, phnum as u32),
        (AT_NULL, 0),
    ];
    let mut bytes = Vec::with_capacity(AUXV_ENTRIES * 8);
    for (kind, value) in entries {
        bytes.extend_from_slice(&kind.to_le_bytes());
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    bytes
}

/// Lay out `image` in the empty address space `space`.
///
/// On error `space` holds a partial image and must be thrown away.
pub fn load(
    space: &mut AddressSpace,
    image: &[u8],
    argdata: &[u8],
    vdso: &[u8],
) -> Result<LoadedImage, Errno> {
    if argdata.len() > MAX_EXEC_IMAGE {
        return Err(Errno::TooBig);
    }
    let info = elf::parse(image).map_err(rejected)?;
    let phdrs = info.phdr_table();
    if phdrs.len() > (ARGDATA_ADDR - PHDR_ADDR) as usize {
        return Err(rejected(ElfError::BadPhdr));
    }
    let segments = info.loadable_segments().map_err(rejected)?;
    let auxv = auxv_bytes(argdata.len(), info.phnum());
    let stack_bottom = STACK_TOP - STACK_SIZE as u32;

    let fixed = [
        (ARGDATA_ADDR, argdata.len()),
        (PHDR_ADDR, phdrs.len()),
        (VDSO_ADDR, vdso.len()),
        (AUXV_ADDR, auxv.len()),
        (stack_bottom, STACK_SIZE),
    ];
    let loaded = segments.iter().map(|s| (s.vaddr, s.memsz as usize));
    reserve_frames(space, fixed.into_iter().chain(loaded))?;

    let rw = Protection::READ | Protection::WRITE;
    map_filled(space, ARGDATA_ADDR, argdata.len(), rw, argdata)?;
    map_filled(space, PHDR_ADDR, phdrs.len(), rw, phdrs)?;
    map_filled(space, VDSO_ADDR, vdso.len(), rw, vdso)?;
    map_filled(space, AUXV_ADDR, auxv.len(), rw, &auxv)?;
    map_filled(space, stack_bottom, STACK_SIZE, rw, &[])?;
    // cdecl: the entry point finds the auxv pointer as its first argument.
    space.write_bytes(VirtAddr::new(STACK_TOP - 4), &AUXV_ADDR.to_le_bytes())?;

    for segment in segments {
        if segment.memsz == 0 {
            continue;
        }
        let addr = VirtAddr::new(segment.vaddr);
        let pages = pages_for(segment.memsz as usize);
        if !space.is_range_free(addr, pages) {
            return Err(rejected(ElfError::SegmentOverlap));
        }
        space.add_mem_mapping(
            MemMapping::anonymous(addr, pages, Protection::READ | Protection::EXEC),
            false,
        );
        space.ensure_completely_backed(addr)?;
        space.write_bytes(addr, segment.data)?;
        // Fresh frames are zeroed; the tail past the file data is .bss.
        let bss = segment.memsz as usize - segment.data.len();
        space.zero_bytes(addr + segment.data.len() as u32, bss)?;
    }

    Ok(LoadedImage {
        entry: info.entry(),
        stack_pointer: STACK_TOP - 8,
        auxv: VirtAddr::new(AUXV_ADDR),
    })
}

/// Bytes of an auxv table, decoded into `(type, value)` pairs.
pub fn decode_auxv(bytes: &[u8]) -> Vec<(u32, u32)> {
    bytes
        .chunks_exact(8)
        .map(|e| {
            let kind = u32::from_le_bytes([e[0], e[1], e[2], e[3]]);
            let value = u32::from_le_bytes([e[4], e[5], e[6], e[7]]);
            (kind, value)
        })
        .collect()
}
