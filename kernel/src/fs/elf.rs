//! Minimal ELF32 parser for loading user-mode executables.
//!
//! Accepts little-endian i386 CloudABI executables (`ET_EXEC` or `ET_DYN`).
//! The header checks run in a fixed order so that the first failing field
//! decides the reported error.

use alloc::vec::Vec;
use core::fmt;

use crate::config::{KERNEL_BASE, PAGE_SIZE};
use crate::error::Errno;

/// ELF magic number: 0x7f 'E' 'L' 'F'.
const ELF_MAGIC: [u8; 4] = [0x7f, b'E', b'L', b'F'];

const EI_CLASS: usize = 4;
const EI_DATA: usize = 5;
const EI_VERSION: usize = 6;
const EI_OSABI: usize = 7;
const EI_ABIVERSION: usize = 8;

/// ELF class: 32-bit.
pub const ELFCLASS32: u8 = 1;

/// ELF data encoding: little-endian.
pub const ELFDATA2LSB: u8 = 1;

/// OS/ABI tag of CloudABI executables.
pub const ELFOSABI_CLOUDABI: u8 = 17;

pub const EV_CURRENT: u32 = 1;

/// ELF type: executable.
pub const ET_EXEC: u16 = 2;

/// ELF type: shared object (position-independent executable).
pub const ET_DYN: u16 = 3;

/// ELF machine: Intel 80386.
pub const EM_386: u16 = 3;

/// Program header type: loadable segment.
pub const PT_LOAD: u32 = 1;

/// Size of an ELF32 file header.
pub const EHDR_SIZE: usize = 52;

/// Size of an ELF32 program header.
pub const PHDR_SIZE: usize = 32;

fn u16_at(data: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([data[offset], data[offset + 1]])
}

fn u32_at(data: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        data[offset],
        data[offset + 1],
        data[offset + 2],
        data[offset + 3],
    ])
}

/// ELF32 file header (first 52 bytes).
#[derive(Debug, Clone, Copy)]
pub struct Elf32Header {
    pub e_ident: [u8; 16],
    pub e_type: u16,
    pub e_machine: u16,
    pub e_version: u32,
    pub e_entry: u32,
    pub e_phoff: u32,
    pub e_shoff: u32,
    pub e_flags: u32,
    pub e_ehsize: u16,
    pub e_phentsize: u16,
    pub e_phnum: u16,
    pub e_shentsize: u16,
    pub e_shnum: u16,
    pub e_shstrndx: u16,
}

impl Elf32Header {
    /// Decode a header. `data` must hold at least `EHDR_SIZE` bytes.
    fn read(data: &[u8]) -> Self {
        let mut e_ident = [0u8; 16];
        e_ident.copy_from_slice(&data[..16]);
        Self {
            e_ident,
            e_type: u16_at(data, 16),
            e_machine: u16_at(data, 18),
            e_version: u32_at(data, 20),
            e_entry: u32_at(data, 24),
            e_phoff: u32_at(data, 28),
            e_shoff: u32_at(data, 32),
            e_flags: u32_at(data, 36),
            e_ehsize: u16_at(data, 40),
            e_phentsize: u16_at(data, 42),
            e_phnum: u16_at(data, 44),
            e_shentsize: u16_at(data, 46),
            e_shnum: u16_at(data, 48),
            e_shstrndx: u16_at(data, 50),
        }
    }
}

/// ELF32 program header (32 bytes).
#[derive(Debug, Clone, Copy)]
pub struct Elf32Phdr {
    pub p_type: u32,
    pub p_offset: u32,
    pub p_vaddr: u32,
    pub p_paddr: u32,
    pub p_filesz: u32,
    pub p_memsz: u32,
    pub p_flags: u32,
    pub p_align: u32,
}

impl Elf32Phdr {
    fn read(data: &[u8]) -> Self {
        Self {
            p_type: u32_at(data, 0),
            p_offset: u32_at(data, 4),
            p_vaddr: u32_at(data, 8),
            p_paddr: u32_at(data, 12),
            p_filesz: u32_at(data, 16),
            p_memsz: u32_at(data, 20),
            p_flags: u32_at(data, 24),
            p_align: u32_at(data, 28),
        }
    }

    /// Returns true if this is a PT_LOAD segment.
    pub fn is_load(&self) -> bool {
        self.p_type == PT_LOAD
    }
}

/// Errors that can occur during ELF parsing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElfError {
    TooSmall,
    BadMagic,
    Not32Bit,
    NotLittleEndian,
    BadIdentVersion,
    WrongAbi,
    NotExecutable,
    WrongMachine,
    BadVersion,
    /// Program header table is malformed or not inside the image.
    BadPhdr,
    /// Segment file data lies outside the image, or is larger than the segment.
    BadSegment,
    UnalignedSegment,
    /// Segment reaches into the kernel half of the address space.
    SegmentOutOfRange,
    /// Segment collides with another segment or a fixed mapping.
    SegmentOverlap,
}

impl fmt::Display for ElfError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            ElfError::TooSmall => "image smaller than an ELF header",
            ElfError::BadMagic => "bad magic",
            ElfError::Not32Bit => "not ELFCLASS32",
            ElfError::NotLittleEndian => "not little-endian",
            ElfError::BadIdentVersion => "bad ident version",
            ElfError::WrongAbi => "not a CloudABI executable",
            ElfError::NotExecutable => "neither ET_EXEC nor ET_DYN",
            ElfError::WrongMachine => "not an i386 executable",
            ElfError::BadVersion => "bad ELF version",
            ElfError::BadPhdr => "program header table outside image",
            ElfError::BadSegment => "segment data outside image",
            ElfError::UnalignedSegment => "segment not page aligned",
            ElfError::SegmentOutOfRange => "segment in kernel space",
            ElfError::SegmentOverlap => "segment overlaps another mapping",
        };
        f.write_str(reason)
    }
}

impl From<ElfError> for Errno {
    fn from(_: ElfError) -> Self {
        Errno::NoExec
    }
}

/// A loadable segment, validated against the image.
#[derive(Debug, Clone, Copy)]
pub struct Segment<'a> {
    pub vaddr: u32,
    pub memsz: u32,
    pub flags: u32,
    /// The `p_filesz` bytes copied from the image.
    pub data: &'a [u8],
}

/// Information extracted from a validated ELF32 executable.
pub struct ElfInfo<'a> {
    pub data: &'a [u8],
    pub header: Elf32Header,
}

impl<'a> ElfInfo<'a> {
    pub fn entry(&self) -> u32 {
        self.header.e_entry
    }

    pub fn phnum(&self) -> usize {
        self.header.e_phnum as usize
    }

    /// The raw program header table, as it appears in the image.
    pub fn phdr_table(&self) -> &'a [u8] {
        let start = self.header.e_phoff as usize;
        &self.data[start..start + self.phnum() * PHDR_SIZE]
    }

    pub fn program_headers(&self) -> impl Iterator<Item = Elf32Phdr> + 'a {
        self.phdr_table().chunks_exact(PHDR_SIZE).map(Elf32Phdr::read)
    }

    /// Every PT_LOAD segment, checked against the image and the user range.
    pub fn loadable_segments(&self) -> Result<Vec<Segment<'a>>, ElfError> {
        let mut segments = Vec::new();
        for phdr in self.program_headers().filter(Elf32Phdr::is_load) {
            let start = phdr.p_offset as usize;
            let end = start
                .checked_add(phdr.p_filesz as usize)
                .ok_or(ElfError::BadSegment)?;
            if end > self.data.len() || phdr.p_filesz > phdr.p_memsz {
                return Err(ElfError::BadSegment);
            }
            if phdr.p_vaddr as usize % PAGE_SIZE != 0 {
                return Err(ElfError::UnalignedSegment);
            }
            if phdr.p_vaddr as u64 + phdr.p_memsz as u64 > KERNEL_BASE as u64 {
                return Err(ElfError::SegmentOutOfRange);
            }
            segments.push(Segment {
                vaddr: phdr.p_vaddr,
                memsz: phdr.p_memsz,
                flags: phdr.p_flags,
                data: &self.data[start..end],
            });
        }
        Ok(segments)
    }
}

/// Parse and validate an ELF32 executable from a byte slice.
pub fn parse(data: &[u8]) -> Result<ElfInfo<'_>, ElfError> {
    if data.len() < EHDR_SIZE {
        return Err(ElfError::TooSmall);
    }

    let hdr = Elf32Header::read(data);
    let ident = &hdr.e_ident;

    if ident[0..4] != ELF_MAGIC {
        return Err(ElfError::BadMagic);
    }
    if ident[EI_CLASS] != ELFCLASS32 {
        return Err(ElfError::Not32Bit);
    }
    if ident[EI_DATA] != ELFDATA2LSB {
        return Err(ElfError::NotLittleEndian);
    }
    if ident[EI_VERSION] != 1 {
        return Err(ElfError::BadIdentVersion);
    }
    if ident[EI_OSABI] != ELFOSABI_CLOUDABI || ident[EI_ABIVERSION] != 0 {
        return Err(ElfError::WrongAbi);
    }
    if hdr.e_type != ET_EXEC && hdr.e_type != ET_DYN {
        return Err(ElfError::NotExecutable);
    }
    if hdr.e_machine != EM_386 {
        return Err(ElfError::WrongMachine);
    }
    if hdr.e_version != EV_CURRENT {
        return Err(ElfError::BadVersion);
    }

    let phnum = hdr.e_phnum as usize;
    if phnum > 0 && hdr.e_phentsize as usize != PHDR_SIZE {
        return Err(ElfError::BadPhdr);
    }
    let phdrs_end = (hdr.e_phoff as usize)
        .checked_add(phnum * PHDR_SIZE)
        .ok_or(ElfError::BadPhdr)?;
    if phdrs_end > data.len() {
        return Err(ElfError::BadPhdr);
    }

    Ok(ElfInfo { data, header: hdr })
}
