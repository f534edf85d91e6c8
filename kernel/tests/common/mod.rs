//! Shared setup for the integration tests: a hosted kernel, log output on
//! stderr, and a tiny ELF32 assembler.
#![allow(dead_code)]

use std::sync::Arc;

use cirrus_kernel::Kernel;
use cirrus_kernel::fs::{FileDescriptor, MemoryFile};
use cirrus_kernel::memory::PhysicalMemory;
use cirrus_kernel::task::{RoundRobin, Thread};

/// Where test images are linked.
pub const LOAD_ADDR: u32 = 0x0804_8000;

struct Stderr;

impl klog::Console for Stderr {
    fn write_str(&self, s: &str) {
        eprint!("{}", s);
    }
}

static STDERR: Stderr = Stderr;

pub fn init_logging() {
    // Every test binary runs several tests; only the first install wins.
    let _ = klog::init(&STDERR, klog::Level::Debug);
}

pub struct Machine {
    pub kernel: Arc<Kernel>,
    pub rr: Arc<RoundRobin>,
}

impl Machine {
    pub fn new() -> Self {
        init_logging();
        let rr = Arc::new(RoundRobin::new());
        let kernel = Kernel::new(Arc::new(PhysicalMemory::new(1024)), rr.clone());
        Self { kernel, rr }
    }

    /// A kernel thread that is not part of any process, made current.
    pub fn current_kernel_thread(&self, tid: u32) -> Arc<Thread> {
        let thread = Thread::kernel(tid, self.kernel.scheduler());
        self.rr.set_current(&thread);
        thread
    }
}

pub fn file(name: &str, data: Vec<u8>) -> Arc<dyn FileDescriptor> {
    Arc::new(MemoryFile::new(name, data))
}

/// One loadable segment: virtual address, file bytes, size in memory.
pub struct Seg {
    pub vaddr: u32,
    pub data: Vec<u8>,
    pub memsz: u32,
}

/// Assemble a CloudABI i386 executable: header, program headers, then
/// the segment bytes in order.
pub fn elf(segments: &[Seg], entry: u32) -> Vec<u8> {
    const EHDR: usize = 52;
    const PHDR: usize = 32;
    let phoff = EHDR;
    let mut data_offset = EHDR + PHDR * segments.len();

    let mut out = Vec::new();
    out.extend_from_slice(&[0x7F, b'E', b'L', b'F', 1, 1, 1, 17, 0, 0, 0, 0, 0, 0, 0, 0]);
    out.extend_from_slice(&2u16.to_le_bytes()); // ET_EXEC
    out.extend_from_slice(&3u16.to_le_bytes()); // EM_386
    out.extend_from_slice(&1u32.to_le_bytes());
    out.extend_from_slice(&entry.to_le_bytes());
    out.extend_from_slice(&(phoff as u32).to_le_bytes());
    out.extend_from_slice(&0u32.to_le_bytes());
    out.extend_from_slice(&0u32.to_le_bytes());
    out.extend_from_slice(&(EHDR as u16).to_le_bytes());
    out.extend_from_slice(&(PHDR as u16).to_le_bytes());
    out.extend_from_slice(&(segments.len() as u16).to_le_bytes());
    out.extend_from_slice(&40u16.to_le_bytes());
    out.extend_from_slice(&0u16.to_le_bytes());
    out.extend_from_slice(&0u16.to_le_bytes());
    assert_eq!(out.len(), EHDR);

    for seg in segments {
        let fields = [
            1, // PT_LOAD
            data_offset as u32,
            seg.vaddr,
            seg.vaddr,
            seg.data.len() as u32,
            seg.memsz,
            5, // R+X
            0x1000,
        ];
        for field in fields {
            out.extend_from_slice(&field.to_le_bytes());
        }
        data_offset += seg.data.len();
    }
    for seg in segments {
        out.extend_from_slice(&seg.data);
    }
    out
}

/// 16 bytes of code at [`LOAD_ADDR`] followed by 0x1800 bytes of bss.
pub fn hello() -> Vec<u8> {
    elf(
        &[Seg {
            vaddr: LOAD_ADDR,
            data: vec![0xCC; 16],
            memsz: 0x1810,
        }],
        LOAD_ADDR + 4,
    )
}

/// A descriptor whose reads fail after the first chunk.
pub struct Broken;

impl FileDescriptor for Broken {
    fn name(&self) -> &str {
        "broken"
    }

    fn read(&self, offset: usize, buf: &mut [u8]) -> Result<usize, cirrus_kernel::Errno> {
        if offset > 0 {
            return Err(cirrus_kernel::Errno::Io);
        }
        buf.fill(0x7F);
        Ok(buf.len())
    }
}
