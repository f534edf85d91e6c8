//! User address-space layout and kernel limits.
//!
//! ```text
//!   0x0000_0000 ┌──────────────────────────┐
//!               │ ELF segments             │
//!   0x7FFF_0000 ├──────────────────────────┤
//!               │ main thread stack (64K)  │
//!   0x8000_0000 ├──────────────────────────┤ STACK_TOP
//!               │ auxv   @ 0x8001_0000     │
//!               │ vdso   @ 0x8004_0000     │
//!               │ phdrs  @ 0x8006_0000     │
//!               │ argdata@ 0x8010_0000     │
//!   0x9000_0000 ├──────────────────────────┤
//!               │ mem_map() free range     │
//!   0xC000_0000 ├──────────────────────────┤ KERNEL_BASE
//!               │ kernel (shared tables)   │
//!   0xFFFF_FFFF └──────────────────────────┘
//! ```

/// Size of a page and of a physical frame.
pub const PAGE_SIZE: usize = 4096;

/// Entries in a page directory or a page table.
pub const PAGE_TABLE_ENTRIES: usize = 1024;

/// Page tables owned by a process. The rest of the directory maps the kernel.
pub const USER_PAGE_TABLES: usize = 0x300;

/// First kernel virtual address. Directory slot `USER_PAGE_TABLES`.
pub const KERNEL_BASE: u32 = 0xC000_0000;

// ── Fixed user mappings ─────────────────────────────────────────

/// Highest address (exclusive) of the main thread stack.
pub const STACK_TOP: u32 = 0x8000_0000;

/// Main thread stack size.
pub const STACK_SIZE: usize = 0x1_0000;

/// Auxiliary vector.
pub const AUXV_ADDR: u32 = 0x8001_0000;

/// VDSO image.
pub const VDSO_ADDR: u32 = 0x8004_0000;

/// Copy of the executable's program header table.
pub const PHDR_ADDR: u32 = 0x8006_0000;

/// Argument data blob.
pub const ARGDATA_ADDR: u32 = 0x8010_0000;

// ── Free range search ───────────────────────────────────────────

/// Where `find_free_virtual_range` starts looking.
pub const FREE_RANGE_START: u32 = 0x9000_0000;

/// Where `find_free_virtual_range` gives up.
pub const FREE_RANGE_END: u32 = 0xC000_0000;

// ── Limits ──────────────────────────────────────────────────────

/// Largest executable image exec() will stage (10 MiB).
pub const MAX_EXEC_IMAGE: usize = 10 * 1024 * 1024;

/// exec() reads the image in chunks of this size.
pub const EXEC_READ_CHUNK: usize = 1024;

/// Upper bound on descriptor slots per process.
pub const MAX_FDS: usize = 1024;

// ── Physical memory model ───────────────────────────────────────

/// Low physical memory mapped at `KERNEL_BASE` by the shared kernel table.
pub const KERNEL_LOW_MEMORY: u32 = 4 * 1024 * 1024;

/// First physical address handed out by the frame allocator.
pub const FRAME_BASE: u32 = KERNEL_LOW_MEMORY;

/// Kernel mappings checked before a page directory is installed:
/// the VGA text buffer and a kernel text address.
pub const PAGING_PROBES: [(u32, u32); 2] = [(0xC00B_8000, 0x000B_8000), (0xC010_31C6, 0x0010_31C6)];
