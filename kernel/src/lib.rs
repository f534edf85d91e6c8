// =============================================================================
// Cirrus: Kernel Core
// =============================================================================
//
// The process, thread and address-space core of the Cirrus kernel.
//
// WHAT LIVES HERE:
//   - sync     → conditions, signalers and waiters: every blocking kernel
//                operation suspends and resumes threads through these
//   - memory   → 32-bit two-level paging, per-process mappings with lazy
//                backing, and the physical frame allocator
//   - task     → threads, the scheduler interface, processes (exec/fork/exit)
//   - fs       → the descriptor collaborator trait and the ELF32 loader format
//   - cap      → rights-checked descriptor tables
//
// WHAT DOES NOT:
//   Drivers, filesystems and the boot path. They hand this crate a
//   `Kernel` (physical memory + scheduler) and call into processes.
//
// =============================================================================

// The kernel itself builds without std. Unit tests and the `hosted`
// feature link it for the host-thread scheduler.
#![cfg_attr(not(test), no_std)]

// Heap-allocated types (Vec, Box, Arc, String) come from `alloc`.
extern crate alloc;

#[cfg(all(feature = "hosted", not(test)))]
extern crate std;

// =============================================================================
// Module declarations
// =============================================================================

/// Capability-checked descriptor tables.
pub mod cap;

/// Address-space layout constants and limits.
pub mod config;

/// Error types surfaced to system calls.
pub mod error;

/// Descriptor collaborator trait and the ELF32 format.
pub mod fs;

/// The bundle of collaborators every process runs against.
pub mod kernel;

/// Memory management subsystem.
/// Contains: address types, frame allocator, paging, mappings, address spaces.
pub mod memory;

/// Synchronization primitives.
/// Contains: conditions, signalers, waiters, kernel condition variables.
pub mod sync;

/// Threads, scheduling and processes.
pub mod task;

pub use error::Errno;
pub use kernel::Kernel;
