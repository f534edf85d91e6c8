// =============================================================================
// Cirrus: Physical and Virtual Address Types
// =============================================================================
//
// PhysAddr and VirtAddr are separate newtypes so the compiler refuses to use
// one where the other is expected. Converting between them always goes
// through a page directory walk.
//
// i386 ADDRESS SPACE (no PAE):
//   - 32-bit virtual addresses, split 10/10/12:
//
//       31        22 21        12 11          0
//       ┌───────────┬───────────┬─────────────┐
//       │ directory │   table   │   offset    │
//       └───────────┴───────────┴─────────────┘
//
//   - 0x0000_0000 .. 0xC000_0000 belongs to the process
//   - 0xC000_0000 .. 0xFFFF_FFFF belongs to the kernel (shared tables)
//
// =============================================================================

use core::fmt;

use crate::config::{KERNEL_BASE, PAGE_SIZE};

// =============================================================================
// PhysAddr: a physical memory address
// =============================================================================

/// A physical memory address.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct PhysAddr(u32);

impl PhysAddr {
    #[inline]
    pub const fn new(addr: u32) -> Self {
        Self(addr)
    }

    #[inline]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// Returns true if this address is aligned to a 4KB page boundary.
    #[inline]
    pub const fn is_page_aligned(self) -> bool {
        self.0 & 0xFFF == 0
    }

    /// Aligns this address down to the nearest 4KB page boundary.
    #[inline]
    pub const fn page_align_down(self) -> Self {
        Self(self.0 & !0xFFF)
    }
}

/// The `P:` prefix distinguishes physical from virtual addresses in log output.
impl fmt::Debug for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "P:{:#010X}", self.0)
    }
}

impl fmt::Display for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "P:{:#010X}", self.0)
    }
}

impl core::ops::Add<u32> for PhysAddr {
    type Output = Self;
    #[inline]
    fn add(self, offset: u32) -> Self {
        Self(self.0 + offset)
    }
}

// =============================================================================
// VirtAddr: a virtual memory address
// =============================================================================

/// A virtual memory address in a 32-bit address space.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct VirtAddr(u32);

impl VirtAddr {
    #[inline]
    pub const fn new(addr: u32) -> Self {
        Self(addr)
    }

    #[inline]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// Widened to `u64` so range ends past 4 GiB don't wrap.
    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0 as u64
    }

    /// Returns true if this address lies in the kernel's shared range.
    #[inline]
    pub const fn is_kernel(self) -> bool {
        self.0 >= KERNEL_BASE
    }

    #[inline]
    pub const fn is_page_aligned(self) -> bool {
        self.0 & 0xFFF == 0
    }

    #[inline]
    pub const fn page_align_down(self) -> Self {
        Self(self.0 & !0xFFF)
    }

    /// Page directory slot covering this address.
    #[inline]
    pub const fn directory_index(self) -> usize {
        (self.0 >> 22) as usize
    }

    /// Page table slot covering this address.
    #[inline]
    pub const fn table_index(self) -> usize {
        ((self.0 >> 12) & 0x3FF) as usize
    }

    /// Extracts the 12-bit page offset.
    #[inline]
    pub const fn page_offset(self) -> usize {
        (self.0 & 0xFFF) as usize
    }
}

impl fmt::Debug for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "V:{:#010X}", self.0)
    }
}

impl fmt::Display for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "V:{:#010X}", self.0)
    }
}

impl core::ops::Add<u32> for VirtAddr {
    type Output = Self;
    #[inline]
    fn add(self, offset: u32) -> Self {
        Self(self.0 + offset)
    }
}

/// Number of pages needed to hold `len` bytes.
#[inline]
pub const fn pages_for(len: usize) -> usize {
    len.div_ceil(PAGE_SIZE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_virt_indices() {
        let addr = VirtAddr::new(0xC010_31C6);
        assert_eq!(addr.directory_index(), 0x300);
        assert_eq!(addr.table_index(), 0x103);
        assert_eq!(addr.page_offset(), 0x1C6);
        assert!(addr.is_kernel());
        assert_eq!(addr.page_align_down(), VirtAddr::new(0xC010_3000));
    }

    #[test]
    fn test_pages_for() {
        assert_eq!(pages_for(0), 0);
        assert_eq!(pages_for(1), 1);
        assert_eq!(pages_for(PAGE_SIZE), 1);
        assert_eq!(pages_for(PAGE_SIZE + 1), 2);
    }
}
