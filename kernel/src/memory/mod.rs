//! Physical and virtual memory management.

pub mod address;
pub mod address_space;
pub mod frame;
pub mod mapping;
pub mod paging;

pub use address::{PhysAddr, VirtAddr, pages_for};
pub use address_space::AddressSpace;
pub use frame::PhysicalMemory;
pub use mapping::{Backing, MemMapping, Protection};
