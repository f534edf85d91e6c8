//! Descriptor capabilities: rights-carrying handles to kernel resources.
//!
//! A process only reaches a resource through a slot in its [`FdTable`].
//! Each slot pairs the shared resource with two rights masks:
//! `rights_base` (what this handle may do) and `rights_inheriting`
//! (what handles derived from it may do).
//!
//! **Security invariants:**
//! - Rights only ever narrow. `restrict` and `derive` AND masks together;
//!   `dup` copies them unchanged. Nothing widens a handle's rights.
//! - Slots are plain indices. Closed slots are reused lowest-first.

use alloc::sync::Arc;
use alloc::vec::Vec;

use bitflags::bitflags;

use crate::config::MAX_FDS;
use crate::error::Errno;
use crate::fs::FileDescriptor;

// ── Rights ──────────────────────────────────────────────────────

bitflags! {
	/// Capability bits, CloudABI layout.
	#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
	pub struct Rights: u64 {
		const FD_DATASYNC = 1 << 0;
		const FD_READ = 1 << 1;
		const FD_SEEK = 1 << 2;
		const FD_STAT_PUT_FLAGS = 1 << 3;
		const FD_SYNC = 1 << 4;
		const FD_TELL = 1 << 5;
		const FD_WRITE = 1 << 6;
		const FILE_CREATE_DIRECTORY = 1 << 9;
		const FILE_CREATE_FILE = 1 << 10;
		const FILE_LINK_SOURCE = 1 << 12;
		const FILE_LINK_TARGET = 1 << 13;
		const FILE_OPEN = 1 << 14;
		const FILE_READDIR = 1 << 15;
		const FILE_STAT_GET = 1 << 22;
		const MEM_MAP = 1 << 26;
		const MEM_MAP_EXEC = 1 << 27;
		const POLL_FD_READWRITE = 1 << 28;
		const POLL_PROC_TERMINATE = 1 << 30;
		const PROC_EXEC = 1 << 32;
		const SOCK_SHUTDOWN = 1 << 39;

		const ALL = u64::MAX;
	}
}

// ── Descriptor mapping ──────────────────────────────────────────

pub type Fd = u32;

/// One slot of a descriptor table.
#[derive(Clone)]
pub struct FdMapping {
	pub fd: Arc<dyn FileDescriptor>,
	pub rights_base: Rights,
	pub rights_inheriting: Rights,
}

impl FdMapping {
	pub fn new(fd: Arc<dyn FileDescriptor>, rights_base: Rights, rights_inheriting: Rights) -> Self {
		Self { fd, rights_base, rights_inheriting }
	}

	/// A mapping for `fd` obtained through this one (e.g. a file opened
	/// from this directory). Both masks are capped by our inheriting rights.
	pub fn derive(&self, fd: Arc<dyn FileDescriptor>, base: Rights, inheriting: Rights) -> Self {
		Self {
			fd,
			rights_base: base & self.rights_inheriting,
			rights_inheriting: inheriting & self.rights_inheriting,
		}
	}

	#[inline]
	pub fn has_rights(&self, required: Rights) -> bool {
		self.rights_base.contains(required)
	}

	/// Whether both mappings refer to the same resource.
	pub fn same_resource(&self, other: &FdMapping) -> bool {
		same_descriptor(&self.fd, &other.fd)
	}
}

impl core::fmt::Debug for FdMapping {
	fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
		f.debug_struct("FdMapping")
			.field("fd", &self.fd.name())
			.field("rights_base", &self.rights_base)
			.field("rights_inheriting", &self.rights_inheriting)
			.finish()
	}
}

fn same_descriptor(a: &Arc<dyn FileDescriptor>, b: &Arc<dyn FileDescriptor>) -> bool {
	core::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}

// ── Descriptor table ────────────────────────────────────────────

/// Per-process descriptor table. Grows on demand up to [`MAX_FDS`].
#[derive(Clone, Default)]
pub struct FdTable {
	slots: Vec<Option<FdMapping>>,
}

impl FdTable {
	pub fn new() -> Self {
		Self::default()
	}

	/// A table holding `mappings` at descriptors `0..n`, in order.
	pub fn from_mappings(mappings: Vec<FdMapping>) -> Self {
		Self {
			slots: mappings.into_iter().map(Some).collect(),
		}
	}

	/// Number of open descriptors.
	pub fn count(&self) -> usize {
		self.slots.iter().filter(|s| s.is_some()).count()
	}

	/// Add a descriptor in the lowest free slot.
	pub fn add(&mut self, fd: Arc<dyn FileDescriptor>, rights_base: Rights, rights_inheriting: Rights) -> Result<Fd, Errno> {
		self.insert(FdMapping::new(fd, rights_base, rights_inheriting))
	}

	pub fn insert(&mut self, mapping: FdMapping) -> Result<Fd, Errno> {
		if let Some(index) = self.slots.iter().position(|s| s.is_none()) {
			self.slots[index] = Some(mapping);
			return Ok(index as Fd);
		}
		if self.slots.len() >= MAX_FDS {
			log::warn!("descriptor table full ({} entries)", MAX_FDS);
			return Err(Errno::MFile);
		}
		self.slots.push(Some(mapping));
		Ok((self.slots.len() - 1) as Fd)
	}

	/// Look up `num`, requiring at least `required` base rights.
	pub fn get(&self, num: Fd, required: Rights) -> Result<&FdMapping, Errno> {
		let index = num as usize;
		if index >= MAX_FDS {
			log::debug!("fd {} is out of range", num);
			return Err(Errno::BadF);
		}
		let mapping = match self.slots.get(index) {
			Some(Some(mapping)) => mapping,
			_ => {
				log::debug!("fd {} is not open", num);
				return Err(Errno::Inval);
			}
		};
		if !mapping.has_rights(required) {
			log::debug!(
				"fd {} has insufficient rights: holds {:#x}, needs {:#x}",
				num,
				mapping.rights_base.bits(),
				required.bits()
			);
			return Err(Errno::NotCapable);
		}
		Ok(mapping)
	}

	pub fn close(&mut self, num: Fd) -> Result<FdMapping, Errno> {
		self.get(num, Rights::empty())?;
		match self.slots[num as usize].take() {
			Some(mapping) => Ok(mapping),
			None => Err(Errno::Inval),
		}
	}

	/// A new descriptor for the same resource with identical rights.
	pub fn dup(&mut self, num: Fd) -> Result<Fd, Errno> {
		let mapping = self.get(num, Rights::empty())?.clone();
		self.insert(mapping)
	}

	/// Drop rights from `num`. Rights not held already are ignored.
	pub fn restrict(&mut self, num: Fd, rights_base: Rights, rights_inheriting: Rights) -> Result<(), Errno> {
		self.get(num, Rights::empty())?;
		if let Some(mapping) = self.slots[num as usize].as_mut() {
			mapping.rights_base &= rights_base;
			mapping.rights_inheriting &= rights_inheriting;
		}
		Ok(())
	}

	/// Swap in a whole new table. Returns how many of the old descriptors
	/// were closed because the new table no longer refers to them.
	pub fn replace(&mut self, mappings: Vec<FdMapping>) -> usize {
		let old = core::mem::replace(self, Self::from_mappings(mappings));
		old.iter()
			.filter(|(_, m)| !self.iter().any(|(_, n)| n.same_resource(m)))
			.count()
	}

	pub fn iter(&self) -> impl Iterator<Item = (Fd, &FdMapping)> {
		self.slots
			.iter()
			.enumerate()
			.filter_map(|(i, s)| s.as_ref().map(|m| (i as Fd, m)))
	}
}
