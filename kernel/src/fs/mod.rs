//! Descriptors as seen by the process core, and the executable format.
//!
//! Filesystems, pipes and sockets implement [`FileDescriptor`]; the core
//! only ever reads from them (exec images, file-backed mappings).

pub mod elf;

use alloc::string::String;
use alloc::vec::Vec;

use crate::error::Errno;

/// A readable kernel resource.
pub trait FileDescriptor: Send + Sync {
    /// Name used in logs and process names.
    fn name(&self) -> &str;

    /// Read up to `buf.len()` bytes at `offset`. `Ok(0)` means end of file.
    fn read(&self, offset: usize, buf: &mut [u8]) -> Result<usize, Errno>;
}

/// An immutable in-memory file, e.g. a boot module.
pub struct MemoryFile {
    name: String,
    data: Vec<u8>,
}

impl MemoryFile {
    pub fn new(name: &str, data: Vec<u8>) -> Self {
        Self {
            name: String::from(name),
            data,
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl FileDescriptor for MemoryFile {
    fn name(&self) -> &str {
        &self.name
    }

    fn read(&self, offset: usize, buf: &mut [u8]) -> Result<usize, Errno> {
        if offset >= self.data.len() {
            return Ok(0);
        }
        let n = buf.len().min(self.data.len() - offset);
        buf[..n].copy_from_slice(&self.data[offset..offset + n]);
        Ok(n)
    }
}
