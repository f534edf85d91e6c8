//! Recoverable kernel errors.
//!
//! Anything here is reported back to the system call that caused it.
//! Broken kernel invariants are not errors; they `panic!`.

use core::fmt;

/// System call error numbers (CloudABI numbering).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum Errno {
    /// Argument list or image too long.
    TooBig = 1,
    /// Descriptor number out of range.
    BadF = 8,
    /// Address not mapped in the process.
    Fault = 21,
    /// Invalid argument, or an empty descriptor slot.
    Inval = 28,
    /// I/O error reported by a resource.
    Io = 29,
    /// Descriptor table is full.
    MFile = 33,
    /// Not a loadable executable.
    NoExec = 45,
    /// No room in the address space or in physical memory.
    NoMem = 48,
    /// Descriptor lacks the required rights.
    NotCapable = 76,
}

impl Errno {
    pub fn as_str(&self) -> &'static str {
        match self {
            Errno::TooBig => "argument list too long",
            Errno::BadF => "bad file descriptor",
            Errno::Fault => "bad address",
            Errno::Inval => "invalid argument",
            Errno::Io => "I/O error",
            Errno::MFile => "too many open files",
            Errno::NoExec => "executable format error",
            Errno::NoMem => "not enough space",
            Errno::NotCapable => "capabilities insufficient",
        }
    }

    /// Raw value as seen by userland.
    pub fn code(self) -> u16 {
        self as u16
    }
}

impl fmt::Display for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::error::Error for Errno {}

/// Physical memory ran out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocError;

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("out of physical frames")
    }
}

impl From<AllocError> for Errno {
    fn from(_: AllocError) -> Self {
        Errno::NoMem
    }
}
