//! Threads, scheduling and processes.

pub mod exec;
pub mod pipe;
pub mod process;
#[cfg(any(test, feature = "hosted"))]
pub mod round_robin;
pub mod scheduler;
pub mod signal;
pub mod thread;
pub mod userland;

pub use pipe::Pipe;
pub use process::{ExitCode, MapRequest, Pid, Process};
#[cfg(any(test, feature = "hosted"))]
pub use round_robin::RoundRobin;
pub use scheduler::Scheduler;
pub use signal::Signal;
pub use thread::{Context, MAIN_THREAD, Thread, ThreadId, ThreadState};
