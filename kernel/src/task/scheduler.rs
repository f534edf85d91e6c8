//! The scheduler interface.
//!
//! The core only ever tells the scheduler three things: a thread became
//! ready, a thread is exiting, or the running thread must wait. How the
//! next thread is picked is the scheduler's business.

use alloc::sync::Arc;

use crate::task::thread::Thread;

pub trait Scheduler: Send + Sync {
    /// The thread executing kernel code right now.
    fn running_thread(&self) -> Option<Arc<Thread>>;

    /// `thread` may run again.
    fn thread_ready(&self, thread: &Arc<Thread>);

    /// `thread` is gone; forget everything about it.
    fn thread_exiting(&self, thread: &Arc<Thread>);

    /// Suspend the running, already blocked `thread` until it is made ready.
    fn thread_block(&self, thread: &Arc<Thread>);

    /// Let another ready thread run.
    fn thread_yield(&self);
}
