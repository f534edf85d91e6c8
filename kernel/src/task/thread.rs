//! Threads: the unit the scheduler runs and conditions wake.

use alloc::sync::{Arc, Weak};

use spin::Mutex;

use crate::task::process::Process;
use crate::task::scheduler::Scheduler;

pub type ThreadId = u32;

/// Id of the first thread after exec.
pub const MAIN_THREAD: ThreadId = 1;

/// EFLAGS with only the interrupt flag and the reserved bit set.
const USER_EFLAGS: u32 = 0x202;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    /// Waiting in the run queue.
    Ready,
    /// Currently running.
    Running,
    /// Waiting for a condition to be satisfied.
    Blocked,
    /// Finished; never runs again.
    Exited,
}

/// Saved i386 register state of a thread.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct Context {
    pub eax: u32,
    pub ebx: u32,
    pub ecx: u32,
    pub edx: u32,
    pub esi: u32,
    pub edi: u32,
    pub ebp: u32,
    pub esp: u32,
    pub eip: u32,
    pub eflags: u32,
}

impl Context {
    /// Context that starts executing at `entry` with the given stack pointer.
    pub const fn user_entry(entry: u32, stack_pointer: u32) -> Self {
        Self {
            eax: 0,
            ebx: 0,
            ecx: 0,
            edx: 0,
            esi: 0,
            edi: 0,
            ebp: 0,
            esp: stack_pointer,
            eip: entry,
            eflags: USER_EFLAGS,
        }
    }
}

pub struct Thread {
    tid: ThreadId,
    process: Weak<Process>,
    scheduler: Weak<dyn Scheduler>,
    state: Mutex<ThreadState>,
    context: Mutex<Context>,
}

impl Thread {
    /// A new ready thread of `process`.
    pub fn new(
        tid: ThreadId,
        process: Weak<Process>,
        scheduler: &Arc<dyn Scheduler>,
        context: Context,
    ) -> Arc<Self> {
        Arc::new(Self {
            tid,
            process,
            scheduler: Arc::downgrade(scheduler),
            state: Mutex::new(ThreadState::Ready),
            context: Mutex::new(context),
        })
    }

    /// A thread that belongs to no process.
    pub fn kernel(tid: ThreadId, scheduler: &Arc<dyn Scheduler>) -> Arc<Self> {
        Self::new(tid, Weak::new(), scheduler, Context::default())
    }

    pub fn tid(&self) -> ThreadId {
        self.tid
    }

    /// The owning process, if it is still alive.
    pub fn process(&self) -> Option<Arc<Process>> {
        self.process.upgrade()
    }

    pub fn context(&self) -> Context {
        *self.context.lock()
    }

    pub fn set_context(&self, context: Context) {
        *self.context.lock() = context;
    }

    pub fn state(&self) -> ThreadState {
        *self.state.lock()
    }

    /// Scheduler bookkeeping only. Everything else goes through
    /// `thread_block`, `thread_unblock` and `thread_exit`.
    pub fn set_state(&self, state: ThreadState) {
        *self.state.lock() = state;
    }

    pub fn is_blocked(&self) -> bool {
        self.state() == ThreadState::Blocked
    }

    pub fn is_exited(&self) -> bool {
        self.state() == ThreadState::Exited
    }

    /// Enter the blocked state without giving up the CPU yet.
    ///
    /// A condition satisfied between this call and `thread_block` makes
    /// the thread ready again, so `thread_block` returns immediately.
    pub fn mark_blocked(&self) {
        let mut state = self.state.lock();
        if *state != ThreadState::Exited {
            *state = ThreadState::Blocked;
        }
    }

    /// Suspend until some other party calls `thread_unblock`.
    pub fn thread_block(self: &Arc<Self>) {
        self.mark_blocked();
        match self.scheduler.upgrade() {
            Some(scheduler) => scheduler.thread_block(self),
            None => panic!("thread {} blocked without a scheduler", self.tid),
        }
    }

    pub fn thread_unblock(self: &Arc<Self>) {
        match self.scheduler.upgrade() {
            Some(scheduler) => scheduler.thread_ready(self),
            None => self.set_state(ThreadState::Ready),
        }
    }

    /// Mark the thread finished and take it off the scheduler.
    pub fn thread_exit(self: &Arc<Self>) {
        self.set_state(ThreadState::Exited);
        if let Some(scheduler) = self.scheduler.upgrade() {
            scheduler.thread_exiting(self);
        }
    }
}

impl core::fmt::Debug for Thread {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Thread")
            .field("tid", &self.tid)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::RoundRobin;

    #[test]
    fn test_user_entry_context() {
        let ctx = Context::user_entry(0x0804_8000, 0x7FFF_FFF8);
        assert_eq!(ctx.eip, 0x0804_8000);
        assert_eq!(ctx.esp, 0x7FFF_FFF8);
        assert_eq!(ctx.eflags, 0x202);
        assert_eq!(ctx.eax, 0);
    }

    #[test]
    fn test_state_transitions() {
        let scheduler: Arc<dyn Scheduler> = Arc::new(RoundRobin::new());
        let thread = Thread::kernel(7, &scheduler);
        assert_eq!(thread.state(), ThreadState::Ready);
        assert!(thread.process().is_none());

        thread.mark_blocked();
        assert!(thread.is_blocked());
        thread.thread_unblock();
        assert_eq!(thread.state(), ThreadState::Ready);

        thread.thread_exit();
        assert!(thread.is_exited());
        thread.mark_blocked();
        assert!(thread.is_exited());
    }
}
