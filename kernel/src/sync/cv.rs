//! A kernel condition variable.

use alloc::sync::Arc;

use crate::sync::condition::{Condition, Signaler};
use crate::sync::waiter::ConditionWaiter;
use crate::task::Scheduler;

pub struct CondVar {
    signaler: Arc<Signaler>,
}

impl CondVar {
    pub fn new() -> Self {
        Self {
            signaler: Signaler::new(),
        }
    }

    /// Block the running thread until `notify` or `broadcast`.
    pub fn wait(&self, scheduler: &dyn Scheduler) {
        let mut waiter = ConditionWaiter::new();
        waiter.add_condition(Condition::new(&self.signaler));
        waiter.wait(scheduler);
        waiter.finish();
    }

    /// Wake the longest waiting thread.
    pub fn notify(&self) -> bool {
        self.signaler.notify()
    }

    pub fn broadcast(&self) -> usize {
        self.signaler.broadcast()
    }

    pub fn waiters(&self) -> usize {
        self.signaler.subscriber_count()
    }
}

impl Default for CondVar {
    fn default() -> Self {
        Self::new()
    }
}
