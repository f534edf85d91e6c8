//! Waiting on several conditions at once.

use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::sync::condition::Condition;
use crate::task::Scheduler;

/// Blocks the running thread until at least one of its conditions is
/// satisfied. Lives on the stack of one blocking call.
///
/// Conditions are single use: once a wait ends, every condition has left
/// its signaler.
#[derive(Default)]
pub struct ConditionWaiter {
    conditions: Vec<Arc<Condition>>,
}

impl ConditionWaiter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_condition(&mut self, condition: Arc<Condition>) {
        self.conditions.push(condition);
    }

    pub fn conditions(&self) -> &[Arc<Condition>] {
        &self.conditions
    }

    /// Block until one of the conditions is satisfied.
    pub fn wait(&mut self, scheduler: &dyn Scheduler) {
        if self.conditions.is_empty() {
            panic!("wait() without any condition");
        }
        let thread = match scheduler.running_thread() {
            Some(thread) => thread,
            None => panic!("wait() outside of any thread"),
        };

        // Blocked before any predicate runs: a satisfy from here on
        // finds the thread blocked and readies it again.
        thread.mark_blocked();

        let mut satisfied = false;
        for condition in &self.conditions {
            let signaler = match condition.signaler() {
                Some(signaler) => signaler,
                None => panic!("wait() on detached {:?}", condition),
            };
            condition.set_thread(&thread);
            condition.set_satisfied(false);
            if !satisfied {
                signaler.subscribe(condition);
            }
            if signaler.already_satisfied(condition) {
                if !condition.is_satisfied() {
                    condition.satisfy();
                }
                satisfied = true;
            }
        }
        // A notify may have landed while the predicates ran.
        satisfied = satisfied || self.conditions.iter().any(|c| c.is_satisfied());

        if !satisfied {
            scheduler.thread_block(&thread);
        }

        for condition in &self.conditions {
            if condition.has_thread() && !condition.is_satisfied() {
                condition.cancel();
            }
        }
    }

    /// Hand over the satisfied conditions and forget the rest.
    pub fn finish(&mut self) -> Vec<Arc<Condition>> {
        let mut conditions = core::mem::take(&mut self.conditions);
        conditions.retain(|c| c.is_satisfied());
        if conditions.is_empty() {
            panic!("finish() without a satisfied condition");
        }
        conditions
    }
}

impl Drop for ConditionWaiter {
    fn drop(&mut self) {
        for condition in &self.conditions {
            if condition.signaler().is_some() {
                condition.cancel();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::condition::Signaler;
    use crate::task::{RoundRobin, Thread};

    fn setup() -> (Arc<RoundRobin>, Arc<dyn Scheduler>, Arc<Thread>) {
        let rr = Arc::new(RoundRobin::new());
        let scheduler: Arc<dyn Scheduler> = rr.clone();
        let thread = Thread::kernel(1, &scheduler);
        rr.set_current(&thread);
        (rr, scheduler, thread)
    }

    #[test]
    fn test_already_satisfied_returns_without_blocking() {
        let (_rr, scheduler, thread) = setup();
        let signalers: Vec<_> = (0..3).map(|_| Signaler::new()).collect();
        signalers[1].set_already_satisfied_function(|_| true);

        let mut waiter = ConditionWaiter::new();
        let conditions: Vec<_> = signalers.iter().map(Condition::new).collect();
        for c in &conditions {
            waiter.add_condition(c.clone());
        }
        waiter.wait(scheduler.as_ref());

        assert!(!thread.is_blocked());
        let done = waiter.finish();
        assert_eq!(done.len(), 1);
        assert!(Arc::ptr_eq(&done[0], &conditions[1]));
        for s in &signalers {
            assert_eq!(s.subscriber_count(), 0);
        }
    }

    #[test]
    fn test_blocks_until_notified() {
        let (rr, scheduler, thread) = setup();
        let a = Signaler::new();
        let b = Signaler::new();

        let helper = Thread::kernel(2, &scheduler);
        let wake = b.clone();
        rr.spawn(&helper, move || {
            wake.notify();
        });

        let mut waiter = ConditionWaiter::new();
        let ca = Condition::new(&a);
        let cb = Condition::new(&b);
        waiter.add_condition(ca.clone());
        waiter.add_condition(cb.clone());
        waiter.wait(scheduler.as_ref());

        assert_eq!(thread.state(), crate::task::ThreadState::Running);
        assert!(cb.is_satisfied());
        assert!(!ca.is_satisfied());
        assert!(!a.is_subscribed(&ca));
        assert_eq!(a.subscriber_count(), 0);
        assert_eq!(waiter.finish().len(), 1);
    }

    #[test]
    fn test_notify_from_predicate_is_not_lost() {
        let (_rr, scheduler, thread) = setup();
        let signaler = Signaler::new();
        // The predicate says no, but wakes the head subscriber while it
        // runs: the subscribe already happened, so that is this wait.
        let weak = Arc::downgrade(&signaler);
        signaler.set_already_satisfied_function(move |_| {
            if let Some(signaler) = weak.upgrade() {
                signaler.notify();
            }
            false
        });

        let mut waiter = ConditionWaiter::new();
        let condition = Condition::new(&signaler);
        waiter.add_condition(condition.clone());
        // Nothing else is runnable: blocking here would be a deadlock panic.
        waiter.wait(scheduler.as_ref());

        assert_eq!(thread.state(), crate::task::ThreadState::Running);
        assert!(condition.is_satisfied());
        assert_eq!(signaler.subscriber_count(), 0);
        let done = waiter.finish();
        assert_eq!(done.len(), 1);
        assert!(Arc::ptr_eq(&done[0], &condition));
    }

    #[test]
    fn test_drop_cancels_outstanding() {
        let signaler = Signaler::new();
        let condition = Condition::new(&signaler);
        signaler.subscribe(&condition);
        {
            let mut waiter = ConditionWaiter::new();
            waiter.add_condition(condition.clone());
        }
        assert_eq!(signaler.subscriber_count(), 0);
        assert!(condition.signaler().is_none());
    }

    #[test]
    #[should_panic(expected = "without a satisfied condition")]
    fn test_finish_requires_satisfied() {
        let signaler = Signaler::new();
        let mut waiter = ConditionWaiter::new();
        waiter.add_condition(Condition::new(&signaler));
        waiter.finish();
    }
}
