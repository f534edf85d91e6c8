//! Conditions and signalers, the building block of every blocking wait.
//!
//! A [`Signaler`] belongs to a resource that can be waited on (a pipe, a
//! process's termination). A [`Condition`] is one waiter's interest in one
//! signaler. Satisfying a condition wakes its thread and detaches the
//! condition from the signaler.
//!
//! Neither side keeps the other alive: the signaler holds its subscribers
//! weakly, and a condition refers to its signaler and thread weakly.

use alloc::collections::VecDeque;
use alloc::sync::{Arc, Weak};

use spin::Mutex;

use crate::task::Thread;

struct ConditionState {
    /// `None` once satisfied, canceled, or orphaned by the signaler.
    signaler: Option<Weak<Signaler>>,
    thread: Weak<Thread>,
    satisfied: bool,
}

pub struct Condition {
    state: Mutex<ConditionState>,
}

impl Condition {
    pub fn new(signaler: &Arc<Signaler>) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(ConditionState {
                signaler: Some(Arc::downgrade(signaler)),
                thread: Weak::new(),
                satisfied: false,
            }),
        })
    }

    /// The signaler this condition is still attached to.
    pub fn signaler(&self) -> Option<Arc<Signaler>> {
        self.state.lock().signaler.as_ref().and_then(Weak::upgrade)
    }

    pub fn is_satisfied(&self) -> bool {
        self.state.lock().satisfied
    }

    /// Whether a live thread still waits on this condition.
    pub fn has_thread(&self) -> bool {
        self.state.lock().thread.strong_count() > 0
    }

    pub(crate) fn set_thread(&self, thread: &Arc<Thread>) {
        self.state.lock().thread = Arc::downgrade(thread);
    }

    pub(crate) fn set_satisfied(&self, satisfied: bool) {
        self.state.lock().satisfied = satisfied;
    }

    /// Mark satisfied, wake the waiting thread and leave the signaler.
    pub fn satisfy(&self) {
        let thread = {
            let mut state = self.state.lock();
            state.satisfied = true;
            state.thread.upgrade()
        };
        if let Some(thread) = thread {
            if thread.is_blocked() {
                thread.thread_unblock();
            }
        }
        self.reset();
    }

    /// Leave the signaler without being satisfied.
    pub fn cancel(&self) {
        self.reset();
    }

    fn reset(&self) {
        let signaler = {
            let mut state = self.state.lock();
            state.thread = Weak::new();
            state.signaler.take()
        };
        if let Some(signaler) = signaler.and_then(|s| s.upgrade()) {
            signaler.remove(self);
        }
    }
}

impl Drop for Condition {
    fn drop(&mut self) {
        let signaler = self.state.get_mut().signaler.take();
        if let Some(signaler) = signaler.and_then(|s| s.upgrade()) {
            signaler.remove(self);
        }
    }
}

impl core::fmt::Debug for Condition {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Condition")
            .field("attached", &state.signaler.is_some())
            .field("satisfied", &state.satisfied)
            .finish()
    }
}

type AlreadySatisfied = Arc<dyn Fn(&Condition) -> bool + Send + Sync>;

pub struct Signaler {
    /// Oldest subscriber first.
    subscribers: Mutex<VecDeque<Weak<Condition>>>,
    already_satisfied: Mutex<Option<AlreadySatisfied>>,
}

impl Signaler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            subscribers: Mutex::new(VecDeque::new()),
            already_satisfied: Mutex::new(None),
        })
    }

    /// Install the predicate that lets a wait finish without blocking.
    pub fn set_already_satisfied_function(
        &self,
        predicate: impl Fn(&Condition) -> bool + Send + Sync + 'static,
    ) {
        *self.already_satisfied.lock() = Some(Arc::new(predicate));
    }

    pub fn already_satisfied(&self, condition: &Condition) -> bool {
        let predicate = self.already_satisfied.lock().clone();
        predicate.is_some_and(|p| (*p)(condition))
    }

    /// Append `condition` to the subscriber list.
    pub fn subscribe(&self, condition: &Arc<Condition>) {
        let ours = condition
            .state
            .lock()
            .signaler
            .as_ref()
            .is_some_and(|s| core::ptr::eq(s.as_ptr(), self));
        if !ours {
            panic!("{:?} subscribed to a signaler it does not belong to", condition);
        }
        let mut subscribers = self.subscribers.lock();
        if subscribers.iter().any(|s| is(s, condition)) {
            return;
        }
        subscribers.push_back(Arc::downgrade(condition));
    }

    fn remove(&self, condition: &Condition) {
        self.subscribers.lock().retain(|s| !is(s, condition));
    }

    pub fn is_subscribed(&self, condition: &Condition) -> bool {
        self.subscribers.lock().iter().any(|s| is(s, condition))
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    /// Satisfy the oldest subscriber. Returns false if there was none.
    pub fn notify(&self) -> bool {
        loop {
            let head = match self.subscribers.lock().front() {
                Some(head) => head.clone(),
                None => return false,
            };
            let Some(condition) = head.upgrade() else {
                // Dropped while subscribed; its Drop is about to remove it.
                self.subscribers.lock().retain(|s| !Weak::ptr_eq(s, &head));
                continue;
            };
            condition.satisfy();
            let unchanged = self
                .subscribers
                .lock()
                .front()
                .is_some_and(|s| Weak::ptr_eq(s, &head));
            if unchanged {
                panic!("{:?} still heads the subscriber list after satisfy", condition);
            }
            return true;
        }
    }

    /// Satisfy every current subscriber, oldest first. Conditions that
    /// subscribe during the broadcast are left for the next one.
    pub fn broadcast(&self) -> usize {
        let snapshot: VecDeque<Weak<Condition>> = self.subscribers.lock().clone();
        let mut woken = 0;
        for weak in snapshot {
            let Some(condition) = weak.upgrade() else {
                continue;
            };
            if !self.is_subscribed(&condition) {
                continue;
            }
            condition.satisfy();
            if self.is_subscribed(&condition) {
                panic!("{:?} still subscribed after satisfy", condition);
            }
            woken += 1;
        }
        woken
    }
}

impl Drop for Signaler {
    fn drop(&mut self) {
        let subscribers = core::mem::take(self.subscribers.get_mut());
        if subscribers.is_empty() {
            return;
        }
        log::warn!(
            "signaler destroyed with {} subscribers; they will never be satisfied",
            subscribers.len()
        );
        for condition in subscribers.iter().filter_map(Weak::upgrade) {
            condition.state.lock().signaler = None;
        }
    }
}

fn is(subscriber: &Weak<Condition>, condition: &Condition) -> bool {
    core::ptr::eq(subscriber.as_ptr(), condition)
}
