//! Kernel-side bookkeeping for userland locks and condition variables.
//!
//! Userland locks and condvars live in process memory and are only known
//! to the kernel while some thread has to sleep on them. Each process keeps
//! the ones currently managed, keyed by their user address.

use alloc::collections::{BTreeMap, VecDeque};
use alloc::sync::{Arc, Weak};

use core::sync::atomic::{AtomicUsize, Ordering};

use spin::Mutex;

use crate::memory::VirtAddr;
use crate::sync::CondVar;
use crate::task::scheduler::Scheduler;
use crate::task::thread::Thread;

/// A contended userland reader/writer lock.
pub struct UserlandLock {
    address: VirtAddr,
    readers: CondVar,
    number_of_readers: AtomicUsize,
    waiting_writers: Mutex<VecDeque<Weak<Thread>>>,
}

impl UserlandLock {
    fn new(address: VirtAddr) -> Self {
        Self {
            address,
            readers: CondVar::new(),
            number_of_readers: AtomicUsize::new(0),
            waiting_writers: Mutex::new(VecDeque::new()),
        }
    }

    pub fn address(&self) -> VirtAddr {
        self.address
    }

    /// Readers sleep here until the writer releases the lock.
    pub fn readers(&self) -> &CondVar {
        &self.readers
    }

    pub fn number_of_readers(&self) -> usize {
        self.number_of_readers.load(Ordering::Acquire)
    }

    pub fn add_reader(&self) -> usize {
        self.number_of_readers.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Returns the readers left.
    pub fn remove_reader(&self) -> usize {
        let previous = self
            .number_of_readers
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        match previous {
            Ok(n) => n - 1,
            Err(_) => panic!("reader count of lock {} underflowed", self.address),
        }
    }

    pub fn add_waiting_writer(&self, thread: &Arc<Thread>) {
        self.waiting_writers.lock().push_back(Arc::downgrade(thread));
    }

    /// The longest waiting writer that still exists.
    pub fn take_waiting_writer(&self) -> Option<Arc<Thread>> {
        let mut writers = self.waiting_writers.lock();
        while let Some(writer) = writers.pop_front() {
            if let Some(thread) = writer.upgrade() {
                return Some(thread);
            }
        }
        None
    }

    pub fn has_waiting_writers(&self) -> bool {
        self.waiting_writers.lock().iter().any(|w| w.strong_count() > 0)
    }
}

/// A userland condition variable with sleeping waiters.
pub struct UserlandCondvar {
    address: VirtAddr,
    waiters: AtomicUsize,
    cv: CondVar,
}

impl UserlandCondvar {
    fn new(address: VirtAddr) -> Self {
        Self {
            address,
            waiters: AtomicUsize::new(0),
            cv: CondVar::new(),
        }
    }

    pub fn address(&self) -> VirtAddr {
        self.address
    }

    pub fn waiters(&self) -> usize {
        self.waiters.load(Ordering::Acquire)
    }

    /// Sleep until signalled.
    pub fn wait(&self, scheduler: &dyn Scheduler) {
        self.waiters.fetch_add(1, Ordering::AcqRel);
        self.cv.wait(scheduler);
        self.waiters.fetch_sub(1, Ordering::AcqRel);
    }

    /// Wake up to `count` waiters, oldest first. Returns how many woke.
    pub fn signal(&self, count: usize) -> usize {
        let mut woken = 0;
        while woken < count && self.cv.notify() {
            woken += 1;
        }
        woken
    }

    pub fn broadcast(&self) -> usize {
        self.cv.broadcast()
    }
}

#[derive(Default)]
pub struct UserlandTables {
    locks: BTreeMap<VirtAddr, Arc<UserlandLock>>,
    condvars: BTreeMap<VirtAddr, Arc<UserlandCondvar>>,
}

impl UserlandTables {
    pub fn lock(&self, address: VirtAddr) -> Option<Arc<UserlandLock>> {
        self.locks.get(&address).cloned()
    }

    pub fn lock_or_create(&mut self, address: VirtAddr) -> Arc<UserlandLock> {
        self.locks
            .entry(address)
            .or_insert_with(|| Arc::new(UserlandLock::new(address)))
            .clone()
    }

    pub fn forget_lock(&mut self, address: VirtAddr) {
        self.locks.remove(&address);
    }

    pub fn condvar(&self, address: VirtAddr) -> Option<Arc<UserlandCondvar>> {
        self.condvars.get(&address).cloned()
    }

    pub fn condvar_or_create(&mut self, address: VirtAddr) -> Arc<UserlandCondvar> {
        self.condvars
            .entry(address)
            .or_insert_with(|| Arc::new(UserlandCondvar::new(address)))
            .clone()
    }

    pub fn forget_condvar(&mut self, address: VirtAddr) {
        self.condvars.remove(&address);
    }
}
