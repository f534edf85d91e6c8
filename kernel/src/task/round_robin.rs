//! A round-robin scheduler for hosted builds.
//!
//! Work is queued as tasks: closures bound to a kernel thread. Each task
//! runs on a host thread of its own, so a task that blocks keeps its
//! stack while other tasks go on, and blocked tasks resume in whatever
//! order their threads become ready.
//!
//! Only one task executes at a time. Every host thread owns a [`Gate`];
//! whoever dispatches a task opens that task's gate and then waits on its
//! own until the task finishes, blocks or yields.

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::format;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::any::Any;
use core::sync::atomic::{AtomicBool, Ordering};
use std::panic::{self, AssertUnwindSafe};
use std::thread as host;

use spin::Mutex;

use crate::task::scheduler::Scheduler;
use crate::task::thread::{Thread, ThreadState};

// ── Gates ──────────────────────────────────────────────────────────────

/// One host thread's permission to run.
struct Gate {
    host: host::Thread,
    permit: AtomicBool,
}

impl Gate {
    fn here() -> Arc<Self> {
        Arc::new(Self {
            host: host::current(),
            permit: AtomicBool::new(false),
        })
    }

    fn open(&self) {
        self.permit.store(true, Ordering::Release);
        self.host.unpark();
    }

    fn wait(&self) {
        while !self.permit.swap(false, Ordering::Acquire) {
            host::park();
        }
    }

    fn is_here(&self) -> bool {
        self.host.id() == host::current().id()
    }
}

/// Unwinds a suspended task whose thread exited while it was parked.
struct Killed;

// ── Run queue ──────────────────────────────────────────────────────────

type Work = Box<dyn FnOnce() + Send>;

enum Step {
    Start(Work),
    Resume(Arc<Gate>),
}

struct Task {
    thread: Arc<Thread>,
    step: Step,
}

/// A host thread running a task.
struct Worker {
    thread: Arc<Thread>,
    gate: Arc<Gate>,
}

struct RunQueue {
    /// Ready threads, round-robin order.
    ready: VecDeque<Arc<Thread>>,
    current: Option<Arc<Thread>>,
    tasks: VecDeque<Task>,
    /// Waiting for the running task to give the CPU back.
    dispatcher: Option<Arc<Gate>>,
    workers: Vec<Worker>,
    /// Payload of a task that panicked, re-raised by its dispatcher.
    panicked: Option<Box<dyn Any + Send>>,
}

impl RunQueue {
    /// The oldest task that can make progress. A parked task whose
    /// thread exited is runnable too: it has to unwind.
    fn take_runnable(&mut self) -> Option<Task> {
        let position = self.tasks.iter().position(|t| match t.step {
            Step::Start(_) => t.thread.state() == ThreadState::Ready,
            Step::Resume(_) => matches!(
                t.thread.state(),
                ThreadState::Ready | ThreadState::Exited
            ),
        })?;
        self.tasks.remove(position)
    }

    fn worker_here(&self) -> Option<(Arc<Thread>, Arc<Gate>)> {
        self.workers
            .iter()
            .find(|w| w.gate.is_here())
            .map(|w| (Arc::clone(&w.thread), Arc::clone(&w.gate)))
    }

    fn make_ready(&mut self, thread: &Arc<Thread>) {
        thread.set_state(ThreadState::Ready);
        if !contains(&self.ready, thread) {
            self.ready.push_back(Arc::clone(thread));
        }
    }

    fn is_current(&self, thread: &Arc<Thread>) -> bool {
        self.current.as_ref().is_some_and(|c| Arc::ptr_eq(c, thread))
    }

    /// Queue the calling worker to be resumed and give the CPU away.
    fn park(&mut self, thread: &Arc<Thread>, gate: &Arc<Gate>) -> Option<Arc<Gate>> {
        self.tasks.push_back(Task {
            thread: Arc::clone(thread),
            step: Step::Resume(Arc::clone(gate)),
        });
        self.current = None;
        self.dispatcher.clone()
    }
}

fn contains(queue: &VecDeque<Arc<Thread>>, thread: &Arc<Thread>) -> bool {
    queue.iter().any(|t| Arc::ptr_eq(t, thread))
}

fn hand_back(dispatcher: Option<Arc<Gate>>) {
    match dispatcher {
        Some(gate) => gate.open(),
        None => panic!("task gave up the CPU with no dispatcher waiting"),
    }
}

/// Sleep until dispatched again. An exited thread does not come back.
fn resume(thread: &Arc<Thread>, gate: &Gate) {
    gate.wait();
    if thread.is_exited() {
        panic::resume_unwind(Box::new(Killed));
    }
}

fn finish(
    queue: &Mutex<RunQueue>,
    thread: Arc<Thread>,
    gate: &Arc<Gate>,
    panicked: Option<Box<dyn Any + Send>>,
) {
    let dispatcher = {
        let mut queue = queue.lock();
        queue.workers.retain(|w| !Arc::ptr_eq(&w.gate, gate));
        if thread.state() == ThreadState::Running {
            queue.make_ready(&thread);
        }
        if queue.is_current(&thread) {
            queue.current = None;
        }
        if let Some(payload) = panicked.filter(|p| !(**p).is::<Killed>()) {
            queue.panicked = Some(payload);
        }
        queue.dispatcher.clone()
    };
    drop(thread);
    hand_back(dispatcher);
}

// ── Scheduler ──────────────────────────────────────────────────────────

pub struct RoundRobin {
    queue: Arc<Mutex<RunQueue>>,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self {
            queue: Arc::new(Mutex::new(RunQueue {
                ready: VecDeque::new(),
                current: None,
                tasks: VecDeque::new(),
                dispatcher: None,
                workers: Vec::new(),
                panicked: None,
            })),
        }
    }

    /// Queue `work` to run on behalf of `thread`.
    pub fn spawn(&self, thread: &Arc<Thread>, work: impl FnOnce() + Send + 'static) {
        let mut queue = self.queue.lock();
        queue.tasks.push_back(Task {
            thread: Arc::clone(thread),
            step: Step::Start(Box::new(work)),
        });
        if thread.state() == ThreadState::Ready && !contains(&queue.ready, thread) {
            queue.ready.push_back(Arc::clone(thread));
        }
    }

    /// Make `thread` the running thread (used at boot and by tests).
    pub fn set_current(&self, thread: &Arc<Thread>) {
        let mut queue = self.queue.lock();
        queue.ready.retain(|t| !Arc::ptr_eq(t, thread));
        thread.set_state(ThreadState::Running);
        queue.current = Some(Arc::clone(thread));
    }

    /// Number of threads in the ready queue (excluding current).
    pub fn ready_count(&self) -> usize {
        self.queue.lock().ready.len()
    }

    /// Tasks not started yet, plus parked ones.
    pub fn pending_tasks(&self) -> usize {
        self.queue.lock().tasks.len()
    }

    /// Dispatch tasks until none is runnable. Returns how many times
    /// one was started or resumed.
    pub fn run(&self) -> usize {
        let mut ran = 0;
        loop {
            let next = self.queue.lock().take_runnable();
            match next {
                Some(task) => self.dispatch(task),
                None => return ran,
            }
            ran += 1;
        }
    }

    /// Hand the CPU to `task` and wait until it gives it back.
    fn dispatch(&self, task: Task) {
        let gate = Gate::here();
        let (previous, outer) = {
            let mut queue = self.queue.lock();
            queue.ready.retain(|t| !Arc::ptr_eq(t, &task.thread));
            if !task.thread.is_exited() {
                task.thread.set_state(ThreadState::Running);
            }
            let previous = queue.current.replace(Arc::clone(&task.thread));
            let outer = queue.dispatcher.replace(Arc::clone(&gate));
            (previous, outer)
        };

        match task.step {
            Step::Start(work) => self.start(task.thread, work),
            Step::Resume(worker) => worker.open(),
        }
        gate.wait();

        let panicked = {
            let mut queue = self.queue.lock();
            queue.current = previous.filter(|t| !t.is_exited());
            queue.dispatcher = outer;
            queue.panicked.take()
        };
        if let Some(payload) = panicked {
            panic::resume_unwind(payload);
        }
    }

    fn start(&self, thread: Arc<Thread>, work: Work) {
        let queue = Arc::clone(&self.queue);
        let tid = thread.tid();
        let spawned = host::Builder::new()
            .name(format!("kthread-{}", tid))
            .spawn(move || {
                let gate = Gate::here();
                queue.lock().workers.push(Worker {
                    thread: Arc::clone(&thread),
                    gate: Arc::clone(&gate),
                });
                let outcome = panic::catch_unwind(AssertUnwindSafe(work));
                finish(&queue, thread, &gate, outcome.err());
            });
        if let Err(e) = spawned {
            panic!("cannot start a host thread for thread {}: {}", tid, e);
        }
    }

    /// Blocked from outside any task: run others until `thread` is ready.
    fn block_dispatching(&self, thread: &Arc<Thread>) {
        loop {
            let next = {
                let mut queue = self.queue.lock();
                if !thread.is_blocked() {
                    queue.ready.retain(|t| !Arc::ptr_eq(t, thread));
                    if !thread.is_exited() {
                        thread.set_state(ThreadState::Running);
                    }
                    queue.current = Some(Arc::clone(thread));
                    return;
                }
                queue.take_runnable()
            };
            match next {
                Some(task) => self.dispatch(task),
                None => panic!(
                    "deadlock: thread {} is blocked and nothing else can run",
                    thread.tid()
                ),
            }
        }
    }

    /// Blocked inside a task: park until the thread is made ready.
    fn block_parked(&self, thread: &Arc<Thread>, gate: Arc<Gate>) {
        let dispatcher = {
            let mut queue = self.queue.lock();
            if !thread.is_blocked() {
                queue.ready.retain(|t| !Arc::ptr_eq(t, thread));
                if !thread.is_exited() {
                    thread.set_state(ThreadState::Running);
                }
                queue.current = Some(Arc::clone(thread));
                return;
            }
            queue.park(thread, &gate)
        };
        hand_back(dispatcher);
        resume(thread, &gate);
    }
}

impl Default for RoundRobin {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler for RoundRobin {
    fn running_thread(&self) -> Option<Arc<Thread>> {
        self.queue.lock().current.clone()
    }

    fn thread_ready(&self, thread: &Arc<Thread>) {
        if thread.is_exited() {
            return;
        }
        let mut queue = self.queue.lock();
        if queue.is_current(thread) {
            thread.set_state(ThreadState::Running);
        } else {
            queue.make_ready(thread);
        }
    }

    fn thread_exiting(&self, thread: &Arc<Thread>) {
        // Dropped after the lock is released: closures may own anything.
        let abandoned: Vec<Task>;
        let parked;
        {
            let mut queue = self.queue.lock();
            queue.ready.retain(|t| !Arc::ptr_eq(t, thread));
            let (dropped, kept): (Vec<Task>, Vec<Task>) =
                queue.tasks.drain(..).partition(|t| {
                    Arc::ptr_eq(&t.thread, thread) && matches!(t.step, Step::Start(_))
                });
            queue.tasks = kept.into();
            abandoned = dropped;
            parked = contains_task(&queue.tasks, thread);
            if queue.is_current(thread) {
                queue.current = None;
            }
        }
        if !abandoned.is_empty() {
            log::debug!(
                "thread {} exited with {} pending tasks",
                thread.tid(),
                abandoned.len()
            );
        }
        if parked {
            log::debug!("thread {} exited while parked; it unwinds when next dispatched", thread.tid());
        }
    }

    fn thread_block(&self, thread: &Arc<Thread>) {
        let worker = self.queue.lock().worker_here();
        match worker {
            Some((_, gate)) => self.block_parked(thread, gate),
            None => self.block_dispatching(thread),
        }
    }

    fn thread_yield(&self) {
        let worker = self.queue.lock().worker_here();
        match worker {
            Some((thread, gate)) => {
                let dispatcher = {
                    let mut queue = self.queue.lock();
                    if thread.is_exited() {
                        return;
                    }
                    queue.make_ready(&thread);
                    queue.park(&thread, &gate)
                };
                hand_back(dispatcher);
                resume(&thread, &gate);
            }
            None => {
                let next = self.queue.lock().take_runnable();
                if let Some(task) = next {
                    self.dispatch(task);
                }
            }
        }
    }
}

fn contains_task(tasks: &VecDeque<Task>, thread: &Arc<Thread>) -> bool {
    tasks.iter().any(|t| Arc::ptr_eq(&t.thread, thread))
}
