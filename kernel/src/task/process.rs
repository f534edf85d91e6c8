//! Processes: the address space, threads and descriptors of one program.
//!
//! A process starts empty. `exec` loads an image and gives it its main
//! thread; `fork` fills an empty process from the caller's. `exit` (or a
//! terminating signal) tears every thread down and wakes whoever waits on
//! the termination signaler.

use alloc::format;
use alloc::string::String;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use spin::Mutex;

use crate::cap::{Fd, FdMapping, FdTable, Rights};
use crate::config::{KERNEL_BASE, PAGE_SIZE};
use crate::error::Errno;
use crate::fs::FileDescriptor;
use crate::kernel::Kernel;
use crate::memory::{AddressSpace, Backing, MemMapping, Protection, VirtAddr, pages_for};
use crate::sync::Signaler;
use crate::task::exec;
use crate::task::signal::{self, Signal};
use crate::task::thread::{Context, MAIN_THREAD, Thread, ThreadId};
use crate::task::userland::{UserlandCondvar, UserlandLock, UserlandTables};

// ── Process identifiers ─────────────────────────────────────────

pub type Pid = u64;

pub type ExitCode = u32;

/// Monotonically increasing PID counter.
static NEXT_PID: AtomicU64 = AtomicU64::new(1);

fn alloc_pid() -> Pid {
    NEXT_PID.fetch_add(1, Ordering::Relaxed)
}

// ── Memory map requests ─────────────────────────────────────────

/// Arguments of `Process::mem_map`.
#[derive(Debug, Clone, Copy)]
pub struct MapRequest {
    /// Fixed placement, replacing whatever is mapped there. `None` picks
    /// a free range.
    pub address: Option<VirtAddr>,
    pub len: usize,
    pub protection: Protection,
    /// Descriptor and page-aligned offset to read contents from.
    pub fd: Option<(Fd, usize)>,
}

impl MapRequest {
    pub fn anonymous(len: usize, protection: Protection) -> Self {
        Self {
            address: None,
            len,
            protection,
            fd: None,
        }
    }
}

// ── Process ─────────────────────────────────────────────────────

struct ProcessInner {
    name: String,
    address_space: AddressSpace,
    threads: Vec<Arc<Thread>>,
    last_thread: ThreadId,
    fds: FdTable,
    running: bool,
    exit_code: ExitCode,
    exit_signal: Signal,
}

pub struct Process {
    pid: Pid,
    kernel: Arc<Kernel>,
    me: Weak<Process>,
    termination: Arc<Signaler>,
    inner: Mutex<ProcessInner>,
    userland: Mutex<UserlandTables>,
}

impl Process {
    /// Use `Kernel::spawn_process`.
    pub(crate) fn new(kernel: &Arc<Kernel>, name: &str) -> Arc<Self> {
        Arc::new_cyclic(|me: &Weak<Process>| {
            let termination = Signaler::new();
            let watched = me.clone();
            termination.set_already_satisfied_function(move |_| {
                watched.upgrade().is_some_and(|p| p.is_terminated())
            });
            Self {
                pid: alloc_pid(),
                kernel: Arc::clone(kernel),
                me: me.clone(),
                termination,
                inner: Mutex::new(ProcessInner {
                    name: String::from(name),
                    address_space: AddressSpace::new(kernel.memory()),
                    threads: Vec::new(),
                    last_thread: MAIN_THREAD - 1,
                    fds: FdTable::new(),
                    running: false,
                    exit_code: 0,
                    exit_signal: 0,
                }),
                userland: Mutex::new(UserlandTables::default()),
            }
        })
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn name(&self) -> String {
        self.inner.lock().name.clone()
    }

    pub fn kernel(&self) -> &Arc<Kernel> {
        &self.kernel
    }

    /// Broadcast once the process has exited.
    pub fn termination_signaler(&self) -> &Arc<Signaler> {
        &self.termination
    }

    pub fn is_terminated(&self) -> bool {
        !self.inner.lock().running
    }

    /// `(exit code, signal)` once terminated.
    pub fn exit_status(&self) -> Option<(ExitCode, Signal)> {
        let inner = self.inner.lock();
        if inner.running {
            None
        } else {
            Some((inner.exit_code, inner.exit_signal))
        }
    }

    pub fn threads(&self) -> Vec<Arc<Thread>> {
        self.inner.lock().threads.clone()
    }

    pub fn thread_count(&self) -> usize {
        self.inner.lock().threads.len()
    }

    // ── Descriptors ─────────────────────────────────────────────

    pub fn add_fd(
        &self,
        fd: Arc<dyn FileDescriptor>,
        rights_base: Rights,
        rights_inheriting: Rights,
    ) -> Result<Fd, Errno> {
        self.inner.lock().fds.add(fd, rights_base, rights_inheriting)
    }

    /// The mapping behind `num`, if it holds at least `required`.
    pub fn get_fd(&self, num: Fd, required: Rights) -> Result<FdMapping, Errno> {
        self.inner.lock().fds.get(num, required).cloned()
    }

    pub fn close_fd(&self, num: Fd) -> Result<(), Errno> {
        self.inner.lock().fds.close(num).map(drop)
    }

    pub fn with_fds<R>(&self, f: impl FnOnce(&mut FdTable) -> R) -> R {
        f(&mut self.inner.lock().fds)
    }

    // ── Address space ───────────────────────────────────────────

    pub fn with_address_space<R>(&self, f: impl FnOnce(&mut AddressSpace) -> R) -> R {
        f(&mut self.inner.lock().address_space)
    }

    pub fn add_mem_mapping(&self, mapping: MemMapping, overwrite: bool) {
        self.with_address_space(|space| space.add_mem_mapping(mapping, overwrite));
    }

    pub fn mem_unmap(&self, addr: VirtAddr, num_pages: usize) {
        self.with_address_space(|space| space.mem_unmap(addr, num_pages));
    }

    pub fn find_free_virtual_range(&self, num_pages: usize) -> Option<VirtAddr> {
        self.with_address_space(|space| space.find_free_virtual_range(num_pages))
    }

    pub fn install_page_directory(&self) {
        log::trace!("process {}: installing page directory", self.pid);
        self.with_address_space(|space| space.install());
    }

    pub fn handle_page_fault(&self, addr: VirtAddr) -> Result<(), Errno> {
        self.with_address_space(|space| space.handle_page_fault(addr))
    }

    /// Map new memory. Returns where it went.
    pub fn mem_map(&self, request: MapRequest) -> Result<VirtAddr, Errno> {
        if request.len == 0 {
            return Err(Errno::Inval);
        }
        let pages = pages_for(request.len);

        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        let backing = match request.fd {
            None => Backing::Anonymous,
            Some((num, offset)) => {
                if offset % PAGE_SIZE != 0 {
                    return Err(Errno::Inval);
                }
                let mut rights = Rights::MEM_MAP;
                if request.protection.contains(Protection::EXEC) {
                    rights |= Rights::MEM_MAP_EXEC;
                }
                let mapping = inner.fds.get(num, rights)?;
                Backing::Descriptor {
                    fd: Arc::clone(&mapping.fd),
                    offset,
                }
            }
        };

        let address = match request.address {
            Some(addr) => {
                let end = addr.as_u64() + (pages * PAGE_SIZE) as u64;
                if !addr.is_page_aligned() || end > KERNEL_BASE as u64 {
                    return Err(Errno::Inval);
                }
                addr
            }
            None => inner
                .address_space
                .find_free_virtual_range(pages)
                .ok_or(Errno::NoMem)?,
        };

        inner.address_space.add_mem_mapping(
            MemMapping::new(address, pages, backing, request.protection),
            request.address.is_some(),
        );
        Ok(address)
    }

    // ── Userland locks and condvars ─────────────────────────────

    pub fn userland_lock(&self, addr: VirtAddr) -> Option<Arc<UserlandLock>> {
        self.userland.lock().lock(addr)
    }

    pub fn userland_lock_or_create(&self, addr: VirtAddr) -> Arc<UserlandLock> {
        self.userland.lock().lock_or_create(addr)
    }

    pub fn forget_userland_lock(&self, addr: VirtAddr) {
        self.userland.lock().forget_lock(addr);
    }

    pub fn userland_condvar(&self, addr: VirtAddr) -> Option<Arc<UserlandCondvar>> {
        self.userland.lock().condvar(addr)
    }

    pub fn userland_condvar_or_create(&self, addr: VirtAddr) -> Arc<UserlandCondvar> {
        self.userland.lock().condvar_or_create(addr)
    }

    pub fn forget_userland_condvar(&self, addr: VirtAddr) {
        self.userland.lock().forget_condvar(addr);
    }

    // ── Lifecycle ───────────────────────────────────────────────

    /// Replace the program running in this process with the image in `fd`.
    ///
    /// Either the new image is fully in place, or nothing changed: name,
    /// mappings, threads and descriptors are only touched once the image
    /// loaded without error.
    pub fn exec(
        &self,
        fd: &Arc<dyn FileDescriptor>,
        new_fds: Vec<FdMapping>,
        argdata: &[u8],
    ) -> Result<(), Errno> {
        let image = exec::read_image(fd.as_ref())?;

        let mut space = AddressSpace::new(self.kernel.memory());
        space.install();
        let loaded = match exec::load(&mut space, &image, argdata, self.kernel.vdso()) {
            Ok(loaded) => loaded,
            Err(e) => {
                drop(space);
                self.install_page_directory();
                log::warn!("process {}: exec of {} failed: {}", self.pid, fd.name(), e);
                return Err(e);
            }
        };

        let (thread, old_space, old_threads, closed) = {
            let mut inner = self.inner.lock();
            let old_space = core::mem::replace(&mut inner.address_space, space);
            let old_threads = core::mem::take(&mut inner.threads);
            inner.name = format!("exec<-{}", fd.name());
            inner.running = true;
            inner.exit_code = 0;
            inner.exit_signal = 0;
            let closed = inner.fds.replace(new_fds);

            inner.last_thread = MAIN_THREAD;
            let thread = Thread::new(
                MAIN_THREAD,
                self.me.clone(),
                self.kernel.scheduler(),
                Context::user_entry(loaded.entry, loaded.stack_pointer),
            );
            inner.threads.push(Arc::clone(&thread));
            (thread, old_space, old_threads, closed)
        };
        drop(old_space);
        for old in &old_threads {
            old.thread_exit();
        }
        self.kernel.scheduler().thread_ready(&thread);

        log::info!(
            "process {}: exec {} (entry {:#010x}, {} old threads, {} fds closed)",
            self.pid,
            fd.name(),
            loaded.entry,
            old_threads.len(),
            closed
        );
        Ok(())
    }

    /// Turn this empty process into a copy of `caller`'s process, with one
    /// thread resuming where `caller` is.
    ///
    /// A process cannot be forked into itself. Running out of frames while
    /// copying leaves this process untouched.
    pub fn fork(&self, caller: &Arc<Thread>) -> Result<Arc<Thread>, Errno> {
        let source = match caller.process() {
            Some(source) => source,
            None => panic!("fork() from thread {} without a process", caller.tid()),
        };
        if core::ptr::eq(Arc::as_ptr(&source), self) {
            log::warn!("process {}: fork into itself", self.pid);
            return Err(Errno::Inval);
        }

        let thread = {
            let mut inner = self.inner.lock();
            if !inner.threads.is_empty() {
                panic!("fork() on process {} that already has threads", self.pid);
            }
            let src = source.inner.lock();
            if !src.running {
                panic!("fork() from process {} that is not running", source.pid);
            }

            let mut space = AddressSpace::new(self.kernel.memory());
            space.copy_mappings_from(&src.address_space)?;
            inner.address_space = space;
            inner.name = format!("{}->forked", src.name);
            inner.fds = src.fds.clone();
            drop(src);

            inner.running = true;
            inner.exit_code = 0;
            inner.exit_signal = 0;
            inner.last_thread = caller.tid();
            let thread = Thread::new(
                caller.tid(),
                self.me.clone(),
                self.kernel.scheduler(),
                caller.context(),
            );
            inner.threads.push(Arc::clone(&thread));
            thread
        };
        self.kernel.scheduler().thread_ready(&thread);

        log::info!("process {} forked from process {}", self.pid, source.pid);
        Ok(thread)
    }

    /// Start another thread in this running process.
    pub fn add_thread(&self, context: Context) -> Arc<Thread> {
        let thread = {
            let mut inner = self.inner.lock();
            if !inner.running {
                panic!("add_thread() on process {} that is not running", self.pid);
            }
            inner.last_thread += 1;
            let thread = Thread::new(
                inner.last_thread,
                self.me.clone(),
                self.kernel.scheduler(),
                context,
            );
            inner.threads.push(Arc::clone(&thread));
            thread
        };
        self.kernel.scheduler().thread_ready(&thread);
        thread
    }

    /// `thread` exits on its own. The last thread leaving ends the process.
    pub fn remove_thread(&self, thread: &Arc<Thread>) {
        let last = {
            let mut inner = self.inner.lock();
            let before = inner.threads.len();
            inner.threads.retain(|t| !Arc::ptr_eq(t, thread));
            inner.threads.len() < before && inner.threads.is_empty() && inner.running
        };
        thread.thread_exit();
        if last {
            self.exit(0, 0);
        }
    }

    /// Terminate the process. A nonzero `signal` wins over `code`.
    pub fn exit(&self, code: ExitCode, signal: Signal) {
        if self.kernel.is_init(self) {
            log::error!("init exited with signal {}, exit code {}", signal, code);
            panic!("init exited");
        }

        let threads = {
            let mut inner = self.inner.lock();
            inner.running = false;
            inner.exit_signal = signal;
            inner.exit_code = if signal == 0 { code } else { 0 };
            log::info!(
                "process {} \"{}\" exited with signal {}, code {}",
                self.pid,
                inner.name,
                inner.exit_signal,
                inner.exit_code
            );
            core::mem::take(&mut inner.threads)
        };

        for thread in &threads {
            thread.thread_exit();
        }
        self.termination.broadcast();
        self.kernel.scheduler().thread_yield();
    }

    /// Deliver `signal`. There are no handlers: it kills or is ignored.
    pub fn signal(&self, signal: Signal) {
        if signal::is_terminating(signal) {
            self.exit(0, signal);
        } else {
            log::debug!("process {}: ignoring signal {}", self.pid, signal);
        }
    }
}

impl core::fmt::Debug for Process {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Process")
            .field("pid", &self.pid)
            .field("name", &self.name())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::MemoryFile;
    use crate::memory::PhysicalMemory;
    use crate::task::RoundRobin;
    use crate::task::signal::{SIGCHLD, SIGKILL};
    use alloc::vec;

    fn kernel() -> Arc<Kernel> {
        Kernel::new(Arc::new(PhysicalMemory::new(256)), Arc::new(RoundRobin::new()))
    }

    /// A process that counts as running without an image loaded.
    fn running(kernel: &Arc<Kernel>, name: &str) -> Arc<Process> {
        let process = kernel.spawn_process(name);
        process.inner.lock().running = true;
        process
    }

    #[test]
    fn test_fresh_process_is_empty() {
        let kernel = kernel();
        let p = kernel.spawn_process("p");
        assert_eq!(p.name(), "p");
        assert_eq!(p.thread_count(), 0);
        assert!(p.is_terminated());
        assert!(p.with_address_space(|s| s.mappings().is_empty()));
    }

    #[test]
    fn test_exit_records_status() {
        let kernel = kernel();
        let p = running(&kernel, "p");
        let t = p.add_thread(Context::default());
        assert_eq!(t.tid(), MAIN_THREAD);
        assert_eq!(p.exit_status(), None);

        p.exit(3, 0);
        assert_eq!(p.exit_status(), Some((3, 0)));
        assert!(t.is_exited());
        assert_eq!(p.thread_count(), 0);
    }

    #[test]
    fn test_signal_overrides_code() {
        let kernel = kernel();
        let p = running(&kernel, "p");
        p.signal(SIGCHLD);
        assert!(!p.is_terminated());
        p.signal(SIGKILL);
        assert_eq!(p.exit_status(), Some((0, SIGKILL)));
    }

    #[test]
    #[should_panic(expected = "init exited")]
    fn test_init_cannot_exit() {
        let kernel = kernel();
        let init = running(&kernel, "init");
        kernel.set_init(&init);
        init.exit(0, 0);
    }

    #[test]
    fn test_last_thread_leaving_exits() {
        let kernel = kernel();
        let p = running(&kernel, "p");
        let a = p.add_thread(Context::default());
        let b = p.add_thread(Context::default());
        assert_eq!(b.tid(), MAIN_THREAD + 1);
        p.remove_thread(&a);
        assert!(!p.is_terminated());
        p.remove_thread(&b);
        assert_eq!(p.exit_status(), Some((0, 0)));
    }

    #[test]
    fn test_mem_map_placement() {
        let kernel = kernel();
        let p = kernel.spawn_process("p");
        let rw = Protection::READ | Protection::WRITE;

        let a = p.mem_map(MapRequest::anonymous(PAGE_SIZE * 2, rw)).unwrap();
        let b = p.mem_map(MapRequest::anonymous(1, rw)).unwrap();
        assert_eq!(a, VirtAddr::new(crate::config::FREE_RANGE_START));
        assert_eq!(b, a + (PAGE_SIZE * 2) as u32);

        let fixed = MapRequest {
            address: Some(VirtAddr::new(0x1000_0000)),
            ..MapRequest::anonymous(PAGE_SIZE, rw)
        };
        assert_eq!(p.mem_map(fixed), Ok(VirtAddr::new(0x1000_0000)));
        assert_eq!(p.mem_map(MapRequest::anonymous(0, rw)), Err(Errno::Inval));

        let unaligned = MapRequest {
            address: Some(VirtAddr::new(0x1000_0010)),
            ..fixed
        };
        assert_eq!(p.mem_map(unaligned), Err(Errno::Inval));
        let kernel_half = MapRequest {
            address: Some(VirtAddr::new(0xBFFF_F000)),
            len: PAGE_SIZE * 2,
            ..fixed
        };
        assert_eq!(p.mem_map(kernel_half), Err(Errno::Inval));

        p.mem_unmap(a, 2);
        assert_eq!(p.find_free_virtual_range(2), Some(a));
    }

    #[test]
    fn test_mem_map_descriptor_needs_rights() {
        let kernel = kernel();
        let p = kernel.spawn_process("p");
        let file: Arc<dyn FileDescriptor> = Arc::new(MemoryFile::new("data", vec![0xAB; 100]));
        let ro = p.add_fd(file.clone(), Rights::FD_READ, Rights::empty()).unwrap();
        let mappable = p.add_fd(file, Rights::MEM_MAP, Rights::empty()).unwrap();

        let mut request = MapRequest::anonymous(PAGE_SIZE, Protection::READ);
        request.fd = Some((ro, 0));
        assert_eq!(p.mem_map(request), Err(Errno::NotCapable));

        request.fd = Some((mappable, 0));
        let addr = p.mem_map(request).unwrap();
        let mut buf = [0u8; 4];
        p.with_address_space(|s| s.read_bytes(addr, &mut buf)).unwrap();
        assert_eq!(buf, [0xAB; 4]);

        request.protection = Protection::READ | Protection::EXEC;
        assert_eq!(p.mem_map(request), Err(Errno::NotCapable));
        request.fd = Some((mappable, 10));
        assert_eq!(p.mem_map(request), Err(Errno::Inval));
    }

    struct Unreadable;

    impl FileDescriptor for Unreadable {
        fn name(&self) -> &str {
            "unreadable"
        }
        fn read(&self, _offset: usize, _buf: &mut [u8]) -> Result<usize, Errno> {
            Err(Errno::Io)
        }
    }

    #[test]
    fn test_mapped_descriptor_read_error_reaches_the_fault() {
        let kernel = kernel();
        let p = kernel.spawn_process("p");
        let fd = p.add_fd(Arc::new(Unreadable), Rights::MEM_MAP, Rights::empty()).unwrap();
        let mut request = MapRequest::anonymous(PAGE_SIZE, Protection::READ);
        request.fd = Some((fd, 0));
        let addr = p.mem_map(request).unwrap();

        assert_eq!(p.handle_page_fault(addr), Err(Errno::Io));
        let mut buf = [0u8; 4];
        assert_eq!(p.with_address_space(|s| s.read_bytes(addr, &mut buf)), Err(Errno::Io));
        assert_eq!(p.with_address_space(|s| s.translate(addr)), None);
    }

    #[test]
    fn test_fd_operations() {
        let kernel = kernel();
        let p = kernel.spawn_process("p");
        let file: Arc<dyn FileDescriptor> = Arc::new(MemoryFile::new("f", vec![1]));
        let fd = p.add_fd(file, Rights::FD_READ, Rights::empty()).unwrap();
        assert_eq!(p.get_fd(fd, Rights::FD_READ).unwrap().fd.name(), "f");
        assert_eq!(p.get_fd(fd, Rights::FD_WRITE).unwrap_err(), Errno::NotCapable);
        assert_eq!(p.close_fd(fd), Ok(()));
        assert_eq!(p.close_fd(fd), Err(Errno::Inval));
    }

    #[test]
    fn test_termination_signaler_predicate() {
        let kernel = kernel();
        let p = running(&kernel, "p");
        let condition = crate::sync::Condition::new(p.termination_signaler());
        assert!(!p.termination_signaler().already_satisfied(&condition));
        p.exit(1, 0);
        assert!(p.termination_signaler().already_satisfied(&condition));
    }

    #[test]
    fn test_userland_tables() {
        let kernel = kernel();
        let p = kernel.spawn_process("p");
        let addr = VirtAddr::new(0x5000);
        assert!(p.userland_lock(addr).is_none());
        let lock = p.userland_lock_or_create(addr);
        assert!(Arc::ptr_eq(&lock, &p.userland_lock(addr).unwrap()));
        p.forget_userland_lock(addr);
        assert!(p.userland_lock(addr).is_none());
        assert_eq!(p.userland_condvar_or_create(addr).waiters(), 0);
        p.forget_userland_condvar(addr);
        assert!(p.userland_condvar(addr).is_none());
    }
}
