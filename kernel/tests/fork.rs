mod common;

use cirrus_kernel::Errno;
use cirrus_kernel::cap::Rights;
use cirrus_kernel::memory::{Protection, VirtAddr};
use cirrus_kernel::task::{MapRequest, ThreadState};

use common::{Machine, file, hello};

#[test]
fn test_fork_copies_the_caller() {
    let m = Machine::new();
    let parent = m.kernel.spawn_process("parent");
    parent.exec(&file("hello", hello()), Vec::new(), b"args").unwrap();
    let log = file("log", Vec::new());
    let fd = parent
        .add_fd(log, Rights::FD_READ | Rights::FD_WRITE, Rights::FD_READ)
        .unwrap();
    let data = parent
        .mem_map(MapRequest::anonymous(4096, Protection::READ | Protection::WRITE))
        .unwrap();
    parent.with_address_space(|s| s.write_bytes(data, b"parent")).unwrap();

    let caller = parent.threads()[0].clone();
    let mut ctx = caller.context();
    ctx.eax = 0x1234;
    caller.set_context(ctx);

    let child = m.kernel.spawn_process("child");
    let thread = child.fork(&caller).unwrap();

    assert_eq!(child.name(), "exec<-hello->forked");
    assert_ne!(child.pid(), parent.pid());
    assert!(!child.is_terminated());
    assert_eq!(child.thread_count(), 1);
    assert_eq!(thread.tid(), caller.tid());
    assert_eq!(thread.context(), ctx);
    assert_eq!(thread.state(), ThreadState::Ready);
    assert!(std::sync::Arc::ptr_eq(&thread.process().unwrap(), &child));

    // Same resource, same rights.
    let mine = parent.get_fd(fd, Rights::empty()).unwrap();
    let theirs = child.get_fd(fd, Rights::FD_READ | Rights::FD_WRITE).unwrap();
    assert!(theirs.same_resource(&mine));
    assert_eq!(theirs.rights_inheriting, Rights::FD_READ);

    // Same layout, private memory.
    let layout = |p: &cirrus_kernel::task::Process| -> Vec<(VirtAddr, usize)> {
        p.with_address_space(|s| {
            s.mappings()
                .iter()
                .map(|m| (m.virtual_address(), m.number_of_pages()))
                .collect()
        })
    };
    assert_eq!(layout(&child), layout(&parent));

    let mut buf = [0u8; 6];
    child.with_address_space(|s| s.read_bytes(data, &mut buf)).unwrap();
    assert_eq!(&buf, b"parent");
    child.with_address_space(|s| s.write_bytes(data, b"child!")).unwrap();
    parent.with_address_space(|s| s.read_bytes(data, &mut buf)).unwrap();
    assert_eq!(&buf, b"parent");

    let child_dir = child.with_address_space(|s| s.page_directory().physical_address());
    let parent_dir = parent.with_address_space(|s| s.page_directory().physical_address());
    assert_ne!(child_dir, parent_dir);
    let code = VirtAddr::new(common::LOAD_ADDR);
    assert_ne!(
        child.with_address_space(|s| s.translate(code)),
        parent.with_address_space(|s| s.translate(code))
    );
}

#[test]
fn test_forked_child_lives_on_its_own() {
    let m = Machine::new();
    let parent = m.kernel.spawn_process("parent");
    parent.exec(&file("hello", hello()), Vec::new(), b"").unwrap();
    let child = m.kernel.spawn_process("child");
    let thread = child.fork(&parent.threads()[0]).unwrap();

    child.exit(9, 0);
    assert_eq!(child.exit_status(), Some((9, 0)));
    assert_eq!(thread.state(), ThreadState::Exited);
    assert_eq!(parent.exit_status(), None);
    assert_eq!(parent.threads()[0].state(), ThreadState::Ready);
}

#[test]
#[should_panic(expected = "already has threads")]
fn test_fork_into_busy_process() {
    let m = Machine::new();
    let parent = m.kernel.spawn_process("parent");
    parent.exec(&file("hello", hello()), Vec::new(), b"").unwrap();
    let caller = parent.threads()[0].clone();
    let child = m.kernel.spawn_process("child");
    child.fork(&caller).unwrap();
    let _ = child.fork(&caller);
}

#[test]
#[should_panic(expected = "without a process")]
fn test_fork_from_kernel_thread() {
    let m = Machine::new();
    let caller = m.current_kernel_thread(1);
    let _ = m.kernel.spawn_process("child").fork(&caller);
}

#[test]
fn test_fork_into_own_process_is_refused() {
    let m = Machine::new();
    let p = m.kernel.spawn_process("p");
    p.exec(&file("hello", hello()), Vec::new(), b"").unwrap();
    let caller = p.threads()[0].clone();
    // Leaves the process empty, but the thread still points back at it.
    p.exit(0, 0);
    assert_eq!(p.fork(&caller).unwrap_err(), Errno::Inval);
    assert_eq!(p.thread_count(), 0);
    assert!(p.is_terminated());
}

#[test]
fn test_fork_out_of_frames_leaves_child_empty() {
    let m = Machine::new();
    let parent = m.kernel.spawn_process("parent");
    parent.exec(&file("hello", hello()), Vec::new(), b"").unwrap();
    // Back enough of a large mapping that a full copy cannot fit.
    let free = m.kernel.memory().frames_free();
    let big = parent
        .mem_map(MapRequest::anonymous(free * 4096, Protection::READ | Protection::WRITE))
        .unwrap();
    let pages = free * 2 / 3;
    for page in 0..pages {
        parent.handle_page_fault(big + (page * 4096) as u32).unwrap();
    }
    let frames = m.kernel.memory().frames_in_use();

    let child = m.kernel.spawn_process("child");
    assert_eq!(child.fork(&parent.threads()[0]).unwrap_err(), Errno::NoMem);
    assert_eq!(child.thread_count(), 0);
    assert_eq!(child.name(), "child");
    assert!(child.with_address_space(|s| s.mappings().is_empty()));
    assert_eq!(m.kernel.memory().frames_in_use(), frames);
}
