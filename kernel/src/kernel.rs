//! The collaborators every process runs against.
//!
//! The boot path builds one `Kernel` and hands it to the processes it
//! spawns. Nothing in this crate is global, so several kernels can live
//! side by side (hosted tests do exactly that).

use alloc::sync::{Arc, Weak};

use spin::Once;

use crate::config::{PAGE_SIZE, PHDR_ADDR, VDSO_ADDR};
use crate::memory::PhysicalMemory;
use crate::task::{Process, Scheduler};

/// vDSO mapped when no other image is supplied: a bare ELF32 header with
/// no program headers.
pub static DEFAULT_VDSO: [u8; 52] = [
    0x7F, b'E', b'L', b'F', 1, 1, 1, 17, 0, 0, 0, 0, 0, 0, 0, 0, // e_ident
    3, 0, // e_type = ET_DYN
    3, 0, // e_machine = EM_386
    1, 0, 0, 0, // e_version
    0, 0, 0, 0, // e_entry
    0, 0, 0, 0, // e_phoff
    0, 0, 0, 0, // e_shoff
    0, 0, 0, 0, // e_flags
    52, 0, // e_ehsize
    32, 0, // e_phentsize
    0, 0, // e_phnum
    40, 0, // e_shentsize
    0, 0, // e_shnum
    0, 0, // e_shstrndx
];

pub struct Kernel {
    memory: Arc<PhysicalMemory>,
    scheduler: Arc<dyn Scheduler>,
    vdso: &'static [u8],
    init: Once<Weak<Process>>,
}

impl Kernel {
    pub fn new(memory: Arc<PhysicalMemory>, scheduler: Arc<dyn Scheduler>) -> Arc<Self> {
        Self::with_vdso(memory, scheduler, &DEFAULT_VDSO)
    }

    pub fn with_vdso(
        memory: Arc<PhysicalMemory>,
        scheduler: Arc<dyn Scheduler>,
        vdso: &'static [u8],
    ) -> Arc<Self> {
        let room = (PHDR_ADDR - VDSO_ADDR) as usize;
        if vdso.len() > room {
            panic!("vDSO of {} bytes does not fit in {} pages", vdso.len(), room / PAGE_SIZE);
        }
        Arc::new(Self {
            memory,
            scheduler,
            vdso,
            init: Once::new(),
        })
    }

    pub fn memory(&self) -> &Arc<PhysicalMemory> {
        &self.memory
    }

    pub fn scheduler(&self) -> &Arc<dyn Scheduler> {
        &self.scheduler
    }

    pub fn vdso(&self) -> &'static [u8] {
        self.vdso
    }

    /// A new, empty process: no threads, no mappings, no descriptors.
    pub fn spawn_process(self: &Arc<Self>, name: &str) -> Arc<Process> {
        let process = Process::new(self, name);
        log::info!("spawned process {} \"{}\"", process.pid(), name);
        process
    }

    /// Designate the init process. Only the first call has any effect.
    pub fn set_init(&self, process: &Arc<Process>) {
        self.init.call_once(|| Arc::downgrade(process));
    }

    pub fn is_init(&self, process: &Process) -> bool {
        self.init
            .get()
            .is_some_and(|init| core::ptr::eq(init.as_ptr(), process))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::elf;
    use crate::task::RoundRobin;

    fn kernel() -> Arc<Kernel> {
        Kernel::new(Arc::new(PhysicalMemory::new(64)), Arc::new(RoundRobin::new()))
    }

    #[test]
    fn test_default_vdso_is_valid_elf() {
        let info = elf::parse(&DEFAULT_VDSO).unwrap();
        assert_eq!(info.phnum(), 0);
    }

    #[test]
    fn test_init_designation() {
        let kernel = kernel();
        let a = kernel.spawn_process("a");
        let b = kernel.spawn_process("b");
        assert!(!kernel.is_init(&a));
        kernel.set_init(&a);
        kernel.set_init(&b);
        assert!(kernel.is_init(&a));
        assert!(!kernel.is_init(&b));
        assert_ne!(a.pid(), b.pid());
    }

    #[test]
    #[should_panic(expected = "does not fit")]
    fn test_oversized_vdso() {
        static HUGE: [u8; 0x2_1000] = [0; 0x2_1000];
        Kernel::with_vdso(Arc::new(PhysicalMemory::new(8)), Arc::new(RoundRobin::new()), &HUGE);
    }
}
