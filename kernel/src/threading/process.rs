use crate::paging::PageManager;
use crate::sync::mutex::Mutex;
use crate::vm::page::SupplementalPageTable;
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicU16, Ordering};

pub type Pid = u16;
pub type AtomicPid = AtomicU16;

pub struct ProcessControlBlock {
    pub pid: Pid,
    /// Top of this process's user stack (exclusive). On-demand stack growth
    /// is measured downward from here.
    pub stack_top: usize,
    pub page_manager: Mutex<PageManager>,
    pub page_table: Mutex<SupplementalPageTable>,
    /// Held by this process while it reloads one of its own pages, and by an
    /// evictor while it persists one of this process's frames. See the lock
    /// ordering in `vm`.
    pub frame_access: Mutex<()>,
    pub exit_status: Mutex<Option<i32>>,
}

impl ProcessControlBlock {
    fn new(pid: Pid, stack_top: usize) -> ProcessControlBlock {
        ProcessControlBlock {
            pid,
            stack_top,
            page_manager: Mutex::new(PageManager::new()),
            page_table: Mutex::new(SupplementalPageTable::new()),
            frame_access: Mutex::new(()),
            exit_status: Mutex::new(None),
        }
    }
}

#[derive(Default)]
pub struct ProcessTable {
    content: BTreeMap<Pid, Arc<ProcessControlBlock>>,
}

impl ProcessTable {
    pub fn add(&mut self, pcb: Arc<ProcessControlBlock>) {
        assert!(
            !self.content.contains_key(&pcb.pid),
            "PCB with pid {} already added to process table.",
            pcb.pid
        );
        self.content.insert(pcb.pid, pcb);
    }

    pub fn remove(&mut self, pid: Pid) -> Option<Arc<ProcessControlBlock>> {
        self.content.remove(&pid)
    }

    pub fn get(&self, pid: Pid) -> Option<&Arc<ProcessControlBlock>> {
        self.content.get(&pid)
    }
}

pub struct ProcessState {
    pub table: Mutex<ProcessTable>,
    next_pid: AtomicPid,
}

impl Default for ProcessState {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessState {
    pub fn new() -> ProcessState {
        ProcessState {
            table: Mutex::new(ProcessTable::default()),
            next_pid: AtomicPid::new(1),
        }
    }

    pub fn allocate_pid(&self) -> Pid {
        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
        if pid == 0 {
            panic!("PID overflow"); // TODO: handle overflow properly
        }
        pid
    }

    /// Creates a process with an empty address space and registers it.
    pub fn create_process(&self, stack_top: usize) -> Arc<ProcessControlBlock> {
        let pcb = Arc::new(ProcessControlBlock::new(self.allocate_pid(), stack_top));
        self.table.lock().add(Arc::clone(&pcb));
        pcb
    }
}
