//! Page-fault resolution and the VM locking protocol.
//!
//! # Lock order
//!
//! Every thread acquires VM locks in this order, skipping levels freely but
//! never going backwards:
//!
//! 1. the faulting process's own `frame_access` lock,
//! 2. the frame table lock,
//! 3. the swap lock.
//!
//! The supplemental-page-table, page-directory, and frame-pool mutexes are
//! leaf locks: held briefly and never across another acquisition. The one
//! place a thread needs a *different* process's `frame_access` lock (the
//! evictor persisting a victim) probes it with `try_lock` and skips the
//! victim on contention, which keeps the order acyclic.
//!
//! A frame being filled is pinned (and, until registered, absent from the
//! frame table entirely), so it cannot be chosen as a victim while its
//! contents are in flight. Pins last only for the fill; nothing holds a pin
//! across an acquisition that could itself trigger eviction.

pub mod frame_table;
pub mod page;
pub mod swap;

use crate::system::SystemState;
use crate::threading::process::ProcessControlBlock;
use crate::vm::page::{FileMapping, PageEntry, PageLocation};
use crate::vm::swap::SwapSlot;
use alloc::sync::Arc;
use core::fmt;
use core::slice;
use log::{info, warn};
use marrowos_shared::mem::{FrameIndex, VirtPage, OFFSET, PAGE_FRAME_SIZE};
use marrowos_shared::sizes::MB;

/// How far below its recorded top a process's stack may grow.
pub const MAX_STACK_SIZE: usize = 8 * MB;

/// An x86 `PUSHA` writes 32 bytes below the stack pointer before the fault
/// is raised, so addresses that far under `esp` still count as stack probes.
const STACK_PROBE_SLACK: usize = 32;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum VmError {
    /// No free slot on the swap device. Fatal to the whole system by
    /// design: the memory + swap budget is exceeded, and there is nothing
    /// sensible to degrade to.
    SwapExhausted,
    /// A lazily loaded page's file range ended early. The mapping is
    /// corrupt; the faulting process must be terminated rather than run on
    /// a truncated page.
    ShortRead { expected: usize, got: usize },
    /// A fault with no supplemental entry and no stack-growth
    /// justification. A normal outcome: the process is terminated.
    BadAccess { addr: usize },
}

impl fmt::Display for VmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SwapExhausted => write!(f, "out of swap space"),
            Self::ShortRead { expected, got } => {
                write!(f, "short read during lazy load ({got} of {expected} bytes)")
            }
            Self::BadAccess { addr } => write!(f, "invalid access to {addr:#x}"),
        }
    }
}

impl core::error::Error for VmError {}

pub type Result<T> = core::result::Result<T, VmError>;

/// Resolves a fault at `fault_addr` for `pcb`.
///
/// `user_sp` is the faulting thread's user stack pointer, used only to judge
/// whether an unmapped address is legitimate stack growth. On `Err` the
/// dispatch layer terminates the process (or, for
/// [`VmError::SwapExhausted`], panics the kernel).
pub fn handle_fault(
    system: &SystemState,
    pcb: &Arc<ProcessControlBlock>,
    fault_addr: usize,
    user_sp: usize,
) -> Result<()> {
    if fault_addr >= OFFSET {
        return Err(VmError::BadAccess { addr: fault_addr });
    }
    let vpage = VirtPage::containing(fault_addr);

    if pcb.page_table.lock().get(vpage).is_none() {
        if is_stack_growth(pcb, fault_addr, user_sp) {
            let _frame_access = pcb.frame_access.lock();
            return install_stack_page(system, pcb, vpage);
        }
        return Err(VmError::BadAccess { addr: fault_addr });
    }

    // From here on hold our frame-access lock: an evictor mid-flight on this
    // page has either finished persisting it or will skip it, so the state
    // read below is the one we get to resolve against.
    let _frame_access = pcb.frame_access.lock();

    enum Pending {
        Done,
        FromSwap { slot: SwapSlot, writable: bool },
        FromFile { mapping: FileMapping, writable: bool },
    }

    let pending = {
        let spt = pcb.page_table.lock();
        match spt.get(vpage) {
            None => return Err(VmError::BadAccess { addr: fault_addr }),
            Some(entry) => match (entry.location, entry.source.clone()) {
                (PageLocation::Resident { .. }, _) => Pending::Done,
                (PageLocation::InSwap { slot }, _) => Pending::FromSwap {
                    slot,
                    writable: entry.writable,
                },
                (PageLocation::InFile, Some(mapping)) => Pending::FromFile {
                    mapping,
                    writable: entry.writable,
                },
                (PageLocation::InFile, None) => {
                    warn!("pid {}: file-backed page without a source", pcb.pid);
                    return Err(VmError::BadAccess { addr: fault_addr });
                }
            },
        }
    };

    match pending {
        // Resolved concurrently, or a spurious fault: nothing to do.
        Pending::Done => Ok(()),
        Pending::FromSwap { slot, writable } => load_from_swap(system, pcb, vpage, slot, writable),
        Pending::FromFile { mapping, writable } => {
            load_from_file(system, pcb, vpage, &mapping, writable)
        }
    }
}

/// Bounded stack-growth policy: the address must lie within
/// [`MAX_STACK_SIZE`] below the process's stack top and no more than the
/// probe slack below the faulting thread's stack pointer.
fn is_stack_growth(pcb: &ProcessControlBlock, addr: usize, user_sp: usize) -> bool {
    addr < pcb.stack_top
        && addr >= pcb.stack_top.saturating_sub(MAX_STACK_SIZE)
        && addr >= user_sp.saturating_sub(STACK_PROBE_SLACK)
}

/// Obtains a frame for the caller: a free one from the pool if available,
/// otherwise by evicting. Loops because a pass can come up empty while every
/// candidate is pinned or mid-fill; pins are short-lived, so a retry soon
/// finds a victim.
fn acquire_frame(system: &SystemState, pcb: &ProcessControlBlock) -> Result<FrameIndex> {
    loop {
        if let Some(frame) = system.frame_pool.lock().alloc() {
            return Ok(frame);
        }
        if let Some(frame) = system
            .frame_table
            .try_evict(pcb, &system.frame_pool, &system.swap)?
        {
            return Ok(frame);
        }
        core::hint::spin_loop();
    }
}

/// Installs the user translation and the frame's kernel alias together.
fn install_translation(
    pcb: &ProcessControlBlock,
    vpage: VirtPage,
    frame: FrameIndex,
    writable: bool,
) {
    let mut pd = pcb.page_manager.lock();
    pd.map(vpage, frame, writable, true);
    pd.map(frame.kernel_page(), frame, true, false);
}

/// Fill from file: read the recorded range, zero the tail, map, register.
///
/// A short read means the executable or mapping is corrupt: the frame goes
/// back to the pool, no translation is installed, and the caller terminates
/// the process.
fn load_from_file(
    system: &SystemState,
    pcb: &Arc<ProcessControlBlock>,
    vpage: VirtPage,
    mapping: &FileMapping,
    writable: bool,
) -> Result<()> {
    let frame = acquire_frame(system, pcb)?;
    let ptr = system.frame_pool.lock().frame_ptr(frame);
    // SAFETY: the frame is not yet registered, so no other thread can reach
    // it; the pool keeps the arena alive.
    let page = unsafe { slice::from_raw_parts_mut(ptr, PAGE_FRAME_SIZE) };

    let got = mapping.file.read_at(mapping.offset, &mut page[..mapping.length]);
    if got < mapping.length {
        system.frame_pool.lock().dealloc(frame);
        warn!(
            "pid {}: short read loading page {:#x} ({} of {} bytes)",
            pcb.pid,
            vpage.addr(),
            got,
            mapping.length
        );
        return Err(VmError::ShortRead {
            expected: mapping.length,
            got,
        });
    }
    page[mapping.length..].fill(0);

    install_translation(pcb, vpage, frame, writable);
    system.frame_table.register(pcb, vpage, frame);
    if let Some(entry) = pcb.page_table.lock().get_mut(vpage) {
        entry.location = PageLocation::Resident { frame };
    }
    system.frame_table.unpin(frame);
    Ok(())
}

/// Fill from swap. The translation goes in *before* the slot is read: the
/// page is briefly mapped with undefined contents, which is fine because the
/// frame is pinned for the window and no thread of this process runs ahead
/// of its own fault handler.
fn load_from_swap(
    system: &SystemState,
    pcb: &Arc<ProcessControlBlock>,
    vpage: VirtPage,
    slot: SwapSlot,
    writable: bool,
) -> Result<()> {
    let frame = acquire_frame(system, pcb)?;
    install_translation(pcb, vpage, frame, writable);

    let ptr = system.frame_pool.lock().frame_ptr(frame);
    // SAFETY: the frame is unregistered and its new mapping belongs to the
    // thread currently blocked in this fault handler.
    let page = unsafe { slice::from_raw_parts_mut(ptr, PAGE_FRAME_SIZE) };
    system.swap.read_slot(slot, page);

    system.frame_table.register(pcb, vpage, frame);
    if let Some(entry) = pcb.page_table.lock().get_mut(vpage) {
        entry.location = PageLocation::Resident { frame };
        // The slot was consumed; from now on this page has no file copy
        // either, so a future eviction always persists it.
        entry.source = None;
    }
    system.frame_table.unpin(frame);
    Ok(())
}

/// Fill as a new stack page: zeroed frame, fresh writable entry. Used only
/// for on-demand growth, never to retry an existing entry.
fn install_stack_page(
    system: &SystemState,
    pcb: &Arc<ProcessControlBlock>,
    vpage: VirtPage,
) -> Result<()> {
    let frame = acquire_frame(system, pcb)?;
    let ptr = system.frame_pool.lock().frame_ptr(frame);
    // SAFETY: unregistered frame, see `load_from_file`.
    unsafe { core::ptr::write_bytes(ptr, 0, PAGE_FRAME_SIZE) };

    pcb.page_table.lock().insert(vpage, PageEntry::stack_resident(frame));
    install_translation(pcb, vpage, frame, true);
    system.frame_table.register(pcb, vpage, frame);
    system.frame_table.unpin(frame);
    Ok(())
}

/// Process-teardown hook: sweep the frame table, then destroy the
/// supplemental page table (in that order, so no entry can still name a
/// live frame when it is dropped). Idempotent: a second call on an
/// already-torn-down process finds nothing to do.
pub fn process_cleanup(system: &SystemState, pcb: &Arc<ProcessControlBlock>) {
    let _frame_access = pcb.frame_access.lock();
    system.frame_table.release_all(pcb.pid, &system.frame_pool);
    pcb.page_table.lock().clear(&system.swap);
}

/// Ends `pcb` with `status`, releasing all of its VM state.
pub fn terminate(system: &SystemState, pcb: &Arc<ProcessControlBlock>, status: i32) {
    *pcb.exit_status.lock() = Some(status);
    info!("pid {}: exit({})", pcb.pid, status);
    process_cleanup(system, pcb);
    system.process.table.lock().remove(pcb.pid);
}
