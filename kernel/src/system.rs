use crate::block::block_core::{Block, BlockType};
use crate::mem::frame_pool::FramePool;
use crate::sync::mutex::Mutex;
use crate::threading::process::ProcessState;
use crate::vm::frame_table::FrameTable;
use crate::vm::swap::SwapSpace;
use alloc::boxed::Box;
use log::info;
use once_cell::race::OnceBox;

/// The process-wide singletons of the VM subsystem.
///
/// Entry points take `&SystemState` explicitly rather than reaching for the
/// global, so tests can run against private instances; the kernel proper
/// initializes [`SYSTEM`] once at boot and passes that everywhere.
pub struct SystemState {
    pub frame_pool: Mutex<FramePool>,
    pub frame_table: FrameTable,
    pub swap: SwapSpace,
    pub process: ProcessState,
}

impl SystemState {
    /// Builds the subsystem over a user pool of `frame_count` frames and the
    /// given swap device. The frame table's capacity is the pool size; the
    /// swap slot count is derived from the device's capacity.
    pub fn new(frame_count: usize, swap_device: Block) -> SystemState {
        assert_eq!(
            swap_device.get_type(),
            BlockType::Swap,
            "swap space must be built on the swap-role device"
        );
        info!("vm: {} user frames", frame_count);
        SystemState {
            frame_pool: Mutex::new(FramePool::new(frame_count)),
            frame_table: FrameTable::new(frame_count),
            swap: SwapSpace::new(swap_device),
            process: ProcessState::new(),
        }
    }
}

static SYSTEM: OnceBox<SystemState> = OnceBox::new();

/// Initializes the global system state. Called once during boot, before any
/// process exists.
pub fn init_system(frame_count: usize, swap_device: Block) -> &'static SystemState {
    let state = Box::new(SystemState::new(frame_count, swap_device));
    if SYSTEM.set(state).is_err() {
        panic!("init_system called while system was already initialized");
    }
    unwrap_system()
}

pub fn unwrap_system() -> &'static SystemState {
    SYSTEM.get().expect("System not initialized.")
}
