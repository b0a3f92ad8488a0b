pub mod frame_pool;

pub use frame_pool::FramePool;
