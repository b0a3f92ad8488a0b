pub mod block_core;
