//! Background workers.

pub mod pool;

pub use pool::{WorkerPool, WorkerPoolConfig, WorkerPoolHandle, WorkerPoolStats};
