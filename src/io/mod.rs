//! I/O utilities

mod buffer_pool;

pub use buffer_pool::{BufferPool, PooledBuffer, DEFAULT_POOL_CAPACITY, READ_BUFFER_SIZE};
