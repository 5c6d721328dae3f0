//! Page-granular storage: a direct-I/O paged file with an in-file free
//! list, and a pinning CLOCK buffer pool over it.

mod file;
mod frame;
mod pool;

pub use file::{PagedFile, PagedFileOptions};
pub use pool::{AccessMode, BufferPool, PageRef, PoolStats};
