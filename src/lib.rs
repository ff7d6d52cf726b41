#[cfg(not(target_pointer_width = "64"))]
compile_error!("codeheap supports only 64-bit targets.");

pub(crate) mod sync;

// public module: contains implementation details (hidden via pub(crate))
// and TEST_MUTEX (public for tests)
pub mod memory;

// the heap and its allocation records
pub use memory::code_heap::{Allocation, CodeHeap, HeapError};

// underlying page pools and their configuration
pub use memory::code_pools::{CodePagePools, CodePoolsConfig};
pub use memory::page_pool::{SegmentHandle, UnwindAllocation};

// size classes
pub use memory::bucket::{Bucket, CHUNK_SIZE, MAX_SMALL_ALLOC};

// stats
pub use memory::stats::HeapStats;

// protection attributes and VM errors
pub use memory::vm::{Protection, VmError};
