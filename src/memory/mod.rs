mod allocation;
mod allocator;

pub use allocation::{Allocation, AllocationKey, MemoryAccess, ResourceHandle};
pub use allocator::{MemoryAllocator, MemoryStats};
