mod pool;

pub use pool::{StagingBlock, StagingBufferPool, StagingKey, StagingSource};

use crate::{
    buffer::{Buffer, BufferSpec, BufferUsage},
    memory::{MemoryAccess, MemoryAllocator},
};

/// Floor applied to every staging request; many tiny uploads would
/// otherwise fragment the pool.
pub const MIN_STAGING_SIZE: ash::vk::DeviceSize = 64 * 1024;
pub const MAX_STAGING_ENTRIES: usize = 16;
/// Epochs an idle entry survives before garbage collection removes it.
pub const STAGING_IDLE_AGE: u64 = 30;
/// Frames between amortized garbage collection passes.
pub const STAGING_GC_INTERVAL: u64 = 60;

impl StagingBlock for Buffer {
    fn capacity(&self) -> ash::vk::DeviceSize {
        self.size()
    }
}

impl StagingSource<Buffer> for MemoryAllocator {
    fn create_staging(&mut self, size: ash::vk::DeviceSize) -> anyhow::Result<Buffer> {
        Buffer::new(
            self,
            BufferSpec {
                size,
                usage: BufferUsage::Staging,
                access: MemoryAccess::CpuToGpu,
                persistent_map: true,
                debug_name: Some(format!("staging({size})")),
            },
        )
    }

    fn destroy_staging(&mut self, block: Buffer) {
        block.destroy(self);
    }
}
