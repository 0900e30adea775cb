use anyhow::Context;
use ash::vk;

use crate::{
    memory::{AllocationKey, MemoryAllocator},
    staging::StagingBufferPool,
    transfer::TransferContext,
};

use super::spec::BufferSpec;

/// A single GPU buffer bound to one allocation. Created once, destroyed
/// explicitly by its owner; the allocation itself lives in the
/// [`MemoryAllocator`] tracking table.
pub struct Buffer {
    key: AllocationKey,
    vk_buffer: vk::Buffer,
    spec: BufferSpec,
    // Nested map() calls are tolerated; the real unmap happens only on the
    // transition back to zero, and never for persistent mappings.
    map_count: u32,
    mapped_ptr: Option<*mut u8>,
}

impl Buffer {
    pub fn new(allocator: &mut MemoryAllocator, spec: BufferSpec) -> anyhow::Result<Self> {
        if spec.size == 0 {
            anyhow::bail!("buffer {:?} requested with zero size", spec.debug_name);
        }
        let spec = spec.resolved();

        let key = allocator
            .create_buffer(
                spec.size,
                spec.usage.usage_flags(),
                spec.access,
                spec.persistent_map,
                spec.debug_name.as_deref(),
            )
            .with_context(|| format!("failed to create buffer {:?}", spec.debug_name))?;
        let vk_buffer = allocator.vk_buffer(key)?;

        let mapped_ptr = if spec.persistent_map {
            allocator.allocation(key).and_then(|a| a.mapped_ptr())
        } else {
            None
        };

        Ok(Self {
            key,
            vk_buffer,
            spec,
            map_count: 0,
            mapped_ptr,
        })
    }

    /// Creates a host-visible buffer and writes `data` into it. Device-local
    /// buffers take their initial contents through [`Buffer::upload`]
    /// instead.
    pub fn with_data(
        allocator: &mut MemoryAllocator,
        spec: BufferSpec,
        data: &[u8],
    ) -> anyhow::Result<Self> {
        let mut buffer = Self::new(allocator, spec)?;
        buffer.update(allocator, data, 0)?;
        Ok(buffer)
    }

    pub fn vk_buffer(&self) -> vk::Buffer {
        self.vk_buffer
    }

    pub fn key(&self) -> AllocationKey {
        self.key
    }

    pub fn size(&self) -> vk::DeviceSize {
        self.spec.size
    }

    pub fn host_visible(&self) -> bool {
        self.spec.access.host_visible()
    }

    pub fn map(&mut self, allocator: &mut MemoryAllocator) -> anyhow::Result<*mut u8> {
        if let Some(ptr) = self.mapped_ptr {
            self.map_count += 1;
            return Ok(ptr);
        }
        let ptr = allocator
            .map_memory(self.key)
            .with_context(|| format!("failed to map buffer {:?}", self.spec.debug_name))?;
        self.mapped_ptr = Some(ptr);
        self.map_count = 1;
        Ok(ptr)
    }

    pub fn unmap(&mut self, allocator: &mut MemoryAllocator) {
        if self.map_count == 0 {
            log::warn!(
                "unbalanced unmap on buffer {:?}",
                self.spec.debug_name
            );
            return;
        }
        self.map_count -= 1;
        if self.map_count == 0 && !self.spec.persistent_map {
            allocator.unmap_memory(self.key);
            self.mapped_ptr = None;
        }
    }

    /// Direct host write. Legal only on host-visible buffers; refused
    /// writes leave the buffer untouched.
    pub fn update(
        &mut self,
        allocator: &mut MemoryAllocator,
        data: &[u8],
        offset: vk::DeviceSize,
    ) -> anyhow::Result<()> {
        self.spec.check_update(offset, data.len())?;

        let ptr = self.map(allocator)?;
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), ptr.add(offset as usize), data.len());
        }
        allocator.flush(self.key, offset, data.len() as vk::DeviceSize)?;
        self.unmap(allocator);
        Ok(())
    }

    /// Device-local-safe write. Host-visible buffers are written directly;
    /// everything else goes through a pooled staging buffer and a
    /// synchronous single-use copy submission, which makes this a
    /// setup-time path, not a per-frame one.
    pub fn upload(
        &mut self,
        allocator: &mut MemoryAllocator,
        staging: &StagingBufferPool<Buffer>,
        transfer: Option<&TransferContext>,
        data: &[u8],
        offset: vk::DeviceSize,
    ) -> anyhow::Result<()> {
        if self.host_visible() {
            return self.update(allocator, data, offset);
        }

        let Some(transfer) = transfer else {
            log::error!(
                "upload to device-local buffer {:?} requires a transfer context",
                self.spec.debug_name
            );
            anyhow::bail!("no transfer context supplied for device-local upload");
        };

        let dst = self.vk_buffer;
        let len = data.len() as vk::DeviceSize;
        staging.with_staging_buffer(allocator, len, |allocator, block| {
            block.update(allocator, data, 0)?;
            let src = block.vk_buffer();
            transfer.immediate(|device, cmd| {
                let region = vk::BufferCopy::default().dst_offset(offset).size(len);
                unsafe { device.cmd_copy_buffer(cmd, src, dst, &[region]) };
                Ok(())
            })
        })
    }

    pub fn destroy(self, allocator: &mut MemoryAllocator) {
        if self.map_count > 0 {
            log::warn!(
                "buffer {:?} destroyed with {} outstanding mappings",
                self.spec.debug_name,
                self.map_count
            );
        }
        allocator.destroy_buffer(self.key);
    }
}
