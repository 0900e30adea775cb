use anyhow::Context;
use ash::vk;
use slotmap::SlotMap;
use vk_mem::Alloc;

use crate::vulkan::DeviceContext;

use super::{
    Allocation, AllocationKey, MemoryAccess,
    allocation::ResourceHandle,
};

/// Aggregate view of the tracking table, used for the shutdown leak check
/// and periodic logging. `used_bytes` counts what callers requested;
/// `allocated_bytes` counts what the allocator reserved, which alignment
/// and driver-chosen image layouts can round up.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct MemoryStats {
    pub allocation_count: usize,
    pub used_bytes: vk::DeviceSize,
    pub allocated_bytes: vk::DeviceSize,
}

impl MemoryStats {
    pub(crate) fn record(&mut self, requested: vk::DeviceSize, allocated: vk::DeviceSize) {
        self.allocation_count += 1;
        self.used_bytes += requested;
        self.allocated_bytes += allocated;
    }

    pub(crate) fn release(&mut self, requested: vk::DeviceSize, allocated: vk::DeviceSize) {
        self.allocation_count = self.allocation_count.saturating_sub(1);
        self.used_bytes = self.used_bytes.saturating_sub(requested);
        self.allocated_bytes = self.allocated_bytes.saturating_sub(allocated);
    }
}

/// Owns the `vk_mem::Allocator` and the table of every live [`Allocation`].
/// All buffer and image memory in the engine is created and destroyed
/// through this type; resource wrappers only ever hold an [`AllocationKey`].
pub struct MemoryAllocator {
    allocator: vk_mem::Allocator,
    allocations: SlotMap<AllocationKey, Allocation>,
    stats: MemoryStats,
    device_context: DeviceContext,
}

impl MemoryAllocator {
    pub fn new(
        instance: &ash::Instance,
        device: &ash::Device,
        physical_device: vk::PhysicalDevice,
        device_context: DeviceContext,
    ) -> anyhow::Result<Self> {
        let create_info = vk_mem::AllocatorCreateInfo::new(instance, device, physical_device);
        let allocator = unsafe {
            vk_mem::Allocator::new(create_info).context("failed to create vk-mem allocator")?
        };

        Ok(Self {
            allocator,
            allocations: SlotMap::default(),
            stats: MemoryStats::default(),
            device_context,
        })
    }

    pub fn create_buffer(
        &mut self,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        access: MemoryAccess,
        mapped: bool,
        debug_name: Option<&str>,
    ) -> anyhow::Result<AllocationKey> {
        let buffer_info = vk::BufferCreateInfo::default()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let alloc_info = access.allocation_create_info(mapped);

        let (vk_buffer, allocation) = unsafe {
            self.allocator
                .create_buffer(&buffer_info, &alloc_info)
                .with_context(|| format!("failed to allocate buffer of {size} bytes"))?
        };

        if let Some(name) = debug_name {
            self.device_context.name_object(vk_buffer, name)?;
        }

        let info = self.allocator.get_allocation_info(&allocation);
        let mapped_ptr = mapped.then(|| info.mapped_data as *mut u8);

        self.stats.record(size, info.size);
        Ok(self.allocations.insert(Allocation {
            handle: ResourceHandle::Buffer(vk_buffer),
            allocation,
            requested: size,
            allocated: info.size,
            mapped_ptr,
        }))
    }

    #[allow(clippy::too_many_arguments)]
    pub fn create_image(
        &mut self,
        extent: vk::Extent3D,
        mip_levels: u32,
        array_layers: u32,
        format: vk::Format,
        tiling: vk::ImageTiling,
        usage: vk::ImageUsageFlags,
        access: MemoryAccess,
        samples: vk::SampleCountFlags,
        debug_name: Option<&str>,
    ) -> anyhow::Result<AllocationKey> {
        let image_info = vk::ImageCreateInfo::default()
            .image_type(if extent.depth > 1 {
                vk::ImageType::TYPE_3D
            } else {
                vk::ImageType::TYPE_2D
            })
            .extent(extent)
            .mip_levels(mip_levels)
            .array_layers(array_layers)
            .format(format)
            .tiling(tiling)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .usage(usage)
            .samples(samples)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let alloc_info = access.allocation_create_info(false);

        let (vk_image, allocation) = unsafe {
            self.allocator
                .create_image(&image_info, &alloc_info)
                .with_context(|| {
                    format!("failed to allocate {}x{} image", extent.width, extent.height)
                })?
        };

        if let Some(name) = debug_name {
            self.device_context.name_object(vk_image, name)?;
        }

        // The driver owns the image layout, so the reserved size is the only
        // figure available; it stands in for the requested size too.
        let size = self.allocator.get_allocation_info(&allocation).size;
        self.stats.record(size, size);
        Ok(self.allocations.insert(Allocation {
            handle: ResourceHandle::Image(vk_image),
            allocation,
            requested: size,
            allocated: size,
            mapped_ptr: None,
        }))
    }

    pub fn destroy_buffer(&mut self, key: AllocationKey) {
        match self.allocations.get(key).map(|a| a.handle) {
            Some(ResourceHandle::Buffer(vk_buffer)) => {
                let mut allocation = self
                    .allocations
                    .remove(key)
                    .expect("allocation vanished between get and remove");
                unsafe {
                    self.allocator
                        .destroy_buffer(vk_buffer, &mut allocation.allocation);
                }
                self.stats.release(allocation.requested, allocation.allocated);
            }
            Some(ResourceHandle::Image(_)) => {
                log::error!("destroy_buffer: key refers to an image allocation");
            }
            None => {
                log::error!("destroy_buffer: unknown or already-destroyed allocation key");
            }
        }
    }

    pub fn destroy_image(&mut self, key: AllocationKey) {
        match self.allocations.get(key).map(|a| a.handle) {
            Some(ResourceHandle::Image(vk_image)) => {
                let mut allocation = self
                    .allocations
                    .remove(key)
                    .expect("allocation vanished between get and remove");
                unsafe {
                    self.allocator
                        .destroy_image(vk_image, &mut allocation.allocation);
                }
                self.stats.release(allocation.requested, allocation.allocated);
            }
            Some(ResourceHandle::Buffer(_)) => {
                log::error!("destroy_image: key refers to a buffer allocation");
            }
            None => {
                log::error!("destroy_image: unknown or already-destroyed allocation key");
            }
        }
    }

    pub fn allocation(&self, key: AllocationKey) -> Option<&Allocation> {
        self.allocations.get(key)
    }

    pub fn vk_buffer(&self, key: AllocationKey) -> anyhow::Result<vk::Buffer> {
        match self.allocations.get(key).map(|a| a.handle) {
            Some(ResourceHandle::Buffer(b)) => Ok(b),
            Some(ResourceHandle::Image(_)) => {
                anyhow::bail!("allocation key refers to an image, not a buffer")
            }
            None => anyhow::bail!("unknown allocation key"),
        }
    }

    /// Maps the allocation, returning the persistent pointer when one was
    /// established at creation. Nested-mapping bookkeeping lives in the
    /// resource wrappers, not here.
    pub fn map_memory(&mut self, key: AllocationKey) -> anyhow::Result<*mut u8> {
        let allocation = self
            .allocations
            .get_mut(key)
            .context("map_memory: unknown allocation key")?;
        if let Some(ptr) = allocation.mapped_ptr {
            return Ok(ptr);
        }
        unsafe {
            self.allocator
                .map_memory(&mut allocation.allocation)
                .context("failed to map allocation")
        }
    }

    /// No-op for persistently mapped allocations.
    pub fn unmap_memory(&mut self, key: AllocationKey) {
        let Some(allocation) = self.allocations.get_mut(key) else {
            log::error!("unmap_memory: unknown allocation key");
            return;
        };
        if allocation.mapped_ptr.is_some() {
            return;
        }
        unsafe {
            self.allocator.unmap_memory(&mut allocation.allocation);
        }
    }

    /// Required after any host write to non-coherent memory, before the GPU
    /// reads it. vk-mem skips the flush internally for coherent heaps.
    pub fn flush(
        &self,
        key: AllocationKey,
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
    ) -> anyhow::Result<()> {
        let allocation = self
            .allocations
            .get(key)
            .context("flush: unknown allocation key")?;
        self.allocator
            .flush_allocation(&allocation.allocation, offset, size)
            .context("failed to flush allocation")
    }

    pub fn stats(&self) -> MemoryStats {
        self.stats
    }

    pub fn log_heap_budgets(&self) {
        match self.allocator.get_heap_budgets() {
            Ok(budgets) => {
                for (heap, b) in budgets.iter().enumerate() {
                    log::debug!(
                        "heap {heap}: {} / {} bytes used",
                        b.usage,
                        b.budget
                    );
                }
            }
            Err(e) => log::warn!("failed to query heap budgets: {e:?}"),
        }
    }

    /// Shutdown check. Everything should have been destroyed by its owner
    /// before the allocator goes away; leaks are logged, not fatal.
    pub fn report_leaks(&self) {
        let stats = self.stats();
        if stats.allocation_count > 0 {
            log::warn!(
                "memory allocator torn down with {} live allocations ({} bytes used, {} reserved)",
                stats.allocation_count,
                stats.used_bytes,
                stats.allocated_bytes
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stats_track_used_and_reserved_separately() {
        let mut stats = MemoryStats::default();
        // A 100-byte request the allocator rounds up to 256.
        stats.record(100, 256);
        stats.record(64, 64);

        assert_eq!(stats.allocation_count, 2);
        assert_eq!(stats.used_bytes, 164);
        assert_eq!(stats.allocated_bytes, 320);

        stats.release(100, 256);
        assert_eq!(stats.allocation_count, 1);
        assert_eq!(stats.used_bytes, 64);
        assert_eq!(stats.allocated_bytes, 64);
    }

    #[test]
    fn release_saturates_instead_of_underflowing() {
        let mut stats = MemoryStats::default();
        stats.record(64, 64);
        stats.release(128, 256);
        assert_eq!(stats, MemoryStats::default());
    }
}
