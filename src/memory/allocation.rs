use ash::vk;
use slotmap::new_key_type;

new_key_type! { pub struct AllocationKey; }

/// The native handle an allocation is bound to. Keeping this typed (instead
/// of an untyped pointer crossing module boundaries) lets destroy paths
/// reject a key that refers to the wrong kind of resource.
#[derive(Copy, Clone)]
pub enum ResourceHandle {
    Buffer(vk::Buffer),
    Image(vk::Image),
}

/// One tracked unit of GPU memory. Owned by the [`MemoryAllocator`]'s
/// tracking table; resource wrappers hold the [`AllocationKey`] and request
/// destruction through the allocator.
///
/// [`MemoryAllocator`]: super::MemoryAllocator
pub struct Allocation {
    pub(crate) handle: ResourceHandle,
    pub(crate) allocation: vk_mem::Allocation,
    /// Bytes the caller asked for.
    pub(crate) requested: vk::DeviceSize,
    /// Bytes the allocator actually reserved; at least `requested`, more
    /// when alignment or the driver's layout rounds up.
    pub(crate) allocated: vk::DeviceSize,
    /// Set when the allocation was persistently mapped at creation.
    pub(crate) mapped_ptr: Option<*mut u8>,
}

impl Allocation {
    pub fn handle(&self) -> ResourceHandle {
        self.handle
    }

    pub fn size(&self) -> vk::DeviceSize {
        self.requested
    }

    pub fn allocated_size(&self) -> vk::DeviceSize {
        self.allocated
    }

    pub fn mapped_ptr(&self) -> Option<*mut u8> {
        self.mapped_ptr
    }
}

/// Where a resource's memory lives, and from which side it is written.
/// Determines host-visibility: everything except `GpuOnly` can be mapped.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum MemoryAccess {
    GpuOnly,
    CpuToGpu,
    GpuToCpu,
    CpuCached,
}

impl MemoryAccess {
    pub fn host_visible(self) -> bool {
        !matches!(self, MemoryAccess::GpuOnly)
    }

    pub(crate) fn allocation_create_info(self, mapped: bool) -> vk_mem::AllocationCreateInfo {
        let (usage, mut flags) = match self {
            MemoryAccess::GpuOnly => (
                vk_mem::MemoryUsage::AutoPreferDevice,
                vk_mem::AllocationCreateFlags::empty(),
            ),
            MemoryAccess::CpuToGpu => (
                vk_mem::MemoryUsage::Auto,
                vk_mem::AllocationCreateFlags::HOST_ACCESS_SEQUENTIAL_WRITE,
            ),
            MemoryAccess::GpuToCpu => (
                vk_mem::MemoryUsage::AutoPreferHost,
                vk_mem::AllocationCreateFlags::HOST_ACCESS_RANDOM,
            ),
            MemoryAccess::CpuCached => (
                vk_mem::MemoryUsage::AutoPreferHost,
                vk_mem::AllocationCreateFlags::HOST_ACCESS_RANDOM,
            ),
        };

        if mapped {
            flags |= vk_mem::AllocationCreateFlags::MAPPED;
        }

        vk_mem::AllocationCreateInfo {
            usage,
            flags,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gpu_only_is_not_host_visible() {
        assert!(!MemoryAccess::GpuOnly.host_visible());
        assert!(MemoryAccess::CpuToGpu.host_visible());
        assert!(MemoryAccess::GpuToCpu.host_visible());
        assert!(MemoryAccess::CpuCached.host_visible());
    }

    #[test]
    fn mapped_flag_is_requested_only_when_asked() {
        let info = MemoryAccess::CpuToGpu.allocation_create_info(true);
        assert!(info.flags.contains(vk_mem::AllocationCreateFlags::MAPPED));

        let info = MemoryAccess::CpuToGpu.allocation_create_info(false);
        assert!(!info.flags.contains(vk_mem::AllocationCreateFlags::MAPPED));
    }
}
