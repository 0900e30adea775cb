use ash::vk;

use crate::memory::MemoryAccess;

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum BufferUsage {
    Vertex,
    Index,
    Uniform,
    Storage,
    Staging,
    Indirect,
}

impl BufferUsage {
    pub(crate) fn usage_flags(self) -> vk::BufferUsageFlags {
        match self {
            BufferUsage::Vertex => {
                vk::BufferUsageFlags::VERTEX_BUFFER | vk::BufferUsageFlags::TRANSFER_DST
            }
            BufferUsage::Index => {
                vk::BufferUsageFlags::INDEX_BUFFER | vk::BufferUsageFlags::TRANSFER_DST
            }
            BufferUsage::Uniform => vk::BufferUsageFlags::UNIFORM_BUFFER,
            BufferUsage::Storage => {
                vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::TRANSFER_DST
            }
            BufferUsage::Staging => vk::BufferUsageFlags::TRANSFER_SRC,
            BufferUsage::Indirect => {
                vk::BufferUsageFlags::INDIRECT_BUFFER | vk::BufferUsageFlags::TRANSFER_DST
            }
        }
    }
}

#[derive(Clone, PartialEq, Eq, Hash)]
pub struct BufferSpec {
    pub size: vk::DeviceSize,
    pub usage: BufferUsage,
    pub access: MemoryAccess,
    pub persistent_map: bool,
    pub debug_name: Option<String>,
}

impl BufferSpec {
    /// Applies the category rules before allocation. A staging buffer that
    /// is not host-visible is a contradiction, so the access category is
    /// corrected with a warning instead of refusing the request.
    pub(crate) fn resolved(mut self) -> Self {
        if self.usage == BufferUsage::Staging && !self.access.host_visible() {
            log::warn!(
                "staging buffer {:?} requested GpuOnly memory; forcing CpuToGpu",
                self.debug_name
            );
            self.access = MemoryAccess::CpuToGpu;
        }
        self
    }

    /// Validates a host-side write against the buffer's capacity and
    /// visibility. Refused writes must not touch any state.
    pub(crate) fn check_update(&self, offset: vk::DeviceSize, len: usize) -> anyhow::Result<()> {
        if !self.access.host_visible() {
            log::error!(
                "update refused: buffer {:?} is not host-visible",
                self.debug_name
            );
            anyhow::bail!("update on a device-local buffer");
        }
        let end = offset
            .checked_add(len as vk::DeviceSize)
            .unwrap_or(vk::DeviceSize::MAX);
        if end > self.size {
            log::error!(
                "update refused: {} bytes at offset {} exceeds capacity {} of buffer {:?}",
                len,
                offset,
                self.size,
                self.debug_name
            );
            anyhow::bail!("update range exceeds buffer capacity");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(usage: BufferUsage, access: MemoryAccess, size: vk::DeviceSize) -> BufferSpec {
        BufferSpec {
            size,
            usage,
            access,
            persistent_map: false,
            debug_name: None,
        }
    }

    #[test]
    fn staging_forces_host_visibility() {
        let resolved = spec(BufferUsage::Staging, MemoryAccess::GpuOnly, 64).resolved();
        assert_eq!(resolved.access, MemoryAccess::CpuToGpu);
    }

    #[test]
    fn non_staging_access_is_preserved() {
        let resolved = spec(BufferUsage::Vertex, MemoryAccess::GpuOnly, 64).resolved();
        assert_eq!(resolved.access, MemoryAccess::GpuOnly);
    }

    #[test]
    fn update_refused_on_gpu_only() {
        let s = spec(BufferUsage::Vertex, MemoryAccess::GpuOnly, 64);
        assert!(s.check_update(0, 16).is_err());
    }

    #[test]
    fn update_refused_past_capacity() {
        let s = spec(BufferUsage::Uniform, MemoryAccess::CpuToGpu, 64);
        assert!(s.check_update(0, 64).is_ok());
        assert!(s.check_update(1, 64).is_err());
        assert!(s.check_update(64, 1).is_err());
        assert!(s.check_update(vk::DeviceSize::MAX, usize::MAX).is_err());
    }
}
