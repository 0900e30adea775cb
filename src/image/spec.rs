use ash::vk;

use crate::memory::MemoryAccess;

#[derive(Clone, PartialEq, Eq, Hash)]
pub struct ImageSpec {
    pub extent: vk::Extent3D,
    pub mip_levels: u32,
    pub array_layers: u32,
    pub format: vk::Format,
    pub tiling: vk::ImageTiling,
    pub usage: vk::ImageUsageFlags,
    pub access: MemoryAccess,
    pub samples: vk::SampleCountFlags,
    pub debug_name: Option<String>,
}

impl ImageSpec {
    /// A single-mip 2D texture destined for shader sampling, populated
    /// through a staged upload.
    pub fn sampled_2d(width: u32, height: u32, format: vk::Format) -> Self {
        Self {
            extent: vk::Extent3D {
                width,
                height,
                depth: 1,
            },
            mip_levels: 1,
            array_layers: 1,
            format,
            tiling: vk::ImageTiling::OPTIMAL,
            usage: vk::ImageUsageFlags::TRANSFER_DST | vk::ImageUsageFlags::SAMPLED,
            access: MemoryAccess::GpuOnly,
            samples: vk::SampleCountFlags::TYPE_1,
            debug_name: None,
        }
    }

    pub fn with_debug_name(mut self, name: impl Into<String>) -> Self {
        self.debug_name = Some(name.into());
        self
    }
}
