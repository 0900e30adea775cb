use anyhow::Context;
use ash::vk;
use smallvec::SmallVec;

use crate::{
    buffer::Buffer,
    memory::{AllocationKey, MemoryAllocator},
    staging::StagingBufferPool,
    transfer::TransferContext,
};

use super::spec::ImageSpec;

/// The barrier masks for one supported layout transition.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct TransitionPlan {
    pub old_layout: vk::ImageLayout,
    pub new_layout: vk::ImageLayout,
    pub src_access: vk::AccessFlags,
    pub dst_access: vk::AccessFlags,
    pub src_stage: vk::PipelineStageFlags,
    pub dst_stage: vk::PipelineStageFlags,
}

/// Layout transitions are driven from a table of known-good pairs; anything
/// else is refused, leaving the image in its prior valid layout.
pub(crate) fn plan_transition(
    old: vk::ImageLayout,
    new: vk::ImageLayout,
) -> anyhow::Result<TransitionPlan> {
    let (src_access, dst_access, src_stage, dst_stage) = match (old, new) {
        // No prior reader to wait for on a freshly created image.
        (vk::ImageLayout::UNDEFINED, vk::ImageLayout::TRANSFER_DST_OPTIMAL) => (
            vk::AccessFlags::empty(),
            vk::AccessFlags::TRANSFER_WRITE,
            vk::PipelineStageFlags::TOP_OF_PIPE,
            vk::PipelineStageFlags::TRANSFER,
        ),
        // Gate shader-stage reads on the preceding transfer write.
        (vk::ImageLayout::TRANSFER_DST_OPTIMAL, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL) => (
            vk::AccessFlags::TRANSFER_WRITE,
            vk::AccessFlags::SHADER_READ,
            vk::PipelineStageFlags::TRANSFER,
            vk::PipelineStageFlags::VERTEX_SHADER | vk::PipelineStageFlags::FRAGMENT_SHADER,
        ),
        _ => {
            log::error!("unsupported image layout transition {old:?} -> {new:?}");
            anyhow::bail!("unsupported image layout transition {old:?} -> {new:?}");
        }
    };

    Ok(TransitionPlan {
        old_layout: old,
        new_layout: new,
        src_access,
        dst_access,
        src_stage,
        dst_stage,
    })
}

fn record_barrier(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    image: vk::Image,
    plan: &TransitionPlan,
) {
    let barrier = vk::ImageMemoryBarrier::default()
        .old_layout(plan.old_layout)
        .new_layout(plan.new_layout)
        .src_access_mask(plan.src_access)
        .dst_access_mask(plan.dst_access)
        .image(image)
        .subresource_range(
            vk::ImageSubresourceRange::default()
                .aspect_mask(vk::ImageAspectFlags::COLOR)
                .base_mip_level(0)
                .level_count(vk::REMAINING_MIP_LEVELS)
                .base_array_layer(0)
                .layer_count(vk::REMAINING_ARRAY_LAYERS),
        );

    unsafe {
        device.cmd_pipeline_barrier(
            cmd,
            plan.src_stage,
            plan.dst_stage,
            vk::DependencyFlags::empty(),
            &[],
            &[],
            &[barrier],
        );
    }
}

/// A GPU image bound to one allocation, with the current layout tracked on
/// the CPU side rather than queried from the driver.
pub struct Image {
    key: AllocationKey,
    vk_image: vk::Image,
    spec: ImageSpec,
    layout: vk::ImageLayout,
    views: SmallVec<[vk::ImageView; 2]>,
}

impl Image {
    pub fn new(allocator: &mut MemoryAllocator, spec: ImageSpec) -> anyhow::Result<Self> {
        if spec.extent.width == 0 || spec.extent.height == 0 {
            anyhow::bail!("image {:?} requested with zero extent", spec.debug_name);
        }

        let key = allocator
            .create_image(
                spec.extent,
                spec.mip_levels,
                spec.array_layers,
                spec.format,
                spec.tiling,
                spec.usage,
                spec.access,
                spec.samples,
                spec.debug_name.as_deref(),
            )
            .with_context(|| format!("failed to create image {:?}", spec.debug_name))?;

        let vk_image = match allocator.allocation(key).map(|a| a.handle()) {
            Some(crate::memory::ResourceHandle::Image(i)) => i,
            _ => anyhow::bail!("image allocation did not yield an image handle"),
        };

        Ok(Self {
            key,
            vk_image,
            spec,
            layout: vk::ImageLayout::UNDEFINED,
            views: SmallVec::new(),
        })
    }

    pub fn vk_image(&self) -> vk::Image {
        self.vk_image
    }

    /// Creates a full-subresource view over the image and tracks it; views
    /// are destroyed together with the image.
    pub fn create_view(&mut self, device: &ash::Device) -> anyhow::Result<vk::ImageView> {
        let info = vk::ImageViewCreateInfo::default()
            .image(self.vk_image)
            .view_type(if self.spec.array_layers > 1 {
                vk::ImageViewType::TYPE_2D_ARRAY
            } else {
                vk::ImageViewType::TYPE_2D
            })
            .format(self.spec.format)
            .subresource_range(
                vk::ImageSubresourceRange::default()
                    .aspect_mask(vk::ImageAspectFlags::COLOR)
                    .base_mip_level(0)
                    .level_count(self.spec.mip_levels)
                    .base_array_layer(0)
                    .layer_count(self.spec.array_layers),
            );
        let view = unsafe {
            device
                .create_image_view(&info, None)
                .with_context(|| format!("failed to create view for image {:?}", self.spec.debug_name))?
        };
        self.views.push(view);
        Ok(view)
    }

    pub fn layout(&self) -> vk::ImageLayout {
        self.layout
    }

    pub fn extent(&self) -> vk::Extent3D {
        self.spec.extent
    }

    /// Records a barrier moving the image into `new_layout`. An unsupported
    /// pair is a logged error for this call; the image keeps its prior
    /// layout.
    pub fn record_transition(
        &mut self,
        device: &ash::Device,
        cmd: vk::CommandBuffer,
        new_layout: vk::ImageLayout,
    ) -> anyhow::Result<()> {
        let plan = plan_transition(self.layout, new_layout)?;
        record_barrier(device, cmd, self.vk_image, &plan);
        self.layout = new_layout;
        Ok(())
    }

    /// Staged upload: Undefined -> TransferDst, copy from a pooled staging
    /// buffer, TransferDst -> ShaderReadOnly, all in one synchronous
    /// single-use submission.
    pub fn upload(
        &mut self,
        allocator: &mut MemoryAllocator,
        staging: &StagingBufferPool<Buffer>,
        transfer: &TransferContext,
        data: &[u8],
    ) -> anyhow::Result<()> {
        // Plan both hops before any work so an unsupported starting layout
        // fails without touching the staging pool.
        let to_transfer = plan_transition(self.layout, vk::ImageLayout::TRANSFER_DST_OPTIMAL)?;
        let to_shader = plan_transition(
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        )?;

        let image = self.vk_image;
        let extent = self.spec.extent;

        staging.with_staging_buffer(allocator, data.len() as vk::DeviceSize, |allocator, block| {
            block.update(allocator, data, 0)?;
            let src = block.vk_buffer();
            transfer.immediate(|device, cmd| {
                record_barrier(device, cmd, image, &to_transfer);

                let region = vk::BufferImageCopy::default()
                    .image_subresource(
                        vk::ImageSubresourceLayers::default()
                            .aspect_mask(vk::ImageAspectFlags::COLOR)
                            .mip_level(0)
                            .base_array_layer(0)
                            .layer_count(1),
                    )
                    .image_extent(extent);
                unsafe {
                    device.cmd_copy_buffer_to_image(
                        cmd,
                        src,
                        image,
                        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                        &[region],
                    );
                }

                record_barrier(device, cmd, image, &to_shader);
                Ok(())
            })
        })?;

        self.layout = vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL;
        Ok(())
    }

    pub fn destroy(self, device: &ash::Device, allocator: &mut MemoryAllocator) {
        for view in self.views {
            unsafe { device.destroy_image_view(view, None) };
        }
        allocator.destroy_image(self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upload_transitions_are_supported() {
        assert!(
            plan_transition(
                vk::ImageLayout::UNDEFINED,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL
            )
            .is_ok()
        );
        assert!(
            plan_transition(
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL
            )
            .is_ok()
        );
    }

    #[test]
    fn unknown_transition_pair_is_refused() {
        assert!(
            plan_transition(
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL
            )
            .is_err()
        );
        assert!(
            plan_transition(vk::ImageLayout::UNDEFINED, vk::ImageLayout::GENERAL).is_err()
        );
    }

    #[test]
    fn fresh_image_transition_waits_on_nothing() {
        let plan = plan_transition(
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        )
        .unwrap();
        assert_eq!(plan.src_access, vk::AccessFlags::empty());
        assert_eq!(plan.src_stage, vk::PipelineStageFlags::TOP_OF_PIPE);
    }

    #[test]
    fn shader_read_transition_gates_on_transfer_write() {
        let plan = plan_transition(
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        )
        .unwrap();
        assert_eq!(plan.src_access, vk::AccessFlags::TRANSFER_WRITE);
        assert!(
            plan.dst_stage
                .contains(vk::PipelineStageFlags::FRAGMENT_SHADER)
        );
    }
}
