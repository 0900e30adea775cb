use anyhow::Context;
use ash::vk;

/// Owns the per-frame primary command buffers, one per frame-in-flight
/// slot. Reusing a slot's buffer is safe because the frame fence has
/// already been waited on by the time [`record`] runs.
///
/// [`record`]: CommandRecorder::record
pub struct CommandRecorder {
    command_pool: vk::CommandPool,
    command_buffers: Vec<vk::CommandBuffer>,
}

impl CommandRecorder {
    pub fn new(
        device: &ash::Device,
        queue_family: u32,
        frame_count: usize,
    ) -> anyhow::Result<Self> {
        let pool_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(queue_family)
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);
        let command_pool = unsafe {
            device
                .create_command_pool(&pool_info, None)
                .context("failed to create frame command pool")?
        };

        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(frame_count as u32);
        let command_buffers = unsafe {
            device
                .allocate_command_buffers(&alloc_info)
                .context("failed to allocate frame command buffers")?
        };

        Ok(Self {
            command_pool,
            command_buffers,
        })
    }

    /// Records the frame: acquire barrier, clear pass via dynamic
    /// rendering, present barrier. Draw submission plugs in between the
    /// barriers once there is geometry to draw.
    pub fn record(
        &self,
        device: &ash::Device,
        frame_index: usize,
        swapchain_image: vk::Image,
        swapchain_image_view: vk::ImageView,
        extent: vk::Extent2D,
    ) -> anyhow::Result<vk::CommandBuffer> {
        let _span = tracy_client::span!("record_commands");
        let cmd = *self
            .command_buffers
            .get(frame_index)
            .context("frame index out of range for command recorder")?;

        let clear_color = vk::ClearColorValue {
            float32: [0.392, 0.584, 0.929, 1.0],
        };
        let clear_value = vk::ClearValue { color: clear_color };
        let render_rect = vk::Rect2D {
            offset: vk::Offset2D::default(),
            extent,
        };

        unsafe {
            device
                .begin_command_buffer(cmd, &vk::CommandBufferBeginInfo::default())
                .context("failed to begin command buffer")?;

            transition_image_to_render(device, cmd, swapchain_image);

            device.cmd_begin_rendering(
                cmd,
                &vk::RenderingInfo::default()
                    .render_area(render_rect)
                    .layer_count(1)
                    .color_attachments(&[vk::RenderingAttachmentInfo::default()
                        .image_view(swapchain_image_view)
                        .image_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
                        .load_op(vk::AttachmentLoadOp::CLEAR)
                        .store_op(vk::AttachmentStoreOp::STORE)
                        .clear_value(clear_value)]),
            );
            device.cmd_end_rendering(cmd);

            transition_image_to_present(device, cmd, swapchain_image);
            device
                .end_command_buffer(cmd)
                .context("failed to end command buffer")?;
        }

        Ok(cmd)
    }

    pub fn destroy(&mut self, device: &ash::Device) {
        log::trace!("Destroying Command Recorder");
        unsafe {
            device.destroy_command_pool(self.command_pool, None);
        }
        self.command_buffers.clear();
    }
}

fn transition_image_to_render(device: &ash::Device, cmd: vk::CommandBuffer, image: vk::Image) {
    // UNDEFINED discards the previous contents; the clear pass writes every
    // pixel, so nothing presented earlier needs to survive.
    let barrier = vk::ImageMemoryBarrier::default()
        .old_layout(vk::ImageLayout::UNDEFINED)
        .new_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
        .image(image)
        .subresource_range(
            vk::ImageSubresourceRange::default()
                .aspect_mask(vk::ImageAspectFlags::COLOR)
                .base_mip_level(0)
                .level_count(1)
                .base_array_layer(0)
                .layer_count(1),
        )
        .src_access_mask(vk::AccessFlags::empty())
        .dst_access_mask(vk::AccessFlags::COLOR_ATTACHMENT_WRITE);

    unsafe {
        device.cmd_pipeline_barrier(
            cmd,
            vk::PipelineStageFlags::TOP_OF_PIPE,
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            vk::DependencyFlags::empty(),
            &[],
            &[],
            &[barrier],
        );
    }
}

fn transition_image_to_present(device: &ash::Device, cmd: vk::CommandBuffer, image: vk::Image) {
    let barrier = vk::ImageMemoryBarrier::default()
        .old_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
        .new_layout(vk::ImageLayout::PRESENT_SRC_KHR)
        .image(image)
        .subresource_range(
            vk::ImageSubresourceRange::default()
                .aspect_mask(vk::ImageAspectFlags::COLOR)
                .base_mip_level(0)
                .level_count(1)
                .base_array_layer(0)
                .layer_count(1),
        )
        .src_access_mask(vk::AccessFlags::COLOR_ATTACHMENT_WRITE)
        .dst_access_mask(vk::AccessFlags::empty());

    unsafe {
        device.cmd_pipeline_barrier(
            cmd,
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            vk::PipelineStageFlags::BOTTOM_OF_PIPE,
            vk::DependencyFlags::empty(),
            &[],
            &[],
            &[barrier],
        );
    }
}
