use std::sync::Arc;

use anyhow::Context;
use ash::vk;

/// Synchronous single-use command submission, used for setup-time uploads
/// and layout transitions. Submitting and then waiting on a fence is
/// deliberately heavyweight; nothing on the per-frame path goes through
/// here.
pub struct TransferContext {
    device: Arc<ash::Device>,
    queue: vk::Queue,
    command_pool: vk::CommandPool,
}

impl TransferContext {
    pub fn new(
        device: Arc<ash::Device>,
        queue: vk::Queue,
        queue_family: u32,
    ) -> anyhow::Result<Self> {
        let pool_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(queue_family)
            .flags(vk::CommandPoolCreateFlags::TRANSIENT);
        let command_pool = unsafe {
            device
                .create_command_pool(&pool_info, None)
                .context("failed to create transfer command pool")?
        };

        Ok(Self {
            device,
            queue,
            command_pool,
        })
    }

    /// Records a command buffer via `f`, submits it, and blocks until the
    /// GPU signals completion.
    pub fn immediate(
        &self,
        f: impl FnOnce(&ash::Device, vk::CommandBuffer) -> anyhow::Result<()>,
    ) -> anyhow::Result<()> {
        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(self.command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let command_buffers = unsafe {
            self.device
                .allocate_command_buffers(&alloc_info)
                .context("failed to allocate single-use command buffer")?
        };
        let cmd = command_buffers[0];

        let result = self.record_and_submit(cmd, f);

        unsafe {
            self.device
                .free_command_buffers(self.command_pool, &command_buffers);
        }
        result
    }

    fn record_and_submit(
        &self,
        cmd: vk::CommandBuffer,
        f: impl FnOnce(&ash::Device, vk::CommandBuffer) -> anyhow::Result<()>,
    ) -> anyhow::Result<()> {
        unsafe {
            self.device
                .begin_command_buffer(
                    cmd,
                    &vk::CommandBufferBeginInfo::default()
                        .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT),
                )
                .context("failed to begin single-use command buffer")?;
        }

        f(&self.device, cmd)?;

        unsafe {
            self.device
                .end_command_buffer(cmd)
                .context("failed to end single-use command buffer")?;
        }

        let fence = unsafe {
            self.device
                .create_fence(&vk::FenceCreateInfo::default(), None)
                .context("failed to create submission fence")?
        };

        let command_buffers = [cmd];
        let submit_info = vk::SubmitInfo::default().command_buffers(&command_buffers);
        let result = unsafe {
            self.device
                .queue_submit(self.queue, &[submit_info], fence)
                .context("failed to submit single-use command buffer")
                .and_then(|()| {
                    self.device
                        .wait_for_fences(&[fence], true, u64::MAX)
                        .context("failed waiting for single-use submission")
                })
        };

        unsafe {
            self.device.destroy_fence(fence, None);
        }
        result
    }

    pub fn destroy(&mut self) {
        log::trace!("Destroying Transfer Context");
        unsafe {
            self.device.destroy_command_pool(self.command_pool, None);
        }
    }
}
