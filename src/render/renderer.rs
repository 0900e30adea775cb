use std::sync::Arc;

use anyhow::Context;
use ash::vk;
use bytemuck::{Pod, Zeroable};
#[cfg(feature = "tracing")]
use tracy_client::frame_mark;

use crate::{
    buffer::{Buffer, BufferSpec, BufferUsage},
    image::{Image, ImageSpec},
    memory::{MemoryAccess, MemoryAllocator},
    staging::{
        MAX_STAGING_ENTRIES, MIN_STAGING_SIZE, STAGING_GC_INTERVAL, STAGING_IDLE_AGE,
        StagingBufferPool,
    },
    transfer::TransferContext,
    vulkan::VulkanContext,
};

use super::{
    CommandRecorder, FRAMES_IN_FLIGHT, FrameSlot, FrameSyncManager, ImageSlot, PresentOutcome,
    SwapchainContext, VkGpuSync,
};

#[repr(C)]
#[derive(Copy, Clone, Pod, Zeroable)]
struct FrameUbo {
    time: f32,
    _pad: [f32; 3],
}

#[repr(C)]
#[derive(Copy, Clone, Pod, Zeroable)]
struct Vertex {
    position: [f32; 3],
    color: [f32; 3],
}

const TRIANGLE: [Vertex; 3] = [
    Vertex {
        position: [0.0, -0.5, 0.0],
        color: [1.0, 0.0, 0.0],
    },
    Vertex {
        position: [0.5, 0.5, 0.0],
        color: [0.0, 1.0, 0.0],
    },
    Vertex {
        position: [-0.5, 0.5, 0.0],
        color: [0.0, 0.0, 1.0],
    },
];

/// Owns every GPU-side subsystem and sequences one displayed frame:
/// wait -> acquire -> record -> submit -> present -> advance.
pub struct Renderer {
    device: Arc<ash::Device>,
    allocator: MemoryAllocator,
    staging: StagingBufferPool<Buffer>,
    transfer: TransferContext,
    swapchain: SwapchainContext,
    sync: FrameSyncManager,
    gpu: VkGpuSync,
    recorder: CommandRecorder,

    uniforms: Vec<Buffer>,
    vertex_buffer: Option<Buffer>,
    default_texture: Option<Image>,

    surface_extent: [u32; 2],
    start: std::time::Instant,
    frame_counter: u64,
}

impl Renderer {
    pub fn new(vk: &VulkanContext, surface_extent: [u32; 2]) -> anyhow::Result<Self> {
        let device = vk.device_arc();
        let queue_families = vk.queue_families();

        let mut allocator = MemoryAllocator::new(
            vk.instance(),
            &device,
            vk.physical_device(),
            vk.device_context().clone(),
        )
        .context("failed to create memory allocator")?;

        let staging = StagingBufferPool::new(MIN_STAGING_SIZE, MAX_STAGING_ENTRIES, STAGING_IDLE_AGE);
        let transfer = TransferContext::new(
            device.clone(),
            vk.graphics_queue(),
            queue_families.graphics_index,
        )
        .context("failed to create transfer context")?;

        let swapchain = SwapchainContext::new(
            vk.instance(),
            device.clone(),
            vk.physical_device(),
            vk.surface_instance(),
            vk.surface_khr(),
            queue_families,
            surface_extent,
        )
        .context("failed to create swapchain context")?;

        let frames = (0..FRAMES_IN_FLIGHT)
            .map(|_| FrameSlot::new(&device))
            .collect::<anyhow::Result<Vec<_>>>()
            .context("failed to create frame slots")?;
        let images = (0..swapchain.image_count())
            .map(|_| ImageSlot::new(&device))
            .collect::<anyhow::Result<Vec<_>>>()
            .context("failed to create image slots")?;
        let sync = FrameSyncManager::new(frames, images);

        let gpu = VkGpuSync::new(
            device.clone(),
            swapchain.swapchain_device.clone(),
            swapchain.swapchain,
            vk.graphics_queue(),
            vk.present_queue(),
        );

        let recorder = CommandRecorder::new(&device, queue_families.graphics_index, FRAMES_IN_FLIGHT)
            .context("failed to create command recorder")?;

        // One persistently mapped uniform buffer per frame slot; the fence
        // wait makes rewriting slot i's buffer safe.
        let uniforms = (0..FRAMES_IN_FLIGHT)
            .map(|i| {
                Buffer::new(
                    &mut allocator,
                    BufferSpec {
                        size: std::mem::size_of::<FrameUbo>() as vk::DeviceSize,
                        usage: BufferUsage::Uniform,
                        access: MemoryAccess::CpuToGpu,
                        persistent_map: true,
                        debug_name: Some(format!("frame-ubo({i})")),
                    },
                )
            })
            .collect::<anyhow::Result<Vec<_>>>()
            .context("failed to create frame uniform buffers")?;

        let mut renderer = Self {
            device,
            allocator,
            staging,
            transfer,
            swapchain,
            sync,
            gpu,
            recorder,
            uniforms,
            vertex_buffer: None,
            default_texture: None,
            surface_extent,
            start: std::time::Instant::now(),
            frame_counter: 0,
        };
        renderer.upload_static_resources()?;
        Ok(renderer)
    }

    /// Setup-time uploads exercising the staged path: static geometry into
    /// a device-local vertex buffer, and the default texture every material
    /// falls back to.
    fn upload_static_resources(&mut self) -> anyhow::Result<()> {
        let mut vertex_buffer = Buffer::new(
            &mut self.allocator,
            BufferSpec {
                size: std::mem::size_of_val(&TRIANGLE) as vk::DeviceSize,
                usage: BufferUsage::Vertex,
                access: MemoryAccess::GpuOnly,
                persistent_map: false,
                debug_name: Some("triangle-vertices".to_string()),
            },
        )?;
        vertex_buffer
            .upload(
                &mut self.allocator,
                &self.staging,
                Some(&self.transfer),
                bytemuck::cast_slice(&TRIANGLE),
                0,
            )
            .context("failed to upload vertex buffer")?;
        self.vertex_buffer = Some(vertex_buffer);

        let mut texture = Image::new(
            &mut self.allocator,
            ImageSpec::sampled_2d(4, 4, vk::Format::R8G8B8A8_UNORM)
                .with_debug_name("default-texture"),
        )?;
        let white = [255u8; 4 * 4 * 4];
        texture
            .upload(&mut self.allocator, &self.staging, &self.transfer, &white)
            .context("failed to upload default texture")?;
        texture
            .create_view(&self.device)
            .context("failed to create default texture view")?;
        self.default_texture = Some(texture);

        log::debug!("static resources uploaded: {:?}", self.allocator.stats());
        Ok(())
    }

    pub fn resized(&mut self, extent: [u32; 2]) {
        self.surface_extent = extent;
    }

    pub fn draw(&mut self, vk: &VulkanContext) -> anyhow::Result<()> {
        let _span = tracy_client::span!("draw_frame");

        self.sync.wait_for_frame(&mut self.gpu)?;

        let Some(acquired) = self.sync.acquire_image(&mut self.gpu)? else {
            log::debug!("surface out of date on acquire; recreating swapchain");
            self.recreate_swapchain(vk)?;
            return Ok(());
        };
        let image_index = acquired.image_index;

        let frame = self.sync.current_frame();
        let ubo = FrameUbo {
            time: self.start.elapsed().as_secs_f32(),
            _pad: [0.0; 3],
        };
        self.uniforms[frame].update(&mut self.allocator, bytemuck::bytes_of(&ubo), 0)?;

        let cmd = self.recorder.record(
            &self.device,
            frame,
            self.swapchain.images[image_index as usize],
            self.swapchain.image_views[image_index as usize],
            self.swapchain.extent(),
        )?;

        self.sync.submit(&mut self.gpu, cmd, image_index)?;

        let outcome = self.sync.present(&mut self.gpu, image_index)?;
        // A suboptimal acquire presents this frame first, then recreates.
        if acquired.suboptimal || outcome != PresentOutcome::Presented {
            log::debug!("surface changed; recreating swapchain");
            self.recreate_swapchain(vk)?;
        }

        self.end_of_frame_housekeeping();

        #[cfg(feature = "tracing")]
        frame_mark();
        Ok(())
    }

    fn end_of_frame_housekeeping(&mut self) {
        self.staging.advance_epoch();
        self.frame_counter += 1;
        // Amortized: collecting every frame would be wasted scans.
        if self.frame_counter % STAGING_GC_INTERVAL == 0 {
            self.staging.garbage_collect(&mut self.allocator);
        }
    }

    /// Recreates everything that depends on the surface. Frame-sync slots
    /// survive; only the per-image slots are rebuilt, because the new
    /// swapchain may have a different image count.
    fn recreate_swapchain(&mut self, vk: &VulkanContext) -> anyhow::Result<()> {
        unsafe {
            self.device
                .device_wait_idle()
                .context("failed waiting for device idle before swapchain recreation")?;
        }

        self.swapchain.destroy();
        self.swapchain = SwapchainContext::new(
            vk.instance(),
            self.device.clone(),
            vk.physical_device(),
            vk.surface_instance(),
            vk.surface_khr(),
            vk.queue_families(),
            self.surface_extent,
        )
        .context("failed to recreate swapchain")?;
        self.gpu.set_swapchain(self.swapchain.swapchain);

        let images = (0..self.swapchain.image_count())
            .map(|_| ImageSlot::new(&self.device))
            .collect::<anyhow::Result<Vec<_>>>()
            .context("failed to recreate image slots")?;
        self.sync.reset_images(&self.device, images);
        Ok(())
    }

    pub fn destroy(&mut self) -> anyhow::Result<()> {
        log::debug!("Renderer shutting down after {} frames", self.frame_counter);
        unsafe {
            self.device
                .device_wait_idle()
                .context("failed waiting for device idle at shutdown")?;
        }

        self.recorder.destroy(&self.device);
        self.sync.destroy(&self.device);

        for buffer in self.uniforms.drain(..) {
            buffer.destroy(&mut self.allocator);
        }
        if let Some(buffer) = self.vertex_buffer.take() {
            buffer.destroy(&mut self.allocator);
        }
        if let Some(texture) = self.default_texture.take() {
            texture.destroy(&self.device, &mut self.allocator);
        }
        self.staging.destroy(&mut self.allocator);
        self.transfer.destroy();
        self.swapchain.destroy();

        self.allocator.log_heap_budgets();
        self.allocator.report_leaks();
        Ok(())
    }
}
