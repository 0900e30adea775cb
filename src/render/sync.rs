use std::sync::Arc;

use anyhow::Context;
use ash::vk;

/// Result of asking the presentation engine for the next image.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AcquireOutcome {
    Ready { image_index: u32, suboptimal: bool },
    /// The surface changed underneath us; the caller recreates the
    /// swapchain and tries again next frame.
    OutOfDate,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PresentOutcome {
    Presented,
    Suboptimal,
    OutOfDate,
}

/// A successful acquire. `suboptimal` means the image is still usable but
/// the swapchain no longer matches the surface exactly; the caller should
/// present this frame and then recreate.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AcquiredImage {
    pub image_index: u32,
    pub suboptimal: bool,
}

/// The device-side operations the frame state machine depends on. Keeping
/// this narrow lets the sequencing logic run against a recording fake in
/// tests; [`VkGpuSync`] is the production implementation.
pub trait GpuSync {
    fn wait_for_fence(&mut self, fence: vk::Fence) -> anyhow::Result<()>;
    fn reset_fence(&mut self, fence: vk::Fence) -> anyhow::Result<()>;
    fn acquire_next_image(&mut self, signal: vk::Semaphore) -> anyhow::Result<AcquireOutcome>;
    fn submit(
        &mut self,
        cmd: vk::CommandBuffer,
        wait: vk::Semaphore,
        signal: vk::Semaphore,
        fence: vk::Fence,
    ) -> anyhow::Result<()>;
    fn present(&mut self, image_index: u32, wait: vk::Semaphore) -> anyhow::Result<PresentOutcome>;
}

/// One frame-in-flight slot, cycled round-robin.
pub struct FrameSlot {
    pub fence: vk::Fence,
    pub image_available: vk::Semaphore,
}

impl FrameSlot {
    pub fn new(device: &ash::Device) -> anyhow::Result<Self> {
        // Created signaled so the very first wait on this slot passes.
        let fence = create_fence(device, true).context("failed to create frame fence")?;
        let image_available =
            create_semaphore(device).context("failed to create image available semaphore")?;
        Ok(Self {
            fence,
            image_available,
        })
    }

    pub fn destroy(&mut self, device: &ash::Device) {
        log::trace!("Destroying Frame Slot");
        unsafe {
            device.destroy_semaphore(self.image_available, None);
            device.destroy_fence(self.fence, None);
        }
    }
}

/// One swapchain-image slot. `last_used_by` remembers which frame fence
/// last claimed this image, so a new claimant can wait it out even when the
/// image count differs from the frames-in-flight count.
pub struct ImageSlot {
    pub render_finished: vk::Semaphore,
    last_used_by: Option<vk::Fence>,
}

impl ImageSlot {
    pub fn new(device: &ash::Device) -> anyhow::Result<Self> {
        let render_finished =
            create_semaphore(device).context("failed to create render finished semaphore")?;
        Ok(Self {
            render_finished,
            last_used_by: None,
        })
    }

    pub fn destroy(&mut self, device: &ash::Device) {
        unsafe {
            device.destroy_semaphore(self.render_finished, None);
        }
    }
}

/// The frame pacing state machine. Per slot the sequence is
/// wait -> acquire -> submit -> present, and the round-robin index advances
/// after present whether or not presentation succeeded, so a failed present
/// can never desynchronize the counter from the submissions that already
/// happened.
pub struct FrameSyncManager {
    frames: Vec<FrameSlot>,
    images: Vec<ImageSlot>,
    current: usize,
}

impl FrameSyncManager {
    pub fn new(frames: Vec<FrameSlot>, images: Vec<ImageSlot>) -> Self {
        assert!(!frames.is_empty());
        assert!(!images.is_empty());
        Self {
            frames,
            images,
            current: 0,
        }
    }

    pub fn current_frame(&self) -> usize {
        self.current
    }

    pub fn frames_in_flight(&self) -> usize {
        self.frames.len()
    }

    /// The throttle that stops the CPU racing more than N frames ahead:
    /// blocks until the GPU has finished the previous use of this slot.
    pub fn wait_for_frame(&self, gpu: &mut dyn GpuSync) -> anyhow::Result<()> {
        gpu.wait_for_fence(self.frames[self.current].fence)
            .context("failed waiting for frame fence")
    }

    /// Acquires the next presentable image. `Ok(None)` means the surface is
    /// out of date and the caller should recreate the swapchain; frame-sync
    /// objects themselves stay intact. A suboptimal acquire is still a
    /// usable image and is reported through [`AcquiredImage::suboptimal`].
    pub fn acquire_image(
        &mut self,
        gpu: &mut dyn GpuSync,
    ) -> anyhow::Result<Option<AcquiredImage>> {
        let slot = &self.frames[self.current];
        let outcome = gpu
            .acquire_next_image(slot.image_available)
            .context("failed to acquire swapchain image")?;

        let (image_index, suboptimal) = match outcome {
            AcquireOutcome::Ready {
                image_index,
                suboptimal,
            } => (image_index, suboptimal),
            AcquireOutcome::OutOfDate => return Ok(None),
        };

        let image = self
            .images
            .get_mut(image_index as usize)
            .context("acquired image index out of range")?;

        // Second protection layer beyond the frame-slot fence: the image
        // count and frames-in-flight count may differ, so the image may
        // still belong to an older submission.
        if let Some(fence) = image.last_used_by.take() {
            gpu.wait_for_fence(fence)
                .context("failed waiting for image's previous frame")?;
        }
        image.last_used_by = Some(self.frames[self.current].fence);

        Ok(Some(AcquiredImage {
            image_index,
            suboptimal,
        }))
    }

    /// Resets the slot fence immediately before resubmission (resetting any
    /// earlier would let a stale signaled state be observed) and submits,
    /// waiting on the acquire semaphore at color-attachment output and
    /// signaling the per-image render-finished semaphore plus the slot
    /// fence.
    pub fn submit(
        &mut self,
        gpu: &mut dyn GpuSync,
        cmd: vk::CommandBuffer,
        image_index: u32,
    ) -> anyhow::Result<()> {
        let image = self
            .images
            .get(image_index as usize)
            .context("submit: image index out of range")?;
        let slot = &self.frames[self.current];

        gpu.reset_fence(slot.fence)
            .context("failed to reset frame fence")?;
        gpu.submit(cmd, slot.image_available, image.render_finished, slot.fence)
            .context("failed to submit frame")
    }

    /// Presents and advances the round-robin index exactly once, on every
    /// path. The wait semaphore is the one belonging to the image index
    /// actually used, not to the frame slot.
    pub fn present(
        &mut self,
        gpu: &mut dyn GpuSync,
        image_index: u32,
    ) -> anyhow::Result<PresentOutcome> {
        let image = self
            .images
            .get(image_index as usize)
            .context("present: image index out of range")?;

        let result = gpu.present(image_index, image.render_finished);
        self.current = (self.current + 1) % self.frames.len();
        result.context("failed to present frame")
    }

    /// Swapchain recreation replaces the per-image slots; per-frame slots
    /// survive untouched.
    pub fn reset_images(&mut self, device: &ash::Device, images: Vec<ImageSlot>) {
        assert!(!images.is_empty());
        for mut slot in self.images.drain(..) {
            slot.destroy(device);
        }
        self.images = images;
    }

    pub fn destroy(&mut self, device: &ash::Device) {
        log::trace!("Destroying Frame Sync Manager");
        for mut slot in self.frames.drain(..) {
            slot.destroy(device);
        }
        for mut slot in self.images.drain(..) {
            slot.destroy(device);
        }
    }
}

/// Production [`GpuSync`] over the logical device, swapchain and queues.
pub struct VkGpuSync {
    device: Arc<ash::Device>,
    swapchain_device: ash::khr::swapchain::Device,
    swapchain: vk::SwapchainKHR,
    graphics_queue: vk::Queue,
    present_queue: vk::Queue,
}

impl VkGpuSync {
    pub fn new(
        device: Arc<ash::Device>,
        swapchain_device: ash::khr::swapchain::Device,
        swapchain: vk::SwapchainKHR,
        graphics_queue: vk::Queue,
        present_queue: vk::Queue,
    ) -> Self {
        Self {
            device,
            swapchain_device,
            swapchain,
            graphics_queue,
            present_queue,
        }
    }

    /// Points the sync layer at a freshly recreated swapchain.
    pub fn set_swapchain(&mut self, swapchain: vk::SwapchainKHR) {
        self.swapchain = swapchain;
    }
}

impl GpuSync for VkGpuSync {
    fn wait_for_fence(&mut self, fence: vk::Fence) -> anyhow::Result<()> {
        // Unbounded by design; a stuck GPU is fatal, not recoverable.
        unsafe {
            self.device
                .wait_for_fences(&[fence], true, u64::MAX)
                .context("failed waiting for fence")
        }
    }

    fn reset_fence(&mut self, fence: vk::Fence) -> anyhow::Result<()> {
        unsafe {
            self.device
                .reset_fences(&[fence])
                .context("failed to reset fence")
        }
    }

    fn acquire_next_image(&mut self, signal: vk::Semaphore) -> anyhow::Result<AcquireOutcome> {
        let result = unsafe {
            self.swapchain_device.acquire_next_image(
                self.swapchain,
                u64::MAX,
                signal,
                vk::Fence::null(),
            )
        };
        match result {
            Ok((image_index, suboptimal)) => Ok(AcquireOutcome::Ready {
                image_index,
                suboptimal,
            }),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(AcquireOutcome::OutOfDate),
            Err(e) => Err(anyhow::anyhow!("acquire_next_image failed: {e:?}")),
        }
    }

    fn submit(
        &mut self,
        cmd: vk::CommandBuffer,
        wait: vk::Semaphore,
        signal: vk::Semaphore,
        fence: vk::Fence,
    ) -> anyhow::Result<()> {
        let wait_semaphores = [wait];
        let signal_semaphores = [signal];
        let command_buffers = [cmd];
        // Not earlier stages: vertex and compute work may proceed before
        // the image is actually ready.
        let wait_stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];

        let submit_info = vk::SubmitInfo::default()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores);

        unsafe {
            self.device
                .queue_submit(self.graphics_queue, &[submit_info], fence)
                .context("failed to submit to graphics queue")
        }
    }

    fn present(&mut self, image_index: u32, wait: vk::Semaphore) -> anyhow::Result<PresentOutcome> {
        let wait_semaphores = [wait];
        let image_indices = [image_index];
        let swapchains = [self.swapchain];

        let present_info = vk::PresentInfoKHR::default()
            .wait_semaphores(&wait_semaphores)
            .image_indices(&image_indices)
            .swapchains(&swapchains);

        let result = unsafe {
            self.swapchain_device
                .queue_present(self.present_queue, &present_info)
        };
        match result {
            Ok(false) => Ok(PresentOutcome::Presented),
            Ok(true) => Ok(PresentOutcome::Suboptimal),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(PresentOutcome::OutOfDate),
            Err(e) => Err(anyhow::anyhow!("queue_present failed: {e:?}")),
        }
    }
}

pub fn create_semaphore(device: &ash::Device) -> anyhow::Result<vk::Semaphore> {
    unsafe {
        device
            .create_semaphore(&vk::SemaphoreCreateInfo::default(), None)
            .context("failed to create semaphore")
    }
}

pub fn create_fence(device: &ash::Device, signaled: bool) -> anyhow::Result<vk::Fence> {
    let flags = if signaled {
        vk::FenceCreateFlags::SIGNALED
    } else {
        vk::FenceCreateFlags::empty()
    };

    let create_info = vk::FenceCreateInfo::default().flags(flags);
    unsafe {
        device
            .create_fence(&create_info, None)
            .context("failed to create fence")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;
    use std::collections::VecDeque;

    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    enum Event {
        Wait(u64),
        Reset(u64),
        Acquire,
        Submit { fence: u64, image_sem: u64 },
        Present { image_sem: u64 },
    }

    /// Records every call the state machine makes, in order, and serves
    /// scripted acquire/present outcomes.
    #[derive(Default)]
    struct FakeGpu {
        events: Vec<Event>,
        acquire_script: VecDeque<AcquireOutcome>,
        present_script: VecDeque<PresentOutcome>,
    }

    impl FakeGpu {
        fn scripted_round_robin(image_count: u32, frames: usize) -> Self {
            let mut gpu = Self::default();
            for i in 0..frames {
                gpu.acquire_script.push_back(AcquireOutcome::Ready {
                    image_index: (i as u32) % image_count,
                    suboptimal: false,
                });
                gpu.present_script.push_back(PresentOutcome::Presented);
            }
            gpu
        }
    }

    impl GpuSync for FakeGpu {
        fn wait_for_fence(&mut self, fence: vk::Fence) -> anyhow::Result<()> {
            self.events.push(Event::Wait(fence.as_raw()));
            Ok(())
        }

        fn reset_fence(&mut self, fence: vk::Fence) -> anyhow::Result<()> {
            self.events.push(Event::Reset(fence.as_raw()));
            Ok(())
        }

        fn acquire_next_image(&mut self, _signal: vk::Semaphore) -> anyhow::Result<AcquireOutcome> {
            self.events.push(Event::Acquire);
            Ok(self
                .acquire_script
                .pop_front()
                .expect("acquire script exhausted"))
        }

        fn submit(
            &mut self,
            _cmd: vk::CommandBuffer,
            _wait: vk::Semaphore,
            signal: vk::Semaphore,
            fence: vk::Fence,
        ) -> anyhow::Result<()> {
            self.events.push(Event::Submit {
                fence: fence.as_raw(),
                image_sem: signal.as_raw(),
            });
            Ok(())
        }

        fn present(
            &mut self,
            _image_index: u32,
            wait: vk::Semaphore,
        ) -> anyhow::Result<PresentOutcome> {
            self.events.push(Event::Present {
                image_sem: wait.as_raw(),
            });
            Ok(self
                .present_script
                .pop_front()
                .expect("present script exhausted"))
        }
    }

    fn frame_slots(count: u64) -> Vec<FrameSlot> {
        (0..count)
            .map(|i| FrameSlot {
                fence: vk::Fence::from_raw(100 + i),
                image_available: vk::Semaphore::from_raw(200 + i),
            })
            .collect()
    }

    fn image_slots(count: u64) -> Vec<ImageSlot> {
        (0..count)
            .map(|i| ImageSlot {
                render_finished: vk::Semaphore::from_raw(300 + i),
                last_used_by: None,
            })
            .collect()
    }

    fn run_frame(sync: &mut FrameSyncManager, gpu: &mut FakeGpu) -> Option<u32> {
        sync.wait_for_frame(gpu).unwrap();
        let Some(acquired) = sync.acquire_image(gpu).unwrap() else {
            return None;
        };
        sync.submit(gpu, vk::CommandBuffer::null(), acquired.image_index)
            .unwrap();
        sync.present(gpu, acquired.image_index).unwrap();
        Some(acquired.image_index)
    }

    #[test]
    fn slot_fence_is_waited_before_reuse() {
        let mut gpu = FakeGpu::scripted_round_robin(3, 3);
        let mut sync = FrameSyncManager::new(frame_slots(2), image_slots(3));

        for _ in 0..3 {
            run_frame(&mut sync, &mut gpu);
        }

        // Frame 2 reuses slot 0: between the two submits that carry fence
        // 100 there must be a wait on fence 100.
        let submits: Vec<usize> = gpu
            .events
            .iter()
            .enumerate()
            .filter(|(_, e)| matches!(e, Event::Submit { fence: 100, .. }))
            .map(|(i, _)| i)
            .collect();
        assert_eq!(submits.len(), 2);
        let waited_between = gpu.events[submits[0]..submits[1]]
            .iter()
            .any(|e| matches!(e, Event::Wait(100)));
        assert!(waited_between, "slot 0 resubmitted before its fence wait");
    }

    #[test]
    fn third_frame_waits_on_first_frames_fence() {
        // N=2 in flight: frames 0 and 1 submit back to back; frame 2's
        // throttle wait must target slot 0's fence.
        let mut gpu = FakeGpu::scripted_round_robin(3, 3);
        let mut sync = FrameSyncManager::new(frame_slots(2), image_slots(3));

        run_frame(&mut sync, &mut gpu);
        run_frame(&mut sync, &mut gpu);
        gpu.events.clear();

        sync.wait_for_frame(&mut gpu).unwrap();
        assert_eq!(gpu.events, vec![Event::Wait(100)]);
    }

    #[test]
    fn image_still_in_flight_is_waited_out() {
        // 2 frames in flight but only 1 swapchain image: every acquire
        // after the first must wait on whichever fence last claimed the
        // image, in addition to the slot's own throttle wait.
        let mut gpu = FakeGpu::scripted_round_robin(1, 2);
        let mut sync = FrameSyncManager::new(frame_slots(2), image_slots(1));

        run_frame(&mut sync, &mut gpu);
        gpu.events.clear();

        sync.wait_for_frame(&mut gpu).unwrap();
        let acquired = sync.acquire_image(&mut gpu).unwrap();
        assert_eq!(acquired.map(|a| a.image_index), Some(0));
        // Wait(101) is slot 1's throttle; Wait(100) is the image's previous
        // owner, frame slot 0.
        assert_eq!(
            gpu.events,
            vec![Event::Wait(101), Event::Acquire, Event::Wait(100)]
        );
    }

    #[test]
    fn fence_reset_happens_immediately_before_submit() {
        let mut gpu = FakeGpu::scripted_round_robin(2, 1);
        let mut sync = FrameSyncManager::new(frame_slots(2), image_slots(2));

        run_frame(&mut sync, &mut gpu);

        let reset = gpu
            .events
            .iter()
            .position(|e| matches!(e, Event::Reset(100)))
            .unwrap();
        let submit = gpu
            .events
            .iter()
            .position(|e| matches!(e, Event::Submit { fence: 100, .. }))
            .unwrap();
        assert_eq!(submit, reset + 1);
    }

    #[test]
    fn present_waits_on_the_used_images_semaphore() {
        // Acquire returns image 1 even though this is frame slot 0; the
        // present wait must be image 1's semaphore (301), not slot-indexed.
        let mut gpu = FakeGpu::default();
        gpu.acquire_script.push_back(AcquireOutcome::Ready {
            image_index: 1,
            suboptimal: false,
        });
        gpu.present_script.push_back(PresentOutcome::Presented);
        let mut sync = FrameSyncManager::new(frame_slots(2), image_slots(3));

        let image_index = run_frame(&mut sync, &mut gpu).unwrap();
        assert_eq!(image_index, 1);
        assert!(
            gpu.events
                .contains(&Event::Present { image_sem: 301 })
        );
        assert!(
            gpu.events
                .contains(&Event::Submit {
                    fence: 100,
                    image_sem: 301
                })
        );
    }

    #[test]
    fn failed_present_still_advances_exactly_once() {
        let mut gpu = FakeGpu::default();
        for outcome in [
            PresentOutcome::OutOfDate,
            PresentOutcome::Presented,
            PresentOutcome::Suboptimal,
        ] {
            gpu.acquire_script.push_back(AcquireOutcome::Ready {
                image_index: 0,
                suboptimal: false,
            });
            gpu.present_script.push_back(outcome);
        }
        let mut sync = FrameSyncManager::new(frame_slots(2), image_slots(2));

        assert_eq!(sync.current_frame(), 0);
        let outcome = {
            sync.wait_for_frame(&mut gpu).unwrap();
            let acquired = sync.acquire_image(&mut gpu).unwrap().unwrap();
            sync.submit(&mut gpu, vk::CommandBuffer::null(), acquired.image_index)
                .unwrap();
            sync.present(&mut gpu, acquired.image_index).unwrap()
        };
        assert_eq!(outcome, PresentOutcome::OutOfDate);
        assert_eq!(
            sync.current_frame(),
            1,
            "failed present must advance the index exactly once"
        );

        run_frame(&mut sync, &mut gpu);
        assert_eq!(sync.current_frame(), 0);
        run_frame(&mut sync, &mut gpu);
        assert_eq!(sync.current_frame(), 1);
    }

    #[test]
    fn suboptimal_acquire_is_surfaced() {
        // The image is still usable, so acquire succeeds, but the caller
        // must learn the swapchain no longer matches the surface.
        let mut gpu = FakeGpu::default();
        gpu.acquire_script.push_back(AcquireOutcome::Ready {
            image_index: 0,
            suboptimal: true,
        });
        let mut sync = FrameSyncManager::new(frame_slots(2), image_slots(2));

        sync.wait_for_frame(&mut gpu).unwrap();
        let acquired = sync.acquire_image(&mut gpu).unwrap().unwrap();
        assert_eq!(
            acquired,
            AcquiredImage {
                image_index: 0,
                suboptimal: true
            }
        );
    }

    #[test]
    fn out_of_date_acquire_leaves_state_untouched() {
        let mut gpu = FakeGpu::default();
        gpu.acquire_script.push_back(AcquireOutcome::OutOfDate);
        let mut sync = FrameSyncManager::new(frame_slots(2), image_slots(2));

        sync.wait_for_frame(&mut gpu).unwrap();
        let acquired = sync.acquire_image(&mut gpu).unwrap();
        assert_eq!(acquired, None);
        assert_eq!(sync.current_frame(), 0, "no advance without a present");
        assert!(
            !gpu.events.iter().any(|e| matches!(e, Event::Reset(_))),
            "no fence may be reset on the recovery path"
        );
    }
}
