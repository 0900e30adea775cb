mod recorder;
mod renderer;
mod swapchain;
mod sync;

pub use recorder::CommandRecorder;
pub use renderer::Renderer;
pub use swapchain::SwapchainContext;
pub use sync::{
    AcquireOutcome, AcquiredImage, FrameSlot, FrameSyncManager, GpuSync, ImageSlot,
    PresentOutcome, VkGpuSync,
};

/// How far the CPU may run ahead of the GPU.
pub const FRAMES_IN_FLIGHT: usize = 2;
