use anyhow::Context;
use winit::window::Window;

use crate::render::Renderer;
use crate::vulkan::VulkanContext;

/// Ties the Vulkan foundation to the renderer and drives one frame per
/// redraw. Shutdown is explicit: the renderer must release its GPU
/// resources while the device is still alive, so [`shutdown`] runs before
/// the context drops.
///
/// [`shutdown`]: Engine::shutdown
pub struct Engine {
    vulkan: VulkanContext,
    renderer: Option<Renderer>,
}

impl Engine {
    pub fn new(window: &Window) -> anyhow::Result<Self> {
        let size = window.inner_size();
        let vulkan = VulkanContext::new(window).context("failed to create Vulkan context")?;
        let renderer = Renderer::new(&vulkan, [size.width, size.height])
            .context("failed to create renderer")?;

        Ok(Self {
            vulkan,
            renderer: Some(renderer),
        })
    }

    pub fn draw(&mut self) -> anyhow::Result<()> {
        if let Some(renderer) = self.renderer.as_mut() {
            renderer.draw(&self.vulkan)?;
        }
        Ok(())
    }

    pub fn resized(&mut self, width: u32, height: u32) {
        if width == 0 || height == 0 {
            // Minimized; the next acquire reports out-of-date and the
            // renderer recreates once the window has a real size again.
            return;
        }
        if let Some(renderer) = self.renderer.as_mut() {
            renderer.resized([width, height]);
        }
    }

    pub fn shutdown(&mut self) -> anyhow::Result<()> {
        if let Some(mut renderer) = self.renderer.take() {
            renderer.destroy().context("failed to shut renderer down")?;
        }
        Ok(())
    }
}
