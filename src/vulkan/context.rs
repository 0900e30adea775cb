use std::sync::Arc;

use anyhow::Context;
use ash::vk;
use winit::window::Window;

use super::device::create_logical_device;
use super::device_context::DeviceContext;
use super::instance::{InstanceParts, create_instance};
use super::physical::{QueueFamiliesIndices, pick_physical_device};

/// The stable Vulkan foundation: instance, surface, physical and logical
/// device, and queues. Everything here lives for the whole application;
/// surface-size-dependent objects (swapchain, per-image sync) live in the
/// renderer and get rebuilt on resize.
pub struct VulkanContext {
    instance: ash::Instance,
    debug_messenger: Option<(ash::ext::debug_utils::Instance, vk::DebugUtilsMessengerEXT)>,
    surface_instance: ash::khr::surface::Instance,
    surface_khr: vk::SurfaceKHR,
    physical_device: vk::PhysicalDevice,
    queue_families: QueueFamiliesIndices,
    device: Arc<ash::Device>,
    graphics_queue: vk::Queue,
    present_queue: vk::Queue,
    device_context: DeviceContext,
}

impl VulkanContext {
    pub fn new(window: &Window) -> anyhow::Result<Self> {
        let InstanceParts {
            instance,
            surface_instance,
            surface_khr,
            debug_messenger,
        } = create_instance(window).context("failed to create instance")?;

        let (physical_device, queue_families) =
            pick_physical_device(&instance, &surface_instance, surface_khr)
                .context("failed to pick physical device")?;

        let (device, graphics_queue, present_queue) =
            create_logical_device(&instance, physical_device, queue_families)
                .context("failed to create logical device")?;

        // Object naming requires the same debug-utils extension the
        // messenger does, so its presence is the gate.
        let debug_utils = debug_messenger
            .as_ref()
            .map(|_| Arc::new(ash::ext::debug_utils::Device::new(&instance, &device)));
        let device_context = DeviceContext {
            device: device.clone(),
            debug_utils,
        };

        Ok(Self {
            instance,
            debug_messenger,
            surface_instance,
            surface_khr,
            physical_device,
            queue_families,
            device,
            graphics_queue,
            present_queue,
            device_context,
        })
    }

    pub fn instance(&self) -> &ash::Instance {
        &self.instance
    }

    pub fn device(&self) -> &ash::Device {
        &self.device
    }

    pub fn device_arc(&self) -> Arc<ash::Device> {
        self.device.clone()
    }

    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    pub fn queue_families(&self) -> QueueFamiliesIndices {
        self.queue_families
    }

    pub fn graphics_queue(&self) -> vk::Queue {
        self.graphics_queue
    }

    pub fn present_queue(&self) -> vk::Queue {
        self.present_queue
    }

    pub fn surface_instance(&self) -> &ash::khr::surface::Instance {
        &self.surface_instance
    }

    pub fn surface_khr(&self) -> vk::SurfaceKHR {
        self.surface_khr
    }

    pub fn device_context(&self) -> &DeviceContext {
        &self.device_context
    }
}

impl Drop for VulkanContext {
    fn drop(&mut self) {
        log::trace!("Destroying Vulkan Context");
        unsafe {
            log::trace!("  Destroying Device");
            self.device.destroy_device(None);
            if let Some((debug_utils, messenger)) = &self.debug_messenger {
                log::trace!("  Destroying debug messenger");
                debug_utils.destroy_debug_utils_messenger(*messenger, None);
            }
            log::trace!("  Destroying Surface");
            self.surface_instance.destroy_surface(self.surface_khr, None);
            log::trace!("  Destroying Instance");
            self.instance.destroy_instance(None);
        }
        log::trace!("Vulkan Context Destroyed");
    }
}
