use std::sync::Arc;

use anyhow::Context;
use ash::vk;

use crate::vulkan::{QueueFamiliesIndices, SwapchainSupportDetails, SwapchainProperties};

pub struct SwapchainContext {
    device: Arc<ash::Device>,
    pub swapchain_device: ash::khr::swapchain::Device,
    pub swapchain: vk::SwapchainKHR,
    properties: SwapchainProperties,
    pub images: Vec<vk::Image>,
    pub image_views: Vec<vk::ImageView>,
}

impl SwapchainContext {
    pub fn new(
        instance: &ash::Instance,
        device: Arc<ash::Device>,
        physical_device: vk::PhysicalDevice,
        surface_instance: &ash::khr::surface::Instance,
        surface_khr: vk::SurfaceKHR,
        queue_families: QueueFamiliesIndices,
        preferred_dimensions: [u32; 2],
    ) -> anyhow::Result<Self> {
        let details = SwapchainSupportDetails::new(physical_device, surface_instance, surface_khr)
            .context("failed to create swapchain support details")?;
        let properties = details.get_ideal_swapchain_properties(preferred_dimensions);

        let format = properties.format;
        let present_mode = properties.present_mode;
        let extent = properties.extent;
        let image_count = {
            let max = details.capabilities.max_image_count;
            let mut preferred = details.capabilities.min_image_count + 1;
            if max > 0 && preferred > max {
                preferred = max;
            }
            preferred
        };

        log::debug!(
            "Creating swapchain.\n\tFormat: {:?}\n\tColorSpace: {:?}\n\tPresentMode: {:?}\n\tExtent: {:?}\n\tImageCount: {:?}",
            format.format,
            format.color_space,
            present_mode,
            extent,
            image_count,
        );

        let graphics = queue_families.graphics_index;
        let present = queue_families.present_index;
        let families_indices = [graphics, present];

        let create_info = {
            let mut builder = vk::SwapchainCreateInfoKHR::default()
                .surface(surface_khr)
                .min_image_count(image_count)
                .image_format(format.format)
                .image_color_space(format.color_space)
                .image_extent(extent)
                .image_array_layers(1)
                .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT);

            builder = if graphics != present {
                builder
                    .image_sharing_mode(vk::SharingMode::CONCURRENT)
                    .queue_family_indices(&families_indices)
            } else {
                builder.image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            };

            builder
                .pre_transform(details.capabilities.current_transform)
                .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
                .present_mode(present_mode)
                .clipped(true)
        };

        let swapchain_device = ash::khr::swapchain::Device::new(instance, &device);
        let swapchain = unsafe {
            swapchain_device
                .create_swapchain(&create_info, None)
                .context("failed to create swapchain")?
        };
        let images = unsafe {
            swapchain_device
                .get_swapchain_images(swapchain)
                .context("failed to get swapchain images")?
        };

        let image_views = images
            .iter()
            .map(|&image| {
                let info = vk::ImageViewCreateInfo::default()
                    .image(image)
                    .view_type(vk::ImageViewType::TYPE_2D)
                    .format(format.format)
                    .subresource_range(
                        vk::ImageSubresourceRange::default()
                            .aspect_mask(vk::ImageAspectFlags::COLOR)
                            .base_mip_level(0)
                            .level_count(1)
                            .base_array_layer(0)
                            .layer_count(1),
                    );
                unsafe {
                    device
                        .create_image_view(&info, None)
                        .context("failed to create swapchain image view")
                }
            })
            .collect::<anyhow::Result<Vec<_>>>()?;

        Ok(Self {
            device,
            swapchain_device,
            swapchain,
            properties,
            images,
            image_views,
        })
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.properties.extent
    }

    pub fn format(&self) -> vk::Format {
        self.properties.format.format
    }

    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    pub fn destroy(&mut self) {
        log::trace!("Destroying Swapchain Context");
        unsafe {
            for &view in &self.image_views {
                self.device.destroy_image_view(view, None);
            }
            self.swapchain_device
                .destroy_swapchain(self.swapchain, None);
        }
        self.image_views.clear();
        self.images.clear();
        self.swapchain = vk::SwapchainKHR::null();
    }
}
