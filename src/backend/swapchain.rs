// Swapchain - Window presentation
//
// Negotiates format, present mode, extent and image count against what the
// surface reports, then creates the swapchain and one view per image.

use ash::extensions::khr;
use ash::prelude::VkResult;
use ash::vk::{self, Handle};

use super::device::{LogicalDeviceContext, PhysicalDeviceCandidate};
use super::error::{RendererError, Result};
use super::teardown::{GpuObject, TeardownStack};

/// Prefer 8-bit RGBA/BGRA with non-linear sRGB, else whatever the device lists first.
/// A lone UNDEFINED entry means the surface has no preference.
pub fn choose_surface_format(formats: &[vk::SurfaceFormatKHR]) -> Option<vk::SurfaceFormatKHR> {
    if let [only] = formats {
        if only.format == vk::Format::UNDEFINED {
            return Some(vk::SurfaceFormatKHR {
                format: vk::Format::R8G8B8A8_UNORM,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            });
        }
    }

    formats
        .iter()
        .find(|f| {
            matches!(f.format, vk::Format::R8G8B8A8_UNORM | vk::Format::B8G8R8A8_UNORM)
                && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
        })
        .or_else(|| formats.first())
        .copied()
}

/// MAILBOX when offered; FIFO is always supported
pub fn choose_present_mode(modes: &[vk::PresentModeKHR]) -> vk::PresentModeKHR {
    if modes.contains(&vk::PresentModeKHR::MAILBOX) {
        vk::PresentModeKHR::MAILBOX
    } else {
        vk::PresentModeKHR::FIFO
    }
}

/// Use the surface's extent unless it reports the "size follows window" sentinel,
/// in which case clamp the framebuffer size into the allowed range.
pub fn choose_extent(
    capabilities: &vk::SurfaceCapabilitiesKHR,
    framebuffer_size: (u32, u32),
) -> vk::Extent2D {
    if capabilities.current_extent.width != u32::MAX {
        return capabilities.current_extent;
    }

    // max(min, min(max, v)); min wins if the limits are inverted
    let fit = |value: u32, min: u32, max: u32| value.min(max).max(min);

    let (width, height) = framebuffer_size;
    vk::Extent2D {
        width: fit(
            width,
            capabilities.min_image_extent.width,
            capabilities.max_image_extent.width,
        ),
        height: fit(
            height,
            capabilities.min_image_extent.height,
            capabilities.max_image_extent.height,
        ),
    }
}

/// One more than the minimum, capped by the maximum (0 means unbounded)
pub fn choose_image_count(capabilities: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let wanted = capabilities.min_image_count.saturating_add(1);
    if capabilities.max_image_count > 0 && capabilities.max_image_count < wanted {
        capabilities.max_image_count
    } else {
        wanted
    }
}

/// How swapchain images are shared between the graphics and presentation queues
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageSharing {
    Exclusive,
    Concurrent([u32; 2]),
}

impl ImageSharing {
    pub fn for_families(graphics: u32, presentation: u32) -> Self {
        if graphics == presentation {
            ImageSharing::Exclusive
        } else {
            ImageSharing::Concurrent([graphics, presentation])
        }
    }

    pub fn mode(&self) -> vk::SharingMode {
        match self {
            ImageSharing::Exclusive => vk::SharingMode::EXCLUSIVE,
            ImageSharing::Concurrent(_) => vk::SharingMode::CONCURRENT,
        }
    }

    pub fn family_indices(&self) -> &[u32] {
        match self {
            ImageSharing::Exclusive => &[],
            ImageSharing::Concurrent(families) => families,
        }
    }
}

/// Swapchain image; the image belongs to the swapchain, the view to us
#[derive(Debug, Clone, Copy)]
pub struct SwapchainImage {
    pub image: vk::Image,
    pub view: vk::ImageView,
}

pub struct SwapchainState {
    pub loader: khr::Swapchain,
    pub swapchain: vk::SwapchainKHR,
    pub format: vk::SurfaceFormatKHR,
    pub present_mode: vk::PresentModeKHR,
    pub extent: vk::Extent2D,
    pub images: Vec<SwapchainImage>,
}

impl SwapchainState {
    pub fn new(
        instance: &ash::Instance,
        device: &LogicalDeviceContext,
        candidate: &PhysicalDeviceCandidate,
        surface: vk::SurfaceKHR,
        framebuffer_size: (u32, u32),
        stack: &mut TeardownStack,
    ) -> Result<Self> {
        let support = &candidate.support;
        let capabilities = &support.capabilities;

        let format = choose_surface_format(&support.formats)
            .ok_or(RendererError::SwapchainCreation(vk::Result::ERROR_FORMAT_NOT_SUPPORTED))?;
        let present_mode = choose_present_mode(&support.present_modes);
        let extent = choose_extent(capabilities, framebuffer_size);
        let image_count = choose_image_count(capabilities);

        let sharing =
            ImageSharing::for_families(candidate.graphics_family, candidate.presentation_family);

        log::info!(
            "Creating swapchain: {}x{}, {:?}/{:?}, {:?}, {} images, {:?} sharing",
            extent.width,
            extent.height,
            format.format,
            format.color_space,
            present_mode,
            image_count,
            sharing.mode()
        );

        let create_info = vk::SwapchainCreateInfoKHR::builder()
            .surface(surface)
            .min_image_count(image_count)
            .image_format(format.format)
            .image_color_space(format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .image_sharing_mode(sharing.mode())
            .queue_family_indices(sharing.family_indices())
            .pre_transform(capabilities.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode)
            .clipped(true)
            .old_swapchain(vk::SwapchainKHR::null());

        let loader = khr::Swapchain::new(instance, &device.device);

        let swapchain = unsafe { loader.create_swapchain(&create_info, None) }
            .map_err(RendererError::SwapchainCreation)?;
        {
            let loader = loader.clone();
            stack.push(GpuObject::Swapchain, swapchain, move |s| unsafe {
                loader.destroy_swapchain(s, None);
            });
        }

        let images = unsafe { loader.get_swapchain_images(swapchain) }
            .map_err(RendererError::SwapchainCreation)?;

        let images = images
            .into_iter()
            .map(|image| {
                let view = create_image_view(&device.device, image, format.format)?;
                stack.push_device_object(&device.device, view);
                Ok(SwapchainImage { image, view })
            })
            .collect::<Result<Vec<_>>>()?;

        log::info!("Created swapchain with {} images", images.len());
        for (index, image) in images.iter().enumerate() {
            log::debug!(
                "Swapchain image {}: {:#x} (view {:#x})",
                index,
                image.image.as_raw(),
                image.view.as_raw()
            );
        }

        Ok(Self {
            loader,
            swapchain,
            format,
            present_mode,
            extent,
            images,
        })
    }

    /// Acquire next image for rendering
    pub fn acquire_next_image(&self, timeout: u64, semaphore: vk::Semaphore) -> VkResult<(u32, bool)> {
        unsafe {
            self.loader
                .acquire_next_image(self.swapchain, timeout, semaphore, vk::Fence::null())
        }
    }

    /// Present rendered image to screen
    pub fn present(
        &self,
        queue: vk::Queue,
        image_index: u32,
        wait_semaphores: &[vk::Semaphore],
    ) -> VkResult<bool> {
        let swapchains = [self.swapchain];
        let image_indices = [image_index];

        let present_info = vk::PresentInfoKHR::builder()
            .wait_semaphores(wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        unsafe { self.loader.queue_present(queue, &present_info) }
    }

    pub fn views(&self) -> impl Iterator<Item = vk::ImageView> + '_ {
        self.images.iter().map(|i| i.view)
    }
}

/// 2D color view over the whole image
fn create_image_view(device: &ash::Device, image: vk::Image, format: vk::Format) -> Result<vk::ImageView> {
    let create_info = vk::ImageViewCreateInfo::builder()
        .image(image)
        .view_type(vk::ImageViewType::TYPE_2D)
        .format(format)
        .components(vk::ComponentMapping {
            r: vk::ComponentSwizzle::IDENTITY,
            g: vk::ComponentSwizzle::IDENTITY,
            b: vk::ComponentSwizzle::IDENTITY,
            a: vk::ComponentSwizzle::IDENTITY,
        })
        .subresource_range(vk::ImageSubresourceRange {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            base_mip_level: 0,
            level_count: 1,
            base_array_layer: 0,
            layer_count: 1,
        });

    unsafe { device.create_image_view(&create_info, None) }.map_err(RendererError::ImageViewCreation)
}
