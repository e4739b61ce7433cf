// Capability probing
//
// Read-only queries against the host and candidate GPUs. Device selection
// only talks to the `CapabilityProbe` trait, so it can run against canned
// answers as well as a live instance.

use ash::extensions::khr;
use ash::prelude::VkResult;
use ash::vk;
use std::ffi::{CStr, CString};

/// What a surface offers a particular physical device
#[derive(Debug, Clone, Default)]
pub struct SwapchainSupport {
    pub capabilities: vk::SurfaceCapabilitiesKHR,
    pub formats: Vec<vk::SurfaceFormatKHR>,
    pub present_modes: Vec<vk::PresentModeKHR>,
}

impl SwapchainSupport {
    pub fn is_adequate(&self) -> bool {
        !self.formats.is_empty() && !self.present_modes.is_empty()
    }
}

pub trait CapabilityProbe {
    fn physical_devices(&self) -> VkResult<Vec<vk::PhysicalDevice>>;

    fn queue_families(&self, device: vk::PhysicalDevice) -> Vec<vk::QueueFamilyProperties>;

    /// Can queue family `family` of `device` present to the target surface?
    fn supports_presentation(&self, device: vk::PhysicalDevice, family: u32) -> VkResult<bool>;

    fn device_extensions(&self, device: vk::PhysicalDevice) -> VkResult<Vec<CString>>;

    fn swapchain_support(&self, device: vk::PhysicalDevice) -> VkResult<SwapchainSupport>;

    fn device_name(&self, _device: vk::PhysicalDevice) -> String {
        String::from("<unknown>")
    }
}

/// Probe backed by a live instance and window surface
pub struct VulkanProbe<'a> {
    pub instance: &'a ash::Instance,
    pub surface_loader: &'a khr::Surface,
    pub surface: vk::SurfaceKHR,
}

impl CapabilityProbe for VulkanProbe<'_> {
    fn physical_devices(&self) -> VkResult<Vec<vk::PhysicalDevice>> {
        unsafe { self.instance.enumerate_physical_devices() }
    }

    fn queue_families(&self, device: vk::PhysicalDevice) -> Vec<vk::QueueFamilyProperties> {
        unsafe {
            self.instance
                .get_physical_device_queue_family_properties(device)
        }
    }

    fn supports_presentation(&self, device: vk::PhysicalDevice, family: u32) -> VkResult<bool> {
        unsafe {
            self.surface_loader
                .get_physical_device_surface_support(device, family, self.surface)
        }
    }

    fn device_extensions(&self, device: vk::PhysicalDevice) -> VkResult<Vec<CString>> {
        let properties = unsafe { self.instance.enumerate_device_extension_properties(device) }?;
        Ok(extension_names(&properties))
    }

    fn swapchain_support(&self, device: vk::PhysicalDevice) -> VkResult<SwapchainSupport> {
        unsafe {
            Ok(SwapchainSupport {
                capabilities: self
                    .surface_loader
                    .get_physical_device_surface_capabilities(device, self.surface)?,
                formats: self
                    .surface_loader
                    .get_physical_device_surface_formats(device, self.surface)?,
                present_modes: self
                    .surface_loader
                    .get_physical_device_surface_present_modes(device, self.surface)?,
            })
        }
    }

    fn device_name(&self, device: vk::PhysicalDevice) -> String {
        let properties = unsafe { self.instance.get_physical_device_properties(device) };
        unsafe { CStr::from_ptr(properties.device_name.as_ptr()) }
            .to_string_lossy()
            .into_owned()
    }
}

pub fn extension_names(properties: &[vk::ExtensionProperties]) -> Vec<CString> {
    properties
        .iter()
        .map(|p| unsafe { CStr::from_ptr(p.extension_name.as_ptr()) }.to_owned())
        .collect()
}

/// First required name absent from `available`, compared exactly
pub fn find_missing_extension<'r>(available: &[CString], required: &[&'r CStr]) -> Option<&'r CStr> {
    required
        .iter()
        .copied()
        .find(|name| !available.iter().any(|have| have.as_c_str() == *name))
}
