// Vulkan instance and window surface
//
// Responsibilities:
// - Instance creation (after checking the window system's extensions)
// - Optional validation layers + debug messenger
// - Surface creation from raw window handles

use ash::extensions::{ext::DebugUtils, khr};
use ash::{vk, Entry};
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};
use std::ffi::{CStr, CString};
use std::os::raw::c_char;

use super::error::{RendererError, Result};
use super::probe::{extension_names, find_missing_extension};
use super::teardown::{GpuObject, TeardownStack};

const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

pub struct VulkanInstance {
    pub entry: Entry,
    pub instance: ash::Instance,
    pub surface_loader: khr::Surface,
}

impl VulkanInstance {
    /// Load the Vulkan library and create an instance able to present to
    /// windows of `display`.
    pub fn new(
        app_name: &str,
        display: RawDisplayHandle,
        enable_validation: bool,
        stack: &mut TeardownStack,
    ) -> Result<Self> {
        log::info!("Creating Vulkan instance: {}", app_name);

        let entry = unsafe { Entry::load() }?;

        let mut extensions: Vec<*const c_char> = ash_window::enumerate_required_extensions(display)
            .map_err(|source| RendererError::Query {
                what: "window system extensions",
                source,
            })?
            .to_vec();

        let validation = enable_validation && Self::has_validation_layer(&entry)?;
        if validation {
            extensions.push(DebugUtils::name().as_ptr());
        }

        Self::check_instance_extensions(&entry, &extensions)?;

        // Interior NULs cannot come from config in practice; fall back to a fixed name
        let app_name_cstr =
            CString::new(app_name).unwrap_or_else(|_| CString::from(c"tri-present"));
        let engine_name = c"No Engine";

        let app_info = vk::ApplicationInfo::builder()
            .application_name(&app_name_cstr)
            .application_version(vk::make_api_version(0, 1, 0, 0))
            .engine_name(engine_name)
            .engine_version(vk::make_api_version(0, 1, 0, 0))
            .api_version(vk::API_VERSION_1_0);

        let layer_names = if validation {
            vec![VALIDATION_LAYER.as_ptr()]
        } else {
            vec![]
        };

        let create_info = vk::InstanceCreateInfo::builder()
            .application_info(&app_info)
            .enabled_extension_names(&extensions)
            .enabled_layer_names(&layer_names);

        let instance = unsafe { entry.create_instance(&create_info, None) }
            .map_err(RendererError::InstanceCreation)?;

        {
            // The loader library must outlive the instance
            let entry = entry.clone();
            let owner = instance.clone();
            stack.push(GpuObject::Instance, instance.handle(), move |_| unsafe {
                owner.destroy_instance(None);
                drop(entry);
            });
        }

        if validation {
            Self::setup_debug_messenger(&entry, &instance, stack)?;
        }

        let surface_loader = khr::Surface::new(&entry, &instance);

        Ok(Self {
            entry,
            instance,
            surface_loader,
        })
    }

    fn has_validation_layer(entry: &Entry) -> Result<bool> {
        let layers = entry
            .enumerate_instance_layer_properties()
            .map_err(|source| RendererError::Query {
                what: "instance layers",
                source,
            })?;
        let found = has_layer(&layers, VALIDATION_LAYER);
        if !found {
            log::warn!("Validation requested but {:?} is not installed", VALIDATION_LAYER);
        }
        Ok(found)
    }

    fn check_instance_extensions(entry: &Entry, requested: &[*const c_char]) -> Result<()> {
        let available = entry
            .enumerate_instance_extension_properties(None)
            .map_err(|source| RendererError::Query {
                what: "instance extensions",
                source,
            })?;
        let available = extension_names(&available);
        let required: Vec<&CStr> = requested
            .iter()
            .map(|&ptr| unsafe { CStr::from_ptr(ptr) })
            .collect();

        match find_missing_extension(&available, &required) {
            Some(missing) => Err(RendererError::UnsupportedInstanceExtension(
                missing.to_string_lossy().into_owned(),
            )),
            None => Ok(()),
        }
    }

    fn setup_debug_messenger(
        entry: &Entry,
        instance: &ash::Instance,
        stack: &mut TeardownStack,
    ) -> Result<()> {
        let debug_utils = DebugUtils::new(entry, instance);

        let create_info = vk::DebugUtilsMessengerCreateInfoEXT::builder()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                    | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            )
            .pfn_user_callback(Some(debug_callback));

        let messenger = unsafe { debug_utils.create_debug_utils_messenger(&create_info, None) }
            .map_err(|source| RendererError::ResourceCreation {
                what: "debug messenger",
                source,
            })?;

        stack.push(GpuObject::DebugMessenger, messenger, move |m| unsafe {
            debug_utils.destroy_debug_utils_messenger(m, None);
        });
        Ok(())
    }

    /// Create the presentation surface for a native window
    pub fn create_surface(
        &self,
        display: RawDisplayHandle,
        window: RawWindowHandle,
        stack: &mut TeardownStack,
    ) -> Result<vk::SurfaceKHR> {
        let surface = unsafe {
            ash_window::create_surface(&self.entry, &self.instance, display, window, None)
        }
        .map_err(RendererError::SurfaceCreation)?;

        let loader = self.surface_loader.clone();
        stack.push(GpuObject::Surface, surface, move |s| unsafe {
            loader.destroy_surface(s, None);
        });
        Ok(surface)
    }
}

/// Exact-name lookup in the loader's layer list
fn has_layer(layers: &[vk::LayerProperties], name: &CStr) -> bool {
    layers.iter().any(|layer| {
        let layer_name = unsafe { CStr::from_ptr(layer.layer_name.as_ptr()) };
        layer_name == name
    })
}

// Debug callback for validation layers
unsafe extern "system" fn debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _p_user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    let message = CStr::from_ptr((*p_callback_data).p_message);

    match message_severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => {
            log::error!("[Vulkan] {}", message.to_string_lossy());
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => {
            log::warn!("[Vulkan] {}", message.to_string_lossy());
        }
        _ => {
            log::debug!("[Vulkan] {}", message.to_string_lossy());
        }
    }

    vk::FALSE
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layer(name: &str) -> vk::LayerProperties {
        let mut props = vk::LayerProperties::default();
        for (dst, &src) in props.layer_name.iter_mut().zip(name.as_bytes()) {
            *dst = src as c_char;
        }
        props
    }

    #[test]
    fn validation_layer_found_by_exact_name() {
        let layers = [layer("VK_LAYER_MESA_device_select"), layer("VK_LAYER_KHRONOS_validation")];
        assert!(has_layer(&layers, VALIDATION_LAYER));
    }

    #[test]
    fn validation_layer_absent_or_prefixed() {
        assert!(!has_layer(&[], VALIDATION_LAYER));
        let layers = [layer("VK_LAYER_KHRONOS_validation_extra"), layer("VK_LAYER_KHRONOS")];
        assert!(!has_layer(&layers, VALIDATION_LAYER));
    }
}
