// GPU selection and logical device
//
// Responsibilities:
// - Physical device selection (first usable device in enumeration order)
// - Logical device + graphics/presentation queue retrieval

use ash::extensions::khr;
use ash::prelude::VkResult;
use ash::vk;
use std::collections::BTreeSet;
use std::ffi::CStr;

use super::error::{RendererError, Result};
use super::probe::{find_missing_extension, CapabilityProbe, SwapchainSupport};
use super::teardown::{GpuObject, TeardownStack};

/// Device extensions every candidate must expose
pub fn required_device_extensions() -> [&'static CStr; 1] {
    [khr::Swapchain::name()]
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueFamilyIndices {
    pub graphics_family: Option<u32>,
    pub presentation_family: Option<u32>,
}

impl QueueFamilyIndices {
    /// Scan queue families in order. The first family with graphics support and
    /// the first one that can present each win; scanning stops once both are known.
    /// A failed surface-support query is an error, not a family that cannot present.
    pub fn find<P: CapabilityProbe>(probe: &P, device: vk::PhysicalDevice) -> VkResult<Self> {
        let mut indices = Self::default();

        for (index, family) in probe.queue_families(device).iter().enumerate() {
            let index = index as u32;
            if family.queue_count == 0 {
                continue;
            }

            if indices.graphics_family.is_none()
                && family.queue_flags.contains(vk::QueueFlags::GRAPHICS)
            {
                indices.graphics_family = Some(index);
            }

            if indices.presentation_family.is_none() && probe.supports_presentation(device, index)? {
                indices.presentation_family = Some(index);
            }

            if indices.is_complete() {
                break;
            }
        }

        Ok(indices)
    }

    pub fn is_complete(&self) -> bool {
        self.graphics_family.is_some() && self.presentation_family.is_some()
    }

    /// Distinct families, one queue-create entry each
    pub fn unique_families(&self) -> Vec<u32> {
        let set: BTreeSet<u32> = self
            .graphics_family
            .into_iter()
            .chain(self.presentation_family)
            .collect();
        set.into_iter().collect()
    }
}

/// A device that passed every selection check
#[derive(Debug, Clone)]
pub struct PhysicalDeviceCandidate {
    pub handle: vk::PhysicalDevice,
    pub graphics_family: u32,
    pub presentation_family: u32,
    pub support: SwapchainSupport,
}

impl PhysicalDeviceCandidate {
    pub fn queue_families(&self) -> QueueFamilyIndices {
        QueueFamilyIndices {
            graphics_family: Some(self.graphics_family),
            presentation_family: Some(self.presentation_family),
        }
    }
}

/// Evaluate one device; `Ok(None)` if it is unusable
fn evaluate<P: CapabilityProbe>(
    probe: &P,
    device: vk::PhysicalDevice,
    required_extensions: &[&CStr],
) -> Result<Option<PhysicalDeviceCandidate>> {
    let indices = QueueFamilyIndices::find(probe, device).map_err(|source| {
        log::error!("Surface support query failed on {}: {}", probe.device_name(device), source);
        RendererError::Query {
            what: "surface support",
            source,
        }
    })?;

    let extensions_supported = match probe.device_extensions(device) {
        Ok(available) => match find_missing_extension(&available, required_extensions) {
            Some(missing) => {
                log::warn!(
                    "Skipping {}: missing extension {:?}",
                    probe.device_name(device),
                    missing
                );
                false
            }
            None => true,
        },
        Err(e) => {
            log::warn!("Skipping {}: cannot list extensions ({})", probe.device_name(device), e);
            false
        }
    };

    // Surface queries need the swapchain extension
    let support = if extensions_supported {
        match probe.swapchain_support(device) {
            Ok(support) => Some(support),
            Err(e) => {
                log::warn!("Skipping {}: surface query failed ({})", probe.device_name(device), e);
                None
            }
        }
    } else {
        None
    };

    match (indices.graphics_family, indices.presentation_family, support) {
        (Some(graphics_family), Some(presentation_family), Some(support))
            if support.is_adequate() =>
        {
            Ok(Some(PhysicalDeviceCandidate {
                handle: device,
                graphics_family,
                presentation_family,
                support,
            }))
        }
        _ => {
            log::debug!("{} is not usable with this surface", probe.device_name(device));
            Ok(None)
        }
    }
}

/// Pick the first usable device in enumeration order. No scoring.
pub fn select_physical_device<P: CapabilityProbe>(
    probe: &P,
    required_extensions: &[&CStr],
) -> Result<PhysicalDeviceCandidate> {
    let devices = probe
        .physical_devices()
        .map_err(|source| RendererError::Query {
            what: "physical devices",
            source,
        })?;

    if devices.is_empty() {
        return Err(RendererError::NoSuitableDevice(
            "no Vulkan-capable GPU found".to_string(),
        ));
    }

    let mut accepted = None;
    for &device in &devices {
        if let Some(candidate) = evaluate(probe, device, required_extensions)? {
            accepted = Some(candidate);
            break;
        }
    }

    let candidate = accepted.ok_or_else(|| {
        RendererError::NoSuitableDevice(format!(
            "none of {} devices supports graphics, presentation and {:?}",
            devices.len(),
            required_extensions
        ))
    })?;

    log::info!(
        "Selected GPU: {} (graphics family {}, presentation family {})",
        probe.device_name(candidate.handle),
        candidate.graphics_family,
        candidate.presentation_family
    );
    Ok(candidate)
}

/// Logical device plus its two queues (which may be the same queue)
pub struct LogicalDeviceContext {
    pub device: ash::Device,
    pub graphics_queue: vk::Queue,
    pub presentation_queue: vk::Queue,
}

impl LogicalDeviceContext {
    pub fn new(
        instance: &ash::Instance,
        candidate: &PhysicalDeviceCandidate,
        required_extensions: &[&CStr],
        stack: &mut TeardownStack,
    ) -> Result<Self> {
        let queue_priorities = [1.0];

        let queue_create_infos: Vec<vk::DeviceQueueCreateInfo> = candidate
            .queue_families()
            .unique_families()
            .into_iter()
            .map(|family| {
                vk::DeviceQueueCreateInfo::builder()
                    .queue_family_index(family)
                    .queue_priorities(&queue_priorities)
                    .build()
            })
            .collect();

        let extensions: Vec<_> = required_extensions.iter().map(|e| e.as_ptr()).collect();
        let features = vk::PhysicalDeviceFeatures::default();

        let create_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(&queue_create_infos)
            .enabled_extension_names(&extensions)
            .enabled_features(&features);

        let device = unsafe { instance.create_device(candidate.handle, &create_info, None) }
            .map_err(RendererError::DeviceCreation)?;

        {
            let owner = device.clone();
            stack.push(GpuObject::Device, device.handle(), move |_| unsafe {
                owner.destroy_device(None);
            });
        }

        let graphics_queue = unsafe { device.get_device_queue(candidate.graphics_family, 0) };
        let presentation_queue =
            unsafe { device.get_device_queue(candidate.presentation_family, 0) };

        log::info!(
            "Created logical device with {} queue(s)",
            queue_create_infos.len()
        );

        Ok(Self {
            device,
            graphics_queue,
            presentation_queue,
        })
    }

    /// Wait for device to be idle (e.g., before cleanup)
    pub fn wait_idle(&self) -> Result<()> {
        unsafe { self.device.device_wait_idle() }.map_err(|source| RendererError::Query {
            what: "device idle",
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::prelude::VkResult;
    use ash::vk::Handle;
    use std::ffi::CString;

    #[derive(Clone)]
    struct FakeFamily {
        pub flags: vk::QueueFlags,
        pub count: u32,
        pub present: bool,
    }

    #[derive(Clone)]
    struct FakeDevice {
        pub name: &'static str,
        pub families: Vec<FakeFamily>,
        pub extensions: Vec<&'static str>,
        pub formats: Vec<vk::SurfaceFormatKHR>,
        pub present_modes: Vec<vk::PresentModeKHR>,
        pub surface_error: Option<vk::Result>,
    }

    impl FakeDevice {
        pub fn usable(name: &'static str) -> Self {
            Self {
                name,
                families: vec![FakeFamily {
                    flags: vk::QueueFlags::GRAPHICS | vk::QueueFlags::TRANSFER,
                    count: 1,
                    present: true,
                }],
                extensions: vec!["VK_KHR_swapchain"],
                formats: vec![vk::SurfaceFormatKHR {
                    format: vk::Format::B8G8R8A8_UNORM,
                    color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
                }],
                present_modes: vec![vk::PresentModeKHR::FIFO],
                surface_error: None,
            }
        }
    }

    struct FakeProbe {
        pub devices: Vec<FakeDevice>,
    }

    impl FakeProbe {
        fn lookup(&self, device: vk::PhysicalDevice) -> &FakeDevice {
            &self.devices[device.as_raw() as usize - 1]
        }
    }

    impl CapabilityProbe for FakeProbe {
        fn physical_devices(&self) -> VkResult<Vec<vk::PhysicalDevice>> {
            Ok((1..=self.devices.len() as u64)
                .map(vk::PhysicalDevice::from_raw)
                .collect())
        }

        fn queue_families(&self, device: vk::PhysicalDevice) -> Vec<vk::QueueFamilyProperties> {
            self.lookup(device)
                .families
                .iter()
                .map(|f| vk::QueueFamilyProperties {
                    queue_flags: f.flags,
                    queue_count: f.count,
                    ..Default::default()
                })
                .collect()
        }

        fn supports_presentation(&self, device: vk::PhysicalDevice, family: u32) -> VkResult<bool> {
            let d = self.lookup(device);
            match d.surface_error {
                Some(e) => Err(e),
                None => Ok(d.families[family as usize].present),
            }
        }

        fn device_extensions(&self, device: vk::PhysicalDevice) -> VkResult<Vec<CString>> {
            Ok(self
                .lookup(device)
                .extensions
                .iter()
                .map(|e| CString::new(*e).unwrap())
                .collect())
        }

        fn swapchain_support(&self, device: vk::PhysicalDevice) -> VkResult<SwapchainSupport> {
            let d = self.lookup(device);
            Ok(SwapchainSupport {
                capabilities: vk::SurfaceCapabilitiesKHR::default(),
                formats: d.formats.clone(),
                present_modes: d.present_modes.clone(),
            })
        }

        fn device_name(&self, device: vk::PhysicalDevice) -> String {
            self.lookup(device).name.to_string()
        }
    }

    fn select(devices: Vec<FakeDevice>) -> Result<PhysicalDeviceCandidate> {
        let probe = FakeProbe { devices };
        select_physical_device(&probe, &required_device_extensions())
    }

    fn selected_name(devices: Vec<FakeDevice>) -> &'static str {
        let names: Vec<_> = devices.iter().map(|d| d.name).collect();
        let candidate = select(devices).unwrap();
        names[candidate.handle.as_raw() as usize - 1]
    }

    #[test]
    fn zero_devices_is_an_error() {
        assert!(matches!(select(vec![]), Err(RendererError::NoSuitableDevice(_))));
    }

    #[test]
    fn first_usable_device_wins() {
        let devices = vec![
            FakeDevice::usable("integrated"),
            FakeDevice::usable("discrete"),
        ];
        assert_eq!(selected_name(devices), "integrated");
    }

    #[test]
    fn each_failed_predicate_skips_a_device() {
        let mut no_graphics = FakeDevice::usable("no-graphics");
        no_graphics.families[0].flags = vk::QueueFlags::COMPUTE;

        let mut no_present = FakeDevice::usable("no-present");
        no_present.families[0].present = false;

        let mut no_swapchain = FakeDevice::usable("no-swapchain");
        no_swapchain.extensions = vec!["VK_KHR_maintenance1"];

        let mut no_formats = FakeDevice::usable("no-formats");
        no_formats.formats.clear();

        let mut no_modes = FakeDevice::usable("no-modes");
        no_modes.present_modes.clear();

        let rejected = vec![no_graphics, no_present, no_swapchain, no_formats, no_modes];
        assert!(matches!(
            select(rejected.clone()),
            Err(RendererError::NoSuitableDevice(_))
        ));

        let mut with_good = rejected;
        with_good.push(FakeDevice::usable("good"));
        assert_eq!(selected_name(with_good), "good");
    }

    #[test]
    fn empty_queue_family_is_ignored() {
        let mut device = FakeDevice::usable("gpu");
        device.families.insert(
            0,
            FakeFamily {
                flags: vk::QueueFlags::GRAPHICS,
                count: 0,
                present: true,
            },
        );
        let candidate = select(vec![device]).unwrap();
        assert_eq!(candidate.graphics_family, 1);
        assert_eq!(candidate.presentation_family, 1);
    }

    #[test]
    fn split_families_take_first_match_each() {
        let mut device = FakeDevice::usable("split");
        device.families = vec![
            FakeFamily { flags: vk::QueueFlags::GRAPHICS, count: 4, present: false },
            FakeFamily { flags: vk::QueueFlags::GRAPHICS, count: 1, present: false },
            FakeFamily { flags: vk::QueueFlags::TRANSFER, count: 1, present: true },
            FakeFamily { flags: vk::QueueFlags::GRAPHICS, count: 1, present: true },
        ];
        let candidate = select(vec![device]).unwrap();
        assert_eq!(candidate.graphics_family, 0);
        assert_eq!(candidate.presentation_family, 2);
    }

    #[test]
    fn lost_surface_is_a_query_error_not_a_missing_gpu() {
        let mut device = FakeDevice::usable("gpu");
        device.surface_error = Some(vk::Result::ERROR_SURFACE_LOST_KHR);

        let err = select(vec![device, FakeDevice::usable("second")]).unwrap_err();
        assert!(matches!(
            err,
            RendererError::Query {
                what: "surface support",
                source: vk::Result::ERROR_SURFACE_LOST_KHR,
            }
        ));
    }

    #[test]
    fn shared_family_yields_one_queue_entry() {
        let shared = QueueFamilyIndices {
            graphics_family: Some(0),
            presentation_family: Some(0),
        };
        assert_eq!(shared.unique_families(), vec![0]);

        let split = QueueFamilyIndices {
            graphics_family: Some(2),
            presentation_family: Some(0),
        };
        assert_eq!(split.unique_families(), vec![0, 2]);
    }
}
