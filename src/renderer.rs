// Renderer context
//
// Owns every GPU object for one window. Built top-down:
//
//   instance -> surface -> device -> swapchain -> pipeline
//            -> framebuffers/command buffers -> sync objects
//
// and torn down in exact reverse through the TeardownStack.

use ash::vk;
use raw_window_handle::{HasRawDisplayHandle, HasRawWindowHandle};

use crate::backend::commands::FrameResources;
use crate::backend::device::{required_device_extensions, select_physical_device, LogicalDeviceContext};
use crate::backend::instance::VulkanInstance;
use crate::backend::pipeline::PipelineState;
use crate::backend::probe::VulkanProbe;
use crate::backend::swapchain::SwapchainState;
use crate::backend::sync::{FrameSynchronizer, VulkanFrameDriver};
use crate::backend::teardown::TeardownStack;
use crate::backend::{Result, ShaderBinaries};
use crate::config::Config;

/// What the renderer needs from the windowing layer
pub trait PresentationTarget: HasRawWindowHandle + HasRawDisplayHandle {
    /// Current framebuffer size in pixels
    fn framebuffer_size(&self) -> (u32, u32);
}

impl PresentationTarget for winit::window::Window {
    fn framebuffer_size(&self) -> (u32, u32) {
        let size = self.inner_size();
        (size.width, size.height)
    }
}

pub struct Renderer {
    device: LogicalDeviceContext,
    swapchain: SwapchainState,
    // Kept for re-recording once the scene stops being static
    _pipeline: PipelineState,
    frames: FrameResources,
    sync: FrameSynchronizer,
    // Declared last: the loader library must stay loaded until the stack unwinds
    teardown: TeardownStack,
    _instance: VulkanInstance,
}

impl Renderer {
    pub fn new<T: PresentationTarget>(
        target: &T,
        config: &Config,
        shaders: &ShaderBinaries,
    ) -> Result<Self> {
        log::info!("Initializing Vulkan...");

        // Anything pushed here is released in reverse if a later step fails
        let mut teardown = TeardownStack::new();

        let display = target.raw_display_handle();
        let instance = VulkanInstance::new(
            &config.window.title,
            display,
            config.validation_enabled(),
            &mut teardown,
        )?;

        let surface = instance.create_surface(display, target.raw_window_handle(), &mut teardown)?;

        let required_extensions = required_device_extensions();
        let candidate = {
            let probe = VulkanProbe {
                instance: &instance.instance,
                surface_loader: &instance.surface_loader,
                surface,
            };
            select_physical_device(&probe, &required_extensions)?
        };

        let device = LogicalDeviceContext::new(
            &instance.instance,
            &candidate,
            &required_extensions,
            &mut teardown,
        )?;

        let swapchain = SwapchainState::new(
            &instance.instance,
            &device,
            &candidate,
            surface,
            target.framebuffer_size(),
            &mut teardown,
        )?;

        let pipeline = PipelineState::new(
            &device.device,
            swapchain.format.format,
            swapchain.extent,
            shaders,
            &mut teardown,
        )?;

        let frames = FrameResources::new(
            &device.device,
            candidate.graphics_family,
            &swapchain,
            &pipeline,
            config.graphics.clear_color,
            &mut teardown,
        )?;

        let sync = FrameSynchronizer::new(&device.device, config.frame_timeout_ns(), &mut teardown)?;

        log::info!(
            "Vulkan initialized successfully ({} GPU objects, {:?})",
            teardown.len(),
            swapchain.present_mode
        );

        Ok(Self {
            device,
            swapchain,
            _pipeline: pipeline,
            frames,
            sync,
            teardown,
            _instance: instance,
        })
    }

    /// Render and present one frame
    pub fn draw(&mut self) -> Result<()> {
        let mut driver = VulkanFrameDriver {
            device: &self.device.device,
            graphics_queue: self.device.graphics_queue,
            presentation_queue: self.device.presentation_queue,
            swapchain: &self.swapchain,
            command_buffers: &self.frames.command_buffers,
        };
        self.sync.draw(&mut driver)?;
        Ok(())
    }

    pub fn frames_drawn(&self) -> u64 {
        self.sync.frames_drawn()
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.swapchain.extent
    }
}

impl Drop for Renderer {
    fn drop(&mut self) {
        log::info!("Cleaning up Vulkan resources...");

        // Wait for GPU to finish before destroying anything
        if let Err(e) = self.device.wait_idle() {
            log::error!("Device did not go idle before teardown: {}", e);
        }

        self.teardown.unwind();

        log::info!("Cleanup complete");
    }
}
