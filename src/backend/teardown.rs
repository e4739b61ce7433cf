// Ownership stack for GPU objects
//
// Every Vulkan object the renderer creates is pushed here together with the
// closure that destroys it. Unwinding pops them in reverse creation order,
// so dependents are always released before what they were built from.
// The stack unwinds on drop, which covers early returns during init.

use ash::vk::{self, Handle};
use std::fmt;

/// Kind of GPU object tracked on the stack (used for logging and traces)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GpuObject {
    Instance,
    DebugMessenger,
    Surface,
    Device,
    Swapchain,
    ImageView,
    RenderPass,
    PipelineLayout,
    Pipeline,
    Framebuffer,
    CommandPool,
    Semaphore,
    Fence,
}

impl fmt::Display for GpuObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

struct Tracked {
    kind: GpuObject,
    raw: u64,
    release: Box<dyn FnOnce()>,
}

#[derive(Default)]
pub struct TeardownStack {
    entries: Vec<Tracked>,
}

impl TeardownStack {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take ownership of `handle`; `release` runs exactly once during unwind
    pub fn push<H, F>(&mut self, kind: GpuObject, handle: H, release: F)
    where
        H: Handle + Copy + 'static,
        F: FnOnce(H) + 'static,
    {
        self.entries.push(Tracked {
            kind,
            raw: handle.as_raw(),
            release: Box::new(move || release(handle)),
        });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Objects currently owned, in creation order
    #[cfg(test)]
    pub fn owned(&self) -> impl Iterator<Item = (GpuObject, u64)> + '_ {
        self.entries.iter().map(|t| (t.kind, t.raw))
    }

    /// Destroy everything, newest first
    pub fn unwind(&mut self) {
        if self.is_empty() {
            return;
        }
        log::info!("Releasing {} GPU objects", self.entries.len());
        while let Some(tracked) = self.entries.pop() {
            log::debug!("Destroying {} {:#x}", tracked.kind, tracked.raw);
            (tracked.release)();
        }
    }
}

impl Drop for TeardownStack {
    fn drop(&mut self) {
        self.unwind();
    }
}

/// Handles whose destroy call only needs the logical device
pub trait DeviceObject: Handle + Copy + 'static {
    const KIND: GpuObject;

    /// # Safety
    /// The handle must have been created from `device` and be unused by the GPU.
    unsafe fn destroy(self, device: &ash::Device);
}

macro_rules! device_object {
    ($($ty:ty => $kind:ident, $destroy:ident;)*) => {
        $(
            impl DeviceObject for $ty {
                const KIND: GpuObject = GpuObject::$kind;

                unsafe fn destroy(self, device: &ash::Device) {
                    device.$destroy(self, None);
                }
            }
        )*
    };
}

device_object! {
    vk::ImageView => ImageView, destroy_image_view;
    vk::RenderPass => RenderPass, destroy_render_pass;
    vk::PipelineLayout => PipelineLayout, destroy_pipeline_layout;
    vk::Pipeline => Pipeline, destroy_pipeline;
    vk::Framebuffer => Framebuffer, destroy_framebuffer;
    vk::CommandPool => CommandPool, destroy_command_pool;
    vk::Semaphore => Semaphore, destroy_semaphore;
    vk::Fence => Fence, destroy_fence;
}

impl TeardownStack {
    /// Push a device-owned handle; the stack keeps its own device clone
    pub fn push_device_object<H: DeviceObject>(&mut self, device: &ash::Device, handle: H) {
        let device = device.clone();
        self.push(H::KIND, handle, move |h: H| unsafe { h.destroy(&device) });
    }
}
