// Framebuffers and command buffers
//
// One framebuffer and one primary command buffer per swapchain image.
// The scene is static, so every buffer is recorded once up front and
// resubmitted each frame. A dynamic scene would record inside the frame
// loop instead, after acquiring the image and before submitting.

use ash::vk;

use super::error::{RendererError, Result};
use super::pipeline::PipelineState;
use super::swapchain::SwapchainState;
use super::teardown::TeardownStack;

/// Framebuffers and the command pool are owned by the TeardownStack;
/// only the recorded buffers are needed after setup.
pub struct FrameResources {
    /// Indexed by swapchain image index, not by frame slot
    pub command_buffers: Vec<vk::CommandBuffer>,
}

impl FrameResources {
    pub fn new(
        device: &ash::Device,
        graphics_family: u32,
        swapchain: &SwapchainState,
        pipeline: &PipelineState,
        clear_color: [f32; 4],
        stack: &mut TeardownStack,
    ) -> Result<Self> {
        let framebuffers = create_framebuffers(
            device,
            swapchain.views(),
            pipeline.render_pass,
            swapchain.extent,
            stack,
        )?;

        let pool_info = vk::CommandPoolCreateInfo::builder().queue_family_index(graphics_family);
        let command_pool = unsafe { device.create_command_pool(&pool_info, None) }.map_err(
            |source| RendererError::ResourceCreation {
                what: "command pool",
                source,
            },
        )?;
        stack.push_device_object(device, command_pool);

        // Freed together with the pool
        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(framebuffers.len() as u32);

        let command_buffers = unsafe { device.allocate_command_buffers(&alloc_info) }.map_err(
            |source| RendererError::ResourceCreation {
                what: "command buffers",
                source,
            },
        )?;

        for (&cmd, &framebuffer) in command_buffers.iter().zip(&framebuffers) {
            record_draw(device, cmd, framebuffer, pipeline, swapchain.extent, clear_color)?;
        }

        log::info!(
            "Created {} framebuffers and {} pre-recorded command buffers",
            framebuffers.len(),
            command_buffers.len()
        );

        Ok(Self { command_buffers })
    }
}

/// Create framebuffers for each swapchain image
pub fn create_framebuffers(
    device: &ash::Device,
    image_views: impl Iterator<Item = vk::ImageView>,
    render_pass: vk::RenderPass,
    extent: vk::Extent2D,
    stack: &mut TeardownStack,
) -> Result<Vec<vk::Framebuffer>> {
    image_views
        .map(|image_view| {
            let attachments = [image_view];
            let framebuffer_info = vk::FramebufferCreateInfo::builder()
                .render_pass(render_pass)
                .attachments(&attachments)
                .width(extent.width)
                .height(extent.height)
                .layers(1);

            let framebuffer = unsafe { device.create_framebuffer(&framebuffer_info, None) }
                .map_err(|source| RendererError::ResourceCreation {
                    what: "framebuffer",
                    source,
                })?;
            stack.push_device_object(device, framebuffer);
            Ok(framebuffer)
        })
        .collect()
}

/// Clear, bind the pipeline, draw 3 vertices
pub fn record_draw(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    framebuffer: vk::Framebuffer,
    pipeline: &PipelineState,
    extent: vk::Extent2D,
    clear_color: [f32; 4],
) -> Result<()> {
    let recording_failed = |source| RendererError::ResourceCreation {
        what: "command buffer recording",
        source,
    };

    let clear_values = [vk::ClearValue {
        color: vk::ClearColorValue {
            float32: clear_color,
        },
    }];

    let render_pass_info = vk::RenderPassBeginInfo::builder()
        .render_pass(pipeline.render_pass)
        .framebuffer(framebuffer)
        .render_area(vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent,
        })
        .clear_values(&clear_values);

    unsafe {
        let begin_info = vk::CommandBufferBeginInfo::builder();
        device
            .begin_command_buffer(cmd, &begin_info)
            .map_err(recording_failed)?;

        device.cmd_begin_render_pass(cmd, &render_pass_info, vk::SubpassContents::INLINE);
        device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, pipeline.pipeline);
        device.cmd_draw(cmd, 3, 1, 0, 0);
        device.cmd_end_render_pass(cmd);

        device.end_command_buffer(cmd).map_err(recording_failed)?;
    }

    Ok(())
}
