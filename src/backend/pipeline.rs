// Graphics pipeline creation
//
// One render pass with a single color attachment that ends up ready for
// presentation, and one fixed-function pipeline drawing a triangle whose
// vertices live in the vertex shader.

use ash::vk;

use super::error::{RendererError, Result};
use super::shader::{ShaderBinaries, ShaderModule};
use super::teardown::TeardownStack;

/// The pipeline layout is empty and only lives on the TeardownStack
pub struct PipelineState {
    pub render_pass: vk::RenderPass,
    pub pipeline: vk::Pipeline,
}

/// The swapchain image: cleared on load, stored, handed to presentation
pub fn color_attachment(format: vk::Format) -> vk::AttachmentDescription {
    vk::AttachmentDescription::builder()
        .format(format)
        .samples(vk::SampleCountFlags::TYPE_1)
        .load_op(vk::AttachmentLoadOp::CLEAR)
        .store_op(vk::AttachmentStoreOp::STORE)
        .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
        .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
        .initial_layout(vk::ImageLayout::UNDEFINED)
        .final_layout(vk::ImageLayout::PRESENT_SRC_KHR)
        .build()
}

/// Layout transitions of the swapchain image are not ordered against the
/// acquire/present semaphores on their own. These two dependencies fence
/// the UNDEFINED -> COLOR_ATTACHMENT and COLOR_ATTACHMENT -> PRESENT_SRC
/// transitions around color-attachment output.
pub fn subpass_dependencies() -> [vk::SubpassDependency; 2] {
    let attachment_access =
        vk::AccessFlags::COLOR_ATTACHMENT_READ | vk::AccessFlags::COLOR_ATTACHMENT_WRITE;

    [
        vk::SubpassDependency::builder()
            .src_subpass(vk::SUBPASS_EXTERNAL)
            .src_stage_mask(vk::PipelineStageFlags::BOTTOM_OF_PIPE)
            .src_access_mask(vk::AccessFlags::MEMORY_READ)
            .dst_subpass(0)
            .dst_stage_mask(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT)
            .dst_access_mask(attachment_access)
            .build(),
        vk::SubpassDependency::builder()
            .src_subpass(0)
            .src_stage_mask(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT)
            .src_access_mask(attachment_access)
            .dst_subpass(vk::SUBPASS_EXTERNAL)
            .dst_stage_mask(vk::PipelineStageFlags::BOTTOM_OF_PIPE)
            .dst_access_mask(vk::AccessFlags::MEMORY_READ)
            .build(),
    ]
}

pub fn create_render_pass(
    device: &ash::Device,
    format: vk::Format,
    stack: &mut TeardownStack,
) -> Result<vk::RenderPass> {
    let attachments = [color_attachment(format)];

    let color_attachment_refs = [vk::AttachmentReference::builder()
        .attachment(0)
        .layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
        .build()];

    let subpasses = [vk::SubpassDescription::builder()
        .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
        .color_attachments(&color_attachment_refs)
        .build()];

    let dependencies = subpass_dependencies();

    let render_pass_info = vk::RenderPassCreateInfo::builder()
        .attachments(&attachments)
        .subpasses(&subpasses)
        .dependencies(&dependencies);

    let render_pass = unsafe { device.create_render_pass(&render_pass_info, None) }.map_err(
        |source| RendererError::PipelineCreation {
            stage: "render pass",
            source,
        },
    )?;
    stack.push_device_object(device, render_pass);

    Ok(render_pass)
}

/// Standard "over" alpha blending
pub fn alpha_blend_attachment() -> vk::PipelineColorBlendAttachmentState {
    vk::PipelineColorBlendAttachmentState::builder()
        .color_write_mask(vk::ColorComponentFlags::RGBA)
        .blend_enable(true)
        .src_color_blend_factor(vk::BlendFactor::SRC_ALPHA)
        .dst_color_blend_factor(vk::BlendFactor::ONE_MINUS_SRC_ALPHA)
        .color_blend_op(vk::BlendOp::ADD)
        .src_alpha_blend_factor(vk::BlendFactor::ONE)
        .dst_alpha_blend_factor(vk::BlendFactor::ZERO)
        .alpha_blend_op(vk::BlendOp::ADD)
        .build()
}

impl PipelineState {
    pub fn new(
        device: &ash::Device,
        format: vk::Format,
        extent: vk::Extent2D,
        shaders: &ShaderBinaries,
        stack: &mut TeardownStack,
    ) -> Result<Self> {
        let render_pass = create_render_pass(device, format, stack)?;
        let pipeline = create_graphics_pipeline(device, render_pass, extent, shaders, stack)?;

        log::info!("Built triangle pipeline for {}x{}", extent.width, extent.height);

        Ok(Self {
            render_pass,
            pipeline,
        })
    }
}

pub fn create_graphics_pipeline(
    device: &ash::Device,
    render_pass: vk::RenderPass,
    extent: vk::Extent2D,
    shaders: &ShaderBinaries,
    stack: &mut TeardownStack,
) -> Result<vk::Pipeline> {
    // Modules are dropped (destroyed) when this function returns
    let vert_module = ShaderModule::new(device, &shaders.vertex)?;
    let frag_module = ShaderModule::new(device, &shaders.fragment)?;

    let entry_point = c"main";

    let shader_stages = [
        vk::PipelineShaderStageCreateInfo::builder()
            .stage(vk::ShaderStageFlags::VERTEX)
            .module(vert_module.handle)
            .name(entry_point)
            .build(),
        vk::PipelineShaderStageCreateInfo::builder()
            .stage(vk::ShaderStageFlags::FRAGMENT)
            .module(frag_module.handle)
            .name(entry_point)
            .build(),
    ];

    // Vertex input: none, positions are generated in the shader
    let vertex_input_info = vk::PipelineVertexInputStateCreateInfo::builder();

    let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::builder()
        .topology(vk::PrimitiveTopology::TRIANGLE_LIST)
        .primitive_restart_enable(false);

    let viewports = [vk::Viewport {
        x: 0.0,
        y: 0.0,
        width: extent.width as f32,
        height: extent.height as f32,
        min_depth: 0.0,
        max_depth: 1.0,
    }];
    let scissors = [vk::Rect2D {
        offset: vk::Offset2D { x: 0, y: 0 },
        extent,
    }];
    let viewport_state = vk::PipelineViewportStateCreateInfo::builder()
        .viewports(&viewports)
        .scissors(&scissors);

    let rasterizer = vk::PipelineRasterizationStateCreateInfo::builder()
        .depth_clamp_enable(false)
        .rasterizer_discard_enable(false)
        .polygon_mode(vk::PolygonMode::FILL)
        .line_width(1.0)
        .cull_mode(vk::CullModeFlags::BACK)
        .front_face(vk::FrontFace::CLOCKWISE)
        .depth_bias_enable(false);

    let multisampling = vk::PipelineMultisampleStateCreateInfo::builder()
        .sample_shading_enable(false)
        .rasterization_samples(vk::SampleCountFlags::TYPE_1);

    let color_blend_attachments = [alpha_blend_attachment()];
    let color_blending = vk::PipelineColorBlendStateCreateInfo::builder()
        .logic_op_enable(false)
        .attachments(&color_blend_attachments);

    // No descriptor sets, no push constants
    let layout_info = vk::PipelineLayoutCreateInfo::builder();

    let pipeline_layout = unsafe { device.create_pipeline_layout(&layout_info, None) }.map_err(
        |source| RendererError::PipelineCreation {
            stage: "pipeline layout",
            source,
        },
    )?;
    stack.push_device_object(device, pipeline_layout);

    let pipeline_info = vk::GraphicsPipelineCreateInfo::builder()
        .stages(&shader_stages)
        .vertex_input_state(&vertex_input_info)
        .input_assembly_state(&input_assembly)
        .viewport_state(&viewport_state)
        .rasterization_state(&rasterizer)
        .multisample_state(&multisampling)
        .color_blend_state(&color_blending)
        .layout(pipeline_layout)
        .render_pass(render_pass)
        .subpass(0)
        .base_pipeline_handle(vk::Pipeline::null())
        .base_pipeline_index(-1)
        .build();

    let pipelines = unsafe {
        device.create_graphics_pipelines(vk::PipelineCache::null(), &[pipeline_info], None)
    }
    .map_err(|(_, source)| RendererError::PipelineCreation {
        stage: "graphics pipeline",
        source,
    })?;

    let pipeline = pipelines
        .into_iter()
        .next()
        .ok_or(RendererError::PipelineCreation {
            stage: "graphics pipeline",
            source: vk::Result::ERROR_UNKNOWN,
        })?;
    stack.push_device_object(device, pipeline);

    Ok(pipeline)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attachment_goes_from_undefined_to_present() {
        let attachment = color_attachment(vk::Format::B8G8R8A8_UNORM);
        assert_eq!(attachment.format, vk::Format::B8G8R8A8_UNORM);
        assert_eq!(attachment.load_op, vk::AttachmentLoadOp::CLEAR);
        assert_eq!(attachment.store_op, vk::AttachmentStoreOp::STORE);
        assert_eq!(attachment.initial_layout, vk::ImageLayout::UNDEFINED);
        assert_eq!(attachment.final_layout, vk::ImageLayout::PRESENT_SRC_KHR);
        assert_eq!(attachment.samples, vk::SampleCountFlags::TYPE_1);
    }

    #[test]
    fn dependencies_bracket_the_subpass() {
        let [into, out_of] = subpass_dependencies();

        assert_eq!(into.src_subpass, vk::SUBPASS_EXTERNAL);
        assert_eq!(into.dst_subpass, 0);
        assert_eq!(into.dst_stage_mask, vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT);
        assert!(into
            .dst_access_mask
            .contains(vk::AccessFlags::COLOR_ATTACHMENT_READ | vk::AccessFlags::COLOR_ATTACHMENT_WRITE));

        assert_eq!(out_of.src_subpass, 0);
        assert_eq!(out_of.dst_subpass, vk::SUBPASS_EXTERNAL);
        assert_eq!(out_of.src_stage_mask, vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT);
        assert_eq!(out_of.src_access_mask, into.dst_access_mask);
    }

    #[test]
    fn blending_is_source_over() {
        let blend = alpha_blend_attachment();
        assert_eq!(blend.blend_enable, vk::TRUE);
        assert_eq!(blend.src_color_blend_factor, vk::BlendFactor::SRC_ALPHA);
        assert_eq!(blend.dst_color_blend_factor, vk::BlendFactor::ONE_MINUS_SRC_ALPHA);
        assert_eq!(blend.color_write_mask, vk::ColorComponentFlags::RGBA);
    }
}
