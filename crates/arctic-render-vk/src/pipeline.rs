// SPDX-License-Identifier: CEPL-1.0
//! Render pass, descriptor layout, graphics pipeline and framebuffers for the
//! mesh pass. Everything here depends on the swapchain and is rebuilt with it.

use std::ffi::CStr;
use std::io::Cursor;
use std::sync::Arc;

use arctic_render::{AssetProvider, FRAGMENT_SHADER_ASSET, VERTEX_SHADER_ASSET};
use ash::util::read_spv;
use ash::vk;
use tracing::{debug, info};

use crate::device::DeviceContext;
use crate::error::{RenderError, RenderResult};
use crate::mesh::Vertex;
use crate::swapchain::SwapchainData;

const ENTRY_POINT: &CStr = c"main";

/// SPIR-V words for both stages, read once and reused on every rebuild.
#[derive(Clone, Debug)]
pub struct ShaderCode {
    pub vertex: Vec<u32>,
    pub fragment: Vec<u32>,
}

impl ShaderCode {
    pub fn load(assets: &dyn AssetProvider) -> RenderResult<Self> {
        Ok(Self { vertex: read_words(assets, VERTEX_SHADER_ASSET)?, fragment: read_words(assets, FRAGMENT_SHADER_ASSET)? })
    }
}

fn read_words(assets: &dyn AssetProvider, name: &str) -> RenderResult<Vec<u32>> {
    let bytes = assets
        .read(name)
        .map_err(|e| RenderError::AssetMissing { name: name.to_owned(), reason: format!("{e:#}") })?;
    read_spv(&mut Cursor::new(&bytes[..])).map_err(|e| RenderError::ShaderCompileFailed(format!("{name}: {e}")))
}

pub struct PipelineBuilder {
    ctx: Arc<DeviceContext>,
    shaders: ShaderCode,
    render_pass: vk::RenderPass,
    set_layout: vk::DescriptorSetLayout,
    layout: vk::PipelineLayout,
    pipeline: vk::Pipeline,
    framebuffers: Vec<vk::Framebuffer>,
    extent: vk::Extent2D,
}

impl PipelineBuilder {
    pub fn new(ctx: Arc<DeviceContext>, shaders: ShaderCode) -> Self {
        Self {
            ctx,
            shaders,
            render_pass: vk::RenderPass::null(),
            set_layout: vk::DescriptorSetLayout::null(),
            layout: vk::PipelineLayout::null(),
            pipeline: vk::Pipeline::null(),
            framebuffers: Vec::new(),
            extent: vk::Extent2D::default(),
        }
    }

    /// Builds every object in dependency order. On error whatever was built
    /// is torn down again and the builder is empty.
    pub fn load(&mut self, swap: &SwapchainData, views: &[vk::ImageView]) -> RenderResult<()> {
        self.clean_up();
        let result = self.build(swap, views);
        if result.is_err() {
            self.clean_up();
        }
        result
    }

    fn build(&mut self, swap: &SwapchainData, views: &[vk::ImageView]) -> RenderResult<()> {
        let device = self.ctx.device();
        // SAFETY: every create-info below outlives its create call.
        unsafe {
            self.render_pass = create_render_pass(device, swap.format)?;
            self.set_layout = create_ubo_set_layout(device)?;

            let layout_info = vk::PipelineLayoutCreateInfo {
                s_type: vk::StructureType::PIPELINE_LAYOUT_CREATE_INFO,
                set_layout_count: 1,
                p_set_layouts: &self.set_layout,
                ..Default::default()
            };
            self.layout = device
                .create_pipeline_layout(&layout_info, None)
                .map_err(RenderError::vk("create_pipeline_layout"))?;

            self.pipeline = create_pipeline(device, &self.shaders, self.render_pass, self.layout)?;

            for &view in views {
                let fb_info = vk::FramebufferCreateInfo {
                    s_type: vk::StructureType::FRAMEBUFFER_CREATE_INFO,
                    render_pass: self.render_pass,
                    attachment_count: 1,
                    p_attachments: &view,
                    width: swap.extent.width,
                    height: swap.extent.height,
                    layers: 1,
                    ..Default::default()
                };
                let fb = device
                    .create_framebuffer(&fb_info, None)
                    .map_err(RenderError::vk("create_framebuffer"))?;
                self.framebuffers.push(fb);
            }
        }
        self.extent = swap.extent;
        info!(
            "pipeline ready: {:?} {}x{}, {} framebuffers",
            swap.format,
            swap.extent.width,
            swap.extent.height,
            self.framebuffers.len()
        );
        Ok(())
    }

    /// Framebuffers, set layout, pipeline, pipeline layout, render pass.
    pub fn clean_up(&mut self) {
        let device = self.ctx.device();
        // SAFETY: callers keep the device idle; destroying null handles is a no-op.
        unsafe {
            for fb in self.framebuffers.drain(..) {
                device.destroy_framebuffer(fb, None);
            }
            device.destroy_descriptor_set_layout(std::mem::take(&mut self.set_layout), None);
            device.destroy_pipeline(std::mem::take(&mut self.pipeline), None);
            device.destroy_pipeline_layout(std::mem::take(&mut self.layout), None);
            device.destroy_render_pass(std::mem::take(&mut self.render_pass), None);
        }
    }

    pub fn framebuffer_count(&self) -> usize {
        self.framebuffers.len()
    }

    pub fn framebuffer(&self, image_index: u32) -> Option<vk::Framebuffer> {
        self.framebuffers.get(image_index as usize).copied()
    }

    pub fn render_pass(&self) -> vk::RenderPass {
        self.render_pass
    }

    pub fn pipeline(&self) -> vk::Pipeline {
        self.pipeline
    }

    pub fn pipeline_layout(&self) -> vk::PipelineLayout {
        self.layout
    }

    pub fn descriptor_set_layout(&self) -> vk::DescriptorSetLayout {
        self.set_layout
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }
}

impl Drop for PipelineBuilder {
    fn drop(&mut self) {
        self.clean_up();
    }
}

unsafe fn create_render_pass(device: &ash::Device, format: vk::Format) -> RenderResult<vk::RenderPass> {
    let color = vk::AttachmentDescription {
        format,
        samples: vk::SampleCountFlags::TYPE_1,
        load_op: vk::AttachmentLoadOp::CLEAR,
        store_op: vk::AttachmentStoreOp::STORE,
        stencil_load_op: vk::AttachmentLoadOp::DONT_CARE,
        stencil_store_op: vk::AttachmentStoreOp::DONT_CARE,
        initial_layout: vk::ImageLayout::UNDEFINED,
        final_layout: vk::ImageLayout::PRESENT_SRC_KHR,
        ..Default::default()
    };
    let color_ref = vk::AttachmentReference {
        attachment: 0,
        layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
    };
    let subpass = vk::SubpassDescription {
        pipeline_bind_point: vk::PipelineBindPoint::GRAPHICS,
        color_attachment_count: 1,
        p_color_attachments: &color_ref,
        ..Default::default()
    };
    // Layout transition must wait for the acquire semaphore's stage.
    let dependency = vk::SubpassDependency {
        src_subpass: vk::SUBPASS_EXTERNAL,
        dst_subpass: 0,
        src_stage_mask: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
        src_access_mask: vk::AccessFlags::empty(),
        dst_stage_mask: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
        dst_access_mask: vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
        ..Default::default()
    };
    let ci = vk::RenderPassCreateInfo {
        s_type: vk::StructureType::RENDER_PASS_CREATE_INFO,
        attachment_count: 1,
        p_attachments: &color,
        subpass_count: 1,
        p_subpasses: &subpass,
        dependency_count: 1,
        p_dependencies: &dependency,
        ..Default::default()
    };
    unsafe { device.create_render_pass(&ci, None) }.map_err(RenderError::vk("create_render_pass"))
}

unsafe fn create_ubo_set_layout(device: &ash::Device) -> RenderResult<vk::DescriptorSetLayout> {
    let binding = vk::DescriptorSetLayoutBinding {
        binding: 0,
        descriptor_type: vk::DescriptorType::UNIFORM_BUFFER,
        descriptor_count: 1,
        stage_flags: vk::ShaderStageFlags::VERTEX,
        ..Default::default()
    };
    let ci = vk::DescriptorSetLayoutCreateInfo {
        s_type: vk::StructureType::DESCRIPTOR_SET_LAYOUT_CREATE_INFO,
        binding_count: 1,
        p_bindings: &binding,
        ..Default::default()
    };
    unsafe { device.create_descriptor_set_layout(&ci, None) }
        .map_err(RenderError::vk("create_descriptor_set_layout"))
}

unsafe fn create_shader_module(device: &ash::Device, words: &[u32]) -> RenderResult<vk::ShaderModule> {
    let ci = vk::ShaderModuleCreateInfo {
        s_type: vk::StructureType::SHADER_MODULE_CREATE_INFO,
        code_size: words.len() * 4,
        p_code: words.as_ptr(),
        ..Default::default()
    };
    unsafe { device.create_shader_module(&ci, None) }.map_err(RenderError::vk("create_shader_module"))
}

/// Straight src-alpha over, alpha passed through.
pub fn blend_attachment() -> vk::PipelineColorBlendAttachmentState {
    vk::PipelineColorBlendAttachmentState {
        blend_enable: vk::TRUE,
        src_color_blend_factor: vk::BlendFactor::SRC_ALPHA,
        dst_color_blend_factor: vk::BlendFactor::ONE_MINUS_SRC_ALPHA,
        color_blend_op: vk::BlendOp::ADD,
        src_alpha_blend_factor: vk::BlendFactor::ONE,
        dst_alpha_blend_factor: vk::BlendFactor::ZERO,
        alpha_blend_op: vk::BlendOp::ADD,
        color_write_mask: vk::ColorComponentFlags::RGBA,
    }
}

unsafe fn create_pipeline(
    device: &ash::Device,
    shaders: &ShaderCode,
    render_pass: vk::RenderPass,
    layout: vk::PipelineLayout,
) -> RenderResult<vk::Pipeline> {
    let vs = unsafe { create_shader_module(device, &shaders.vertex)? };
    let fs = match unsafe { create_shader_module(device, &shaders.fragment) } {
        Ok(fs) => fs,
        Err(e) => {
            unsafe { device.destroy_shader_module(vs, None) };
            return Err(e);
        }
    };

    let stages = [
        vk::PipelineShaderStageCreateInfo {
            s_type: vk::StructureType::PIPELINE_SHADER_STAGE_CREATE_INFO,
            stage: vk::ShaderStageFlags::VERTEX,
            module: vs,
            p_name: ENTRY_POINT.as_ptr(),
            ..Default::default()
        },
        vk::PipelineShaderStageCreateInfo {
            s_type: vk::StructureType::PIPELINE_SHADER_STAGE_CREATE_INFO,
            stage: vk::ShaderStageFlags::FRAGMENT,
            module: fs,
            p_name: ENTRY_POINT.as_ptr(),
            ..Default::default()
        },
    ];

    let vb = Vertex::binding_description();
    let va = Vertex::attribute_descriptions();
    let vertex_input = vk::PipelineVertexInputStateCreateInfo {
        s_type: vk::StructureType::PIPELINE_VERTEX_INPUT_STATE_CREATE_INFO,
        vertex_binding_description_count: 1,
        p_vertex_binding_descriptions: &vb,
        vertex_attribute_description_count: va.len() as u32,
        p_vertex_attribute_descriptions: va.as_ptr(),
        ..Default::default()
    };
    let input_assembly = vk::PipelineInputAssemblyStateCreateInfo {
        s_type: vk::StructureType::PIPELINE_INPUT_ASSEMBLY_STATE_CREATE_INFO,
        topology: vk::PrimitiveTopology::TRIANGLE_LIST,
        primitive_restart_enable: vk::FALSE,
        ..Default::default()
    };
    let dyn_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
    let dynamic_state = vk::PipelineDynamicStateCreateInfo {
        s_type: vk::StructureType::PIPELINE_DYNAMIC_STATE_CREATE_INFO,
        dynamic_state_count: dyn_states.len() as u32,
        p_dynamic_states: dyn_states.as_ptr(),
        ..Default::default()
    };
    // counts only; rects come from cmd_set_viewport/scissor
    let viewport_state = vk::PipelineViewportStateCreateInfo {
        s_type: vk::StructureType::PIPELINE_VIEWPORT_STATE_CREATE_INFO,
        viewport_count: 1,
        scissor_count: 1,
        ..Default::default()
    };
    let raster = vk::PipelineRasterizationStateCreateInfo {
        s_type: vk::StructureType::PIPELINE_RASTERIZATION_STATE_CREATE_INFO,
        polygon_mode: vk::PolygonMode::FILL,
        cull_mode: vk::CullModeFlags::BACK,
        front_face: vk::FrontFace::COUNTER_CLOCKWISE,
        line_width: 1.0,
        ..Default::default()
    };
    let multisample = vk::PipelineMultisampleStateCreateInfo {
        s_type: vk::StructureType::PIPELINE_MULTISAMPLE_STATE_CREATE_INFO,
        rasterization_samples: vk::SampleCountFlags::TYPE_1,
        sample_shading_enable: vk::FALSE,
        ..Default::default()
    };
    let color_blend_att = blend_attachment();
    let color_blend = vk::PipelineColorBlendStateCreateInfo {
        s_type: vk::StructureType::PIPELINE_COLOR_BLEND_STATE_CREATE_INFO,
        logic_op_enable: vk::FALSE,
        attachment_count: 1,
        p_attachments: &color_blend_att,
        ..Default::default()
    };

    let pipeline_info = vk::GraphicsPipelineCreateInfo {
        s_type: vk::StructureType::GRAPHICS_PIPELINE_CREATE_INFO,
        stage_count: stages.len() as u32,
        p_stages: stages.as_ptr(),
        p_vertex_input_state: &vertex_input,
        p_input_assembly_state: &input_assembly,
        p_viewport_state: &viewport_state,
        p_rasterization_state: &raster,
        p_multisample_state: &multisample,
        p_color_blend_state: &color_blend,
        p_dynamic_state: &dynamic_state,
        layout,
        render_pass,
        subpass: 0,
        ..Default::default()
    };

    let created = unsafe {
        device.create_graphics_pipelines(
            vk::PipelineCache::null(),
            std::slice::from_ref(&pipeline_info),
            None,
        )
    };
    unsafe {
        device.destroy_shader_module(vs, None);
        device.destroy_shader_module(fs, None);
    }
    match created {
        Ok(pipelines) => {
            debug!("graphics pipeline created");
            Ok(pipelines[0])
        }
        Err((_, err)) => Err(RenderError::from_vk("create_graphics_pipelines", err)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct MapAssets(HashMap<&'static str, Vec<u8>>);

    impl AssetProvider for MapAssets {
        fn read(&self, name: &str) -> anyhow::Result<Vec<u8>> {
            self.0.get(name).cloned().ok_or_else(|| anyhow::anyhow!("no such asset"))
        }
    }

    fn spirv_bytes(words: &[u32]) -> Vec<u8> {
        words.iter().flat_map(|w| w.to_le_bytes()).collect()
    }

    #[test]
    fn shader_code_reads_both_stages() {
        let vert = [0x0723_0203u32, 0x0001_0000, 0, 1];
        let frag = [0x0723_0203u32, 0x0001_0000, 0, 2];
        let assets = MapAssets(HashMap::from([
            (VERTEX_SHADER_ASSET, spirv_bytes(&vert)),
            (FRAGMENT_SHADER_ASSET, spirv_bytes(&frag)),
        ]));
        let code = ShaderCode::load(&assets).unwrap();
        assert_eq!(code.vertex, vert);
        assert_eq!(code.fragment, frag);
    }

    #[test]
    fn missing_shader_reports_asset_name() {
        let assets = MapAssets(HashMap::from([(VERTEX_SHADER_ASSET, spirv_bytes(&[0x0723_0203]))]));
        match ShaderCode::load(&assets) {
            Err(RenderError::AssetMissing { name, .. }) => assert_eq!(name, FRAGMENT_SHADER_ASSET),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn truncated_spirv_is_rejected() {
        let assets = MapAssets(HashMap::from([
            (VERTEX_SHADER_ASSET, vec![1, 2, 3]),
            (FRAGMENT_SHADER_ASSET, vec![1, 2, 3]),
        ]));
        assert!(matches!(ShaderCode::load(&assets), Err(RenderError::ShaderCompileFailed(_))));
    }

    #[test]
    fn blend_is_alpha_over() {
        let b = blend_attachment();
        assert_eq!(b.blend_enable, vk::TRUE);
        assert_eq!(b.src_color_blend_factor, vk::BlendFactor::SRC_ALPHA);
        assert_eq!(b.dst_color_blend_factor, vk::BlendFactor::ONE_MINUS_SRC_ALPHA);
        assert_eq!((b.src_alpha_blend_factor, b.dst_alpha_blend_factor), (vk::BlendFactor::ONE, vk::BlendFactor::ZERO));
    }
}
