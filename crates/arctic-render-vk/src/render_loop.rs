// SPDX-License-Identifier: CEPL-1.0
//! Vulkan side of the frame protocol: owns the chain, the pipeline, the mesh
//! and the frame slots, and carries out each step the scheduler asks for.

use std::sync::Arc;
use std::time::Instant;

use arctic_math::Mvp;
use arctic_render::{PresentPreference, SurfaceProvider};
use ash::vk;
use tracing::{debug, warn};

use crate::device::DeviceContext;
use crate::error::{RenderError, RenderResult};
use crate::frame::{FrameSlots, MAX_FRAMES_IN_FLIGHT};
use crate::mesh::{MeshBuffers, UniformBufferObject};
use crate::pipeline::{PipelineBuilder, ShaderCode};
use crate::scheduler::{Acquire, FrameGpu, Presented};
use crate::swapchain::SwapchainManager;

// Field order is drop order: slots, mesh, pipeline, then the chain.
pub struct RenderLoop {
    frames: FrameSlots,
    mesh: MeshBuffers,
    pipeline: PipelineBuilder,
    swapchain: SwapchainManager,
    ctx: Arc<DeviceContext>,
    start: Instant,
    clear_color: [f32; 4],
}

impl RenderLoop {
    pub fn new(
        ctx: Arc<DeviceContext>,
        drawable: Arc<dyn SurfaceProvider>,
        shaders: ShaderCode,
        present: PresentPreference,
        clear_color: [f32; 4],
    ) -> RenderResult<Self> {
        let mut swapchain = SwapchainManager::configure(ctx.clone(), drawable, present);
        let data = swapchain.create_swap_chain()?;

        let mut pipeline = PipelineBuilder::new(ctx.clone(), shaders);
        pipeline.load(&data, swapchain.image_views())?;

        let mesh = MeshBuffers::upload_builtin(&ctx)?;
        let frames = FrameSlots::new(ctx.clone(), pipeline.descriptor_set_layout(), MAX_FRAMES_IN_FLIGHT)?;

        Ok(Self { frames, mesh, pipeline, swapchain, ctx, start: Instant::now(), clear_color })
    }

    pub fn set_clear_color(&mut self, rgba: [f32; 4]) {
        self.clear_color = rgba;
    }

    fn write_uniforms(&mut self, slot: usize, extent: vk::Extent2D) -> RenderResult<()> {
        let ubo = UniformBufferObject::from(Mvp::spinning(
            self.start.elapsed().as_secs_f32(),
            extent.width,
            extent.height,
        ));
        self.frames.slot_mut(slot).uniform.write(bytemuck::bytes_of(&ubo))
    }
}

impl FrameGpu for RenderLoop {
    fn slot_count(&self) -> usize {
        self.frames.slot_count()
    }

    fn wait_for_slot(&mut self, slot: usize) -> RenderResult<()> {
        self.frames.slot(slot).in_flight.wait()
    }

    fn acquire_image(&mut self, slot: usize) -> RenderResult<Acquire> {
        if !self.swapchain.is_live() {
            return Ok(Acquire::OutOfDate);
        }
        let semaphore = self.frames.slot(slot).image_available.handle();
        // SAFETY: semaphore is unsignaled; its previous wait completed before the fence signaled.
        let acquired = unsafe {
            self.swapchain.loader().acquire_next_image(
                self.swapchain.handle(),
                u64::MAX,
                semaphore,
                vk::Fence::null(),
            )
        };
        match acquired {
            Ok((index, suboptimal)) => Ok(Acquire::Image { index, suboptimal }),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(Acquire::OutOfDate),
            Err(e) => Err(RenderError::from_vk("acquire_next_image", e)),
        }
    }

    fn reset_slot(&mut self, slot: usize) -> RenderResult<()> {
        self.frames.slot(slot).in_flight.reset()
    }

    fn record(&mut self, slot: usize, image: u32) -> RenderResult<()> {
        let extent = self.pipeline.extent();
        let framebuffer = self.pipeline.framebuffer(image).ok_or(RenderError::Vulkan {
            op: "framebuffer lookup",
            result: vk::Result::ERROR_OUT_OF_DATE_KHR,
        })?;

        self.write_uniforms(slot, extent)?;

        let device = self.ctx.device();
        let frame = self.frames.slot(slot);
        let cb = frame.command_buffer;

        let begin = vk::CommandBufferBeginInfo {
            s_type: vk::StructureType::COMMAND_BUFFER_BEGIN_INFO,
            flags: vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT,
            ..Default::default()
        };
        let clear = vk::ClearValue {
            color: vk::ClearColorValue { float32: self.clear_color },
        };
        let area = vk::Rect2D { offset: vk::Offset2D { x: 0, y: 0 }, extent };
        let rp_begin = vk::RenderPassBeginInfo {
            s_type: vk::StructureType::RENDER_PASS_BEGIN_INFO,
            render_pass: self.pipeline.render_pass(),
            framebuffer,
            render_area: area,
            clear_value_count: 1,
            p_clear_values: &clear,
            ..Default::default()
        };
        let viewport = vk::Viewport {
            x: 0.0,
            y: 0.0,
            width: extent.width as f32,
            height: extent.height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        };

        // SAFETY: the slot's fence was waited on and reset, so the buffer is not pending.
        unsafe {
            device
                .reset_command_buffer(cb, vk::CommandBufferResetFlags::empty())
                .map_err(RenderError::vk("reset_command_buffer"))?;
            device.begin_command_buffer(cb, &begin).map_err(RenderError::vk("begin_command_buffer"))?;

            device.cmd_begin_render_pass(cb, &rp_begin, vk::SubpassContents::INLINE);
            device.cmd_bind_pipeline(cb, vk::PipelineBindPoint::GRAPHICS, self.pipeline.pipeline());
            device.cmd_set_viewport(cb, 0, std::slice::from_ref(&viewport));
            device.cmd_set_scissor(cb, 0, std::slice::from_ref(&area));
            device.cmd_bind_vertex_buffers(cb, 0, &[self.mesh.vertex.handle()], &[0]);
            device.cmd_bind_index_buffer(cb, self.mesh.index.handle(), 0, vk::IndexType::UINT32);
            device.cmd_bind_descriptor_sets(
                cb,
                vk::PipelineBindPoint::GRAPHICS,
                self.pipeline.pipeline_layout(),
                0,
                &[frame.descriptor_set],
                &[],
            );
            device.cmd_draw_indexed(cb, self.mesh.index_count, 1, 0, 0, 0);
            device.cmd_end_render_pass(cb);

            device.end_command_buffer(cb).map_err(RenderError::vk("end_command_buffer"))?;
        }
        Ok(())
    }

    fn submit(&mut self, slot: usize) -> RenderResult<()> {
        let frame = self.frames.slot(slot);
        let wait = [frame.image_available.handle()];
        let stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
        let signal = [frame.render_finished.handle()];
        let cbs = [frame.command_buffer];
        let si = vk::SubmitInfo {
            s_type: vk::StructureType::SUBMIT_INFO,
            wait_semaphore_count: 1,
            p_wait_semaphores: wait.as_ptr(),
            p_wait_dst_stage_mask: stages.as_ptr(),
            command_buffer_count: 1,
            p_command_buffers: cbs.as_ptr(),
            signal_semaphore_count: 1,
            p_signal_semaphores: signal.as_ptr(),
            ..Default::default()
        };
        // SAFETY: arrays live across the call; fence was reset this pass.
        unsafe {
            self.ctx
                .device()
                .queue_submit(self.ctx.queues().graphics, std::slice::from_ref(&si), frame.in_flight.handle())
        }
        .map_err(RenderError::vk("queue_submit"))
    }

    fn present(&mut self, slot: usize, image: u32) -> RenderResult<Presented> {
        let wait = [self.frames.slot(slot).render_finished.handle()];
        let chains = [self.swapchain.handle()];
        let indices = [image];
        let pi = vk::PresentInfoKHR {
            s_type: vk::StructureType::PRESENT_INFO_KHR,
            wait_semaphore_count: 1,
            p_wait_semaphores: wait.as_ptr(),
            swapchain_count: 1,
            p_swapchains: chains.as_ptr(),
            p_image_indices: indices.as_ptr(),
            ..Default::default()
        };
        // SAFETY: image was acquired this pass; render_finished is signaled by the submit above.
        match unsafe { self.swapchain.loader().queue_present(self.ctx.queues().present, &pi) } {
            Ok(false) => Ok(Presented::Done),
            Ok(true) | Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(Presented::Stale),
            Err(e) => Err(RenderError::from_vk("queue_present", e)),
        }
    }

    fn abandon_slot(&mut self, slot: usize) -> RenderResult<()> {
        let frame = self.frames.slot(slot);
        let wait = [frame.image_available.handle()];
        let stages = [vk::PipelineStageFlags::ALL_COMMANDS];
        let si = vk::SubmitInfo {
            s_type: vk::StructureType::SUBMIT_INFO,
            wait_semaphore_count: 1,
            p_wait_semaphores: wait.as_ptr(),
            p_wait_dst_stage_mask: stages.as_ptr(),
            ..Default::default()
        };
        debug!("re-arming fence of slot {slot}");
        // SAFETY: empty batch; consumes the pending acquire and signals the reset fence.
        unsafe {
            self.ctx
                .device()
                .queue_submit(self.ctx.queues().graphics, std::slice::from_ref(&si), frame.in_flight.handle())
        }
        .map_err(RenderError::vk("queue_submit(abandon)"))
    }

    fn recover_slot(&mut self, slot: usize) -> RenderResult<()> {
        self.frames.renew_sync(slot)
    }

    fn wait_idle(&mut self) -> RenderResult<()> {
        self.ctx.wait_idle()
    }

    fn rebuild_targets(&mut self) -> RenderResult<()> {
        // framebuffers reference the views, so they go first
        self.pipeline.clean_up();
        self.swapchain.clean_up();
        let data = self.swapchain.create_swap_chain()?;
        self.pipeline.load(&data, self.swapchain.image_views())?;
        if self.pipeline.framebuffer_count() != data.image_count as usize {
            return Err(RenderError::Vulkan {
                op: "create_framebuffer",
                result: vk::Result::ERROR_INITIALIZATION_FAILED,
            });
        }
        Ok(())
    }
}

impl Drop for RenderLoop {
    fn drop(&mut self) {
        if let Err(e) = self.ctx.wait_idle() {
            warn!("wait_idle before teardown: {e}");
        }
    }
}
