// SPDX-License-Identifier: CEPL-1.0
#![deny(unsafe_op_in_unsafe_fn)]
//! Vulkan backend: device gateway, swapchain manager, memory and transfer
//! service, pipeline builder and the frame scheduler that ties them together.

pub mod command;
pub mod device;
pub mod error;
pub mod frame;
pub mod instance;
pub mod memory;
pub mod mesh;
pub mod pipeline;
pub mod render_loop;
pub mod scheduler;
pub mod shaders;
pub mod swapchain;
pub mod sync;

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use arctic_render::{AssetProvider, RenderSettings, RenderSize, Renderer, SurfaceProvider};
use tracing::{error, info, warn};

pub use device::{DeviceContext, DeviceRequirements};
pub use error::{RenderError, RenderResult};
pub use frame::MAX_FRAMES_IN_FLIGHT;
pub use memory::{GpuBuffer, TransferService};
pub use mesh::{Vertex, MESH_INDICES, MESH_VERTICES};
pub use scheduler::{FrameOutcome, FrameScheduler};
pub use shaders::BuiltinShaders;

use pipeline::ShaderCode;
use render_loop::RenderLoop;
use scheduler::FrameGpu;

/// Engine root. Drop order: render loop (waits idle, frees per-frame and
/// swapchain objects), device context, then the window.
pub struct VkRenderer {
    scheduler: FrameScheduler,
    render_loop: RenderLoop,
    ctx: Arc<DeviceContext>,
    surface: Arc<dyn SurfaceProvider>,
    paused: bool,
    lost: bool,
}

impl VkRenderer {
    pub fn device_name(&self) -> &str {
        self.ctx.device_name()
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// Set once a frame fails in a way no rebuild can repair; every later
    /// render returns an error without touching the device.
    pub fn is_lost(&self) -> bool {
        self.lost
    }
}

/// Folds one scheduler tick into the renderer's result, latching `lost` on
/// fatal errors.
fn settle_frame(frame: RenderResult<FrameOutcome>, lost: &mut bool) -> Result<()> {
    match frame {
        Ok(FrameOutcome::Presented { .. }) => Ok(()),
        Ok(FrameOutcome::Skipped) => {
            warn!("frame skipped; swapchain will be rebuilt");
            Ok(())
        }
        Err(e) => {
            if e.is_fatal() {
                error!("renderer stopped: {e}");
                *lost = true;
            }
            Err(anyhow::Error::new(e).context("render frame"))
        }
    }
}

impl Renderer for VkRenderer {
    fn new(
        surface: Arc<dyn SurfaceProvider>,
        assets: &dyn AssetProvider,
        settings: RenderSettings,
    ) -> Result<Self> {
        let shaders = ShaderCode::load(assets).context("load shaders")?;
        let ctx = Arc::new(DeviceContext::open(&*surface, settings.validation).context("open device")?);
        let render_loop = RenderLoop::new(
            ctx.clone(),
            surface.clone(),
            shaders,
            settings.present_mode,
            settings.clear_color,
        )
        .context("build render targets")?;
        let scheduler = FrameScheduler::new(render_loop.slot_count());
        let paused = surface.drawable_size().is_empty();

        info!("vulkan renderer ready on '{}'", ctx.device_name());
        Ok(Self { scheduler, render_loop, ctx, surface, paused, lost: false })
    }

    fn resize(&mut self, size: RenderSize) -> Result<()> {
        self.paused = size.is_empty();
        self.scheduler.mark_dirty();
        if self.paused {
            info!("drawable collapsed to {}x{}; paused", size.width, size.height);
        }
        Ok(())
    }

    fn render(&mut self) -> Result<()> {
        if self.lost {
            bail!("renderer stopped after a fatal device error");
        }
        if self.paused {
            return Ok(());
        }
        // the window may have shrunk to zero without a resize reaching us yet
        if self.surface.drawable_size().is_empty() {
            self.paused = true;
            return Ok(());
        }
        let frame = self.scheduler.tick(&mut self.render_loop);
        settle_frame(frame, &mut self.lost)
    }

    fn set_clear_color(&mut self, rgba: [f32; 4]) {
        self.render_loop.set_clear_color(rgba);
    }
}
