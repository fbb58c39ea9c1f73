// SPDX-License-Identifier: CEPL-1.0
#![deny(unsafe_op_in_unsafe_fn)]
mod config;

use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use arctic_core::init_tracing;
use arctic_platform::winit::{
    application::ApplicationHandler,
    event::WindowEvent,
    event_loop::{ActiveEventLoop, ControlFlow, EventLoop},
    window::WindowId,
};
use arctic_platform::PlatformWindow;
use arctic_render::{AssetProvider, DirAssets, RenderSize, Renderer};
use arctic_render_vk::{BuiltinShaders, VkRenderer};
use clap::Parser;
use tracing::{error, info};

use config::{AppCfg, Args};

struct App {
    cfg: AppCfg,
    // renderer before window: the surface must go before the native window
    renderer: Option<VkRenderer>,
    window: Option<PlatformWindow>,
    exiting: bool,
    frames: u32,
    last_fps_instant: Instant,
}

impl App {
    fn start(&mut self, event_loop: &ActiveEventLoop) -> Result<()> {
        let window = PlatformWindow::create(event_loop, &self.cfg.window_spec())?;
        let assets: Box<dyn AssetProvider> = match &self.cfg.render.assets_dir {
            Some(dir) => {
                let assets = DirAssets::new(dir);
                info!("assets from {}", assets.root().display());
                Box::new(assets)
            }
            None => Box::new(BuiltinShaders),
        };
        let renderer = VkRenderer::new(Arc::new(window.clone()), assets.as_ref(), self.cfg.render.settings)?;
        info!("renderer on '{}'", renderer.device_name());

        window.request_redraw();
        self.renderer = Some(renderer);
        self.window = Some(window);
        Ok(())
    }

    fn shutdown(&mut self, event_loop: &ActiveEventLoop) {
        self.exiting = true;
        self.renderer = None;
        self.window = None;
        event_loop.exit();
    }
}

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }
        event_loop.set_control_flow(ControlFlow::Wait);
        if let Err(e) = self.start(event_loop) {
            error!("startup failed: {e:#}");
            self.shutdown(event_loop);
        }
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, window_id: WindowId, event: WindowEvent) {
        if self.window.as_ref().is_some_and(|w| w.id() != window_id) {
            return;
        }

        match event {
            WindowEvent::CloseRequested => {
                info!("CloseRequested");
                self.shutdown(event_loop);
            }

            WindowEvent::Resized(new_size) => {
                let size = RenderSize { width: new_size.width, height: new_size.height };
                info!("Resized → {}x{}", size.width, size.height);
                if let Some(r) = &mut self.renderer {
                    if let Err(e) = r.resize(size) {
                        error!("resize: {e:#}");
                    }
                }
                if let Some(w) = &self.window {
                    w.request_redraw();
                }
            }

            WindowEvent::RedrawRequested => {
                if self.exiting {
                    return;
                }
                let mut stop = false;
                if let Some(r) = &mut self.renderer {
                    match r.render() {
                        Ok(()) if !r.is_paused() => self.frames = self.frames.saturating_add(1),
                        Ok(()) => {}
                        Err(e) => {
                            error!("frame abandoned: {e:#}");
                            stop = r.is_lost();
                        }
                    }
                }
                if stop {
                    self.shutdown(event_loop);
                }
            }

            _ => {}
        }
    }

    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if self.exiting {
            return;
        }
        let paused = self.renderer.as_ref().map_or(true, |r| r.is_paused());
        if !paused {
            if let Some(w) = &self.window {
                w.request_redraw();
            }
        }

        let now = Instant::now();
        if now.duration_since(self.last_fps_instant).as_secs_f32() >= 1.0 {
            if !paused {
                info!("fps ~ {}", self.frames);
            }
            self.frames = 0;
            self.last_fps_instant = now;
        }
    }
}

fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();
    let mut cfg = AppCfg::load(&args.config);
    cfg.apply_args(&args);

    let event_loop: EventLoop<()> = EventLoop::new()?;
    let mut app = App {
        cfg,
        renderer: None,
        window: None,
        exiting: false,
        frames: 0,
        last_fps_instant: Instant::now(),
    };
    event_loop.run_app(&mut app)?;
    Ok(())
}
