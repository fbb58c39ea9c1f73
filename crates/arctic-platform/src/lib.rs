// SPDX-License-Identifier: CEPL-1.0
//! winit glue: exposes a window as the renderer's surface provider.

pub use winit;

use anyhow::{Context, Result};
use arctic_render::{DrawableSize, RenderSize};
use raw_window_handle::{
    DisplayHandle, HandleError, HasDisplayHandle, HasWindowHandle, WindowHandle,
};
use std::sync::Arc;
use winit::{
    dpi::PhysicalSize,
    event_loop::ActiveEventLoop,
    window::{Window, WindowId},
};

#[derive(Clone, Debug)]
pub struct WindowSpec {
    pub title: String,
    pub width: u32,
    pub height: u32,
}

/// Shared handle to the native window.
#[derive(Clone)]
pub struct PlatformWindow {
    window: Arc<Window>,
}

impl PlatformWindow {
    pub fn create(event_loop: &ActiveEventLoop, spec: &WindowSpec) -> Result<Self> {
        let attrs = Window::default_attributes()
            .with_title(spec.title.clone())
            .with_inner_size(PhysicalSize::new(spec.width.max(1), spec.height.max(1)))
            .with_resizable(true);
        let window = event_loop.create_window(attrs).context("create_window")?;
        tracing::info!(
            "window '{}' created ({}x{})",
            spec.title,
            window.inner_size().width,
            window.inner_size().height
        );
        Ok(Self { window: Arc::new(window) })
    }

    pub fn id(&self) -> WindowId {
        self.window.id()
    }

    pub fn request_redraw(&self) {
        self.window.request_redraw();
    }
}

impl DrawableSize for PlatformWindow {
    fn drawable_size(&self) -> RenderSize {
        let size = self.window.inner_size();
        RenderSize { width: size.width, height: size.height }
    }
}

impl HasWindowHandle for PlatformWindow {
    fn window_handle(&self) -> Result<WindowHandle<'_>, HandleError> {
        self.window.window_handle()
    }
}

impl HasDisplayHandle for PlatformWindow {
    fn display_handle(&self) -> Result<DisplayHandle<'_>, HandleError> {
        self.window.display_handle()
    }
}
