// SPDX-License-Identifier: CEPL-1.0
//! Scoped semaphores and fences.

use std::sync::Arc;

use ash::vk;

use crate::device::DeviceContext;
use crate::error::{RenderError, RenderResult};

/// Binary semaphore; GPU-side ordering only.
pub struct Semaphore {
    ctx: Arc<DeviceContext>,
    handle: vk::Semaphore,
}

impl Semaphore {
    pub fn new(ctx: Arc<DeviceContext>) -> RenderResult<Self> {
        let ci = vk::SemaphoreCreateInfo::default();
        // SAFETY: plain object creation on a live device.
        let handle = unsafe { ctx.device().create_semaphore(&ci, None) }
            .map_err(RenderError::vk("create_semaphore"))?;
        Ok(Self { ctx, handle })
    }

    #[inline]
    pub fn handle(&self) -> vk::Semaphore {
        self.handle
    }
}

impl Drop for Semaphore {
    fn drop(&mut self) {
        // SAFETY: owners drop sync objects only after the device is idle.
        unsafe { self.ctx.device().destroy_semaphore(self.handle, None) };
    }
}

/// CPU-observable completion signal.
pub struct Fence {
    ctx: Arc<DeviceContext>,
    handle: vk::Fence,
}

impl Fence {
    /// `signaled` fences let the first wait fall straight through.
    pub fn new(ctx: Arc<DeviceContext>, signaled: bool) -> RenderResult<Self> {
        let ci = vk::FenceCreateInfo {
            s_type: vk::StructureType::FENCE_CREATE_INFO,
            flags: if signaled { vk::FenceCreateFlags::SIGNALED } else { vk::FenceCreateFlags::empty() },
            ..Default::default()
        };
        // SAFETY: plain object creation on a live device.
        let handle = unsafe { ctx.device().create_fence(&ci, None) }
            .map_err(RenderError::vk("create_fence"))?;
        Ok(Self { ctx, handle })
    }

    #[inline]
    pub fn handle(&self) -> vk::Fence {
        self.handle
    }

    /// Blocks without a timeout.
    pub fn wait(&self) -> RenderResult<()> {
        // SAFETY: waiting on a fence this device owns.
        unsafe { self.ctx.device().wait_for_fences(&[self.handle], true, u64::MAX) }
            .map_err(RenderError::vk("wait_for_fences"))
    }

    pub fn reset(&self) -> RenderResult<()> {
        // SAFETY: callers reset only after observing the fence signaled.
        unsafe { self.ctx.device().reset_fences(&[self.handle]) }
            .map_err(RenderError::vk("reset_fences"))
    }
}

impl Drop for Fence {
    fn drop(&mut self) {
        // SAFETY: no pending submission references the fence once the device is idle.
        unsafe { self.ctx.device().destroy_fence(self.handle, None) };
    }
}
