// SPDX-License-Identifier: CEPL-1.0
use std::sync::Arc;

use ash::vk;
use tracing::debug;

use crate::device::DeviceContext;
use crate::error::{RenderError, RenderResult};

/// Command pool on one queue family. Dropping it frees every buffer it
/// allocated.
pub struct CommandPool {
    ctx: Arc<DeviceContext>,
    pool: vk::CommandPool,
}

impl CommandPool {
    pub fn new(
        ctx: Arc<DeviceContext>,
        family: u32,
        flags: vk::CommandPoolCreateFlags,
    ) -> RenderResult<Self> {
        let pool_info = vk::CommandPoolCreateInfo {
            s_type: vk::StructureType::COMMAND_POOL_CREATE_INFO,
            queue_family_index: family,
            flags,
            ..Default::default()
        };
        // SAFETY: family index was validated by device selection.
        let pool = unsafe { ctx.device().create_command_pool(&pool_info, None) }
            .map_err(RenderError::vk("create_command_pool"))?;
        debug!("command pool on family {family} ({flags:?})");
        Ok(Self { ctx, pool })
    }

    pub fn allocate(&self, count: u32) -> RenderResult<Vec<vk::CommandBuffer>> {
        let alloc_info = vk::CommandBufferAllocateInfo {
            s_type: vk::StructureType::COMMAND_BUFFER_ALLOCATE_INFO,
            command_pool: self.pool,
            level: vk::CommandBufferLevel::PRIMARY,
            command_buffer_count: count,
            ..Default::default()
        };
        // SAFETY: pool is live and externally synchronised by &self on one thread.
        unsafe { self.ctx.device().allocate_command_buffers(&alloc_info) }
            .map_err(RenderError::vk("allocate_command_buffers"))
    }

    /// Buffers must not be pending on any queue.
    pub fn free(&self, bufs: &[vk::CommandBuffer]) {
        if !bufs.is_empty() {
            // SAFETY: caller guarantees the buffers finished executing.
            unsafe { self.ctx.device().free_command_buffers(self.pool, bufs) };
        }
    }
}

impl Drop for CommandPool {
    fn drop(&mut self) {
        // SAFETY: destroyed after the device went idle.
        unsafe { self.ctx.device().destroy_command_pool(self.pool, None) };
    }
}
