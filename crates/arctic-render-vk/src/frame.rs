// SPDX-License-Identifier: CEPL-1.0
//! Per-frame resources for the fixed ring of in-flight frames.

use std::sync::Arc;

use ash::vk;

use crate::command::CommandPool;
use crate::device::DeviceContext;
use crate::error::{RenderError, RenderResult};
use crate::memory::GpuBuffer;
use crate::mesh::UniformBufferObject;
use crate::sync::{Fence, Semaphore};

pub const MAX_FRAMES_IN_FLIGHT: usize = 3;

/// Everything one in-flight frame touches. The fence guards the command
/// buffer and the uniform buffer.
pub struct FrameSlot {
    pub command_buffer: vk::CommandBuffer,
    pub image_available: Semaphore,
    pub render_finished: Semaphore,
    pub in_flight: Fence,
    pub uniform: GpuBuffer,
    pub descriptor_set: vk::DescriptorSet,
}

pub struct FrameSlots {
    ctx: Arc<DeviceContext>,
    slots: Vec<FrameSlot>,
    descriptor_pool: vk::DescriptorPool,
    _pool: CommandPool,
}

impl FrameSlots {
    /// `set_layout` must describe one vertex-stage uniform buffer at binding 0.
    pub fn new(ctx: Arc<DeviceContext>, set_layout: vk::DescriptorSetLayout, count: usize) -> RenderResult<Self> {
        let pool = CommandPool::new(
            ctx.clone(),
            ctx.families().graphics,
            vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER,
        )?;
        let command_buffers = pool.allocate(count as u32)?;

        let pool_sizes = [vk::DescriptorPoolSize {
            ty: vk::DescriptorType::UNIFORM_BUFFER,
            descriptor_count: count as u32,
        }];
        let pool_ci = vk::DescriptorPoolCreateInfo {
            s_type: vk::StructureType::DESCRIPTOR_POOL_CREATE_INFO,
            max_sets: count as u32,
            pool_size_count: pool_sizes.len() as u32,
            p_pool_sizes: pool_sizes.as_ptr(),
            ..Default::default()
        };
        // SAFETY: create-info outlives the call.
        let descriptor_pool = unsafe { ctx.device().create_descriptor_pool(&pool_ci, None) }
            .map_err(RenderError::vk("create_descriptor_pool"))?;
        // From here the pool is owned by `frames` so early returns release it.
        let mut frames = Self { ctx: ctx.clone(), slots: Vec::with_capacity(count), descriptor_pool, _pool: pool };

        let layouts = vec![set_layout; count];
        let alloc = vk::DescriptorSetAllocateInfo {
            s_type: vk::StructureType::DESCRIPTOR_SET_ALLOCATE_INFO,
            descriptor_pool,
            descriptor_set_count: count as u32,
            p_set_layouts: layouts.as_ptr(),
            ..Default::default()
        };
        // SAFETY: pool sized for exactly `count` uniform-buffer sets.
        let sets = unsafe { ctx.device().allocate_descriptor_sets(&alloc) }
            .map_err(RenderError::vk("allocate_descriptor_sets"))?;

        for (command_buffer, descriptor_set) in command_buffers.into_iter().zip(sets) {
            let mut uniform = GpuBuffer::new(
                ctx.clone(),
                UniformBufferObject::SIZE,
                vk::BufferUsageFlags::UNIFORM_BUFFER,
                vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
            )?;
            uniform.map_persistent()?;

            let info = vk::DescriptorBufferInfo {
                buffer: uniform.handle(),
                offset: 0,
                range: UniformBufferObject::SIZE,
            };
            let write = vk::WriteDescriptorSet {
                s_type: vk::StructureType::WRITE_DESCRIPTOR_SET,
                dst_set: descriptor_set,
                dst_binding: 0,
                descriptor_count: 1,
                descriptor_type: vk::DescriptorType::UNIFORM_BUFFER,
                p_buffer_info: &info,
                ..Default::default()
            };
            // SAFETY: set is not in use by any submission yet.
            unsafe { ctx.device().update_descriptor_sets(std::slice::from_ref(&write), &[]) };

            frames.slots.push(FrameSlot {
                command_buffer,
                image_available: Semaphore::new(ctx.clone())?,
                render_finished: Semaphore::new(ctx.clone())?,
                in_flight: Fence::new(ctx.clone(), true)?,
                uniform,
                descriptor_set,
            });
        }
        tracing::debug!("{count} frame slots ready");
        Ok(frames)
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    pub fn slot(&self, index: usize) -> &FrameSlot {
        &self.slots[index]
    }

    pub fn slot_mut(&mut self, index: usize) -> &mut FrameSlot {
        &mut self.slots[index]
    }

    /// Swaps in a signaled fence and a fresh acquire semaphore for `index`.
    /// The old objects may be in any state, so the device must be idle.
    pub fn renew_sync(&mut self, index: usize) -> RenderResult<()> {
        let in_flight = Fence::new(self.ctx.clone(), true)?;
        let image_available = Semaphore::new(self.ctx.clone())?;
        let slot = &mut self.slots[index];
        slot.in_flight = in_flight;
        slot.image_available = image_available;
        Ok(())
    }
}

impl Drop for FrameSlots {
    fn drop(&mut self) {
        // Slots go first; sets die with the pool, command buffers with theirs.
        self.slots.clear();
        // SAFETY: device is idle before renderer teardown.
        unsafe { self.ctx.device().destroy_descriptor_pool(self.descriptor_pool, None) };
    }
}
