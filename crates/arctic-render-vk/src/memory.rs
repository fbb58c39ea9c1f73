// SPDX-License-Identifier: CEPL-1.0
//! Buffer allocation, host writes and staged host→device transfers.

use std::ptr::NonNull;
use std::sync::Arc;

use ash::vk;
use tracing::debug;

use crate::command::CommandPool;
use crate::device::DeviceContext;
use crate::error::{RenderError, RenderResult};

/// Lowest memory type index allowed by `type_bits` whose flags contain all of
/// `required`.
pub fn find_memory_type(
    props: &vk::PhysicalDeviceMemoryProperties,
    type_bits: u32,
    required: vk::MemoryPropertyFlags,
) -> Option<u32> {
    let count = props.memory_type_count.min(vk::MAX_MEMORY_TYPES as u32);
    (0..count).find(|&i| {
        (type_bits & (1 << i)) != 0
            && props.memory_types[i as usize].property_flags.contains(required)
    })
}

const HOST_STAGING: vk::MemoryPropertyFlags = vk::MemoryPropertyFlags::from_raw(
    vk::MemoryPropertyFlags::HOST_VISIBLE.as_raw() | vk::MemoryPropertyFlags::HOST_COHERENT.as_raw(),
);

/// A buffer together with its dedicated memory; both are released on drop.
pub struct GpuBuffer {
    ctx: Arc<DeviceContext>,
    buffer: vk::Buffer,
    memory: vk::DeviceMemory,
    size: vk::DeviceSize,
    mapped: Option<NonNull<u8>>,
}

impl GpuBuffer {
    /// Creates the buffer, allocates the first compatible memory type and
    /// binds it at offset 0.
    pub fn new(
        ctx: Arc<DeviceContext>,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        properties: vk::MemoryPropertyFlags,
    ) -> RenderResult<Self> {
        let families = ctx.families();
        let shared = [families.graphics, families.transfer];
        // Transfer and graphics queues both touch copy targets.
        let concurrent = families.has_dedicated_transfer()
            && usage.intersects(vk::BufferUsageFlags::TRANSFER_SRC | vk::BufferUsageFlags::TRANSFER_DST);

        let bci = vk::BufferCreateInfo {
            s_type: vk::StructureType::BUFFER_CREATE_INFO,
            size,
            usage,
            sharing_mode: if concurrent { vk::SharingMode::CONCURRENT } else { vk::SharingMode::EXCLUSIVE },
            queue_family_index_count: if concurrent { shared.len() as u32 } else { 0 },
            p_queue_family_indices: if concurrent { shared.as_ptr() } else { std::ptr::null() },
            ..Default::default()
        };

        let device = ctx.device();
        // SAFETY: bci and `shared` live across the call.
        let buffer = unsafe { device.create_buffer(&bci, None) }
            .map_err(RenderError::vk("create_buffer"))?;

        // SAFETY: buffer was just created on this device.
        let req = unsafe { device.get_buffer_memory_requirements(buffer) };
        let Some(type_index) = find_memory_type(ctx.memory_properties(), req.memory_type_bits, properties)
        else {
            unsafe { device.destroy_buffer(buffer, None) };
            return Err(RenderError::NoCompatibleMemoryType {
                type_bits: req.memory_type_bits,
                required: properties,
            });
        };

        let mai = vk::MemoryAllocateInfo {
            s_type: vk::StructureType::MEMORY_ALLOCATE_INFO,
            allocation_size: req.size,
            memory_type_index: type_index,
            ..Default::default()
        };
        let memory = match unsafe { device.allocate_memory(&mai, None) } {
            Ok(m) => m,
            Err(e) => {
                unsafe { device.destroy_buffer(buffer, None) };
                return Err(RenderError::from_vk("allocate_memory", e));
            }
        };
        if let Err(e) = unsafe { device.bind_buffer_memory(buffer, memory, 0) } {
            unsafe {
                device.destroy_buffer(buffer, None);
                device.free_memory(memory, None);
            }
            return Err(RenderError::from_vk("bind_buffer_memory", e));
        }

        debug!("buffer {size}B usage={usage:?} memory type {type_index}");
        Ok(Self { ctx, buffer, memory, size, mapped: None })
    }

    /// Host-visible, coherent buffer used as a copy source.
    pub fn staging(ctx: Arc<DeviceContext>, size: vk::DeviceSize) -> RenderResult<Self> {
        Self::new(ctx, size, vk::BufferUsageFlags::TRANSFER_SRC | vk::BufferUsageFlags::TRANSFER_DST, HOST_STAGING)
    }

    #[inline]
    pub fn handle(&self) -> vk::Buffer {
        self.buffer
    }

    #[inline]
    pub fn size(&self) -> vk::DeviceSize {
        self.size
    }

    pub fn is_mapped(&self) -> bool {
        self.mapped.is_some()
    }

    fn check_len(&self, len: usize) -> RenderResult<()> {
        if len as vk::DeviceSize > self.size {
            return Err(RenderError::BufferOverflow { len: len as u64, capacity: self.size });
        }
        Ok(())
    }

    fn map_whole(&self) -> RenderResult<NonNull<u8>> {
        // SAFETY: memory is host-visible for every buffer we map; range is the whole allocation.
        let ptr = unsafe {
            self.ctx
                .device()
                .map_memory(self.memory, 0, vk::WHOLE_SIZE, vk::MemoryMapFlags::empty())
        }
        .map_err(RenderError::vk("map_memory"))?;
        NonNull::new(ptr.cast::<u8>())
            .ok_or(RenderError::Vulkan { op: "map_memory", result: vk::Result::ERROR_MEMORY_MAP_FAILED })
    }

    /// Map, copy, unmap. Goes through the persistent mapping when one is open.
    pub fn write(&mut self, bytes: &[u8]) -> RenderResult<()> {
        self.check_len(bytes.len())?;
        if let Some(dst) = self.mapped {
            // SAFETY: mapping covers `size` bytes and len <= size.
            unsafe { std::ptr::copy_nonoverlapping(bytes.as_ptr(), dst.as_ptr(), bytes.len()) };
            return Ok(());
        }
        let dst = self.map_whole()?;
        // SAFETY: as above; unmapped right after.
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), dst.as_ptr(), bytes.len());
            self.ctx.device().unmap_memory(self.memory);
        }
        Ok(())
    }

    /// Keeps the memory mapped until the buffer is dropped.
    pub fn map_persistent(&mut self) -> RenderResult<()> {
        if self.mapped.is_none() {
            self.mapped = Some(self.map_whole()?);
        }
        Ok(())
    }

    /// Copies the first `len` bytes back to the host.
    pub fn read(&self, len: usize) -> RenderResult<Vec<u8>> {
        self.check_len(len)?;
        let mut out = vec![0u8; len];
        if let Some(src) = self.mapped {
            // SAFETY: mapping covers `size` bytes.
            unsafe { std::ptr::copy_nonoverlapping(src.as_ptr(), out.as_mut_ptr(), len) };
            return Ok(out);
        }
        let src = self.map_whole()?;
        // SAFETY: as above; unmapped right after.
        unsafe {
            std::ptr::copy_nonoverlapping(src.as_ptr(), out.as_mut_ptr(), len);
            self.ctx.device().unmap_memory(self.memory);
        }
        Ok(out)
    }
}

impl Drop for GpuBuffer {
    fn drop(&mut self) {
        let device = self.ctx.device();
        // SAFETY: owners drop buffers only once no submission references them.
        unsafe {
            if self.mapped.take().is_some() {
                device.unmap_memory(self.memory);
            }
            device.destroy_buffer(self.buffer, None);
            device.free_memory(self.memory, None);
        }
    }
}

/// One-shot copies on the transfer queue. Every copy blocks until the
/// transfer queue is idle; meant for setup, not per-frame work.
pub struct TransferService {
    ctx: Arc<DeviceContext>,
    pool: CommandPool,
}

impl TransferService {
    pub fn new(ctx: Arc<DeviceContext>) -> RenderResult<Self> {
        let pool = CommandPool::new(
            ctx.clone(),
            ctx.families().transfer,
            vk::CommandPoolCreateFlags::TRANSIENT,
        )?;
        Ok(Self { ctx, pool })
    }

    pub fn copy_buffer_to_buffer(
        &self,
        src: &GpuBuffer,
        dst: &GpuBuffer,
        size: vk::DeviceSize,
    ) -> RenderResult<()> {
        if size > src.size() || size > dst.size() {
            return Err(RenderError::BufferOverflow { len: size, capacity: src.size().min(dst.size()) });
        }
        let device = self.ctx.device();
        let queue = self.ctx.queues().transfer;
        let cmd = self.pool.allocate(1)?[0];

        let run = || -> RenderResult<()> {
            let bi = vk::CommandBufferBeginInfo {
                s_type: vk::StructureType::COMMAND_BUFFER_BEGIN_INFO,
                flags: vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT,
                ..Default::default()
            };
            let region = vk::BufferCopy { src_offset: 0, dst_offset: 0, size };
            let si = vk::SubmitInfo {
                s_type: vk::StructureType::SUBMIT_INFO,
                command_buffer_count: 1,
                p_command_buffers: &cmd,
                ..Default::default()
            };
            // SAFETY: cmd is fresh from our pool; both buffers are live for the whole wait.
            unsafe {
                device.begin_command_buffer(cmd, &bi).map_err(RenderError::vk("begin_command_buffer"))?;
                device.cmd_copy_buffer(cmd, src.handle(), dst.handle(), std::slice::from_ref(&region));
                device.end_command_buffer(cmd).map_err(RenderError::vk("end_command_buffer"))?;
                device
                    .queue_submit(queue, std::slice::from_ref(&si), vk::Fence::null())
                    .map_err(RenderError::vk("queue_submit(transfer)"))?;
                device.queue_wait_idle(queue).map_err(RenderError::vk("queue_wait_idle(transfer)"))
            }
        };
        let result = run();
        self.pool.free(std::slice::from_ref(&cmd));
        result
    }

    /// Device-local buffer filled through a staging buffer that is dropped
    /// before returning.
    pub fn upload(&self, bytes: &[u8], usage: vk::BufferUsageFlags) -> RenderResult<GpuBuffer> {
        let size = bytes.len() as vk::DeviceSize;
        let mut staging = GpuBuffer::staging(self.ctx.clone(), size)?;
        staging.write(bytes)?;

        let dst = GpuBuffer::new(
            self.ctx.clone(),
            size,
            usage | vk::BufferUsageFlags::TRANSFER_DST,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        )?;
        self.copy_buffer_to_buffer(&staging, &dst, size)?;
        Ok(dst)
    }

    /// Reads a device-local buffer back through a fresh staging buffer.
    /// `src` needs TRANSFER_SRC usage.
    pub fn download(&self, src: &GpuBuffer, len: usize) -> RenderResult<Vec<u8>> {
        let size = len as vk::DeviceSize;
        let staging = GpuBuffer::staging(self.ctx.clone(), size)?;
        self.copy_buffer_to_buffer(src, &staging, size)?;
        staging.read(len)
    }
}
