// SPDX-License-Identifier: CEPL-1.0
//! The built-in quad and its per-frame uniform block.

use std::sync::Arc;

use arctic_math::Mvp;
use ash::vk;
use bytemuck::{Pod, Zeroable};

use crate::device::DeviceContext;
use crate::error::RenderResult;
use crate::memory::{GpuBuffer, TransferService};

#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
pub struct Vertex {
    pub pos: [f32; 2],
    pub color: [f32; 3],
}

impl Vertex {
    pub const fn new(pos: [f32; 2], color: [f32; 3]) -> Self {
        Self { pos, color }
    }

    pub fn binding_description() -> vk::VertexInputBindingDescription {
        vk::VertexInputBindingDescription {
            binding: 0,
            stride: std::mem::size_of::<Self>() as u32,
            input_rate: vk::VertexInputRate::VERTEX,
        }
    }

    pub fn attribute_descriptions() -> [vk::VertexInputAttributeDescription; 2] {
        [
            vk::VertexInputAttributeDescription {
                location: 0,
                binding: 0,
                format: vk::Format::R32G32_SFLOAT,
                offset: std::mem::offset_of!(Vertex, pos) as u32,
            },
            vk::VertexInputAttributeDescription {
                location: 1,
                binding: 0,
                format: vk::Format::R32G32B32_SFLOAT,
                offset: std::mem::offset_of!(Vertex, color) as u32,
            },
        ]
    }
}

pub const MESH_VERTICES: [Vertex; 4] = [
    Vertex::new([-0.5, -0.5], [1.0, 0.0, 1.0]),
    Vertex::new([0.5, -0.5], [0.0, 1.0, 1.0]),
    Vertex::new([0.5, 0.5], [0.0, 0.0, 1.0]),
    Vertex::new([-0.5, 0.5], [0.0, 1.0, 0.25]),
];

pub const MESH_INDICES: [u32; 6] = [0, 1, 2, 2, 3, 0];

/// Matches the std140 block `{ mat4 model; mat4 view; mat4 proj; }`.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
pub struct UniformBufferObject {
    pub model: [[f32; 4]; 4],
    pub view: [[f32; 4]; 4],
    pub proj: [[f32; 4]; 4],
}

impl UniformBufferObject {
    pub const SIZE: vk::DeviceSize = std::mem::size_of::<Self>() as vk::DeviceSize;
}

impl From<Mvp> for UniformBufferObject {
    fn from(m: Mvp) -> Self {
        Self {
            model: m.model.to_cols_array_2d(),
            view: m.view.to_cols_array_2d(),
            proj: m.proj.to_cols_array_2d(),
        }
    }
}

/// Device-local vertex and index buffers, uploaded once.
pub struct MeshBuffers {
    pub vertex: GpuBuffer,
    pub index: GpuBuffer,
    pub index_count: u32,
}

impl MeshBuffers {
    pub fn upload_builtin(ctx: &Arc<DeviceContext>) -> RenderResult<Self> {
        let transfer = TransferService::new(ctx.clone())?;
        Self::upload(&transfer, &MESH_VERTICES, &MESH_INDICES)
    }

    pub fn upload(
        transfer: &TransferService,
        vertices: &[Vertex],
        indices: &[u32],
    ) -> RenderResult<Self> {
        let vertex = transfer.upload(bytemuck::cast_slice(vertices), vk::BufferUsageFlags::VERTEX_BUFFER)?;
        let index = transfer.upload(bytemuck::cast_slice(indices), vk::BufferUsageFlags::INDEX_BUFFER)?;
        tracing::info!("mesh uploaded: {} vertices, {} indices", vertices.len(), indices.len());
        Ok(Self { vertex, index, index_count: indices.len() as u32 })
    }
}
