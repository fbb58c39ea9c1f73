// SPDX-License-Identifier: CEPL-1.0
//! Error kinds for the Vulkan backend.

use ash::vk;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RenderError {
    #[error("Vulkan loader unavailable: {0}")]
    LoaderUnavailable(#[from] ash::LoadingError),

    #[error("no physical device satisfies the requirements")]
    NoSuitableDevice,

    #[error("device unavailable during {op}: {result:?}")]
    DeviceUnavailable { op: &'static str, result: vk::Result },

    #[error("out of memory during {op}: {result:?}")]
    OutOfMemory { op: &'static str, result: vk::Result },

    #[error("no memory type matches bits {type_bits:#b} with {required:?}")]
    NoCompatibleMemoryType {
        type_bits: u32,
        required: vk::MemoryPropertyFlags,
    },

    #[error("write of {len} bytes exceeds buffer of {capacity} bytes")]
    BufferOverflow { len: u64, capacity: u64 },

    #[error("surface lost during {op}")]
    SurfaceLost { op: &'static str },

    #[error("shader module rejected: {0}")]
    ShaderCompileFailed(String),

    #[error("asset '{name}' unavailable: {reason}")]
    AssetMissing { name: String, reason: String },

    #[error("window handle: {0}")]
    WindowHandle(#[from] raw_window_handle::HandleError),

    #[error("{op} failed: {result:?}")]
    Vulkan { op: &'static str, result: vk::Result },
}

pub type RenderResult<T> = std::result::Result<T, RenderError>;

impl RenderError {
    /// Classifies a raw result code for the named operation.
    pub fn from_vk(op: &'static str, result: vk::Result) -> Self {
        match result {
            vk::Result::ERROR_OUT_OF_HOST_MEMORY
            | vk::Result::ERROR_OUT_OF_DEVICE_MEMORY
            | vk::Result::ERROR_OUT_OF_POOL_MEMORY => Self::OutOfMemory { op, result },
            vk::Result::ERROR_DEVICE_LOST | vk::Result::ERROR_INITIALIZATION_FAILED => {
                Self::DeviceUnavailable { op, result }
            }
            vk::Result::ERROR_SURFACE_LOST_KHR => Self::SurfaceLost { op },
            vk::Result::ERROR_INVALID_SHADER_NV => {
                Self::ShaderCompileFailed(format!("{op}: {result:?}"))
            }
            _ => Self::Vulkan { op, result },
        }
    }

    /// Adapter for `map_err`: `.map_err(RenderError::vk("create_buffer"))`.
    pub fn vk(op: &'static str) -> impl Fn(vk::Result) -> Self {
        move |result| Self::from_vk(op, result)
    }

    /// True for kinds where retrying the same call cannot help.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::LoaderUnavailable(_)
                | Self::NoSuitableDevice
                | Self::DeviceUnavailable { .. }
                | Self::SurfaceLost { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_codes_map_to_out_of_memory() {
        for code in [
            vk::Result::ERROR_OUT_OF_HOST_MEMORY,
            vk::Result::ERROR_OUT_OF_DEVICE_MEMORY,
        ] {
            assert!(matches!(
                RenderError::from_vk("allocate_memory", code),
                RenderError::OutOfMemory { op: "allocate_memory", .. }
            ));
        }
    }

    #[test]
    fn lost_device_is_fatal() {
        let e = RenderError::vk("queue_submit")(vk::Result::ERROR_DEVICE_LOST);
        assert!(matches!(e, RenderError::DeviceUnavailable { .. }));
        assert!(e.is_fatal());
    }

    #[test]
    fn surface_lost_kind() {
        let e = RenderError::from_vk("acquire_next_image", vk::Result::ERROR_SURFACE_LOST_KHR);
        assert!(matches!(e, RenderError::SurfaceLost { op: "acquire_next_image" }));
    }

    #[test]
    fn other_codes_keep_result() {
        let e = RenderError::from_vk("create_render_pass", vk::Result::ERROR_UNKNOWN);
        assert!(!e.is_fatal());
        assert_eq!(e.to_string(), "create_render_pass failed: ERROR_UNKNOWN");
    }
}
