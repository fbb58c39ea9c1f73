// SPDX-License-Identifier: CEPL-1.0
//! Surface/swapchain manager. Recreation is always clean_up() then
//! create_swap_chain(); there is no in-place resize.

use std::sync::Arc;

use arctic_render::{PresentPreference, RenderSize, SurfaceProvider};
use ash::khr::swapchain;
use ash::vk;
use tracing::info;

use crate::device::DeviceContext;
use crate::error::{RenderError, RenderResult};

pub const PREFERRED_FORMAT: vk::SurfaceFormatKHR = vk::SurfaceFormatKHR {
    format: vk::Format::B8G8R8A8_SRGB,
    color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
};

/// The preferred pair if offered, else whatever the driver lists first.
/// `None` only for an empty list.
pub fn choose_surface_format(formats: &[vk::SurfaceFormatKHR]) -> Option<vk::SurfaceFormatKHR> {
    formats
        .iter()
        .copied()
        .find(|f| f.format == PREFERRED_FORMAT.format && f.color_space == PREFERRED_FORMAT.color_space)
        .or_else(|| formats.first().copied())
}

pub fn choose_present_mode(modes: &[vk::PresentModeKHR], pref: PresentPreference) -> vk::PresentModeKHR {
    match pref {
        PresentPreference::Mailbox if modes.contains(&vk::PresentModeKHR::MAILBOX) => {
            vk::PresentModeKHR::MAILBOX
        }
        _ => vk::PresentModeKHR::FIFO,
    }
}

/// Drawable size clamped into the surface's [min, max] extent.
pub fn clamp_extent(drawable: RenderSize, caps: &vk::SurfaceCapabilitiesKHR) -> vk::Extent2D {
    vk::Extent2D {
        width: drawable
            .width
            .clamp(caps.min_image_extent.width, caps.max_image_extent.width.max(caps.min_image_extent.width)),
        height: drawable
            .height
            .clamp(caps.min_image_extent.height, caps.max_image_extent.height.max(caps.min_image_extent.height)),
    }
}

/// One more than the minimum; a maximum of 0 means unbounded.
pub fn choose_image_count(caps: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let want = caps.min_image_count + 1;
    if caps.max_image_count == 0 {
        want
    } else {
        want.min(caps.max_image_count)
    }
}

/// What downstream stages need to know about the live chain.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SwapchainData {
    pub format: vk::Format,
    pub extent: vk::Extent2D,
    pub image_count: u32,
}

struct Chain {
    handle: vk::SwapchainKHR,
    views: Vec<vk::ImageView>,
    data: SwapchainData,
}

pub struct SwapchainManager {
    ctx: Arc<DeviceContext>,
    drawable: Arc<dyn SurfaceProvider>,
    preference: PresentPreference,
    loader: swapchain::Device,
    chain: Option<Chain>,
}

impl SwapchainManager {
    /// Stores what creation needs. No Vulkan objects are created here.
    pub fn configure(
        ctx: Arc<DeviceContext>,
        drawable: Arc<dyn SurfaceProvider>,
        preference: PresentPreference,
    ) -> Self {
        let loader = swapchain::Device::new(ctx.instance(), ctx.device());
        Self { ctx, drawable, preference, loader, chain: None }
    }

    pub fn create_swap_chain(&mut self) -> RenderResult<SwapchainData> {
        if let Some(chain) = &self.chain {
            return Ok(chain.data);
        }
        let surface = self.ctx.surface().ok_or(RenderError::SurfaceLost { op: "create_swap_chain" })?;
        let phys = self.ctx.physical_device();

        // SAFETY: surface and physical device belong to this context's instance.
        let (caps, formats, modes) = unsafe {
            let l = surface.loader();
            (
                l.get_physical_device_surface_capabilities(phys, surface.handle())
                    .map_err(RenderError::vk("get_physical_device_surface_capabilities"))?,
                l.get_physical_device_surface_formats(phys, surface.handle())
                    .map_err(RenderError::vk("get_physical_device_surface_formats"))?,
                l.get_physical_device_surface_present_modes(phys, surface.handle())
                    .map_err(RenderError::vk("get_physical_device_surface_present_modes"))?,
            )
        };

        let format = choose_surface_format(&formats).ok_or(RenderError::Vulkan {
            op: "get_physical_device_surface_formats",
            result: vk::Result::ERROR_FORMAT_NOT_SUPPORTED,
        })?;
        let present_mode = choose_present_mode(&modes, self.preference);
        let extent = clamp_extent(self.drawable.drawable_size(), &caps);
        let min_image_count = choose_image_count(&caps);

        let families = self.ctx.families();
        let shared = [families.graphics, families.present];
        let split = families.graphics != families.present;

        let ci = vk::SwapchainCreateInfoKHR {
            s_type: vk::StructureType::SWAPCHAIN_CREATE_INFO_KHR,
            surface: surface.handle(),
            min_image_count,
            image_format: format.format,
            image_color_space: format.color_space,
            image_extent: extent,
            image_array_layers: 1,
            image_usage: vk::ImageUsageFlags::COLOR_ATTACHMENT,
            image_sharing_mode: if split { vk::SharingMode::CONCURRENT } else { vk::SharingMode::EXCLUSIVE },
            queue_family_index_count: if split { 2 } else { 0 },
            p_queue_family_indices: if split { shared.as_ptr() } else { std::ptr::null() },
            pre_transform: caps.current_transform,
            composite_alpha: vk::CompositeAlphaFlagsKHR::OPAQUE,
            present_mode,
            clipped: vk::TRUE,
            old_swapchain: vk::SwapchainKHR::null(),
            ..Default::default()
        };

        // SAFETY: ci and `shared` outlive the call; no previous chain exists.
        let handle = unsafe { self.loader.create_swapchain(&ci, None) }
            .map_err(RenderError::vk("create_swapchain"))?;
        let images = match unsafe { self.loader.get_swapchain_images(handle) } {
            Ok(images) => images,
            Err(e) => {
                unsafe { self.loader.destroy_swapchain(handle, None) };
                return Err(RenderError::from_vk("get_swapchain_images", e));
            }
        };

        let mut views = Vec::with_capacity(images.len());
        for &image in &images {
            match create_view(self.ctx.device(), image, format.format) {
                Ok(view) => views.push(view),
                Err(e) => {
                    // SAFETY: nothing has been recorded against these yet.
                    unsafe {
                        for v in views.drain(..) {
                            self.ctx.device().destroy_image_view(v, None);
                        }
                        self.loader.destroy_swapchain(handle, None);
                    }
                    return Err(e);
                }
            }
        }

        let data = SwapchainData { format: format.format, extent, image_count: images.len() as u32 };
        info!(
            "swapchain {:?}/{:?} {:?} {}x{} images={} (asked {})",
            format.format, format.color_space, present_mode, extent.width, extent.height,
            data.image_count, min_image_count
        );
        self.chain = Some(Chain { handle, views, data });
        Ok(data)
    }

    /// Views first, then the chain. Callers keep the device idle around this.
    pub fn clean_up(&mut self) {
        if let Some(chain) = self.chain.take() {
            // SAFETY: caller guarantees no pending work references the chain.
            unsafe {
                for view in chain.views {
                    self.ctx.device().destroy_image_view(view, None);
                }
                self.loader.destroy_swapchain(chain.handle, None);
            }
        }
    }

    pub fn is_live(&self) -> bool {
        self.chain.is_some()
    }

    pub fn image_views(&self) -> &[vk::ImageView] {
        self.chain.as_ref().map_or(&[], |c| &c.views)
    }

    pub fn handle(&self) -> vk::SwapchainKHR {
        self.chain.as_ref().map_or(vk::SwapchainKHR::null(), |c| c.handle)
    }

    pub fn loader(&self) -> &swapchain::Device {
        &self.loader
    }
}

impl Drop for SwapchainManager {
    fn drop(&mut self) {
        self.clean_up();
    }
}

fn create_view(device: &ash::Device, image: vk::Image, format: vk::Format) -> RenderResult<vk::ImageView> {
    let ci = vk::ImageViewCreateInfo {
        s_type: vk::StructureType::IMAGE_VIEW_CREATE_INFO,
        image,
        view_type: vk::ImageViewType::TYPE_2D,
        format,
        components: vk::ComponentMapping {
            r: vk::ComponentSwizzle::IDENTITY,
            g: vk::ComponentSwizzle::IDENTITY,
            b: vk::ComponentSwizzle::IDENTITY,
            a: vk::ComponentSwizzle::IDENTITY,
        },
        subresource_range: vk::ImageSubresourceRange {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            base_mip_level: 0,
            level_count: 1,
            base_array_layer: 0,
            layer_count: 1,
        },
        ..Default::default()
    };
    // SAFETY: image comes from a live swapchain on this device.
    unsafe { device.create_image_view(&ci, None) }.map_err(RenderError::vk("create_image_view"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fmt(format: vk::Format, color_space: vk::ColorSpaceKHR) -> vk::SurfaceFormatKHR {
        vk::SurfaceFormatKHR { format, color_space }
    }

    fn caps(min: (u32, u32), max: (u32, u32), count: (u32, u32)) -> vk::SurfaceCapabilitiesKHR {
        vk::SurfaceCapabilitiesKHR {
            min_image_extent: vk::Extent2D { width: min.0, height: min.1 },
            max_image_extent: vk::Extent2D { width: max.0, height: max.1 },
            min_image_count: count.0,
            max_image_count: count.1,
            ..Default::default()
        }
    }

    #[test]
    fn prefers_srgb_bgra() {
        let formats = [
            fmt(vk::Format::R8G8B8A8_UNORM, vk::ColorSpaceKHR::SRGB_NONLINEAR),
            fmt(vk::Format::B8G8R8A8_SRGB, vk::ColorSpaceKHR::SRGB_NONLINEAR),
        ];
        assert_eq!(choose_surface_format(&formats), Some(formats[1]));
    }

    #[test]
    fn falls_back_to_first_format() {
        // right format, wrong colour space does not count
        let formats = [
            fmt(vk::Format::R8G8B8A8_UNORM, vk::ColorSpaceKHR::SRGB_NONLINEAR),
            fmt(vk::Format::B8G8R8A8_SRGB, vk::ColorSpaceKHR::EXTENDED_SRGB_LINEAR_EXT),
        ];
        assert_eq!(choose_surface_format(&formats), Some(formats[0]));
        assert_eq!(choose_surface_format(&[]), None);
    }

    #[test]
    fn present_mode_selection() {
        let all = [vk::PresentModeKHR::FIFO, vk::PresentModeKHR::MAILBOX];
        assert_eq!(choose_present_mode(&all, PresentPreference::Mailbox), vk::PresentModeKHR::MAILBOX);
        assert_eq!(choose_present_mode(&all, PresentPreference::Fifo), vk::PresentModeKHR::FIFO);
        assert_eq!(
            choose_present_mode(&[vk::PresentModeKHR::FIFO, vk::PresentModeKHR::IMMEDIATE], PresentPreference::Mailbox),
            vk::PresentModeKHR::FIFO
        );
    }

    #[test]
    fn extent_is_clamped() {
        let c = caps((100, 100), (1920, 1080), (2, 0));
        let big = clamp_extent(RenderSize { width: 4000, height: 50 }, &c);
        assert_eq!((big.width, big.height), (1920, 100));
        let inside = clamp_extent(RenderSize { width: 800, height: 600 }, &c);
        assert_eq!((inside.width, inside.height), (800, 600));
    }

    #[test]
    fn image_count_respects_max() {
        assert_eq!(choose_image_count(&caps((1, 1), (1, 1), (2, 0))), 3);
        assert_eq!(choose_image_count(&caps((1, 1), (1, 1), (2, 8))), 3);
        assert_eq!(choose_image_count(&caps((1, 1), (1, 1), (3, 3))), 3);
    }
}
