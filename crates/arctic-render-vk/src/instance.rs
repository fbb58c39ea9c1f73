// SPDX-License-Identifier: CEPL-1.0
//! Vulkan instance, validation messenger and presentation surface.

use std::ffi::{c_char, c_void, CStr};

use ash::ext::debug_utils;
use ash::khr::surface;
use ash::{vk, Entry};
use raw_window_handle::{HasDisplayHandle, HasWindowHandle, RawDisplayHandle};
use tracing::{debug, error, info, trace, warn};

use crate::error::{RenderError, RenderResult};

const APP_NAME: &CStr = c"Arctic Engine";
const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

unsafe extern "system" fn debug_callback(
    severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _types: vk::DebugUtilsMessageTypeFlagsEXT,
    data: *const vk::DebugUtilsMessengerCallbackDataEXT<'_>,
    _user: *mut c_void,
) -> vk::Bool32 {
    if data.is_null() {
        return vk::FALSE;
    }
    // SAFETY: the loader hands us a valid callback struct for the call duration.
    let msg = unsafe {
        let p = (*data).p_message;
        if p.is_null() {
            return vk::FALSE;
        }
        CStr::from_ptr(p).to_string_lossy()
    };
    if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::ERROR) {
        error!(target: "vulkan", "{msg}");
    } else if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::WARNING) {
        warn!(target: "vulkan", "{msg}");
    } else if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::INFO) {
        debug!(target: "vulkan", "{msg}");
    } else {
        trace!(target: "vulkan", "{msg}");
    }
    vk::FALSE
}

/// Owns the loader entry, the instance and (optionally) the debug messenger.
pub struct GpuInstance {
    entry: Entry,
    instance: ash::Instance,
    debug: Option<(debug_utils::Instance, vk::DebugUtilsMessengerEXT)>,
}

impl GpuInstance {
    /// Instance with the surface extensions the display needs. `None` builds
    /// a headless instance.
    pub fn new(display: Option<RawDisplayHandle>, validation: bool) -> RenderResult<Self> {
        // SAFETY: loading the system Vulkan library; no other loader state exists yet.
        let entry = unsafe { Entry::load()? };

        let mut extensions: Vec<*const c_char> = match display {
            Some(dh) => ash_window::enumerate_required_extensions(dh)
                .map_err(RenderError::vk("enumerate_required_extensions"))?
                .to_vec(),
            None => Vec::new(),
        };

        let validation = validation && layer_available(&entry, VALIDATION_LAYER);
        let layers: Vec<*const c_char> = if validation {
            extensions.push(debug_utils::NAME.as_ptr());
            vec![VALIDATION_LAYER.as_ptr()]
        } else {
            Vec::new()
        };

        let app_info = vk::ApplicationInfo {
            s_type: vk::StructureType::APPLICATION_INFO,
            p_application_name: APP_NAME.as_ptr(),
            application_version: 0,
            p_engine_name: APP_NAME.as_ptr(),
            engine_version: 0,
            api_version: vk::API_VERSION_1_0,
            ..Default::default()
        };

        let create_info = vk::InstanceCreateInfo {
            s_type: vk::StructureType::INSTANCE_CREATE_INFO,
            p_application_info: &app_info,
            enabled_extension_count: extensions.len() as u32,
            pp_enabled_extension_names: extensions.as_ptr(),
            enabled_layer_count: layers.len() as u32,
            pp_enabled_layer_names: layers.as_ptr(),
            ..Default::default()
        };

        // SAFETY: every pointer in create_info outlives this call.
        let instance = unsafe { entry.create_instance(&create_info, None) }
            .map_err(RenderError::vk("create_instance"))?;

        let mut this = Self { entry, instance, debug: None };
        if validation {
            this.debug = Some(this.create_messenger()?);
            info!("validation layers enabled");
        }
        Ok(this)
    }

    fn create_messenger(&self) -> RenderResult<(debug_utils::Instance, vk::DebugUtilsMessengerEXT)> {
        let loader = debug_utils::Instance::new(&self.entry, &self.instance);
        let ci = vk::DebugUtilsMessengerCreateInfoEXT {
            s_type: vk::StructureType::DEBUG_UTILS_MESSENGER_CREATE_INFO_EXT,
            message_severity: vk::DebugUtilsMessageSeverityFlagsEXT::VERBOSE
                | vk::DebugUtilsMessageSeverityFlagsEXT::INFO
                | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
            message_type: vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            pfn_user_callback: Some(debug_callback),
            ..Default::default()
        };
        // SAFETY: instance was created with the debug-utils extension enabled.
        let messenger = unsafe { loader.create_debug_utils_messenger(&ci, None) }
            .map_err(RenderError::vk("create_debug_utils_messenger"))?;
        Ok((loader, messenger))
    }

    pub fn entry(&self) -> &Entry {
        &self.entry
    }

    pub fn raw(&self) -> &ash::Instance {
        &self.instance
    }
}

impl Drop for GpuInstance {
    fn drop(&mut self) {
        // SAFETY: every child object (device, surface) is destroyed by its owner first.
        unsafe {
            if let Some((loader, messenger)) = self.debug.take() {
                loader.destroy_debug_utils_messenger(messenger, None);
            }
            self.instance.destroy_instance(None);
        }
        debug!("instance destroyed");
    }
}

fn layer_available(entry: &Entry, name: &CStr) -> bool {
    // SAFETY: plain enumeration on a loaded entry.
    let layers = unsafe { entry.enumerate_instance_layer_properties() }.unwrap_or_default();
    let found = layers.iter().any(|l| {
        // SAFETY: layer_name is a NUL-terminated fixed array filled by the loader.
        unsafe { CStr::from_ptr(l.layer_name.as_ptr()) == name }
    });
    if !found {
        warn!("validation requested but {:?} is not installed", name);
    }
    found
}

/// Presentation surface bound to one window.
pub struct Surface {
    loader: surface::Instance,
    handle: vk::SurfaceKHR,
}

impl Surface {
    /// Must be dropped before `instance`.
    pub fn new(
        instance: &GpuInstance,
        window: &(impl HasWindowHandle + HasDisplayHandle + ?Sized),
    ) -> RenderResult<Self> {
        let dh = window.display_handle()?.as_raw();
        let wh = window.window_handle()?.as_raw();
        let loader = surface::Instance::new(instance.entry(), instance.raw());
        // SAFETY: handles come from a live window that outlives the renderer.
        let handle =
            unsafe { ash_window::create_surface(instance.entry(), instance.raw(), dh, wh, None) }
                .map_err(RenderError::vk("create_surface"))?;
        Ok(Self { loader, handle })
    }

    pub fn loader(&self) -> &surface::Instance {
        &self.loader
    }

    pub fn handle(&self) -> vk::SurfaceKHR {
        self.handle
    }
}

impl Drop for Surface {
    fn drop(&mut self) {
        // SAFETY: the swapchain built on this surface is gone by now.
        unsafe { self.loader.destroy_surface(self.handle, None) };
        debug!("surface destroyed");
    }
}
