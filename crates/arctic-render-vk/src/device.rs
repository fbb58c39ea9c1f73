// SPDX-License-Identifier: CEPL-1.0
//! Device gateway: picks the GPU, opens the logical device and hands out queues.

use std::collections::BTreeSet;
use std::ffi::CStr;

use ash::khr::swapchain;
use ash::vk;
use tracing::{debug, info};

use crate::error::{RenderError, RenderResult};
use crate::instance::{GpuInstance, Surface};

/// What a physical device must offer to be picked.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DeviceRequirements {
    pub discrete_only: bool,
    pub geometry_shader: bool,
    /// Needs a present-capable family, the swapchain extension and a usable surface.
    pub present: bool,
}

impl Default for DeviceRequirements {
    fn default() -> Self {
        Self { discrete_only: true, geometry_shader: true, present: true }
    }
}

impl DeviceRequirements {
    /// Any GPU with a graphics queue; used for offscreen work and tests.
    pub fn headless() -> Self {
        Self { discrete_only: false, geometry_shader: false, present: false }
    }
}

/// Result of the per-role family search. Each role is the first family that
/// qualifies; the search never revisits an earlier choice.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct QueueFamilyIndices {
    pub graphics: Option<u32>,
    /// Only a family with TRANSFER and without GRAPHICS counts here.
    pub transfer: Option<u32>,
    pub present: Option<u32>,
}

impl QueueFamilyIndices {
    pub fn find(
        families: &[vk::QueueFamilyProperties],
        mut supports_present: impl FnMut(u32) -> bool,
    ) -> Self {
        let mut found = Self::default();
        for (i, family) in families.iter().enumerate() {
            let i = i as u32;
            let flags = family.queue_flags;
            if found.graphics.is_none() && flags.contains(vk::QueueFlags::GRAPHICS) {
                found.graphics = Some(i);
            }
            if found.transfer.is_none()
                && flags.contains(vk::QueueFlags::TRANSFER)
                && !flags.contains(vk::QueueFlags::GRAPHICS)
            {
                found.transfer = Some(i);
            }
            if found.present.is_none() && supports_present(i) {
                found.present = Some(i);
            }
        }
        found
    }

    /// Collapses into concrete indices. Without a dedicated transfer family
    /// the graphics family carries copies; without a present requirement the
    /// graphics family stands in for present.
    pub fn resolve(&self, need_present: bool) -> Option<QueueFamilies> {
        let graphics = self.graphics?;
        let present = match (self.present, need_present) {
            (Some(p), _) => p,
            (None, false) => graphics,
            (None, true) => return None,
        };
        Some(QueueFamilies {
            graphics,
            transfer: self.transfer.unwrap_or(graphics),
            present,
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QueueFamilies {
    pub graphics: u32,
    pub transfer: u32,
    pub present: u32,
}

impl QueueFamilies {
    /// Distinct family indices, ascending; one queue is opened per entry.
    pub fn unique(&self) -> Vec<u32> {
        [self.graphics, self.transfer, self.present]
            .into_iter()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    pub fn has_dedicated_transfer(&self) -> bool {
        self.transfer != self.graphics
    }
}

#[derive(Clone, Copy, Debug)]
pub struct Queues {
    pub graphics: vk::Queue,
    pub transfer: vk::Queue,
    pub present: vk::Queue,
}

/// Facts about one physical device that the selection predicate looks at.
#[derive(Clone, Copy, Debug)]
pub struct DeviceCandidate {
    pub device_type: vk::PhysicalDeviceType,
    pub geometry_shader: bool,
    pub families: QueueFamilyIndices,
    pub has_swapchain_ext: bool,
    /// At least one surface format and one present mode.
    pub surface_adequate: bool,
}

impl DeviceCandidate {
    pub fn is_suitable(&self, req: &DeviceRequirements) -> bool {
        if req.discrete_only && self.device_type != vk::PhysicalDeviceType::DISCRETE_GPU {
            return false;
        }
        if req.geometry_shader && !self.geometry_shader {
            return false;
        }
        if self.families.resolve(req.present).is_none() {
            return false;
        }
        !req.present || (self.has_swapchain_ext && self.surface_adequate)
    }
}

/// First suitable candidate in enumeration order; no scoring.
pub fn select_first<T>(
    candidates: impl IntoIterator<Item = (T, DeviceCandidate)>,
    req: &DeviceRequirements,
) -> Option<(T, DeviceCandidate)> {
    candidates.into_iter().find(|(_, c)| c.is_suitable(req))
}

/// Root owner of every GPU handle. Everything else holds an `Arc` to it, so
/// the device outlives all resources created from it.
pub struct DeviceContext {
    device: ash::Device,
    phys: vk::PhysicalDevice,
    families: QueueFamilies,
    queues: Queues,
    memory_properties: vk::PhysicalDeviceMemoryProperties,
    device_name: String,
    // Field order matters: surface drops before instance.
    surface: Option<Surface>,
    instance: GpuInstance,
}

impl DeviceContext {
    /// Windowed context: surface-capable instance, strict device requirements.
    pub fn open(
        window: &(impl raw_window_handle::HasWindowHandle + raw_window_handle::HasDisplayHandle + ?Sized),
        validation: bool,
    ) -> RenderResult<Self> {
        let dh = window.display_handle()?.as_raw();
        let instance = GpuInstance::new(Some(dh), validation)?;
        let surface = Surface::new(&instance, window)?;
        Self::open_with(instance, Some(surface), &DeviceRequirements::default())
    }

    /// Context without a surface.
    pub fn open_headless(req: &DeviceRequirements, validation: bool) -> RenderResult<Self> {
        let instance = GpuInstance::new(None, validation)?;
        let req = DeviceRequirements { present: false, ..*req };
        Self::open_with(instance, None, &req)
    }

    fn open_with(
        instance: GpuInstance,
        surface: Option<Surface>,
        req: &DeviceRequirements,
    ) -> RenderResult<Self> {
        let raw = instance.raw();
        // SAFETY: enumeration on a live instance.
        let physical = unsafe { raw.enumerate_physical_devices() }
            .map_err(RenderError::vk("enumerate_physical_devices"))?;

        let mut candidates = Vec::with_capacity(physical.len());
        for phys in physical {
            candidates.push((phys, describe(raw, phys, surface.as_ref())?));
        }
        let (phys, candidate) =
            select_first(candidates, req).ok_or(RenderError::NoSuitableDevice)?;
        let families = candidate
            .families
            .resolve(req.present)
            .ok_or(RenderError::NoSuitableDevice)?;

        // SAFETY: phys came from this instance.
        let props = unsafe { raw.get_physical_device_properties(phys) };
        let device_name = unsafe { CStr::from_ptr(props.device_name.as_ptr()) }
            .to_string_lossy()
            .into_owned();
        info!(
            "GPU '{}' ({:?}): graphics={} transfer={} present={}",
            device_name, props.device_type, families.graphics, families.transfer, families.present
        );

        let priorities = [1.0_f32];
        let queue_infos: Vec<vk::DeviceQueueCreateInfo> = families
            .unique()
            .into_iter()
            .map(|family| vk::DeviceQueueCreateInfo {
                s_type: vk::StructureType::DEVICE_QUEUE_CREATE_INFO,
                queue_family_index: family,
                queue_count: 1,
                p_queue_priorities: priorities.as_ptr(),
                ..Default::default()
            })
            .collect();

        let device_exts = if req.present { vec![swapchain::NAME.as_ptr()] } else { Vec::new() };
        let features = vk::PhysicalDeviceFeatures {
            geometry_shader: if req.geometry_shader { vk::TRUE } else { vk::FALSE },
            ..Default::default()
        };
        let dinfo = vk::DeviceCreateInfo {
            s_type: vk::StructureType::DEVICE_CREATE_INFO,
            queue_create_info_count: queue_infos.len() as u32,
            p_queue_create_infos: queue_infos.as_ptr(),
            enabled_extension_count: device_exts.len() as u32,
            pp_enabled_extension_names: device_exts.as_ptr(),
            p_enabled_features: &features,
            ..Default::default()
        };
        // SAFETY: all pointers in dinfo outlive the call.
        let device = unsafe { raw.create_device(phys, &dinfo, None) }
            .map_err(RenderError::vk("create_device"))?;

        // SAFETY: each family was requested with exactly one queue.
        let queues = unsafe {
            Queues {
                graphics: device.get_device_queue(families.graphics, 0),
                transfer: device.get_device_queue(families.transfer, 0),
                present: device.get_device_queue(families.present, 0),
            }
        };
        let memory_properties = unsafe { raw.get_physical_device_memory_properties(phys) };

        Ok(Self {
            device,
            phys,
            families,
            queues,
            memory_properties,
            device_name,
            surface,
            instance,
        })
    }

    pub fn device(&self) -> &ash::Device {
        &self.device
    }

    pub fn instance(&self) -> &ash::Instance {
        self.instance.raw()
    }

    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.phys
    }

    pub fn families(&self) -> QueueFamilies {
        self.families
    }

    pub fn queues(&self) -> Queues {
        self.queues
    }

    pub fn memory_properties(&self) -> &vk::PhysicalDeviceMemoryProperties {
        &self.memory_properties
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    pub fn surface(&self) -> Option<&Surface> {
        self.surface.as_ref()
    }

    /// Blocks until every queue on the device is idle.
    pub fn wait_idle(&self) -> RenderResult<()> {
        // SAFETY: host-side wait on a live device.
        unsafe { self.device.device_wait_idle() }.map_err(RenderError::vk("device_wait_idle"))
    }
}

impl Drop for DeviceContext {
    fn drop(&mut self) {
        // SAFETY: the Arc count reached zero, so no resource built on the device remains.
        unsafe {
            self.device.device_wait_idle().ok();
            self.device.destroy_device(None);
        }
        debug!("logical device destroyed");
    }
}

fn describe(
    instance: &ash::Instance,
    phys: vk::PhysicalDevice,
    surface: Option<&Surface>,
) -> RenderResult<DeviceCandidate> {
    // SAFETY: read-only queries on an enumerated physical device.
    unsafe {
        let props = instance.get_physical_device_properties(phys);
        let features = instance.get_physical_device_features(phys);
        let family_props = instance.get_physical_device_queue_family_properties(phys);

        let support = match surface {
            Some(s) => present_support(family_props.len(), |i| {
                s.loader().get_physical_device_surface_support(phys, i, s.handle())
            })?,
            None => Vec::new(),
        };
        let families = QueueFamilyIndices::find(&family_props, |i| {
            support.get(i as usize) == Some(&true)
        });

        let has_swapchain_ext = instance
            .enumerate_device_extension_properties(phys)
            .map_err(RenderError::vk("enumerate_device_extension_properties"))?
            .iter()
            .any(|e| CStr::from_ptr(e.extension_name.as_ptr()) == swapchain::NAME);

        let surface_adequate = match surface {
            Some(s) if has_swapchain_ext => {
                let formats = s
                    .loader()
                    .get_physical_device_surface_formats(phys, s.handle())
                    .map_err(RenderError::vk("get_physical_device_surface_formats"))?;
                let modes = s
                    .loader()
                    .get_physical_device_surface_present_modes(phys, s.handle())
                    .map_err(RenderError::vk("get_physical_device_surface_present_modes"))?;
                !formats.is_empty() && !modes.is_empty()
            }
            _ => false,
        };

        Ok(DeviceCandidate {
            device_type: props.device_type,
            geometry_shader: features.geometry_shader == vk::TRUE,
            families,
            has_swapchain_ext,
            surface_adequate,
        })
    }
}

/// Present support per family. A failed query aborts the scan; a lost
/// surface must not read as "no present queue".
fn present_support(
    family_count: usize,
    mut query: impl FnMut(u32) -> ash::prelude::VkResult<bool>,
) -> RenderResult<Vec<bool>> {
    (0..family_count as u32)
        .map(|i| query(i).map_err(RenderError::vk("get_physical_device_surface_support")))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn family(flags: vk::QueueFlags) -> vk::QueueFamilyProperties {
        vk::QueueFamilyProperties { queue_flags: flags, queue_count: 1, ..Default::default() }
    }

    fn discrete(families: QueueFamilyIndices) -> DeviceCandidate {
        DeviceCandidate {
            device_type: vk::PhysicalDeviceType::DISCRETE_GPU,
            geometry_shader: true,
            families,
            has_swapchain_ext: true,
            surface_adequate: true,
        }
    }

    const FULL: QueueFamilyIndices =
        QueueFamilyIndices { graphics: Some(0), transfer: Some(1), present: Some(0) };

    #[test]
    fn transfer_family_must_not_do_graphics() {
        let families = [
            family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER),
            family(vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER),
            family(vk::QueueFlags::TRANSFER),
        ];
        let found = QueueFamilyIndices::find(&families, |i| i == 0);
        assert_eq!(found.graphics, Some(0));
        assert_eq!(found.transfer, Some(1));
        assert_eq!(found.present, Some(0));
        assert_eq!(found, FULL);
    }

    #[test]
    fn first_match_wins_per_role() {
        let families = [
            family(vk::QueueFlags::TRANSFER),
            family(vk::QueueFlags::GRAPHICS),
            family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::TRANSFER),
        ];
        let found = QueueFamilyIndices::find(&families, |i| i >= 1);
        assert_eq!(found.graphics, Some(1));
        assert_eq!(found.transfer, Some(0));
        assert_eq!(found.present, Some(1));
    }

    #[test]
    fn transfer_falls_back_to_graphics() {
        let families = [family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::TRANSFER)];
        let found = QueueFamilyIndices::find(&families, |_| true);
        assert!(found.transfer.is_none());
        assert_eq!(found.present, Some(0));

        let resolved = found.resolve(true).unwrap();
        assert_eq!(resolved, QueueFamilies { graphics: 0, transfer: 0, present: 0 });
        assert!(!resolved.has_dedicated_transfer());
        assert_eq!(resolved.unique(), vec![0]);
    }

    #[test]
    fn missing_present_only_ok_when_not_needed() {
        let found = QueueFamilyIndices { graphics: Some(2), transfer: Some(1), present: None };
        assert!(found.resolve(true).is_none());
        assert_eq!(
            found.resolve(false),
            Some(QueueFamilies { graphics: 2, transfer: 1, present: 2 })
        );
    }

    #[test]
    fn unique_families_are_deduplicated() {
        let f = QueueFamilies { graphics: 3, transfer: 1, present: 3 };
        assert_eq!(f.unique(), vec![1, 3]);
    }

    #[test]
    fn integrated_gpu_is_rejected() {
        let mut c = discrete(FULL);
        c.device_type = vk::PhysicalDeviceType::INTEGRATED_GPU;
        assert!(!c.is_suitable(&DeviceRequirements::default()));
        assert!(c.is_suitable(&DeviceRequirements::headless()));
    }

    #[test]
    fn geometry_stage_and_swapchain_required() {
        let req = DeviceRequirements::default();
        assert!(discrete(FULL).is_suitable(&req));

        let mut no_geom = discrete(FULL);
        no_geom.geometry_shader = false;
        assert!(!no_geom.is_suitable(&req));

        let mut no_ext = discrete(FULL);
        no_ext.has_swapchain_ext = false;
        assert!(!no_ext.is_suitable(&req));

        let mut no_modes = discrete(FULL);
        no_modes.surface_adequate = false;
        assert!(!no_modes.is_suitable(&req));
    }

    #[test]
    fn selection_takes_first_suitable_without_scoring() {
        let mut integrated = discrete(FULL);
        integrated.device_type = vk::PhysicalDeviceType::INTEGRATED_GPU;
        let candidates = vec![
            ("igpu", integrated),
            ("first-dgpu", discrete(FULL)),
            ("second-dgpu", discrete(FULL)),
        ];
        let (picked, _) = select_first(candidates, &DeviceRequirements::default()).unwrap();
        assert_eq!(picked, "first-dgpu");
    }

    #[test]
    fn selection_fails_when_nothing_qualifies() {
        let mut c = discrete(FULL);
        c.families.graphics = None;
        assert!(select_first(vec![(0, c)], &DeviceRequirements::default()).is_none());
        assert!(select_first(Vec::<(u8, DeviceCandidate)>::new(), &DeviceRequirements::default())
            .is_none());
    }

    #[test]
    fn present_support_reports_each_family() {
        let support = present_support(3, |i| Ok(i != 1)).unwrap();
        assert_eq!(support, vec![true, false, true]);
        assert!(present_support(0, |_| unreachable!()).unwrap().is_empty());
    }

    #[test]
    fn present_support_query_failure_propagates() {
        let mut asked = Vec::new();
        let err = present_support(4, |i| {
            asked.push(i);
            if i == 1 { Err(vk::Result::ERROR_SURFACE_LOST_KHR) } else { Ok(true) }
        })
        .unwrap_err();
        assert!(matches!(err, RenderError::SurfaceLost { op: "get_physical_device_surface_support" }));
        assert!(err.is_fatal());
        assert_eq!(asked, vec![0, 1]);
    }
}
