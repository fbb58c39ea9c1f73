// SPDX-License-Identifier: CEPL-1.0
use anyhow::{Context, Result};
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Logical asset names the pipeline asks the asset provider for.
pub const VERTEX_SHADER_ASSET: &str = "shaders/mesh.vert.spv";
pub const FRAGMENT_SHADER_ASSET: &str = "shaders/mesh.frag.spv";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RenderSize {
    pub width: u32,
    pub height: u32,
}

impl RenderSize {
    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PresentPreference {
    /// Triple-buffered MAILBOX when offered, FIFO otherwise.
    #[default]
    #[serde(alias = "low_latency")]
    Mailbox,
    /// Always FIFO.
    Fifo,
}

#[derive(Clone, Copy, Debug, Deserialize)]
#[serde(default)]
pub struct RenderSettings {
    pub clear_color: [f32; 4],
    pub present_mode: PresentPreference,
    /// Enable `VK_LAYER_KHRONOS_validation` when the loader has it.
    pub validation: bool,
}

impl Default for RenderSettings {
    fn default() -> Self {
        Self {
            clear_color: [0.0, 0.0, 0.0, 1.0],
            present_mode: PresentPreference::Mailbox,
            validation: cfg!(debug_assertions),
        }
    }
}

/// Current size of the drawable area in physical pixels.
pub trait DrawableSize {
    fn drawable_size(&self) -> RenderSize;
}

/// Everything the renderer needs from the windowing layer: raw handles for
/// instance extensions and surface creation, plus the live drawable size.
/// Teardown is the provider's own drop.
pub trait SurfaceProvider: HasWindowHandle + HasDisplayHandle + DrawableSize {}

impl<T: HasWindowHandle + HasDisplayHandle + DrawableSize> SurfaceProvider for T {}

/// Read-only blobs addressed by logical path.
pub trait AssetProvider {
    fn read(&self, logical_path: &str) -> Result<Vec<u8>>;
}

/// Serves assets from a directory on disk.
#[derive(Clone, Debug)]
pub struct DirAssets {
    root: PathBuf,
}

impl DirAssets {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl AssetProvider for DirAssets {
    fn read(&self, logical_path: &str) -> Result<Vec<u8>> {
        let path = self.root.join(logical_path);
        std::fs::read(&path).with_context(|| format!("read asset {}", path.display()))
    }
}

pub trait Renderer {
    fn new(
        surface: Arc<dyn SurfaceProvider>,
        assets: &dyn AssetProvider,
        settings: RenderSettings,
    ) -> Result<Self>
    where
        Self: Sized;

    fn resize(&mut self, size: RenderSize) -> Result<()>;
    fn render(&mut self) -> Result<()>;
    fn set_clear_color(&mut self, rgba: [f32; 4]);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("arctic-assets-{tag}-{}", std::process::id()));
        std::fs::create_dir_all(dir.join("shaders")).unwrap();
        dir
    }

    #[test]
    fn dir_assets_reads_by_logical_path() {
        let dir = scratch_dir("read");
        std::fs::write(dir.join(VERTEX_SHADER_ASSET), [3u8, 2, 0x23, 7]).unwrap();

        let assets = DirAssets::new(&dir);
        assert_eq!(assets.read(VERTEX_SHADER_ASSET).unwrap(), vec![3, 2, 0x23, 7]);

        std::fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn dir_assets_missing_file_names_path() {
        let dir = scratch_dir("missing");
        let err = DirAssets::new(&dir).read("shaders/nope.spv").unwrap_err();
        assert!(format!("{err:#}").contains("nope.spv"));
        std::fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn empty_size() {
        assert!(RenderSize { width: 0, height: 10 }.is_empty());
        assert!(!RenderSize { width: 1, height: 1 }.is_empty());
    }

    #[test]
    fn default_settings_prefer_mailbox() {
        let s = RenderSettings::default();
        assert_eq!(s.present_mode, PresentPreference::Mailbox);
        assert_eq!(s.clear_color, [0.0, 0.0, 0.0, 1.0]);
    }
}
