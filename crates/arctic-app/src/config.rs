// SPDX-License-Identifier: CEPL-1.0
//! Command line and `arctic.toml`.

use std::fs;
use std::path::{Path, PathBuf};

use arctic_platform::WindowSpec;
use arctic_render::RenderSettings;
use clap::Parser;
use serde::Deserialize;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Config file; missing or unreadable falls back to defaults
    #[arg(long, default_value = "arctic.toml")]
    pub config: PathBuf,

    /// Serve shaders from this directory instead of the built-in set
    #[arg(long)]
    pub assets: Option<PathBuf>,

    /// Force validation layers on
    #[arg(long)]
    pub validation: bool,
}

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct WindowCfg {
    pub title: String,
    pub width: u32,
    pub height: u32,
}

impl Default for WindowCfg {
    fn default() -> Self {
        Self { title: "arctic".into(), width: 800, height: 600 }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct RenderCfg {
    #[serde(flatten)]
    pub settings: RenderSettings,
    pub assets_dir: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct AppCfg {
    pub window: WindowCfg,
    pub render: RenderCfg,
}

impl AppCfg {
    pub fn parse(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Reads `path`, falling back to defaults on any problem.
    pub fn load(path: &Path) -> Self {
        match fs::read_to_string(path) {
            Ok(text) => Self::parse(&text).unwrap_or_else(|e| {
                warn!("{}: {e}; using defaults", path.display());
                Self::default()
            }),
            Err(e) => {
                info!("{} not read ({e}); using defaults", path.display());
                Self::default()
            }
        }
    }

    /// Command-line flags win over the file.
    pub fn apply_args(&mut self, args: &Args) {
        if let Some(dir) = &args.assets {
            self.render.assets_dir = Some(dir.clone());
        }
        if args.validation {
            self.render.settings.validation = true;
        }
    }

    pub fn window_spec(&self) -> WindowSpec {
        WindowSpec {
            title: self.window.title.clone(),
            width: self.window.width,
            height: self.window.height,
        }
    }
}
