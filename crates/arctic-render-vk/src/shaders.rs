// SPDX-License-Identifier: CEPL-1.0
//! SPIR-V compiled by the build script, served under the logical asset names.

use anyhow::{anyhow, Result};
use arctic_render::{AssetProvider, FRAGMENT_SHADER_ASSET, VERTEX_SHADER_ASSET};

const MESH_VERT: &[u8] = include_bytes!(concat!(env!("OUT_DIR"), "/mesh.vert.spv"));
const MESH_FRAG: &[u8] = include_bytes!(concat!(env!("OUT_DIR"), "/mesh.frag.spv"));

#[derive(Clone, Copy, Debug, Default)]
pub struct BuiltinShaders;

impl AssetProvider for BuiltinShaders {
    fn read(&self, logical_path: &str) -> Result<Vec<u8>> {
        match logical_path {
            VERTEX_SHADER_ASSET => Ok(MESH_VERT.to_vec()),
            FRAGMENT_SHADER_ASSET => Ok(MESH_FRAG.to_vec()),
            other => Err(anyhow!("no built-in asset '{other}'")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::ShaderCode;

    const SPIRV_MAGIC: u32 = 0x0723_0203;

    #[test]
    fn builtin_stages_are_spirv() {
        let code = ShaderCode::load(&BuiltinShaders).unwrap();
        assert_eq!(code.vertex[0], SPIRV_MAGIC);
        assert_eq!(code.fragment[0], SPIRV_MAGIC);
    }

    #[test]
    fn unknown_name_is_an_error() {
        assert!(BuiltinShaders.read("shaders/other.spv").is_err());
    }
}
