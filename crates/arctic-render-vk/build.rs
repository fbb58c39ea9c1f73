// SPDX-License-Identifier: CEPL-1.0
use std::{env, error::Error, fs, path::PathBuf};

// Layout must match mesh::Vertex and mesh::UniformBufferObject.
const MESH_VERT: &str = r#"
#version 450
layout(location = 0) in vec2 inPos;
layout(location = 1) in vec3 inColor;

layout(set = 0, binding = 0) uniform UniformBufferObject {
    mat4 model;
    mat4 view;
    mat4 proj;
} ubo;

layout(location = 0) out vec3 fragColor;

void main() {
    gl_Position = ubo.proj * ubo.view * ubo.model * vec4(inPos, 0.0, 1.0);
    fragColor = inColor;
}
"#;

const MESH_FRAG: &str = r#"
#version 450
layout(location = 0) in vec3 fragColor;
layout(location = 0) out vec4 outColor;

void main() {
    outColor = vec4(fragColor, 1.0);
}
"#;

fn main() -> Result<(), Box<dyn Error>> {
    let out = PathBuf::from(env::var("OUT_DIR")?);

    let compiler = shaderc::Compiler::new().expect("shaderc compiler");
    let mut opts = shaderc::CompileOptions::new().expect("shaderc options");
    opts.set_target_env(shaderc::TargetEnv::Vulkan, shaderc::EnvVersion::Vulkan1_0 as u32);
    opts.set_optimization_level(shaderc::OptimizationLevel::Performance);

    for (src, kind, name) in [
        (MESH_VERT, shaderc::ShaderKind::Vertex, "mesh.vert"),
        (MESH_FRAG, shaderc::ShaderKind::Fragment, "mesh.frag"),
    ] {
        let spv = compiler.compile_into_spirv(src, kind, name, "main", Some(&opts))?;
        fs::write(out.join(format!("{name}.spv")), spv.as_binary_u8())?;
    }

    println!("cargo:rerun-if-changed=build.rs");
    Ok(())
}
