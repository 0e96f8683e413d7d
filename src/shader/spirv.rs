//! GLSL and WGSL to SPIR-V compilation with naga.

use std::path::Path;

use super::{ShaderBinary, ShaderBinding, ShaderBindingKind, ShaderCompiler, ShaderStage};
use crate::error::{GraphicsError, GraphicsResult};

/// Source language of a shader file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceLanguage {
    Glsl,
    Wgsl,
}

impl SourceLanguage {
    /// Pick the language from the file extension. Anything but `.wgsl` is GLSL.
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("wgsl") => Self::Wgsl,
            _ => Self::Glsl,
        }
    }
}

/// [`ShaderCompiler`] backed by naga.
///
/// GLSL goes through naga's preprocessor, so macro definitions and the stage
/// define (`VERTEX`, `FRAGMENT`, `COMPUTE`) are available to `#ifdef`. WGSL
/// has no preprocessor; defines passed for a WGSL file are ignored.
#[derive(Debug, Default, Clone, Copy)]
pub struct NagaShaderCompiler;

impl NagaShaderCompiler {
    pub fn new() -> Self {
        Self
    }

    /// Compile in-memory source. `label` is only used in error messages.
    pub fn compile_source(
        &self,
        label: &str,
        source: &str,
        language: SourceLanguage,
        stage: ShaderStage,
        defines: &[(String, String)],
    ) -> GraphicsResult<ShaderBinary> {
        let error = |message: String| GraphicsError::ShaderCompilation {
            path: label.to_string(),
            message,
        };

        let naga_stage = match stage {
            ShaderStage::Vertex => naga::ShaderStage::Vertex,
            ShaderStage::Fragment => naga::ShaderStage::Fragment,
            ShaderStage::Compute => naga::ShaderStage::Compute,
        };

        let module = match language {
            SourceLanguage::Glsl => {
                let mut options = naga::front::glsl::Options::from(naga_stage);
                options
                    .defines
                    .insert(stage.define().to_string(), String::new());
                for (name, value) in defines {
                    options.defines.insert(name.clone(), value.clone());
                }
                let mut frontend = naga::front::glsl::Frontend::default();
                frontend
                    .parse(&options, source)
                    .map_err(|errors| error(format!("GLSL parse error:\n{errors}")))?
            }
            SourceLanguage::Wgsl => {
                if !defines.is_empty() {
                    log::warn!("Ignoring {} macro definitions for WGSL shader {label}", defines.len());
                }
                naga::front::wgsl::parse_str(source)
                    .map_err(|e| error(format!("WGSL parse error: {}", e.emit_to_string(source))))?
            }
        };

        let mut validator = naga::valid::Validator::new(
            naga::valid::ValidationFlags::all(),
            naga::valid::Capabilities::all(),
        );
        let info = validator
            .validate(&module)
            .map_err(|e| error(format!("Validation error: {e}")))?;

        let entry_point = module
            .entry_points
            .iter()
            .find(|ep| ep.stage == naga_stage)
            .map(|ep| ep.name.clone())
            .ok_or_else(|| error(format!("no entry point for stage {stage:?}")))?;

        let options = naga::back::spv::Options {
            lang_version: (1, 3),
            ..Default::default()
        };
        let pipeline_options = naga::back::spv::PipelineOptions {
            shader_stage: naga_stage,
            entry_point: entry_point.clone(),
        };
        let spirv = naga::back::spv::write_vec(&module, &info, &options, Some(&pipeline_options))
            .map_err(|e| error(format!("SPIR-V generation error: {e}")))?;

        Ok(ShaderBinary {
            stage,
            entry_point,
            spirv,
            bindings: reflect_bindings(&module),
        })
    }
}

impl ShaderCompiler for NagaShaderCompiler {
    fn compile(
        &self,
        path: &Path,
        stage: ShaderStage,
        defines: &[(String, String)],
    ) -> GraphicsResult<ShaderBinary> {
        let label = path.display().to_string();
        let source = std::fs::read_to_string(path).map_err(|e| GraphicsError::ShaderCompilation {
            path: label.clone(),
            message: format!("failed to read source: {e}"),
        })?;
        log::debug!("Compiling {:?} shader {}", stage, label);
        self.compile_source(&label, &source, SourceLanguage::from_path(path), stage, defines)
    }
}

/// Collect the bound global variables of a module.
fn reflect_bindings(module: &naga::Module) -> Vec<ShaderBinding> {
    let mut bindings: Vec<ShaderBinding> = module
        .global_variables
        .iter()
        .filter_map(|(_, var)| {
            let binding = var.binding.as_ref()?;
            let ty = &module.types[var.ty];
            let kind = match var.space {
                naga::AddressSpace::Uniform => ShaderBindingKind::UniformBuffer,
                naga::AddressSpace::Storage { .. } => ShaderBindingKind::StorageBuffer,
                naga::AddressSpace::Handle => match ty.inner {
                    naga::TypeInner::Sampler { .. } => ShaderBindingKind::Sampler,
                    naga::TypeInner::Image {
                        class: naga::ImageClass::Storage { .. },
                        ..
                    } => ShaderBindingKind::StorageTexture,
                    _ => ShaderBindingKind::Texture,
                },
                _ => return None,
            };
            Some(ShaderBinding {
                set: binding.group,
                binding: binding.binding,
                kind,
                name: var.name.clone(),
                type_name: ty.name.clone(),
            })
        })
        .collect();
    bindings.sort_by_key(|b| (b.set, b.binding));
    bindings
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    const VERTEX_GLSL: &str = r#"
#version 450
layout(location = 0) in vec3 a_position;
layout(set = 0, binding = 0) uniform Globals {
    mat4 view_proj;
} globals;
void main() {
    gl_Position = globals.view_proj * vec4(a_position, 1.0);
}
"#;

    const FRAGMENT_GLSL: &str = r#"
#version 450
layout(location = 0) out vec4 o_color;
void main() {
#ifdef SHOW_RED
    o_color = vec4(1.0, 0.0, 0.0, 1.0);
#else
    o_color = vec4(0.0, 0.0, 0.0, 1.0);
#endif
}
"#;

    const COMPUTE_WGSL: &str = r#"
@group(0) @binding(0) var<storage, read_write> values: array<u32>;

@compute @workgroup_size(64)
fn main(@builtin(global_invocation_id) id: vec3<u32>) {
    values[id.x] = values[id.x] * 2u;
}
"#;

    #[test]
    fn test_glsl_vertex_with_reflection() {
        let binary = NagaShaderCompiler::new()
            .compile_source("vs", VERTEX_GLSL, SourceLanguage::Glsl, ShaderStage::Vertex, &[])
            .unwrap();
        assert_eq!(binary.stage, ShaderStage::Vertex);
        assert_eq!(binary.entry_point, "main");
        assert_eq!(binary.spirv[0], 0x0723_0203);
        assert_eq!(binary.bindings.len(), 1);
        assert_eq!(binary.bindings[0].set, 0);
        assert_eq!(binary.bindings[0].binding, 0);
        assert_eq!(binary.bindings[0].kind, ShaderBindingKind::UniformBuffer);
    }

    #[test]
    fn test_defines_change_output() {
        let compiler = NagaShaderCompiler::new();
        let plain = compiler
            .compile_source("fs", FRAGMENT_GLSL, SourceLanguage::Glsl, ShaderStage::Fragment, &[])
            .unwrap();
        let red = compiler
            .compile_source(
                "fs",
                FRAGMENT_GLSL,
                SourceLanguage::Glsl,
                ShaderStage::Fragment,
                &[("SHOW_RED".to_string(), String::new())],
            )
            .unwrap();
        assert_ne!(plain.content_hash(), red.content_hash());
    }

    #[test]
    fn test_wgsl_compute() {
        let binary = NagaShaderCompiler::new()
            .compile_source("cs", COMPUTE_WGSL, SourceLanguage::Wgsl, ShaderStage::Compute, &[])
            .unwrap();
        assert_eq!(binary.bindings.len(), 1);
        assert_eq!(binary.bindings[0].kind, ShaderBindingKind::StorageBuffer);
        assert_eq!(binary.bindings[0].name.as_deref(), Some("values"));
    }

    #[rstest]
    #[case::syntax("#version 450\nvoid main( {", ShaderStage::Vertex)]
    #[case::wrong_stage(COMPUTE_WGSL, ShaderStage::Vertex)]
    fn test_compile_errors(#[case] source: &str, #[case] stage: ShaderStage) {
        let language = if source.contains("@compute") {
            SourceLanguage::Wgsl
        } else {
            SourceLanguage::Glsl
        };
        let err = NagaShaderCompiler::new()
            .compile_source("broken", source, language, stage, &[])
            .unwrap_err();
        assert!(matches!(err, GraphicsError::ShaderCompilation { ref path, .. } if path == "broken"));
    }

    #[test]
    fn test_missing_file() {
        let err = NagaShaderCompiler::new()
            .compile(Path::new("does/not/exist.vert"), ShaderStage::Vertex, &[])
            .unwrap_err();
        assert!(matches!(err, GraphicsError::ShaderCompilation { .. }));
    }

    #[rstest]
    #[case("a.wgsl", SourceLanguage::Wgsl)]
    #[case("a.vert", SourceLanguage::Glsl)]
    #[case("a.comp", SourceLanguage::Glsl)]
    #[case("noext", SourceLanguage::Glsl)]
    fn test_language_from_path(#[case] path: &str, #[case] language: SourceLanguage) {
        assert_eq!(SourceLanguage::from_path(Path::new(path)), language);
    }
}
