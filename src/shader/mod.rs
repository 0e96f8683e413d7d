//! Shader modules and the shader compiler seam.
//!
//! The core never parses shader source itself. It hands a path, a stage and a
//! macro string to a [`ShaderCompiler`] and gets SPIR-V plus binding
//! reflection back. [`NagaShaderCompiler`] is the default implementation.

mod spirv;

use std::path::Path;

use crate::error::GraphicsResult;
use crate::resource::{argument_name, fnv1a_64, fnv_hash};

pub use spirv::{NagaShaderCompiler, SourceLanguage};

/// Shader stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ShaderStage {
    Vertex,
    Fragment,
    Compute,
}

impl ShaderStage {
    /// Preprocessor define set automatically for this stage.
    pub fn define(self) -> &'static str {
        match self {
            Self::Vertex => "VERTEX",
            Self::Fragment => "FRAGMENT",
            Self::Compute => "COMPUTE",
        }
    }
}

/// Identity of a shader module: hash of path, stage and macro definitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ShaderModuleHandle(u64);

impl ShaderModuleHandle {
    pub fn new(path: &Path, stage: ShaderStage, macros: &str) -> Self {
        let path = path.to_string_lossy();
        Self(fnv_hash(&(&*path, stage, macros)))
    }

    pub fn id(&self) -> u64 {
        self.0
    }
}

/// Kind of a reflected shader binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShaderBindingKind {
    UniformBuffer,
    StorageBuffer,
    Texture,
    StorageTexture,
    Sampler,
}

/// A resource binding used by a shader.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ShaderBinding {
    pub set: u32,
    pub binding: u32,
    pub kind: ShaderBindingKind,
    /// Variable name, if the source gave one.
    pub name: Option<String>,
    /// Name of the block or struct type, if any.
    pub type_name: Option<String>,
}

impl ShaderBinding {
    /// Whether `argument` (see [`argument_name`]) refers to this binding.
    pub fn matches_argument(&self, argument: u64) -> bool {
        [&self.name, &self.type_name]
            .into_iter()
            .flatten()
            .any(|name| argument_name(name) == argument)
    }
}

/// Output of a successful shader compilation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShaderBinary {
    pub stage: ShaderStage,
    pub entry_point: String,
    pub spirv: Vec<u32>,
    pub bindings: Vec<ShaderBinding>,
}

impl ShaderBinary {
    /// Hash of the SPIR-V words.
    pub fn content_hash(&self) -> u64 {
        fnv1a_64(bytemuck::cast_slice(&self.spirv))
    }
}

/// Compiles shader source files to SPIR-V.
pub trait ShaderCompiler: Send + Sync {
    /// Compile the file at `path` for `stage` with the given `(name, value)` defines.
    fn compile(
        &self,
        path: &Path,
        stage: ShaderStage,
        defines: &[(String, String)],
    ) -> GraphicsResult<ShaderBinary>;

    /// Fingerprint of the current source, used to detect edits for hot reload.
    ///
    /// `None` when the source cannot be read.
    fn source_fingerprint(&self, path: &Path) -> Option<u64> {
        std::fs::read(path).ok().map(|bytes| fnv1a_64(&bytes))
    }
}

/// Parse a macro string such as `"USE_SHADOWS,MAX_LIGHTS=8"`.
///
/// Definitions are separated by commas or whitespace. A name without a value
/// is defined as empty.
pub fn parse_macro_definitions(macros: &str) -> Vec<(String, String)> {
    macros
        .split(|c: char| c == ',' || c.is_whitespace())
        .filter(|item| !item.is_empty())
        .map(|item| match item.split_once('=') {
            Some((name, value)) => (name.trim().to_string(), value.trim().to_string()),
            None => (item.to_string(), String::new()),
        })
        .collect()
}
