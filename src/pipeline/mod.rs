//! Shader modules and the pipeline cache.
//!
//! The [`PipelineManager`] owns every shader module and compiled pipeline.
//! Pipelines are keyed by the content hash of their state (shader modules and
//! fixed-function state) combined with the attachment formats of the pass
//! they are used in, so the same state used in two differently formatted
//! passes yields two pipelines.
//!
//! # Hot path
//!
//! [`PipelineManager::produce_graphics_pipeline`] is called for every pipeline
//! bind of every frame. A hit costs one read lock and one hash lookup. Misses
//! are serialized by a separate mutex and re-check the table after taking it,
//! so two threads missing on the same key compile once.
//!
//! # Failures
//!
//! A shader that fails to compile poisons only the pipelines that use it.
//! Failed compilations are never cached: the next request after the source
//! changed compiles again.
//!
//! # Persistence
//!
//! [`save_cache`](PipelineManager::save_cache) writes the backend's cache blob
//! for every live pipeline; [`load_cache`](PipelineManager::load_cache) makes
//! those blobs available as initial cache data the next time the same
//! pipeline is compiled.

mod cache_file;
mod state;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

pub use cache_file::{CacheFileEntry, PipelineCacheFile, CACHE_FILE_VERSION};
pub use state::{
    BlendComponent, BlendFactor, BlendOperation, BlendState, CompareFunction,
    ComputePipelineHandle, ComputePipelineState, CullMode, DepthState, FrontFace,
    GraphicsPipelineHandle, GraphicsPipelineState, PolygonMode, PrimitiveTopology,
    RasterizationState, RenderPassCompat, VertexAttribute, VertexBufferLayout, VertexFormat,
    VertexStepMode,
};

use crate::backend::{ComputePipelineDesc, DevicePipeline, GpuBackend, GraphicsPipelineDesc};
use crate::error::{GraphicsError, GraphicsResult};
use crate::resource::{fnv_hash, FnvBuildHasher};
use crate::shader::{
    parse_macro_definitions, ShaderBinary, ShaderBinding, ShaderBindingKind, ShaderCompiler,
    ShaderModuleHandle, ShaderStage,
};

/// Maximum number of descriptor sets a pipeline layout may use.
pub const MAX_DESCRIPTOR_SETS: u32 = 8;

// ============================================================================
// Layout
// ============================================================================

/// Resource layout of a compiled pipeline, merged over all of its stages.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PipelineLayoutInfo {
    /// Hash of all bindings; pipelines with equal keys share a layout.
    pub layout_key: u64,
    /// Hash of each descriptor set's bindings, indexed by set number.
    pub set_layout_keys: Vec<u64>,
    /// Bindings sorted by set and binding number.
    pub bindings: Vec<ShaderBinding>,
}

impl PipelineLayoutInfo {
    /// Merge the reflected bindings of every stage.
    pub fn from_stages<'a>(
        stages: impl IntoIterator<Item = &'a ShaderBinary>,
    ) -> GraphicsResult<Self> {
        let mut bindings: Vec<ShaderBinding> = Vec::new();
        for binding in stages.into_iter().flat_map(|stage| stage.bindings.iter()) {
            if binding.set >= MAX_DESCRIPTOR_SETS {
                return Err(GraphicsError::PipelineCreation(format!(
                    "binding {} uses descriptor set {}, limit is {MAX_DESCRIPTOR_SETS}",
                    binding.binding, binding.set
                )));
            }
            match bindings
                .iter()
                .find(|b| b.set == binding.set && b.binding == binding.binding)
            {
                Some(existing) if existing.kind != binding.kind => {
                    return Err(GraphicsError::PipelineCreation(format!(
                        "set {} binding {} is {:?} in one stage and {:?} in another",
                        binding.set, binding.binding, existing.kind, binding.kind
                    )));
                }
                Some(_) => {}
                None => bindings.push(binding.clone()),
            }
        }
        bindings.sort_by_key(|b| (b.set, b.binding));

        let set_count = bindings.last().map_or(0, |b| b.set + 1);
        let set_layout_keys = (0..set_count)
            .map(|set| {
                let set_bindings: Vec<_> = bindings
                    .iter()
                    .filter(|b| b.set == set)
                    .map(|b| (b.binding, b.kind))
                    .collect();
                fnv_hash(&set_bindings)
            })
            .collect();

        Ok(Self {
            layout_key: fnv_hash(&bindings),
            set_layout_keys,
            bindings,
        })
    }

    /// Set and binding of the uniform buffer an encoder argument refers to.
    pub fn argument_binding(&self, argument: u64) -> Option<(u32, u32)> {
        self.bindings
            .iter()
            .find(|b| b.kind == ShaderBindingKind::UniformBuffer && b.matches_argument(argument))
            .map(|b| (b.set, b.binding))
    }
}

// ============================================================================
// Cache entries
// ============================================================================

/// A compiled pipeline and its layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedPipeline {
    pub pipeline: DevicePipeline,
    pub layout: Arc<PipelineLayoutInfo>,
}

/// Pipeline cache counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PipelineCacheStats {
    pub hits: u64,
    pub misses: u64,
    /// Successful pipeline compilations.
    pub compiles: u64,
    /// Failed shader module compilations and pipeline creations. A pipeline
    /// request that fails on a module's earlier error is not counted again.
    pub failures: u64,
    /// Pipelines dropped because a shader they use was reloaded.
    pub invalidations: u64,
    /// Live pipelines.
    pub pipelines: usize,
    pub shader_modules: usize,
}

#[derive(Debug, Default)]
struct CacheCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    compiles: AtomicU64,
    failures: AtomicU64,
    invalidations: AtomicU64,
}

impl CacheCounters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Debug)]
struct ShaderModuleEntry {
    path: PathBuf,
    stage: ShaderStage,
    macros: String,
    binary: Option<Arc<ShaderBinary>>,
    error: Option<GraphicsError>,
    /// Source fingerprint the binary or error was produced from.
    fingerprint: Option<u64>,
}

#[derive(Debug)]
struct PipelineEntry {
    cached: CachedPipeline,
    shaders: Vec<ShaderModuleHandle>,
    persist_key: u64,
}

type Table<K, V> = HashMap<K, V, FnvBuildHasher>;

/// What to compile on a cache miss.
enum PipelineRequest<'a> {
    Graphics {
        state: &'a GraphicsPipelineState,
        compat: &'a RenderPassCompat,
    },
    Compute(&'a ComputePipelineState),
}

// ============================================================================
// Manager
// ============================================================================

/// Owner of shader modules and the pipeline cache.
///
/// Shared between threads; every method takes `&self`.
pub struct PipelineManager {
    compiler: Arc<dyn ShaderCompiler>,
    modules: RwLock<Table<ShaderModuleHandle, ShaderModuleEntry>>,
    graphics_states: RwLock<Table<GraphicsPipelineHandle, GraphicsPipelineState>>,
    compute_states: RwLock<Table<ComputePipelineHandle, ComputePipelineState>>,
    pipelines: RwLock<Table<u64, PipelineEntry>>,
    /// Backend cache blobs loaded from disk, keyed by persist key.
    blobs: RwLock<Table<u64, Vec<u8>>>,
    compile_lock: Mutex<()>,
    counters: CacheCounters,
}

impl std::fmt::Debug for PipelineManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineManager")
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl PipelineManager {
    pub fn new(compiler: Arc<dyn ShaderCompiler>) -> Self {
        Self {
            compiler,
            modules: RwLock::new(Table::default()),
            graphics_states: RwLock::new(Table::default()),
            compute_states: RwLock::new(Table::default()),
            pipelines: RwLock::new(Table::default()),
            blobs: RwLock::new(Table::default()),
            compile_lock: Mutex::new(()),
            counters: CacheCounters::default(),
        }
    }

    // ------------------------------------------------------------------
    // Shader modules
    // ------------------------------------------------------------------

    /// Compile the shader at `path` for `stage` with `macros` (`"A=1,B"`).
    ///
    /// Modules are cached by path, stage and macro string. A compile error is
    /// logged and kept with the module; it surfaces when a pipeline using the
    /// module is produced.
    pub fn create_shader_module(
        &self,
        path: impl AsRef<Path>,
        stage: ShaderStage,
        macros: &str,
    ) -> ShaderModuleHandle {
        let path = path.as_ref();
        let handle = ShaderModuleHandle::new(path, stage, macros);
        if self.modules.read().contains_key(&handle) {
            return handle;
        }

        let mut entry = ShaderModuleEntry {
            path: path.to_path_buf(),
            stage,
            macros: macros.to_string(),
            binary: None,
            error: None,
            fingerprint: None,
        };
        self.compile_module(&mut entry);
        self.modules.write().entry(handle).or_insert(entry);
        handle
    }

    /// Compile error of a module, if its last compilation failed.
    pub fn shader_module_error(&self, handle: ShaderModuleHandle) -> Option<GraphicsError> {
        self.modules.read().get(&handle).and_then(|m| m.error.clone())
    }

    /// Compiled code of a module, if its last compilation succeeded.
    pub fn shader_binary(&self, handle: ShaderModuleHandle) -> Option<Arc<ShaderBinary>> {
        self.modules.read().get(&handle).and_then(|m| m.binary.clone())
    }

    fn compile_module(&self, entry: &mut ShaderModuleEntry) {
        entry.fingerprint = self.compiler.source_fingerprint(&entry.path);
        let defines = parse_macro_definitions(&entry.macros);
        match self.compiler.compile(&entry.path, entry.stage, &defines) {
            Ok(binary) => {
                log::debug!(
                    "Compiled {:?} shader {} ({} words)",
                    entry.stage,
                    entry.path.display(),
                    binary.spirv.len()
                );
                entry.binary = Some(Arc::new(binary));
                entry.error = None;
            }
            Err(err) => {
                log::error!("Shader {} failed to compile: {err}", entry.path.display());
                CacheCounters::bump(&self.counters.failures);
                entry.binary = None;
                entry.error = Some(err);
            }
        }
    }

    /// Binary of `handle`, recompiling a failed module whose source changed.
    fn module_binary(&self, handle: ShaderModuleHandle) -> GraphicsResult<Arc<ShaderBinary>> {
        let mut modules = self.modules.write();
        let entry = modules.get_mut(&handle).ok_or_else(|| {
            GraphicsError::InvalidParameter(format!("unknown shader module {:016x}", handle.id()))
        })?;
        if let Some(binary) = &entry.binary {
            return Ok(binary.clone());
        }
        let fingerprint = self.compiler.source_fingerprint(&entry.path);
        if fingerprint.is_none() || fingerprint != entry.fingerprint {
            self.compile_module(entry);
        }
        match (&entry.binary, &entry.error) {
            (Some(binary), _) => Ok(binary.clone()),
            (None, Some(err)) => Err(err.clone()),
            (None, None) => Err(GraphicsError::ShaderCompilation {
                path: entry.path.display().to_string(),
                message: "module has no compiled code".into(),
            }),
        }
    }

    // ------------------------------------------------------------------
    // Pipeline states
    // ------------------------------------------------------------------

    /// Register a graphics state and return the handle used to bind it.
    pub fn introduce_graphics_pipeline_state(
        &self,
        state: &GraphicsPipelineState,
    ) -> GraphicsPipelineHandle {
        let handle = state.handle();
        if !self.graphics_states.read().contains_key(&handle) {
            self.graphics_states
                .write()
                .entry(handle)
                .or_insert_with(|| state.clone());
        }
        handle
    }

    /// Register a compute state and return the handle used to bind it.
    pub fn introduce_compute_pipeline_state(
        &self,
        state: &ComputePipelineState,
    ) -> ComputePipelineHandle {
        let handle = state.handle();
        if !self.compute_states.read().contains_key(&handle) {
            self.compute_states.write().entry(handle).or_insert(*state);
        }
        handle
    }

    // ------------------------------------------------------------------
    // Pipelines
    // ------------------------------------------------------------------

    /// Pipeline for `state` rendering into attachments described by `compat`.
    pub fn produce_pipeline<B: GpuBackend + ?Sized>(
        &self,
        backend: &B,
        state: &GraphicsPipelineState,
        compat: &RenderPassCompat,
    ) -> GraphicsResult<CachedPipeline> {
        let handle = self.introduce_graphics_pipeline_state(state);
        self.produce_graphics_pipeline(backend, handle, compat)
    }

    /// Pipeline for a previously introduced graphics state.
    pub fn produce_graphics_pipeline<B: GpuBackend + ?Sized>(
        &self,
        backend: &B,
        handle: GraphicsPipelineHandle,
        compat: &RenderPassCompat,
    ) -> GraphicsResult<CachedPipeline> {
        let key = fnv_hash(&(b'G', handle.id(), compat.hash_key()));
        if let Some(hit) = self.lookup(key) {
            return Ok(hit);
        }

        let state = self
            .graphics_states
            .read()
            .get(&handle)
            .cloned()
            .ok_or_else(|| {
                GraphicsError::InvalidParameter(format!(
                    "graphics pipeline {:016x} was never introduced",
                    handle.id()
                ))
            })?;
        let label = format!("graphics:{:016x}", handle.id());
        self.compile_on_miss(
            backend,
            key,
            &label,
            PipelineRequest::Graphics {
                state: &state,
                compat,
            },
        )
    }

    /// Pipeline for a previously introduced compute state.
    pub fn produce_compute_pipeline<B: GpuBackend + ?Sized>(
        &self,
        backend: &B,
        handle: ComputePipelineHandle,
    ) -> GraphicsResult<CachedPipeline> {
        let key = fnv_hash(&(b'C', handle.id()));
        if let Some(hit) = self.lookup(key) {
            return Ok(hit);
        }

        let state = self.compute_states.read().get(&handle).copied().ok_or_else(|| {
            GraphicsError::InvalidParameter(format!(
                "compute pipeline {:016x} was never introduced",
                handle.id()
            ))
        })?;
        let label = format!("compute:{:016x}", handle.id());
        self.compile_on_miss(backend, key, &label, PipelineRequest::Compute(&state))
    }

    fn lookup(&self, key: u64) -> Option<CachedPipeline> {
        let hit = self.pipelines.read().get(&key).map(|e| e.cached.clone());
        if hit.is_some() {
            CacheCounters::bump(&self.counters.hits);
        }
        hit
    }

    fn compile_on_miss<B: GpuBackend + ?Sized>(
        &self,
        backend: &B,
        key: u64,
        label: &str,
        request: PipelineRequest<'_>,
    ) -> GraphicsResult<CachedPipeline> {
        let _guard = self.compile_lock.lock();
        if let Some(hit) = self.lookup(key) {
            return Ok(hit);
        }
        CacheCounters::bump(&self.counters.misses);
        log::debug!("Pipeline cache miss for {label}");

        match self.compile_pipeline(backend, key, label, &request) {
            Ok(entry) => {
                CacheCounters::bump(&self.counters.compiles);
                let cached = entry.cached.clone();
                self.pipelines.write().insert(key, entry);
                Ok(cached)
            }
            Err(err) => {
                log::error!("Failed to produce pipeline {label}: {err}");
                Err(err)
            }
        }
    }

    fn count_failure<T>(&self, result: GraphicsResult<T>) -> GraphicsResult<T> {
        if result.is_err() {
            CacheCounters::bump(&self.counters.failures);
        }
        result
    }

    fn compile_pipeline<B: GpuBackend + ?Sized>(
        &self,
        backend: &B,
        key: u64,
        label: &str,
        request: &PipelineRequest<'_>,
    ) -> GraphicsResult<PipelineEntry> {
        match *request {
            PipelineRequest::Graphics { state, compat } => {
                let vertex = self.module_binary(state.vertex_shader)?;
                let fragment = state
                    .fragment_shader
                    .map(|handle| self.module_binary(handle))
                    .transpose()?;
                let layout = self.count_failure(PipelineLayoutInfo::from_stages(
                    std::iter::once(&*vertex).chain(fragment.as_deref()),
                ))?;

                let persist_key = fnv_hash(&(
                    key,
                    vertex.content_hash(),
                    fragment.as_ref().map(|f| f.content_hash()),
                ));
                let blobs = self.blobs.read();
                let pipeline =
                    self.count_failure(backend.create_graphics_pipeline(&GraphicsPipelineDesc {
                        label,
                        state,
                        compat,
                        vertex: &vertex,
                        fragment: fragment.as_deref(),
                        layout: &layout,
                        cache_data: blobs.get(&persist_key).map(Vec::as_slice),
                    }))?;

                Ok(PipelineEntry {
                    cached: CachedPipeline {
                        pipeline,
                        layout: Arc::new(layout),
                    },
                    shaders: state.shaders().collect(),
                    persist_key,
                })
            }
            PipelineRequest::Compute(state) => {
                let shader = self.module_binary(state.shader)?;
                let layout = self.count_failure(PipelineLayoutInfo::from_stages([&*shader]))?;
                let persist_key = fnv_hash(&(key, shader.content_hash()));
                let blobs = self.blobs.read();
                let pipeline =
                    self.count_failure(backend.create_compute_pipeline(&ComputePipelineDesc {
                        label,
                        shader: &shader,
                        layout: &layout,
                        cache_data: blobs.get(&persist_key).map(Vec::as_slice),
                    }))?;

                Ok(PipelineEntry {
                    cached: CachedPipeline {
                        pipeline,
                        layout: Arc::new(layout),
                    },
                    shaders: vec![state.shader],
                    persist_key,
                })
            }
        }
    }

    pub fn stats(&self) -> PipelineCacheStats {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        PipelineCacheStats {
            hits: load(&self.counters.hits),
            misses: load(&self.counters.misses),
            compiles: load(&self.counters.compiles),
            failures: load(&self.counters.failures),
            invalidations: load(&self.counters.invalidations),
            pipelines: self.pipelines.read().len(),
            shader_modules: self.modules.read().len(),
        }
    }

    // ------------------------------------------------------------------
    // Hot reload
    // ------------------------------------------------------------------

    /// Recompile shader modules whose source changed and drop the pipelines
    /// that use them. Returns the number of recompiled modules.
    ///
    /// Waits for the device to go idle before destroying any pipeline.
    pub fn update_shader_modules<B: GpuBackend + ?Sized>(&self, backend: &B) -> GraphicsResult<usize> {
        let _guard = self.compile_lock.lock();

        let changed: Vec<ShaderModuleHandle> = self
            .modules
            .read()
            .iter()
            .filter(|(_, entry)| {
                let current = self.compiler.source_fingerprint(&entry.path);
                current.is_some() && current != entry.fingerprint
            })
            .map(|(handle, _)| *handle)
            .collect();
        if changed.is_empty() {
            return Ok(0);
        }

        backend.wait_idle()?;

        {
            let mut modules = self.modules.write();
            for handle in &changed {
                if let Some(entry) = modules.get_mut(handle) {
                    log::info!("Reloading shader {}", entry.path.display());
                    self.compile_module(entry);
                }
            }
        }

        let stale: Vec<PipelineEntry> = {
            let mut pipelines = self.pipelines.write();
            let keys: Vec<u64> = pipelines
                .iter()
                .filter(|(_, entry)| entry.shaders.iter().any(|s| changed.contains(s)))
                .map(|(key, _)| *key)
                .collect();
            keys.iter().filter_map(|key| pipelines.remove(key)).collect()
        };
        for entry in &stale {
            backend.destroy_pipeline(entry.cached.pipeline);
        }
        self.counters
            .invalidations
            .fetch_add(stale.len() as u64, Ordering::Relaxed);
        log::info!(
            "Reloaded {} shader modules, invalidated {} pipelines",
            changed.len(),
            stale.len()
        );
        Ok(changed.len())
    }

    // ------------------------------------------------------------------
    // Persistence
    // ------------------------------------------------------------------

    /// Write cache blobs of all live pipelines, plus loaded blobs not used
    /// this run, to `path`. Returns the number of entries written.
    pub fn save_cache<B: GpuBackend + ?Sized>(&self, backend: &B, path: &Path) -> GraphicsResult<usize> {
        let mut table: Table<u64, Vec<u8>> = self.blobs.read().clone();
        for entry in self.pipelines.read().values() {
            if let Some(blob) = backend.pipeline_cache_data(entry.cached.pipeline) {
                table.insert(entry.persist_key, blob);
            }
        }

        let mut entries: Vec<CacheFileEntry> = table
            .into_iter()
            .map(|(key, blob)| CacheFileEntry { key, blob })
            .collect();
        entries.sort_by_key(|e| e.key);
        let count = entries.len();
        PipelineCacheFile::new(entries).write(path)?;
        log::info!("Saved {count} pipeline cache entries to {}", path.display());
        Ok(count)
    }

    /// Load blobs written by [`save_cache`](Self::save_cache). A missing or
    /// unusable file loads nothing. Returns the number of entries loaded.
    pub fn load_cache(&self, path: &Path) -> GraphicsResult<usize> {
        let Some(file) = PipelineCacheFile::read(path)? else {
            return Ok(0);
        };
        let count = file.entries.len();
        let mut blobs = self.blobs.write();
        for entry in file.entries {
            blobs.insert(entry.key, entry.blob);
        }
        log::info!("Loaded {count} pipeline cache entries from {}", path.display());
        Ok(count)
    }

    /// Destroy every pipeline. The device must be idle.
    pub fn destroy_all<B: GpuBackend + ?Sized>(&self, backend: &B) {
        let entries: Vec<PipelineEntry> = self.pipelines.write().drain().map(|(_, e)| e).collect();
        for entry in entries {
            backend.destroy_pipeline(entry.cached.pipeline);
        }
    }
}
