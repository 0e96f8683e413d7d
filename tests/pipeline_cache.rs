//! Shader compilation, pipeline caching, hot reload and cache persistence
//! with real WGSL sources.

mod common;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use frameforge::backend::{DeviceCommand, DummyBackend};
use frameforge::config::BackendSettings;
use frameforge::error::{ErrorKind, GraphicsError};
use frameforge::graph::{PassType, RenderModule, RenderPass};
use frameforge::pipeline::{
    ComputePipelineHandle, ComputePipelineState, GraphicsPipelineHandle, GraphicsPipelineState,
    PipelineManager, RenderPassCompat,
};
use frameforge::resource::{BufferInfo, ResourceHandle};
use frameforge::shader::{NagaShaderCompiler, ShaderStage};
use frameforge::types::{BufferUsage, TextureFormat};
use frameforge::FrameOrchestrator;
use rstest::rstest;
use tempfile::TempDir;

use common::{clear_pass, orchestrator};

const VERTEX_WGSL: &str = r#"
@vertex
fn vs_main(@builtin(vertex_index) index: u32) -> @builtin(position) vec4<f32> {
    let x = f32(i32(index) - 1);
    let y = f32(i32(index & 1u) * 2 - 1);
    return vec4<f32>(x, y, 0.0, 1.0);
}
"#;

const FRAGMENT_WGSL: &str = r#"
struct Globals {
    tint: vec4<f32>,
}

@group(0) @binding(0) var<uniform> globals: Globals;

@fragment
fn fs_main() -> @location(0) vec4<f32> {
    return globals.tint;
}
"#;

const DIMMED_FRAGMENT_WGSL: &str = r#"
struct Globals {
    tint: vec4<f32>,
}

@group(0) @binding(0) var<uniform> globals: Globals;

@fragment
fn fs_main() -> @location(0) vec4<f32> {
    return globals.tint * 0.5;
}
"#;

const BROKEN_FRAGMENT_WGSL: &str = r#"
@fragment
fn fs_main( -> @location(0) vec4<f32> {
    return vec4<f32>(1.0);
}
"#;

const DOUBLE_WGSL: &str = r#"
@group(0) @binding(0) var<storage, read_write> values: array<u32>;

@compute @workgroup_size(64)
fn main(@builtin(global_invocation_id) id: vec3<u32>) {
    values[id.x] = values[id.x] * 2u;
}
"#;

const TINT: [f32; 4] = [1.0, 0.5, 0.25, 1.0];

struct Shaders {
    dir: TempDir,
    vertex: PathBuf,
    fragment: PathBuf,
}

impl Shaders {
    fn new(fragment_source: &str) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let vertex = dir.path().join("triangle.vert.wgsl");
        let fragment = dir.path().join("triangle.frag.wgsl");
        std::fs::write(&vertex, VERTEX_WGSL).unwrap();
        std::fs::write(&fragment, fragment_source).unwrap();
        Self {
            dir,
            vertex,
            fragment,
        }
    }

    fn rewrite_fragment(&self, source: &str) {
        std::fs::write(&self.fragment, source).unwrap();
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }
}

fn introduce_triangle(manager: &PipelineManager, shaders: &Shaders) -> GraphicsPipelineHandle {
    let vs = manager.create_shader_module(&shaders.vertex, ShaderStage::Vertex, "");
    let fs = manager.create_shader_module(&shaders.fragment, ShaderStage::Fragment, "");
    manager.introduce_graphics_pipeline_state(&GraphicsPipelineState::new(vs, fs))
}

fn triangle_module<'a>(pipeline: GraphicsPipelineHandle) -> RenderModule<'a> {
    RenderModule::new().with_pass(clear_pass("triangle").with_execute(move |encoder| {
        encoder
            .bind_graphics_pipeline(pipeline)
            .set_argument_data("globals", &TINT)
            .draw(3, 1, 0, 0);
    }))
}

fn surface_compat() -> RenderPassCompat {
    RenderPassCompat::new(vec![TextureFormat::Bgra8UnormSrgb], None)
}

#[test]
fn test_draw_binds_pipeline_and_uniforms() {
    let shaders = Shaders::new(FRAGMENT_WGSL);
    let mut orchestrator = orchestrator(DummyBackend::new(), BackendSettings::default());
    let pipeline = introduce_triangle(orchestrator.pipeline_manager(), &shaders);

    let report = orchestrator.render(|_| triangle_module(pipeline)).unwrap();
    assert!(report.is_complete());
    assert!(report.presented);

    let submissions = orchestrator.backend().submissions();
    let commands = &submissions[0].commands;
    assert!(commands
        .iter()
        .any(|c| matches!(c, DeviceCommand::BindGraphicsPipeline(_))));
    let uniform = commands
        .iter()
        .find_map(|c| match c {
            DeviceCommand::BindUniformBuffer {
                set,
                binding,
                buffer,
                offset,
                size,
            } => Some((*set, *binding, *buffer, *offset, *size)),
            _ => None,
        })
        .expect("uniform binding");
    let (set, binding, buffer, offset, size) = uniform;
    assert_eq!((set, binding, size), (0, 0, 16));
    let contents = orchestrator.backend().buffer_contents(buffer).unwrap();
    let written = &contents[offset as usize..(offset + size) as usize];
    assert_eq!(written, bytemuck::bytes_of(&TINT));
    assert!(commands.iter().any(|c| matches!(c, DeviceCommand::Draw { vertex_count: 3, .. })));

    let stats = orchestrator.pipeline_manager().stats();
    assert_eq!(stats.compiles, 1);
    assert_eq!(stats.shader_modules, 2);
}

#[test]
fn test_broken_shader_skips_draws_and_recovers_after_fix() {
    let shaders = Shaders::new(BROKEN_FRAGMENT_WGSL);
    let mut orchestrator = orchestrator(DummyBackend::new(), BackendSettings::default());
    let pipeline = introduce_triangle(orchestrator.pipeline_manager(), &shaders);

    let report = orchestrator.render(|_| triangle_module(pipeline)).unwrap();
    assert!(!report.is_complete());
    assert!(report.presented);
    assert_eq!(report.skipped_draws, 1);
    assert_eq!(report.pipeline_errors.len(), 1);
    let (pass, err) = &report.pipeline_errors[0];
    assert_eq!(pass, "triangle");
    assert!(matches!(err, GraphicsError::ShaderCompilation { .. }));
    assert_eq!(err.kind(), ErrorKind::Shader);

    // Same source: the failure is reported again without recompiling or
    // counting it twice.
    let failures = orchestrator.pipeline_manager().stats().failures;
    assert_eq!(failures, 1);
    let report = orchestrator.render(|_| triangle_module(pipeline)).unwrap();
    assert_eq!(report.skipped_draws, 1);
    assert_eq!(orchestrator.pipeline_manager().stats().failures, failures);
    assert_eq!(orchestrator.pipeline_manager().stats().compiles, 0);

    shaders.rewrite_fragment(FRAGMENT_WGSL);
    let report = orchestrator.render(|_| triangle_module(pipeline)).unwrap();
    assert!(report.is_complete());
    assert_eq!(orchestrator.pipeline_manager().stats().compiles, 1);
}

#[test]
fn test_failed_pipeline_creation_is_not_cached() {
    let shaders = Shaders::new(FRAGMENT_WGSL);
    let mut orchestrator = orchestrator(DummyBackend::new(), BackendSettings::default());
    let pipeline = introduce_triangle(orchestrator.pipeline_manager(), &shaders);
    orchestrator.backend().fail_pipeline_creations(1);

    let report = orchestrator.render(|_| triangle_module(pipeline)).unwrap();
    assert!(matches!(
        report.pipeline_errors.as_slice(),
        [(_, GraphicsError::PipelineCreation(_))]
    ));

    let report = orchestrator.render(|_| triangle_module(pipeline)).unwrap();
    assert!(report.is_complete());
    assert_eq!(orchestrator.backend().pipelines_created(), 1);
}

#[test]
fn test_hot_reload_invalidates_dependent_pipelines() {
    let shaders = Shaders::new(FRAGMENT_WGSL);
    let mut orchestrator = orchestrator(DummyBackend::new(), BackendSettings::default());
    let pipeline = introduce_triangle(orchestrator.pipeline_manager(), &shaders);

    orchestrator.render(|_| triangle_module(pipeline)).unwrap();
    assert_eq!(orchestrator.update_shader_modules().unwrap(), 0);

    shaders.rewrite_fragment(DIMMED_FRAGMENT_WGSL);
    assert_eq!(orchestrator.update_shader_modules().unwrap(), 1);
    let stats = orchestrator.pipeline_manager().stats();
    assert_eq!(stats.invalidations, 1);
    assert_eq!(stats.pipelines, 0);
    assert_eq!(orchestrator.backend().live_pipelines(), 0);

    let report = orchestrator.render(|_| triangle_module(pipeline)).unwrap();
    assert!(report.is_complete());
    assert_eq!(orchestrator.pipeline_manager().stats().compiles, 2);
}

#[rstest]
#[case(1)]
#[case(4)]
#[case(32)]
fn test_identical_requests_compile_once(#[case] requests: u64) {
    let shaders = Shaders::new(FRAGMENT_WGSL);
    let backend = DummyBackend::new();
    let manager = PipelineManager::new(Arc::new(NagaShaderCompiler::new()));
    let vs = manager.create_shader_module(&shaders.vertex, ShaderStage::Vertex, "");
    let fs = manager.create_shader_module(&shaders.fragment, ShaderStage::Fragment, "");
    let state = GraphicsPipelineState::new(vs, fs);

    let first = manager
        .produce_pipeline(&backend, &state, &surface_compat())
        .unwrap();
    for _ in 1..requests {
        let again = manager
            .produce_pipeline(&backend, &state, &surface_compat())
            .unwrap();
        assert_eq!(again.pipeline, first.pipeline);
    }

    let stats = manager.stats();
    assert_eq!(stats.compiles, 1);
    assert_eq!(stats.misses, 1);
    assert_eq!(stats.hits, requests - 1);
    assert_eq!(backend.pipelines_created(), 1);
    manager.destroy_all(&backend);
}

#[test]
fn test_attachment_formats_are_part_of_the_key() {
    let shaders = Shaders::new(FRAGMENT_WGSL);
    let backend = DummyBackend::new();
    let manager = PipelineManager::new(Arc::new(NagaShaderCompiler::new()));
    let handle = introduce_triangle(&manager, &shaders);

    let srgb = manager
        .produce_graphics_pipeline(&backend, handle, &surface_compat())
        .unwrap();
    let hdr = manager
        .produce_graphics_pipeline(
            &backend,
            handle,
            &RenderPassCompat::new(vec![TextureFormat::Rgba16Float], None),
        )
        .unwrap();
    assert_ne!(srgb.pipeline, hdr.pipeline);
    assert_eq!(manager.stats().compiles, 2);
    manager.destroy_all(&backend);
    assert_eq!(backend.live_pipelines(), 0);
}

#[test]
fn test_concurrent_requests_compile_once() {
    let shaders = Shaders::new(FRAGMENT_WGSL);
    let backend = DummyBackend::new();
    let manager = PipelineManager::new(Arc::new(NagaShaderCompiler::new()));
    let handle = introduce_triangle(&manager, &shaders);

    std::thread::scope(|scope| {
        for _ in 0..8 {
            scope.spawn(|| {
                for _ in 0..16 {
                    manager
                        .produce_graphics_pipeline(&backend, handle, &surface_compat())
                        .unwrap();
                }
            });
        }
    });

    let stats = manager.stats();
    assert_eq!(stats.compiles, 1);
    assert_eq!(stats.hits + stats.misses, 8 * 16);
    assert_eq!(backend.pipelines_created(), 1);
    manager.destroy_all(&backend);
}

fn render_once(settings: BackendSettings, shaders: &Shaders) -> Arc<DummyBackend> {
    let backend = Arc::new(DummyBackend::new());
    let mut orchestrator = FrameOrchestrator::new(
        backend.clone(),
        settings,
        Arc::new(NagaShaderCompiler::new()),
    )
    .unwrap();
    let pipeline = introduce_triangle(orchestrator.pipeline_manager(), shaders);
    assert!(orchestrator
        .render(|_| triangle_module(pipeline))
        .unwrap()
        .is_complete());
    backend
}

#[test]
fn test_pipeline_cache_survives_restart() {
    let shaders = Shaders::new(FRAGMENT_WGSL);
    let cache = shaders.path("pipelines.bin");
    let settings = BackendSettings::default().with_pipeline_cache_path(&cache);

    let first = render_once(settings.clone(), &shaders);
    assert_eq!(first.pipelines_created_from_cache(), 0);
    assert!(cache.exists());

    let second = render_once(settings, &shaders);
    assert_eq!(second.pipelines_created(), 1);
    assert_eq!(second.pipelines_created_from_cache(), 1);
}

#[test]
fn test_stale_cache_entries_are_not_used() {
    let shaders = Shaders::new(FRAGMENT_WGSL);
    let cache = shaders.path("pipelines.bin");
    let settings = BackendSettings::default().with_pipeline_cache_path(&cache);

    render_once(settings.clone(), &shaders);
    shaders.rewrite_fragment(DIMMED_FRAGMENT_WGSL);
    let second = render_once(settings, &shaders);
    assert_eq!(second.pipelines_created_from_cache(), 0);
}

#[test]
fn test_corrupt_cache_file_is_ignored() {
    let shaders = Shaders::new(FRAGMENT_WGSL);
    let cache = shaders.path("pipelines.bin");
    std::fs::write(&cache, b"definitely not a pipeline cache").unwrap();

    let backend = render_once(
        BackendSettings::default().with_pipeline_cache_path(&cache),
        &shaders,
    );
    assert_eq!(backend.pipelines_created_from_cache(), 0);
}

fn write_compute(dir: &Path) -> PathBuf {
    let path = dir.join("double.wgsl");
    std::fs::write(&path, DOUBLE_WGSL).unwrap();
    path
}

#[test]
fn test_compute_pass_dispatches() {
    const VALUES: ResourceHandle = ResourceHandle::buffer("values");
    let shaders = Shaders::new(FRAGMENT_WGSL);
    let mut orchestrator = orchestrator(DummyBackend::new(), BackendSettings::default());
    let manager = orchestrator.pipeline_manager().clone();
    let shader = manager.create_shader_module(
        write_compute(shaders.dir.path()),
        ShaderStage::Compute,
        "",
    );
    let double: ComputePipelineHandle =
        manager.introduce_compute_pipeline_state(&ComputePipelineState::new(shader));
    let storage = BufferInfo::new(256).with_usage(BufferUsage::STORAGE_BUFFER);

    let report = orchestrator
        .render(|_| {
            RenderModule::new()
                .with_pass(
                    RenderPass::new("double", PassType::Compute)
                        .with_setup(move |builder| {
                            builder.read_write(VALUES, storage);
                            true
                        })
                        .with_execute(move |encoder| {
                            encoder.bind_compute_pipeline(double).dispatch(1, 1, 1);
                        }),
                )
                .with_pass(clear_pass("present").with_setup(move |builder| {
                    let target = builder.swapchain_image();
                    builder
                        .read(VALUES, storage)
                        .add_color_attachment(target, Default::default())
                        .set_is_root(true);
                    true
                }))
        })
        .unwrap();

    assert!(report.is_complete());
    assert_eq!(report.executed, ["double", "present"]);
    let submissions = orchestrator.backend().submissions();
    let commands = &submissions[0].commands;
    let bind = commands
        .iter()
        .position(|c| matches!(c, DeviceCommand::BindComputePipeline(_)))
        .expect("compute bind");
    let dispatch = commands
        .iter()
        .position(|c| matches!(c, DeviceCommand::Dispatch { x: 1, y: 1, z: 1 }))
        .expect("dispatch");
    assert!(bind < dispatch);
}
