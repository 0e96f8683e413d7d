//! Renders a triangle for a number of frames on the dummy backend and prints
//! what each frame did.
//!
//! ```text
//! cargo run --example triangle -- --frames 6 --frames-in-flight 3
//! RUST_LOG=frameforge=debug cargo run --example triangle -- --headless
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;

use frameforge::backend::DummyBackend;
use frameforge::graph::{ColorAttachment, PassType, RenderModule, RenderPass};
use frameforge::pipeline::{
    GraphicsPipelineHandle, GraphicsPipelineState, VertexBufferLayout, VertexFormat,
};
use frameforge::resource::{BufferInfo, ResourceHandle};
use frameforge::shader::{NagaShaderCompiler, ShaderStage};
use frameforge::types::BufferUsage;
use frameforge::{BackendSettings, FrameOrchestrator, GraphicsResult};

const TRIANGLE_WGSL: &str = r#"
struct Globals {
    tint: vec4<f32>,
}

@group(0) @binding(0) var<uniform> globals: Globals;

@vertex
fn vs_main(@location(0) position: vec2<f32>) -> @builtin(position) vec4<f32> {
    return vec4<f32>(position, 0.0, 1.0);
}

@fragment
fn fs_main() -> @location(0) vec4<f32> {
    return globals.tint;
}
"#;

const VERTICES: ResourceHandle = ResourceHandle::buffer("triangle_vertices");
const PICKING: ResourceHandle = ResourceHandle::buffer("picking_ids");

const TRIANGLE: [[f32; 2]; 3] = [[0.0, 0.5], [-0.5, -0.5], [0.5, -0.5]];

/// frameforge triangle demo.
#[derive(Parser, Debug)]
#[command(name = "triangle", about = "Render a triangle through the frame orchestrator")]
struct Args {
    /// Number of frames to render.
    #[arg(long, default_value = "4")]
    frames: u64,

    /// Frames the CPU may record ahead of the device.
    #[arg(long, default_value = "2")]
    frames_in_flight: usize,

    /// Simulated device time per frame in milliseconds.
    #[arg(long, default_value = "0")]
    fence_latency_ms: u64,

    /// Surface width in pixels.
    #[arg(long, default_value = "1280")]
    width: u32,

    /// Surface height in pixels.
    #[arg(long, default_value = "720")]
    height: u32,

    /// Render without a swapchain.
    #[arg(long)]
    headless: bool,

    /// Load and save the pipeline cache at this path.
    #[arg(long)]
    pipeline_cache: Option<PathBuf>,
}

fn triangle_module<'a>(pipeline: GraphicsPipelineHandle, frame_number: u64) -> RenderModule<'a> {
    let vertex_bytes = std::mem::size_of_val(&TRIANGLE) as u64;
    let pulse = (frame_number % 60) as f32 / 60.0;

    RenderModule::new()
        // Uploads the vertices once per frame; the draw pass reads them.
        .with_pass(
            RenderPass::new("upload", PassType::Transfer)
                .with_setup(move |builder| {
                    builder.write(
                        VERTICES,
                        BufferInfo::new(vertex_bytes)
                            .with_usage(BufferUsage::TRANSFER_DST)
                            .persistent(),
                    );
                    true
                })
                .with_execute(|encoder| {
                    encoder.write_to_buffer(VERTICES, 0, bytemuck::cast_slice(&TRIANGLE));
                }),
        )
        // Nothing reads its output, so it is pruned every frame.
        .with_pass(
            RenderPass::new("picking", PassType::Compute).with_setup(|builder| {
                builder.write(
                    PICKING,
                    BufferInfo::new(4096).with_usage(BufferUsage::STORAGE_BUFFER),
                );
                true
            }),
        )
        .with_pass(
            RenderPass::new("main", PassType::Draw)
                .with_setup(move |builder| {
                    let target = builder.swapchain_image();
                    builder
                        .read(
                            VERTICES,
                            BufferInfo::new(vertex_bytes).with_usage(BufferUsage::VERTEX_BUFFER),
                        )
                        .add_color_attachment(
                            target,
                            ColorAttachment::new().with_clear_color(0.1, 0.1, 0.12, 1.0),
                        )
                        .set_is_root(true);
                    true
                })
                .with_execute(move |encoder| {
                    encoder
                        .bind_graphics_pipeline(pipeline)
                        .bind_vertex_buffers(0, &[(VERTICES, 0)])
                        .set_argument_data("globals", &[1.0, pulse, 0.2, 1.0f32])
                        .draw(3, 1, 0, 0);
                }),
        )
}

fn run(args: &Args, shader_path: PathBuf) -> GraphicsResult<()> {
    let mut settings = BackendSettings::default()
        .with_frames_in_flight(args.frames_in_flight)
        .with_extent(args.width, args.height);
    if let Some(path) = &args.pipeline_cache {
        settings = settings.with_pipeline_cache_path(path);
    }

    let backend = if args.headless {
        DummyBackend::headless()
    } else {
        DummyBackend::from_settings(&settings)
    }
    .with_fence_latency(Duration::from_millis(args.fence_latency_ms));

    let mut orchestrator = FrameOrchestrator::new(
        Arc::new(backend),
        settings,
        Arc::new(NagaShaderCompiler::new()),
    )?;

    let manager = orchestrator.pipeline_manager().clone();
    let vs = manager.create_shader_module(&shader_path, ShaderStage::Vertex, "");
    let fs = manager.create_shader_module(&shader_path, ShaderStage::Fragment, "");
    let state = GraphicsPipelineState::new(vs, fs)
        .with_vertex_layout(VertexBufferLayout::packed(0, &[VertexFormat::Float32x2]));
    let pipeline = manager.introduce_graphics_pipeline_state(&state);

    for _ in 0..args.frames {
        let report = orchestrator.render(|frame| triangle_module(pipeline, frame.frame_number))?;
        println!(
            "frame {:>3} slot {}: executed [{}], pruned [{}], {} commands, presented: {}",
            report.frame_number,
            report.slot,
            report.executed.join(", "),
            report.pruned.join(", "),
            report.command_count,
            report.presented,
        );
        for (pass, err) in &report.pipeline_errors {
            println!("    pass '{pass}' skipped draws: {err}");
        }
    }

    orchestrator.wait_idle()?;
    let stats = manager.stats();
    println!(
        "pipelines: {} compiled, {} cache hits, {} failures",
        stats.compiles, stats.hits, stats.failures
    );
    Ok(())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let shader_dir = tempfile::tempdir()?;
    let shader_path = shader_dir.path().join("triangle.wgsl");
    std::fs::write(&shader_path, TRIANGLE_WGSL)?;

    run(&args, shader_path)?;
    Ok(())
}
