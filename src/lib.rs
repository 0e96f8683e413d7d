//! frameforge - a render graph compiler and frame orchestrator.
//!
//! Applications describe each frame as a [`RenderModule`] of render passes.
//! Every pass declares the resources it reads and writes during setup and
//! records commands during execute. The crate then:
//!
//! - orders passes by their data dependencies and prunes the ones that do
//!   not contribute to the root pass ([`compiler`])
//! - inserts the barriers each hazard needs and aliases transient resources
//!   whose lifetimes do not overlap
//! - keeps several frames in flight, each with its own allocators and fence
//!   ([`frame`])
//! - caches pipelines by content hash, persists them to disk and reloads
//!   shaders when their sources change ([`pipeline`])
//!
//! # Backends
//!
//! - **dummy** (default): host-memory device with simulated fences, used for
//!   tests, benches and headless runs
//! - **Vulkan** (`vulkan-backend` feature): native Vulkan through ash
//!
//! # Logging
//!
//! The crate logs through the `log` facade and never installs a logger.

pub mod allocator;
pub mod backend;
pub mod compiler;
pub mod config;
pub mod encoder;
pub mod error;
pub mod frame;
pub mod graph;
pub mod pipeline;
pub mod resource;
pub mod shader;
pub mod types;

pub use allocator::{LinearAllocator, StagingAllocator};
pub use backend::GpuBackend;
#[cfg(feature = "dummy")]
pub use backend::DummyBackend;
pub use compiler::{compile_module, CompiledFrame, ExecutionPlan};
pub use config::BackendSettings;
pub use encoder::CommandEncoder;
pub use error::{GraphicsError, GraphicsResult};
pub use frame::{FrameOrchestrator, FrameReport, FrameState};
pub use graph::{FrameInfo, PassBuilder, PassType, RenderModule, RenderPass};
pub use pipeline::PipelineManager;
pub use resource::{ResourceHandle, ResourceInfo, ResourceType};
pub use shader::{NagaShaderCompiler, ShaderCompiler};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
