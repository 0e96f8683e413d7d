//! Shared helpers for the integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use frameforge::backend::DummyBackend;
use frameforge::config::BackendSettings;
use frameforge::frame::FrameOrchestrator;
use frameforge::graph::{ColorAttachment, PassType, RenderModule, RenderPass};
use frameforge::shader::NagaShaderCompiler;

/// Route library logs to the test output when `RUST_LOG` is set.
pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn orchestrator(backend: DummyBackend, settings: BackendSettings) -> FrameOrchestrator<DummyBackend> {
    init_logging();
    FrameOrchestrator::new(Arc::new(backend), settings, Arc::new(NagaShaderCompiler::new()))
        .expect("orchestrator")
}

/// Root pass that only clears the presentable image.
pub fn clear_pass<'a>(name: &str) -> RenderPass<'a> {
    RenderPass::new(name, PassType::Draw).with_setup(|builder| {
        let target = builder.swapchain_image();
        builder
            .add_color_attachment(target, ColorAttachment::new().with_clear_color(0.0, 0.0, 0.0, 1.0))
            .set_is_root(true);
        true
    })
}

pub fn clear_module<'a>() -> RenderModule<'a> {
    RenderModule::new().with_pass(clear_pass("clear"))
}

/// Small deterministic generator for randomized module shapes.
pub struct Lcg(u64);

impl Lcg {
    pub fn new(seed: u64) -> Self {
        Self(seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407))
    }

    pub fn next(&mut self) -> u64 {
        self.0 = self
            .0
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        self.0 >> 33
    }

    pub fn below(&mut self, bound: u64) -> u64 {
        self.next() % bound
    }
}
