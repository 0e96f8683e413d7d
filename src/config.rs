//! Backend configuration.
//!
//! [`BackendSettings`] is filled once at startup and handed to the frame
//! orchestrator and the backend. Every field has a usable default:
//!
//! ```
//! use std::time::Duration;
//! use frameforge::config::{BackendSettings, PresentMode};
//!
//! let settings = BackendSettings::default()
//!     .with_frames_in_flight(3)
//!     .with_fence_timeout(Duration::from_millis(500))
//!     .with_present_mode(PresentMode::Mailbox);
//! assert!(settings.validate().is_ok());
//! ```

use std::path::PathBuf;
use std::time::Duration;

use crate::error::{GraphicsError, GraphicsResult};
use crate::types::Extent3d;

/// Upper bound for [`BackendSettings::frames_in_flight`].
pub const MAX_FRAMES_IN_FLIGHT: usize = 8;

/// Swapchain presentation mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PresentMode {
    /// Vsync, never tears. Always supported.
    #[default]
    Fifo,
    /// Low latency without tearing, falls back to FIFO if unsupported.
    Mailbox,
    /// No vsync, may tear.
    Immediate,
}

/// Swapchain configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwapchainSettings {
    pub present_mode: PresentMode,
    /// Preferred number of swapchain images. Clamped to surface limits.
    pub image_count_hint: u32,
    /// Initial extent. Used as is by headless backends.
    pub extent: Extent3d,
}

impl Default for SwapchainSettings {
    fn default() -> Self {
        Self {
            present_mode: PresentMode::Fifo,
            image_count_hint: 3,
            extent: Extent3d::new_2d(1280, 720),
        }
    }
}

/// Settings for the backend and frame orchestrator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendSettings {
    /// Number of frame slots that can be recorded or executing at once.
    pub frames_in_flight: usize,
    /// Number of linear allocators per frame slot.
    pub concurrency_count: usize,
    /// Capacity in bytes of each linear allocator.
    pub transient_capacity: u64,
    /// Alignment of linear allocations.
    pub transient_alignment: u64,
    /// Size of each staging chunk.
    pub staging_chunk_size: u64,
    /// Total staging memory a frame slot may map.
    pub staging_budget: u64,
    /// Longest time `acquire_frame_slot` waits for a slot's fence.
    pub fence_timeout: Duration,
    pub swapchain: SwapchainSettings,
    /// Where compiled pipelines are persisted between runs.
    pub pipeline_cache_path: Option<PathBuf>,
    pub requested_device_extensions: Vec<String>,
    pub enable_validation: bool,
}

impl Default for BackendSettings {
    fn default() -> Self {
        Self {
            frames_in_flight: 2,
            concurrency_count: 1,
            transient_capacity: 4 * 1024 * 1024,
            transient_alignment: 256,
            staging_chunk_size: 8 * 1024 * 1024,
            staging_budget: 64 * 1024 * 1024,
            fence_timeout: Duration::from_secs(2),
            swapchain: SwapchainSettings::default(),
            pipeline_cache_path: None,
            requested_device_extensions: Vec::new(),
            enable_validation: cfg!(debug_assertions),
        }
    }
}

impl BackendSettings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_frames_in_flight(mut self, frames_in_flight: usize) -> Self {
        self.frames_in_flight = frames_in_flight;
        self
    }

    pub fn with_concurrency_count(mut self, concurrency_count: usize) -> Self {
        self.concurrency_count = concurrency_count;
        self
    }

    pub fn with_transient_capacity(mut self, capacity: u64) -> Self {
        self.transient_capacity = capacity;
        self
    }

    pub fn with_transient_alignment(mut self, alignment: u64) -> Self {
        self.transient_alignment = alignment;
        self
    }

    pub fn with_staging(mut self, chunk_size: u64, budget: u64) -> Self {
        self.staging_chunk_size = chunk_size;
        self.staging_budget = budget;
        self
    }

    pub fn with_fence_timeout(mut self, timeout: Duration) -> Self {
        self.fence_timeout = timeout;
        self
    }

    pub fn with_present_mode(mut self, present_mode: PresentMode) -> Self {
        self.swapchain.present_mode = present_mode;
        self
    }

    pub fn with_extent(mut self, width: u32, height: u32) -> Self {
        self.swapchain.extent = Extent3d::new_2d(width, height);
        self
    }

    pub fn with_pipeline_cache_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.pipeline_cache_path = Some(path.into());
        self
    }

    pub fn with_device_extension(mut self, extension: impl Into<String>) -> Self {
        self.requested_device_extensions.push(extension.into());
        self
    }

    pub fn with_validation(mut self, enable: bool) -> Self {
        self.enable_validation = enable;
        self
    }

    /// Check that the settings describe a usable configuration.
    pub fn validate(&self) -> GraphicsResult<()> {
        if self.frames_in_flight == 0 || self.frames_in_flight > MAX_FRAMES_IN_FLIGHT {
            return Err(GraphicsError::InvalidParameter(format!(
                "frames_in_flight must be in 1..={MAX_FRAMES_IN_FLIGHT}, got {}",
                self.frames_in_flight
            )));
        }
        if self.concurrency_count == 0 {
            return Err(GraphicsError::InvalidParameter(
                "concurrency_count must be at least 1".into(),
            ));
        }
        if !self.transient_alignment.is_power_of_two() {
            return Err(GraphicsError::InvalidParameter(format!(
                "transient_alignment must be a power of two, got {}",
                self.transient_alignment
            )));
        }
        if self.staging_chunk_size == 0 || self.staging_chunk_size > self.staging_budget {
            return Err(GraphicsError::InvalidParameter(format!(
                "staging_chunk_size {} must be non-zero and at most the staging budget {}",
                self.staging_chunk_size, self.staging_budget
            )));
        }
        if self.fence_timeout.is_zero() {
            return Err(GraphicsError::InvalidParameter(
                "fence_timeout must be non-zero".into(),
            ));
        }
        Ok(())
    }
}
