//! Error types shared by every stage of the frame.
//!
//! Errors fall into a small taxonomy (see [`ErrorKind`]) that decides how far a
//! failure propagates: configuration and exhaustion errors drop the current
//! frame, shader errors only affect the pass that requested the pipeline, and
//! device loss is terminal.

use std::time::Duration;

use thiserror::Error;

use crate::resource::ResourceHandle;

/// Broad classification of a [`GraphicsError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The frame description is invalid (cycles, bad resource info, root issues).
    Configuration,
    /// A transient allocator, staging budget or device memory ran out.
    Exhaustion,
    /// Swapchain or device failure.
    Device,
    /// Shader or pipeline compilation failed.
    Shader,
    /// Filesystem or serialization failure.
    Io,
}

/// Errors produced by the render graph, allocators, pipeline manager and backends.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GraphicsError {
    #[error("cyclic dependency between passes: {}", .passes.join(" -> "))]
    CyclicDependency { passes: Vec<String> },

    #[error("incompatible resource info for {handle}: {reason}")]
    IncompatibleResourceInfo {
        handle: ResourceHandle,
        reason: String,
    },

    #[error("render module has no root pass")]
    MissingRootPass,

    #[error("render module has more than one root pass: {}", .0.join(", "))]
    MultipleRootPasses(Vec<String>),

    #[error("invalid resource info for {handle}: {reason}")]
    InvalidResourceInfo {
        handle: ResourceHandle,
        reason: String,
    },

    #[error(
        "transient allocator exhausted: requested {requested} bytes, {available} of {capacity} available"
    )]
    TransientAllocatorExhausted {
        requested: u64,
        available: u64,
        capacity: u64,
    },

    #[error("staging allocator exhausted: requested {requested} bytes, budget {budget} bytes")]
    StagingAllocatorExhausted { requested: u64, budget: u64 },

    #[error("out of device memory")]
    OutOfMemory,

    #[error("device lost")]
    DeviceLost,

    #[error("swapchain out of date")]
    SwapchainOutOfDate,

    #[error("timed out after {timeout:?} waiting for frame slot {slot}")]
    FrameTimeout { slot: usize, timeout: Duration },

    #[error("frame slot {slot} is {actual}, expected {expected}")]
    InvalidFrameState {
        slot: usize,
        expected: &'static str,
        actual: &'static str,
    },

    #[error("shader compilation failed for {path}: {message}")]
    ShaderCompilation { path: String, message: String },

    #[error("pipeline creation failed: {0}")]
    PipelineCreation(String),

    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("initialization failed: {0}")]
    InitializationFailed(String),

    #[error("io error: {0}")]
    Io(String),
}

impl GraphicsError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::CyclicDependency { .. }
            | Self::IncompatibleResourceInfo { .. }
            | Self::MissingRootPass
            | Self::MultipleRootPasses(_)
            | Self::InvalidResourceInfo { .. }
            | Self::InvalidFrameState { .. }
            | Self::InvalidParameter(_) => ErrorKind::Configuration,
            Self::TransientAllocatorExhausted { .. }
            | Self::StagingAllocatorExhausted { .. }
            | Self::OutOfMemory => ErrorKind::Exhaustion,
            Self::DeviceLost
            | Self::SwapchainOutOfDate
            | Self::FrameTimeout { .. }
            | Self::InitializationFailed(_) => ErrorKind::Device,
            Self::ShaderCompilation { .. } | Self::PipelineCreation(_) => ErrorKind::Shader,
            Self::Io(_) => ErrorKind::Io,
        }
    }

    /// Whether the application can keep rendering after this error.
    ///
    /// Only device loss is terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::DeviceLost)
    }

    /// Whether the error is resolved by resetting the swapchain and retrying.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::SwapchainOutOfDate)
    }
}

impl From<std::io::Error> for GraphicsError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

/// Result alias used across the crate.
pub type GraphicsResult<T> = Result<T, GraphicsError>;

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_error_display() {
        let err = GraphicsError::OutOfMemory;
        assert_eq!(err.to_string(), "out of device memory");

        let err = GraphicsError::CyclicDependency {
            passes: vec!["a".into(), "b".into(), "a".into()],
        };
        assert_eq!(err.to_string(), "cyclic dependency between passes: a -> b -> a");

        let err = GraphicsError::TransientAllocatorExhausted {
            requested: 600,
            available: 256,
            capacity: 1024,
        };
        assert_eq!(
            err.to_string(),
            "transient allocator exhausted: requested 600 bytes, 256 of 1024 available"
        );
    }

    #[rstest]
    #[case::cycle(GraphicsError::CyclicDependency { passes: vec![] }, ErrorKind::Configuration)]
    #[case::root(GraphicsError::MissingRootPass, ErrorKind::Configuration)]
    #[case::oom(GraphicsError::OutOfMemory, ErrorKind::Exhaustion)]
    #[case::staging(
        GraphicsError::StagingAllocatorExhausted { requested: 1, budget: 0 },
        ErrorKind::Exhaustion
    )]
    #[case::lost(GraphicsError::DeviceLost, ErrorKind::Device)]
    #[case::swapchain(GraphicsError::SwapchainOutOfDate, ErrorKind::Device)]
    #[case::shader(
        GraphicsError::ShaderCompilation { path: "a.vert".into(), message: "x".into() },
        ErrorKind::Shader
    )]
    #[case::io(GraphicsError::Io("denied".into()), ErrorKind::Io)]
    fn test_error_kind(#[case] err: GraphicsError, #[case] kind: ErrorKind) {
        assert_eq!(err.kind(), kind);
    }

    #[test]
    fn test_terminal_and_recoverable() {
        assert!(GraphicsError::DeviceLost.is_terminal());
        assert!(!GraphicsError::DeviceLost.is_recoverable());
        assert!(GraphicsError::SwapchainOutOfDate.is_recoverable());
        assert!(!GraphicsError::SwapchainOutOfDate.is_terminal());
        assert!(!GraphicsError::OutOfMemory.is_terminal());
    }

    #[test]
    fn test_from_io_error() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: GraphicsError = io.into();
        assert_eq!(err.kind(), ErrorKind::Io);
    }
}
