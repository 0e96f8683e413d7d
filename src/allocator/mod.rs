//! Per-frame upload arenas.
//!
//! Every frame slot owns its allocators exclusively. They are reset in one go
//! when the slot is reused, after its fence has signaled; there is no
//! individual deallocation.
//!
//! - [`LinearAllocator`] bump-allocates short-lived per-frame data such as
//!   vertex and uniform pushes.
//! - [`StagingAllocator`] hands out host-visible staging memory for uploads;
//!   each allocation names the staging buffer that backs it so a copy into the
//!   destination resource can be recorded.

mod linear;
mod staging;

pub use linear::LinearAllocator;
pub use staging::{StagingAllocation, StagingAllocator, StagingChunk};

/// Align a value up to the given alignment.
#[inline]
pub(crate) fn align_up(value: u64, alignment: u64) -> u64 {
    debug_assert!(alignment.is_power_of_two());
    (value + alignment - 1) & !(alignment - 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(0, 256, 0)]
    #[case(1, 256, 256)]
    #[case(256, 256, 256)]
    #[case(600, 256, 768)]
    #[case(17, 16, 32)]
    fn test_align_up(#[case] value: u64, #[case] alignment: u64, #[case] expected: u64) {
        assert_eq!(align_up(value, alignment), expected);
    }
}
