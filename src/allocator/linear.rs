//! Bump allocator for per-frame buffer data.

use super::align_up;
use crate::error::{GraphicsError, GraphicsResult};
use crate::resource::ResourceHandle;

/// Fixed-capacity bump allocator backed by one buffer per frame slot.
///
/// Allocations are written into host memory and uploaded to the backing
/// buffer (identified by [`handle`](Self::handle)) when the frame is
/// dispatched. Running out of space is an error, never a silent truncation,
/// so the capacity should be sized generously.
///
/// # Example
///
/// ```
/// use frameforge::allocator::LinearAllocator;
/// use frameforge::resource::ResourceHandle;
///
/// let mut allocator =
///     LinearAllocator::new(ResourceHandle::buffer("frame0/transient"), 1024, 256).unwrap();
/// let (memory, offset) = allocator.allocate(600).unwrap();
/// memory.fill(0xab);
/// assert_eq!(offset, 0);
/// assert!(allocator.allocate(600).is_err());
/// ```
pub struct LinearAllocator {
    handle: ResourceHandle,
    memory: Vec<u8>,
    write_offset: u64,
    alignment: u64,
    high_water_mark: u64,
    allocation_count: u64,
}

impl LinearAllocator {
    /// Create an allocator of `capacity` bytes.
    ///
    /// `alignment` applies to every allocation and must be a power of two.
    pub fn new(handle: ResourceHandle, capacity: u64, alignment: u64) -> GraphicsResult<Self> {
        if !alignment.is_power_of_two() {
            return Err(GraphicsError::InvalidParameter(format!(
                "alignment must be a power of 2, got {alignment}"
            )));
        }
        if capacity == 0 {
            return Err(GraphicsError::InvalidParameter(
                "linear allocator capacity cannot be zero".to_string(),
            ));
        }
        let capacity = usize::try_from(capacity).map_err(|_| {
            GraphicsError::InvalidParameter(format!("capacity {capacity} exceeds address space"))
        })?;

        Ok(Self {
            handle,
            memory: vec![0; capacity],
            write_offset: 0,
            alignment,
            high_water_mark: 0,
            allocation_count: 0,
        })
    }

    /// Handle of the buffer backing this allocator.
    pub fn handle(&self) -> ResourceHandle {
        self.handle
    }

    pub fn capacity(&self) -> u64 {
        self.memory.len() as u64
    }

    pub fn alignment(&self) -> u64 {
        self.alignment
    }

    /// Bytes used since the last reset.
    pub fn used(&self) -> u64 {
        self.write_offset
    }

    pub fn remaining(&self) -> u64 {
        self.capacity() - self.write_offset
    }

    /// Largest `used()` seen across all frames.
    pub fn high_water_mark(&self) -> u64 {
        self.high_water_mark
    }

    /// Allocations made since the last reset.
    pub fn allocation_count(&self) -> u64 {
        self.allocation_count
    }

    /// Allocate `size` bytes with the default alignment.
    ///
    /// Returns the writable memory and its byte offset in the backing buffer.
    pub fn allocate(&mut self, size: u64) -> GraphicsResult<(&mut [u8], u64)> {
        self.allocate_aligned(size, self.alignment)
    }

    /// Allocate `size` bytes at an offset that is a multiple of `alignment`.
    pub fn allocate_aligned(
        &mut self,
        size: u64,
        alignment: u64,
    ) -> GraphicsResult<(&mut [u8], u64)> {
        if !alignment.is_power_of_two() {
            return Err(GraphicsError::InvalidParameter(format!(
                "alignment must be a power of 2, got {alignment}"
            )));
        }

        let offset = align_up(self.write_offset, alignment.max(self.alignment));
        let end = offset.checked_add(size).filter(|end| *end <= self.capacity());
        let Some(end) = end else {
            log::warn!(
                "Linear allocator {} exhausted: requested {} bytes, {} of {} used",
                self.handle,
                size,
                self.write_offset,
                self.capacity()
            );
            return Err(GraphicsError::TransientAllocatorExhausted {
                requested: size,
                available: self.capacity().saturating_sub(offset),
                capacity: self.capacity(),
            });
        };

        self.write_offset = end;
        self.high_water_mark = self.high_water_mark.max(end);
        self.allocation_count += 1;

        Ok((&mut self.memory[offset as usize..end as usize], offset))
    }

    /// Allocate and copy `data`, returning its offset.
    pub fn write(&mut self, data: &[u8]) -> GraphicsResult<u64> {
        let (memory, offset) = self.allocate(data.len() as u64)?;
        memory.copy_from_slice(data);
        Ok(offset)
    }

    /// Allocate and copy a slice of plain-old-data values.
    pub fn write_slice<T: bytemuck::Pod>(&mut self, data: &[T]) -> GraphicsResult<u64> {
        self.write(bytemuck::cast_slice(data))
    }

    /// Bytes written since the last reset, in buffer order.
    pub fn contents(&self) -> &[u8] {
        &self.memory[..self.write_offset as usize]
    }

    /// Invalidate every allocation.
    ///
    /// Only call once the GPU has finished with the frame that used them.
    pub fn reset(&mut self) {
        self.write_offset = 0;
        self.allocation_count = 0;
    }
}

impl std::fmt::Debug for LinearAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinearAllocator")
            .field("handle", &self.handle)
            .field("capacity", &self.capacity())
            .field("write_offset", &self.write_offset)
            .field("alignment", &self.alignment)
            .field("high_water_mark", &self.high_water_mark)
            .finish()
    }
}
