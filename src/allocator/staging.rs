//! Chunked staging memory for host-to-device uploads.

use super::align_up;
use crate::error::{GraphicsError, GraphicsResult};
use crate::resource::{ResourceHandle, ResourceType};

/// Offset alignment of staging allocations, enough for buffer-to-image copies.
const STAGING_ALIGNMENT: u64 = 16;

/// A region of staging memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StagingAllocation {
    /// Staging buffer holding the data.
    pub handle: ResourceHandle,
    /// Byte offset inside that buffer.
    pub offset: u64,
    pub size: u64,
}

/// One host-visible staging buffer.
#[derive(Debug)]
pub struct StagingChunk {
    handle: ResourceHandle,
    data: Vec<u8>,
    used: u64,
}

impl StagingChunk {
    pub fn handle(&self) -> ResourceHandle {
        self.handle
    }

    pub fn capacity(&self) -> u64 {
        self.data.len() as u64
    }

    pub fn used(&self) -> u64 {
        self.used
    }

    /// Bytes mapped since the last reset.
    pub fn contents(&self) -> &[u8] {
        &self.data[..self.used as usize]
    }

    fn fits(&self, size: u64) -> bool {
        align_up(self.used, STAGING_ALIGNMENT)
            .checked_add(size)
            .is_some_and(|end| end <= self.capacity())
    }
}

/// Staging allocator owned by one frame slot.
///
/// Memory comes from chunks of `chunk_size` bytes; a request larger than a
/// chunk gets a dedicated chunk. The sum of all chunk capacities never
/// exceeds `budget`. Chunks are kept across resets and reused by later frames
/// of the same slot.
#[derive(Debug)]
pub struct StagingAllocator {
    name: String,
    chunks: Vec<StagingChunk>,
    chunk_size: u64,
    budget: u64,
}

impl StagingAllocator {
    /// Create an allocator whose chunk handles are derived from `name`.
    pub fn new(name: impl Into<String>, chunk_size: u64, budget: u64) -> GraphicsResult<Self> {
        if chunk_size == 0 || chunk_size > budget {
            return Err(GraphicsError::InvalidParameter(format!(
                "staging chunk size {chunk_size} must be non-zero and within budget {budget}"
            )));
        }
        Ok(Self {
            name: name.into(),
            chunks: Vec::new(),
            chunk_size,
            budget,
        })
    }

    pub fn chunks(&self) -> &[StagingChunk] {
        &self.chunks
    }

    pub fn budget(&self) -> u64 {
        self.budget
    }

    /// Sum of all chunk capacities.
    pub fn reserved(&self) -> u64 {
        self.chunks.iter().map(StagingChunk::capacity).sum()
    }

    /// Bytes mapped since the last reset.
    pub fn used(&self) -> u64 {
        self.chunks.iter().map(StagingChunk::used).sum()
    }

    /// Map `size` bytes of staging memory.
    ///
    /// Returns where the data will live and the memory to fill.
    pub fn map(&mut self, size: u64) -> GraphicsResult<(StagingAllocation, &mut [u8])> {
        if size == 0 {
            return Err(GraphicsError::InvalidParameter(
                "cannot map an empty staging region".to_string(),
            ));
        }

        let existing = self.chunks.iter().position(|chunk| chunk.fits(size));
        let index = match existing {
            Some(index) => index,
            None => self.grow(size)?,
        };

        let chunk = &mut self.chunks[index];
        let offset = align_up(chunk.used, STAGING_ALIGNMENT);
        chunk.used = offset + size;

        let allocation = StagingAllocation {
            handle: chunk.handle,
            offset,
            size,
        };
        Ok((allocation, &mut chunk.data[offset as usize..(offset + size) as usize]))
    }

    /// Map `data.len()` bytes and copy `data` into them.
    pub fn upload(&mut self, data: &[u8]) -> GraphicsResult<StagingAllocation> {
        let (allocation, memory) = self.map(data.len() as u64)?;
        memory.copy_from_slice(data);
        Ok(allocation)
    }

    /// Invalidate every mapping. Chunks stay allocated.
    pub fn reset(&mut self) {
        for chunk in &mut self.chunks {
            chunk.used = 0;
        }
    }

    fn grow(&mut self, size: u64) -> GraphicsResult<usize> {
        let capacity = size.max(self.chunk_size);
        let within_budget = self
            .reserved()
            .checked_add(capacity)
            .is_some_and(|total| total <= self.budget);
        if !within_budget {
            log::warn!(
                "Staging allocator {} exhausted: requested {} bytes with {} of {} reserved",
                self.name,
                size,
                self.reserved(),
                self.budget
            );
            return Err(GraphicsError::StagingAllocatorExhausted {
                requested: size,
                budget: self.budget,
            });
        }

        let index = self.chunks.len();
        let handle = ResourceHandle::indexed(&self.name, index as u64, ResourceType::Buffer);
        log::debug!(
            "Staging allocator {}: new chunk {} ({} bytes)",
            self.name,
            index,
            capacity
        );
        self.chunks.push(StagingChunk {
            handle,
            data: vec![0; capacity as usize],
            used: 0,
        });
        Ok(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::{fixture, rstest};

    #[fixture]
    fn staging() -> StagingAllocator {
        StagingAllocator::new("test/staging", 256, 1024).unwrap()
    }

    #[test]
    fn test_invalid_configuration() {
        assert!(StagingAllocator::new("bad", 0, 1024).is_err());
        assert!(StagingAllocator::new("bad", 2048, 1024).is_err());
    }

    #[rstest]
    fn test_map_returns_backing_handle(mut staging: StagingAllocator) {
        let (allocation, memory) = staging.map(100).unwrap();
        memory.fill(3);
        assert_eq!(allocation.offset, 0);
        assert_eq!(allocation.size, 100);
        assert_eq!(allocation.handle, staging.chunks()[0].handle());
        assert_eq!(staging.chunks()[0].contents(), &[3u8; 100][..]);
    }

    #[rstest]
    fn test_allocations_share_chunk_until_full(mut staging: StagingAllocator) {
        let a = staging.upload(&[1; 100]).unwrap();
        let b = staging.upload(&[2; 100]).unwrap();
        assert_eq!(a.handle, b.handle);
        assert_eq!(b.offset, 112);

        let c = staging.upload(&[3; 100]).unwrap();
        assert_ne!(c.handle, a.handle);
        assert_eq!(c.offset, 0);
        assert_eq!(staging.chunks().len(), 2);
    }

    #[rstest]
    fn test_oversized_request_gets_dedicated_chunk(mut staging: StagingAllocator) {
        let allocation = staging.map(600).unwrap().0;
        assert_eq!(allocation.offset, 0);
        assert_eq!(staging.chunks()[0].capacity(), 600);
        assert_eq!(staging.reserved(), 600);
    }

    #[rstest]
    fn test_budget_exhaustion(mut staging: StagingAllocator) {
        staging.map(900).unwrap();
        let err = staging.map(200).unwrap_err();
        assert_eq!(
            err,
            GraphicsError::StagingAllocatorExhausted {
                requested: 200,
                budget: 1024,
            }
        );
        assert!(staging.map(0).is_err());
    }

    #[rstest]
    #[case(u64::MAX)]
    #[case(u64::MAX - 8)]
    fn test_huge_request_is_exhaustion(mut staging: StagingAllocator, #[case] size: u64) {
        staging.map(100).unwrap();
        assert_eq!(
            staging.map(size).unwrap_err(),
            GraphicsError::StagingAllocatorExhausted {
                requested: size,
                budget: 1024,
            }
        );
        assert_eq!(staging.chunks().len(), 1);
    }

    #[rstest]
    fn test_reset_reuses_chunks(mut staging: StagingAllocator) {
        let first = staging.upload(&[9; 200]).unwrap();
        staging.reset();
        assert_eq!(staging.used(), 0);

        let second = staging.upload(&[9; 200]).unwrap();
        assert_eq!(first, second);
        assert_eq!(staging.chunks().len(), 1);
    }
}
