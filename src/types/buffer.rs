//! Buffer usage flags.

use bitflags::bitflags;

bitflags! {
    /// Usage flags for buffers.
    ///
    /// Flags declared by different passes for the same buffer are unioned
    /// when the graph is compiled.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
    pub struct BufferUsage: u32 {
        /// Buffer can be the source of a transfer.
        const TRANSFER_SRC = 1 << 0;
        /// Buffer can be the destination of a transfer.
        const TRANSFER_DST = 1 << 1;
        /// Buffer can be bound as a uniform buffer.
        const UNIFORM_BUFFER = 1 << 2;
        /// Buffer can be bound as a storage buffer (read and write).
        const STORAGE_BUFFER = 1 << 3;
        /// Buffer can be bound as an index buffer.
        const INDEX_BUFFER = 1 << 4;
        /// Buffer can be bound as a vertex buffer.
        const VERTEX_BUFFER = 1 << 5;
        /// Buffer can hold indirect draw or dispatch arguments.
        const INDIRECT_BUFFER = 1 << 6;
    }
}

impl BufferUsage {
    /// Flags that imply the pass reads the buffer contents.
    pub const READS: Self = Self::TRANSFER_SRC
        .union(Self::UNIFORM_BUFFER)
        .union(Self::STORAGE_BUFFER)
        .union(Self::INDEX_BUFFER)
        .union(Self::VERTEX_BUFFER)
        .union(Self::INDIRECT_BUFFER);

    /// Flags that imply the pass writes the buffer contents.
    pub const WRITES: Self = Self::TRANSFER_DST.union(Self::STORAGE_BUFFER);

    /// Whether these flags imply a read access.
    pub fn is_read(self) -> bool {
        self.intersects(Self::READS)
    }

    /// Whether these flags imply a write access.
    pub fn is_write(self) -> bool {
        self.intersects(Self::WRITES)
    }
}

impl Default for BufferUsage {
    fn default() -> Self {
        Self::empty()
    }
}
