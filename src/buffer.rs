//! Byte limited sort buffer.

use rayon;

/// Chunk buffer limited by the accumulated size of the source data.
///
/// The limit is a flush trigger checked after an item is added, so the buffer is reported full
/// only once its size exceeds the limit. An item larger than the limit still ends up in a
/// (single item) buffer.
pub struct ChunkBuffer<T> {
    limit: u64,
    current_size: u64,
    inner: Vec<T>,
}

impl<T> ChunkBuffer<T> {
    pub fn new(limit: u64) -> Self {
        ChunkBuffer {
            limit,
            current_size: 0,
            inner: Vec::new(),
        }
    }

    /// Adds a new element to the buffer accounting `size` bytes for it.
    pub fn push(&mut self, item: T, size: u64) {
        self.current_size = self.current_size.saturating_add(size);
        self.inner.push(item);
    }

    /// Returns buffer length
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Returns the accumulated size of buffered elements.
    pub fn mem_size(&self) -> u64 {
        self.current_size
    }

    /// Checks if the buffer exceeded the limit.
    pub fn is_full(&self) -> bool {
        self.current_size > self.limit
    }

    pub fn as_slice(&self) -> &[T] {
        self.inner.as_slice()
    }
}

impl<T: Send> rayon::slice::ParallelSliceMut<T> for ChunkBuffer<T> {
    fn as_parallel_slice_mut(&mut self) -> &mut [T] {
        self.inner.as_mut_slice()
    }
}
