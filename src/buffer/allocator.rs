use bytes::{Bytes, BytesMut};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use tracing::trace;

/// Owned byte buffer with a read position and a write position.
///
/// The readable region is `[start, end)` and the writable region is
/// `[end, capacity)`. A buffer handed out by a pooling allocator returns its
/// storage to the pool when dropped, so ownership transfer (moving the
/// `Buffer`) is all that is needed to release it.
pub struct Buffer {
    data: BytesMut,
    start: usize,
    end: usize,
    pool: Option<Arc<Pool>>,
}

impl Buffer {
    /// Creates an unpooled buffer with the given capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        Self::from_storage(zeroed(capacity), None)
    }

    fn from_storage(data: BytesMut, pool: Option<Arc<Pool>>) -> Self {
        Self {
            data,
            start: 0,
            end: 0,
            pool,
        }
    }

    /// Total capacity of the buffer.
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Number of readable bytes.
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// Space left behind the readable bytes.
    pub fn remaining_mut(&self) -> usize {
        self.data.len() - self.end
    }

    /// Whether the storage goes back to an allocator pool on drop.
    pub fn is_pooled(&self) -> bool {
        self.pool.is_some()
    }

    /// The readable bytes.
    pub fn readable(&self) -> &[u8] {
        &self.data[self.start..self.end]
    }

    /// The writable region behind the readable bytes.
    pub fn writable(&mut self) -> &mut [u8] {
        &mut self.data[self.end..]
    }

    /// Marks `count` readable bytes as consumed.
    pub fn advance(&mut self, count: usize) {
        assert!(count <= self.len(), "advance past the readable bytes");
        self.start += count;
        if self.start == self.end {
            self.start = 0;
            self.end = 0;
        }
    }

    /// Marks `count` bytes of the writable region as filled.
    pub fn advance_mut(&mut self, count: usize) {
        assert!(count <= self.remaining_mut(), "advance past the capacity");
        self.end += count;
    }

    /// Copies as much of `src` as fits and returns the number of bytes copied.
    pub fn put_slice(&mut self, src: &[u8]) -> usize {
        let count = src.len().min(self.remaining_mut());
        self.data[self.end..self.end + count].copy_from_slice(&src[..count]);
        self.end += count;
        count
    }

    /// Moves the readable bytes to the front of the storage.
    pub fn compact(&mut self) {
        if self.start > 0 {
            self.data.copy_within(self.start..self.end, 0);
            self.end -= self.start;
            self.start = 0;
        }
    }

    /// Discards all readable bytes.
    pub fn clear(&mut self) {
        self.start = 0;
        self.end = 0;
    }

    /// Copies the readable bytes into an immutable [`Bytes`].
    pub fn to_bytes(&self) -> Bytes {
        Bytes::copy_from_slice(self.readable())
    }

    /// Replaces the storage with `other`, carrying the readable bytes over.
    ///
    /// The old storage is released like a dropped buffer.
    pub(crate) fn replace_storage(&mut self, mut other: Buffer) {
        assert!(other.capacity() >= self.len(), "replacement too small");
        other.clear();
        other.put_slice(self.readable());
        std::mem::swap(self, &mut other);
    }
}

impl From<Vec<u8>> for Buffer {
    fn from(data: Vec<u8>) -> Self {
        let end = data.len();
        Self {
            data: BytesMut::from(&data[..]),
            start: 0,
            end,
            pool: None,
        }
    }
}

impl From<&[u8]> for Buffer {
    fn from(data: &[u8]) -> Self {
        Self {
            data: BytesMut::from(data),
            start: 0,
            end: data.len(),
            pool: None,
        }
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.take() {
            pool.put(std::mem::take(&mut self.data));
        }
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("len", &self.len())
            .field("capacity", &self.capacity())
            .field("pooled", &self.is_pooled())
            .finish()
    }
}

fn zeroed(capacity: usize) -> BytesMut {
    let mut data = BytesMut::with_capacity(capacity);
    data.resize(capacity, 0);
    data
}

// ============================================================================
// Allocators
// ============================================================================

/// Hands out buffers for session queues and engine drivers.
///
/// `extend` and `reduce` resize a buffer while keeping its readable bytes.
/// Allocators that pool storage report `is_releasable() == true`, which
/// enables zero-copy hand-off of caller buffers when a session is configured
/// with `optimize_copying`.
pub trait BufferAllocator: Send + Sync + fmt::Debug {
    /// Allocates an empty buffer with exactly `capacity` bytes of space.
    fn allocate(&self, capacity: usize) -> Buffer;

    /// Whether dropped buffers are returned for reuse.
    fn is_releasable(&self) -> bool;

    /// Grows `buffer` to `capacity`, keeping its readable bytes.
    fn extend(&self, buffer: &mut Buffer, capacity: usize) {
        if capacity > buffer.capacity() {
            buffer.replace_storage(self.allocate(capacity));
        }
    }

    /// Shrinks `buffer` to `capacity` (never below its readable length).
    fn reduce(&self, buffer: &mut Buffer, capacity: usize) {
        let capacity = capacity.max(buffer.len());
        if capacity < buffer.capacity() {
            buffer.replace_storage(self.allocate(capacity));
        }
    }
}

/// Allocator without pooling; storage is freed when a buffer is dropped.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultAllocator;

impl BufferAllocator for DefaultAllocator {
    fn allocate(&self, capacity: usize) -> Buffer {
        Buffer::with_capacity(capacity)
    }

    fn is_releasable(&self) -> bool {
        false
    }
}

/// Allocator that caches released storage by capacity.
///
/// At most `max_cached` storages are kept per capacity; everything beyond that
/// is freed.
#[derive(Debug, Clone)]
pub struct CachingAllocator {
    pool: Arc<Pool>,
}

impl CachingAllocator {
    pub fn new(max_cached: usize) -> Self {
        Self {
            pool: Arc::new(Pool {
                free: Mutex::new(HashMap::new()),
                max_cached,
            }),
        }
    }

    /// Number of cached storages ready for reuse.
    pub fn cached(&self) -> usize {
        self.pool.lock().values().map(Vec::len).sum()
    }
}

impl Default for CachingAllocator {
    fn default() -> Self {
        Self::new(64)
    }
}

impl BufferAllocator for CachingAllocator {
    fn allocate(&self, capacity: usize) -> Buffer {
        let cached = self
            .pool
            .lock()
            .get_mut(&capacity)
            .and_then(|free| free.pop());
        let data = cached.unwrap_or_else(|| zeroed(capacity));
        Buffer::from_storage(data, Some(self.pool.clone()))
    }

    fn is_releasable(&self) -> bool {
        true
    }
}

#[derive(Debug)]
struct Pool {
    free: Mutex<HashMap<usize, Vec<BytesMut>>>,
    max_cached: usize,
}

impl Pool {
    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<usize, Vec<BytesMut>>> {
        // A poisoned pool only means a panic elsewhere; the cache is still valid.
        self.free.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn put(&self, data: BytesMut) {
        let capacity = data.len();
        let mut free = self.lock();
        let slot = free.entry(capacity).or_default();
        if slot.len() < self.max_cached {
            slot.push(data);
        } else {
            trace!(capacity, "Buffer pool full, freeing storage");
        }
    }
}
