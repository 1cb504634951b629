use super::{Buffer, BufferAllocator};
use std::collections::VecDeque;
use std::io::IoSlice;
use std::net::SocketAddr;
use std::sync::Arc;

// Upper bound of slices handed to a single vectored write or wrap call.
const MAX_SOURCES: usize = 64;

/// Outbound byte queue of a stream session.
///
/// Small writes are coalesced into the tail buffer. A caller-supplied buffer
/// is queued as-is (zero-copy) only when copy optimization is enabled and the
/// allocator releases buffers; otherwise its bytes are copied.
#[derive(Debug)]
pub(crate) struct OutBuffers {
    buffers: VecDeque<Buffer>,
    allocator: Arc<dyn BufferAllocator>,
    min_capacity: usize,
    optimize_copying: bool,
    len: usize,
}

impl OutBuffers {
    pub(crate) fn new(
        allocator: Arc<dyn BufferAllocator>,
        min_capacity: usize,
        optimize_copying: bool,
    ) -> Self {
        Self {
            buffers: VecDeque::new(),
            allocator,
            min_capacity,
            optimize_copying,
            len: 0,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of buffers currently held, including an empty cached tail.
    pub(crate) fn buffer_count(&self) -> usize {
        self.buffers.len()
    }

    pub(crate) fn push_slice(&mut self, mut data: &[u8]) {
        self.len += data.len();
        if let Some(tail) = self.buffers.back_mut() {
            let copied = tail.put_slice(data);
            data = &data[copied..];
        }
        while !data.is_empty() {
            let mut buffer = self.allocator.allocate(self.min_capacity.max(data.len()));
            let copied = buffer.put_slice(data);
            data = &data[copied..];
            self.buffers.push_back(buffer);
        }
    }

    pub(crate) fn push_buffer(&mut self, buffer: Buffer) {
        if buffer.is_empty() {
            return;
        }
        if self.optimize_copying && self.allocator.is_releasable() {
            self.len += buffer.len();
            // Drop an empty cached tail so the queue stays in order.
            if self.buffers.back().is_some_and(Buffer::is_empty) {
                self.buffers.pop_back();
            }
            self.buffers.push_back(buffer);
        } else {
            self.push_slice(buffer.readable());
        }
    }

    /// Readable slices in queue order, for vectored writes.
    pub(crate) fn io_slices(&self) -> Vec<IoSlice<'_>> {
        self.buffers
            .iter()
            .filter(|buffer| !buffer.is_empty())
            .take(MAX_SOURCES)
            .map(|buffer| IoSlice::new(buffer.readable()))
            .collect()
    }

    /// Readable slices in queue order, for engine wrap calls.
    pub(crate) fn sources(&self) -> Vec<&[u8]> {
        self.buffers
            .iter()
            .filter(|buffer| !buffer.is_empty())
            .take(MAX_SOURCES)
            .map(Buffer::readable)
            .collect()
    }

    /// Consumes `count` bytes from the front of the queue.
    ///
    /// Leading empty buffers are released. The sole remaining buffer is
    /// compacted, or shrunk back to the minimum capacity once it is empty.
    pub(crate) fn consume(&mut self, mut count: usize) {
        assert!(count <= self.len, "consumed more than queued");
        self.len -= count;
        while count > 0 {
            let Some(front) = self.buffers.front_mut() else {
                break;
            };
            let step = count.min(front.len());
            front.advance(step);
            count -= step;
            if front.is_empty() && self.buffers.len() > 1 {
                self.buffers.pop_front();
            }
        }
        while self.buffers.len() > 1 && self.buffers.front().is_some_and(Buffer::is_empty) {
            self.buffers.pop_front();
        }
        if self.buffers.len() == 1 {
            if let Some(sole) = self.buffers.front_mut() {
                if sole.is_empty() {
                    if sole.capacity() > self.min_capacity {
                        self.allocator.reduce(sole, self.min_capacity);
                    }
                } else {
                    sole.compact();
                }
            }
        }
    }

    /// Releases every queued buffer.
    pub(crate) fn clear(&mut self) {
        self.buffers.clear();
        self.len = 0;
    }
}

/// A queued datagram: destination (if the socket is not connected) and
/// payload. The payload goes back to its allocator when the record is dropped.
#[derive(Debug)]
pub(crate) struct Record {
    pub(crate) addr: Option<SocketAddr>,
    pub(crate) payload: Buffer,
}

/// Outbound record queue of a datagram session. Records are never coalesced.
#[derive(Debug)]
pub(crate) struct RecordQueue {
    records: VecDeque<Record>,
    allocator: Arc<dyn BufferAllocator>,
    optimize_copying: bool,
    len: usize,
}

impl RecordQueue {
    pub(crate) fn new(allocator: Arc<dyn BufferAllocator>, optimize_copying: bool) -> Self {
        Self {
            records: VecDeque::new(),
            allocator,
            optimize_copying,
            len: 0,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub(crate) fn record_count(&self) -> usize {
        self.records.len()
    }

    pub(crate) fn push_slice(&mut self, addr: Option<SocketAddr>, data: &[u8]) {
        let mut payload = self.allocator.allocate(data.len());
        payload.put_slice(data);
        self.len += data.len();
        self.records.push_back(Record { addr, payload });
    }

    pub(crate) fn push_buffer(&mut self, addr: Option<SocketAddr>, buffer: Buffer) {
        if self.optimize_copying && self.allocator.is_releasable() {
            self.len += buffer.len();
            self.records.push_back(Record {
                addr,
                payload: buffer,
            });
        } else {
            self.push_slice(addr, buffer.readable());
        }
    }

    pub(crate) fn front(&self) -> Option<&Record> {
        self.records.front()
    }

    pub(crate) fn pop_front(&mut self) -> Option<Record> {
        let record = self.records.pop_front()?;
        self.len -= record.payload.len();
        Some(record)
    }

    /// Consumes `count` bytes of the front record, dropping it once empty.
    pub(crate) fn consume(&mut self, count: usize) {
        if let Some(front) = self.records.front_mut() {
            let step = count.min(front.payload.len());
            front.payload.advance(step);
            self.len -= step;
            if front.payload.is_empty() {
                self.records.pop_front();
            }
        }
    }

    pub(crate) fn clear(&mut self) {
        self.records.clear();
        self.len = 0;
    }
}

/// Outbound queue of a session, by session kind.
#[derive(Debug)]
pub(crate) enum OutQueue {
    Stream(OutBuffers),
    Datagram(RecordQueue),
}

impl OutQueue {
    pub(crate) fn len(&self) -> usize {
        match self {
            OutQueue::Stream(buffers) => buffers.len(),
            OutQueue::Datagram(records) => records.len(),
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        match self {
            OutQueue::Stream(buffers) => buffers.is_empty(),
            OutQueue::Datagram(records) => records.is_empty(),
        }
    }

    /// Input slices for a wrap call. A datagram queue only ever offers its
    /// front record, since records are wrapped one at a time.
    pub(crate) fn sources(&self) -> Vec<&[u8]> {
        match self {
            OutQueue::Stream(buffers) => buffers.sources(),
            OutQueue::Datagram(records) => records
                .front()
                .map(|record| vec![record.payload.readable()])
                .unwrap_or_default(),
        }
    }

    pub(crate) fn consume(&mut self, count: usize) {
        match self {
            OutQueue::Stream(buffers) => buffers.consume(count),
            OutQueue::Datagram(records) => records.consume(count),
        }
    }

    pub(crate) fn clear(&mut self) {
        match self {
            OutQueue::Stream(buffers) => buffers.clear(),
            OutQueue::Datagram(records) => records.clear(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{CachingAllocator, DefaultAllocator};

    #[test]
    fn test_small_writes_coalesce_into_tail() {
        let mut queue = OutBuffers::new(Arc::new(DefaultAllocator), 16, false);
        queue.push_slice(b"hello ");
        queue.push_slice(b"world");
        assert_eq!(queue.buffer_count(), 1);
        assert_eq!(queue.sources(), vec![&b"hello world"[..]]);

        queue.push_slice(&[7u8; 20]);
        assert_eq!(queue.len(), 31);
        assert_eq!(queue.buffer_count(), 2);
    }

    #[test]
    fn test_consume_drops_leading_buffers_and_shrinks_the_last() {
        let mut queue = OutBuffers::new(Arc::new(DefaultAllocator), 8, false);
        queue.push_slice(&[1u8; 8]);
        queue.push_slice(&[2u8; 40]);
        assert_eq!(queue.buffer_count(), 2);

        queue.consume(10);
        assert_eq!(queue.buffer_count(), 1);
        assert_eq!(queue.len(), 38);

        queue.consume(38);
        assert!(queue.is_empty());
        assert_eq!(queue.buffer_count(), 1);
        assert!(queue.io_slices().is_empty());
    }

    #[test]
    fn test_zero_copy_only_with_releasable_allocator() {
        let pooled = CachingAllocator::new(4);
        let buffer = {
            let mut buffer = pooled.allocate(32);
            buffer.put_slice(b"owned");
            buffer
        };
        let mut queue = OutBuffers::new(Arc::new(pooled.clone()), 16, true);
        queue.push_buffer(buffer);
        assert_eq!(queue.buffer_count(), 1);
        queue.consume(5);
        queue.clear();
        assert!(pooled.cached() >= 1);

        let mut copying = OutBuffers::new(Arc::new(DefaultAllocator), 16, true);
        copying.push_slice(b"ab");
        copying.push_buffer(Buffer::from(&b"cd"[..]));
        assert_eq!(copying.buffer_count(), 1);
        assert_eq!(copying.sources(), vec![&b"abcd"[..]]);
    }

    #[test]
    fn test_records_keep_boundaries() {
        let addr: SocketAddr = "127.0.0.1:9".parse().unwrap();
        let mut records = RecordQueue::new(Arc::new(DefaultAllocator), false);
        records.push_slice(Some(addr), b"one");
        records.push_slice(None, b"three");
        assert_eq!(records.record_count(), 2);
        assert_eq!(records.len(), 8);

        let queue = OutQueue::Datagram(records);
        assert_eq!(queue.sources(), vec![&b"one"[..]]);

        let OutQueue::Datagram(mut records) = queue else {
            unreachable!()
        };
        let first = records.pop_front().unwrap();
        assert_eq!(first.addr, Some(addr));
        records.consume(5);
        assert!(records.is_empty());
        assert_eq!(records.len(), 0);
    }
}
