//! Buffer allocation and outbound queues.
//!
//! [`Buffer`] is an owned handle over pooled or plain storage. Session queues
//! ([`OutBuffers`] for streams, [`RecordQueue`] for datagrams) and the engine
//! driver's network/application buffers are all built from it.

mod allocator;
mod queue;

pub use allocator::{Buffer, BufferAllocator, CachingAllocator, DefaultAllocator};
pub(crate) use queue::{OutBuffers, OutQueue, RecordQueue};
