use super::{ClosingState, Encoder, SessionConfig, SessionKind};
use crate::buffer::{BufferAllocator, OutBuffers, OutQueue, RecordQueue};
use crate::error::Error;
use crate::future::Completions;
use crate::reactor::{LoopHandle, LoopTask, SessionOp};
use mio::Token;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::trace;

/// State shared between a session's loop and the threads writing to it.
pub(crate) struct SessionShared {
    pub(crate) id: u64,
    pub(crate) name: String,
    pub(crate) kind: SessionKind,
    pub(crate) config: SessionConfig,
    pub(crate) allocator: Arc<dyn BufferAllocator>,
    pub(crate) local_addr: Option<SocketAddr>,
    pub(crate) peer_addr: Option<SocketAddr>,
    pub(crate) engine_backed: bool,
    pub(crate) counters: Counters,
    encoder: Option<Mutex<Box<dyn Encoder>>>,
    link: Option<Link>,
    state: Mutex<WriteState>,
}

/// Where a registered session submits work.
#[derive(Debug, Clone)]
pub(crate) struct Link {
    pub(crate) handle: LoopHandle,
    pub(crate) token: Token,
}

/// Everything guarded by the per-session write lock.
#[derive(Debug)]
pub(crate) struct WriteState {
    pub(crate) closing: ClosingState,
    pub(crate) out: OutQueue,
    pub(crate) completions: Completions,
    /// Bytes submitted for writing.
    pub(crate) app_counter: u64,
    /// Bytes written to the channel, or consumed by the engine's wrap.
    pub(crate) net_counter: u64,
    /// A `Process` op is queued and not yet handled.
    pub(crate) scheduled: bool,
    pub(crate) read_suspended: bool,
    pub(crate) write_suspended: bool,
    pub(crate) lazy_handshake: bool,
    pub(crate) registration: Registration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Registration {
    Pending,
    Registered,
    Aborted,
}

impl WriteState {
    /// Marks a `Process` op as queued. Returns `true` if the caller has to
    /// submit it.
    pub(crate) fn request_process(&mut self) -> bool {
        !std::mem::replace(&mut self.scheduled, true)
    }

    /// Drops all queued data and fails the waiting completions.
    pub(crate) fn abandon(&mut self, id: u64) {
        self.out.clear();
        self.completions.fail_all(|| Error::SessionClosed { id });
    }
}

pub(crate) struct SessionParts {
    pub(crate) name: String,
    pub(crate) kind: SessionKind,
    pub(crate) config: SessionConfig,
    pub(crate) allocator: Arc<dyn BufferAllocator>,
    pub(crate) encoder: Option<Box<dyn Encoder>>,
    pub(crate) engine_backed: bool,
    pub(crate) local_addr: Option<SocketAddr>,
    pub(crate) peer_addr: Option<SocketAddr>,
}

impl SessionShared {
    pub(crate) fn new(id: u64, parts: SessionParts, link: Option<Link>) -> Self {
        let out = match parts.kind {
            SessionKind::Stream => OutQueue::Stream(OutBuffers::new(
                parts.allocator.clone(),
                parts.config.min_out_buffer_capacity,
                parts.config.optimize_copying,
            )),
            SessionKind::Datagram => OutQueue::Datagram(RecordQueue::new(
                parts.allocator.clone(),
                parts.config.optimize_copying,
            )),
        };
        let counters = Counters::new(parts.config.throughput_interval);
        Self {
            id,
            name: parts.name,
            kind: parts.kind,
            config: parts.config,
            allocator: parts.allocator,
            local_addr: parts.local_addr,
            peer_addr: parts.peer_addr,
            engine_backed: parts.engine_backed,
            counters,
            encoder: parts.encoder.map(Mutex::new),
            link,
            state: Mutex::new(WriteState {
                closing: ClosingState::None,
                out,
                completions: Completions::default(),
                app_counter: 0,
                net_counter: 0,
                scheduled: false,
                read_suspended: false,
                write_suspended: false,
                lazy_handshake: false,
                registration: Registration::Pending,
            }),
        }
    }

    /// A session that is not attached to any loop.
    #[cfg(test)]
    pub(crate) fn detached(kind: SessionKind, config: SessionConfig, engine_backed: bool) -> Self {
        Self::new(
            0,
            SessionParts {
                name: "detached".to_string(),
                kind,
                config,
                allocator: Arc::new(crate::buffer::DefaultAllocator),
                encoder: None,
                engine_backed,
                local_addr: None,
                peer_addr: None,
            },
            None,
        )
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, WriteState> {
        // Writers never leave the state half-updated, so a poisoned lock is
        // still consistent.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn link(&self) -> Option<&Link> {
        self.link.as_ref()
    }

    pub(crate) fn encoder(&self) -> Option<MutexGuard<'_, Box<dyn Encoder>>> {
        self.encoder
            .as_ref()
            .map(|encoder| encoder.lock().unwrap_or_else(|poisoned| poisoned.into_inner()))
    }

    /// Sends an op to the owning loop. Detached sessions drop it.
    pub(crate) fn submit(&self, op: SessionOp) {
        let Some(link) = &self.link else {
            return;
        };
        let token = link.token;
        if let Err(err) = link.handle.submit(LoopTask::Session { token, op }) {
            trace!(id = self.id, ?err, "Dropped session op, loop is gone");
        }
    }

    /// Marks the session for the loop's invalidated-key pass.
    pub(crate) fn invalidate(&self) {
        if let Some(link) = &self.link {
            link.handle.invalidate(link.token);
        }
    }
}

// ============================================================================
// Byte Counters
// ============================================================================

/// Byte counters and throughput rates of a session.
#[derive(Debug)]
pub(crate) struct Counters {
    read: AtomicU64,
    written: AtomicU64,
    meter: Mutex<Meter>,
}

#[derive(Debug)]
struct Meter {
    interval: Duration,
    sampled_at: Instant,
    read: u64,
    written: u64,
    read_rate: f64,
    write_rate: f64,
}

impl Counters {
    fn new(interval: Duration) -> Self {
        Self {
            read: AtomicU64::new(0),
            written: AtomicU64::new(0),
            meter: Mutex::new(Meter {
                interval,
                sampled_at: Instant::now(),
                read: 0,
                written: 0,
                read_rate: 0.0,
                write_rate: 0.0,
            }),
        }
    }

    pub(crate) fn record_read(&self, len: usize) {
        self.read.fetch_add(len as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_written(&self, len: usize) {
        self.written.fetch_add(len as u64, Ordering::Relaxed);
    }

    pub(crate) fn read_bytes(&self) -> u64 {
        self.read.load(Ordering::Relaxed)
    }

    pub(crate) fn written_bytes(&self) -> u64 {
        self.written.load(Ordering::Relaxed)
    }

    /// Read and write rates in bytes per second, resampled at most once per
    /// interval.
    pub(crate) fn throughputs(&self) -> (f64, f64) {
        let mut meter = self.meter.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let elapsed = meter.sampled_at.elapsed();
        if elapsed >= meter.interval && !elapsed.is_zero() {
            let read = self.read_bytes();
            let written = self.written_bytes();
            let secs = elapsed.as_secs_f64();
            meter.read_rate = (read - meter.read) as f64 / secs;
            meter.write_rate = (written - meter.written) as f64 / secs;
            meter.read = read;
            meter.written = written;
            meter.sampled_at = Instant::now();
        }
        (meter.read_rate, meter.write_rate)
    }
}
