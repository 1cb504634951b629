//! Sessions: the application-facing side of a registered channel.
//!
//! A [`Session`] is a cheap, cloneable handle. Writes, closes and flow
//! control can be issued from any thread; they update the session's state
//! under its write lock and hand the actual I/O to the owning loop.

mod config;
mod handler;
pub(crate) mod shared;
mod state;

pub use crate::reactor::TimerHandle;
pub use config::SessionConfig;
pub use handler::{Encoder, Handler};
pub(crate) use state::{EventValidator, Handshake};
pub use state::{ClosingState, DataEvent, SessionEvent};

use crate::buffer::{Buffer, BufferAllocator, DefaultAllocator, OutQueue};
use crate::engine::Engine;
use crate::error::Error;
use crate::future::{Completion, WriteFuture};
use crate::reactor::{LoopTask, SessionOp};
use bytes::BytesMut;
use shared::{Registration, SessionShared};
use std::any::Any;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Transport flavour of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionKind {
    Stream,
    Datagram,
}

impl SessionKind {
    pub(crate) fn name(self) -> &'static str {
        match self {
            SessionKind::Stream => "stream",
            SessionKind::Datagram => "datagram",
        }
    }
}

/// Everything needed to create a session for a channel.
pub struct SessionSpec {
    pub(crate) name: String,
    pub(crate) handler: Box<dyn Handler>,
    pub(crate) engine: Option<Box<dyn Engine>>,
    pub(crate) config: SessionConfig,
    pub(crate) allocator: Arc<dyn BufferAllocator>,
    pub(crate) encoder: Option<Box<dyn Encoder>>,
}

impl SessionSpec {
    pub fn new(handler: impl Handler + 'static) -> Self {
        Self {
            name: "session".to_string(),
            handler: Box::new(handler),
            engine: None,
            config: SessionConfig::default(),
            allocator: Arc::new(DefaultAllocator),
            encoder: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Drives the session through `engine`.
    pub fn with_engine(mut self, engine: impl Engine + 'static) -> Self {
        self.engine = Some(Box::new(engine));
        self
    }

    pub fn with_boxed_engine(mut self, engine: Box<dyn Engine>) -> Self {
        self.engine = Some(engine);
        self
    }

    pub fn with_config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_allocator(mut self, allocator: Arc<dyn BufferAllocator>) -> Self {
        self.allocator = allocator;
        self
    }

    pub fn with_encoder(mut self, encoder: impl Encoder + 'static) -> Self {
        self.encoder = Some(Box::new(encoder));
        self
    }
}

impl fmt::Debug for SessionSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionSpec")
            .field("name", &self.name)
            .field("engine", &self.engine.is_some())
            .field("config", &self.config)
            .finish()
    }
}

/// Handle to a session registered with a selector loop.
#[derive(Clone)]
pub struct Session {
    pub(crate) shared: Arc<SessionShared>,
}

// ============================================================================
// Identity
// ============================================================================

impl Session {
    pub(crate) fn from_shared(shared: Arc<SessionShared>) -> Self {
        Self { shared }
    }

    pub fn id(&self) -> u64 {
        self.shared.id
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn kind(&self) -> SessionKind {
        self.shared.kind
    }

    pub fn config(&self) -> &SessionConfig {
        &self.shared.config
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.shared.local_addr
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.shared.peer_addr
    }

    /// Whether the session runs its data through an engine.
    pub fn is_engine_backed(&self) -> bool {
        self.shared.engine_backed
    }

    pub fn closing_state(&self) -> ClosingState {
        self.shared.lock().closing
    }

    pub fn is_open(&self) -> bool {
        self.closing_state() == ClosingState::None
    }
}

// ============================================================================
// Writing
// ============================================================================

enum Payload<'a> {
    Slice(&'a [u8]),
    Buffer(Buffer),
}

impl Payload<'_> {
    fn len(&self) -> usize {
        match self {
            Payload::Slice(data) => data.len(),
            Payload::Buffer(buffer) => buffer.len(),
        }
    }
}

impl Session {
    /// Queues `data` and returns a future resolved once it is flushed.
    pub fn write(&self, data: impl AsRef<[u8]>) -> WriteFuture {
        self.connected_target()
            .and_then(|_| self.enqueue(None, Payload::Slice(data.as_ref()), true))
            .unwrap_or_else(|err| Completion::ready(Err(err)))
    }

    pub fn write_no_future(&self, data: impl AsRef<[u8]>) -> Result<(), Error> {
        self.connected_target()?;
        self.enqueue(None, Payload::Slice(data.as_ref()), false)
            .map(drop)
    }

    /// Queues an owned buffer. With copy optimization enabled on a releasing
    /// allocator the buffer is queued without copying and released once
    /// flushed.
    pub fn write_buffer(&self, buffer: Buffer) -> WriteFuture {
        self.connected_target()
            .and_then(|_| self.enqueue(None, Payload::Buffer(buffer), true))
            .unwrap_or_else(|err| Completion::ready(Err(err)))
    }

    pub fn write_buffer_no_future(&self, buffer: Buffer) -> Result<(), Error> {
        self.connected_target()?;
        self.enqueue(None, Payload::Buffer(buffer), false).map(drop)
    }

    /// Encodes `message` with the session's encoder and queues the result.
    pub fn write_message(&self, message: &dyn Any) -> WriteFuture {
        match self.encode(message) {
            Ok(bytes) => self.write(bytes),
            Err(err) => Completion::ready(Err(err)),
        }
    }

    pub fn write_message_no_future(&self, message: &dyn Any) -> Result<(), Error> {
        let bytes = self.encode(message)?;
        self.write_no_future(bytes)
    }

    /// Queues a datagram for `addr`.
    pub fn send(&self, addr: SocketAddr, data: impl AsRef<[u8]>) -> WriteFuture {
        self.datagram_only()
            .and_then(|_| self.enqueue(Some(addr), Payload::Slice(data.as_ref()), true))
            .unwrap_or_else(|err| Completion::ready(Err(err)))
    }

    pub fn send_no_future(&self, addr: SocketAddr, data: impl AsRef<[u8]>) -> Result<(), Error> {
        self.datagram_only()?;
        self.enqueue(Some(addr), Payload::Slice(data.as_ref()), false)
            .map(drop)
    }

    fn encode(&self, message: &dyn Any) -> Result<BytesMut, Error> {
        let mut encoder = self.shared.encoder().ok_or(Error::CodecRequired)?;
        let mut out = BytesMut::new();
        encoder.encode(message, &mut out)?;
        Ok(out)
    }

    fn connected_target(&self) -> Result<(), Error> {
        if self.shared.kind == SessionKind::Datagram && self.shared.peer_addr.is_none() {
            return Err(Error::Unsupported {
                kind: "unconnected datagram",
            });
        }
        Ok(())
    }

    fn datagram_only(&self) -> Result<(), Error> {
        if self.shared.kind != SessionKind::Datagram {
            return Err(Error::Unsupported {
                kind: SessionKind::Stream.name(),
            });
        }
        Ok(())
    }

    fn enqueue(
        &self,
        addr: Option<SocketAddr>,
        payload: Payload<'_>,
        with_future: bool,
    ) -> Result<WriteFuture, Error> {
        let len = payload.len();
        let mut state = self.shared.lock();
        if state.closing != ClosingState::None {
            return Err(Error::SessionClosed { id: self.id() });
        }
        if len == 0 {
            return Ok(Completion::ready(Ok(())));
        }
        match (&mut state.out, payload) {
            (OutQueue::Stream(buffers), Payload::Slice(data)) => buffers.push_slice(data),
            (OutQueue::Stream(buffers), Payload::Buffer(buffer)) => buffers.push_buffer(buffer),
            (OutQueue::Datagram(records), Payload::Slice(data)) => records.push_slice(addr, data),
            (OutQueue::Datagram(records), Payload::Buffer(buffer)) => {
                records.push_buffer(addr, buffer)
            }
        }
        state.app_counter += len as u64;
        let future = if with_future {
            let threshold = state.app_counter;
            state.completions.add(threshold)
        } else {
            Completion::ready(Ok(()))
        };
        let notify = !state.write_suspended && state.request_process();
        drop(state);
        if notify {
            self.shared.submit(SessionOp::Process);
        }
        Ok(future)
    }

    /// Bytes queued and not yet flushed (or wrapped).
    pub fn pending_out(&self) -> usize {
        self.shared.lock().out.len()
    }
}

// ============================================================================
// Closing
// ============================================================================

impl Session {
    /// Closes the session after the queued data is flushed.
    pub fn close(&self) {
        self.transition(ClosingState::Sending, |closing| {
            closing == ClosingState::None
        });
    }

    /// Closes the session without flushing queued data. An engine may still
    /// send its close message.
    pub fn quick_close(&self) {
        self.transition(ClosingState::Finishing, |closing| {
            closing <= ClosingState::Sending
        });
    }

    /// Closes the channel at the next loop iteration, bypassing the engine.
    pub fn dirty_close(&self) {
        let changed = {
            let mut state = self.shared.lock();
            let changed = state.closing.advance(ClosingState::Finished);
            if changed {
                state.abandon(self.id());
                if state.registration == Registration::Pending {
                    state.registration = Registration::Aborted;
                }
            }
            changed
        };
        if changed {
            debug!(id = self.id(), "Dirty close requested");
            self.shared.invalidate();
        }
    }

    fn transition(&self, next: ClosingState, allowed: impl Fn(ClosingState) -> bool) {
        let notify = {
            let mut state = self.shared.lock();
            if !allowed(state.closing) || !state.closing.advance(next) {
                return;
            }
            if next >= ClosingState::Finishing {
                state.abandon(self.id());
            }
            if state.registration == Registration::Pending {
                state.registration = Registration::Aborted;
            }
            state.request_process()
        };
        debug!(id = self.id(), state = ?next, "Close requested");
        if notify {
            self.shared.submit(SessionOp::Process);
        }
    }
}

// ============================================================================
// Flow Control and Handshake
// ============================================================================

impl Session {
    /// Stops reading from the channel until [`Session::resume_read`].
    pub fn suspend_read(&self) {
        self.shared.lock().read_suspended = true;
    }

    pub fn resume_read(&self) {
        let resumed = std::mem::replace(&mut self.shared.lock().read_suspended, false);
        if resumed {
            self.shared.submit(SessionOp::ResumeRead);
        }
    }

    /// Stops flushing queued data until [`Session::resume_write`].
    pub fn suspend_write(&self) {
        self.shared.lock().write_suspended = true;
    }

    pub fn resume_write(&self) {
        let notify = {
            let mut state = self.shared.lock();
            std::mem::replace(&mut state.write_suspended, false) && state.request_process()
        };
        if notify {
            self.shared.submit(SessionOp::Process);
        }
    }

    pub fn is_read_suspended(&self) -> bool {
        self.shared.lock().read_suspended
    }

    pub fn is_write_suspended(&self) -> bool {
        self.shared.lock().write_suspended
    }

    /// Asks the engine to (re)start its handshake on the loop thread.
    pub fn begin_handshake(&self) -> Result<(), Error> {
        self.require_engine()?;
        self.shared.submit(SessionOp::BeginHandshake);
        Ok(())
    }

    /// Like [`Session::begin_handshake`], but the handshake only starts with
    /// the next read or write.
    pub fn begin_lazy_handshake(&self) -> Result<(), Error> {
        self.require_engine()?;
        self.shared.lock().lazy_handshake = true;
        Ok(())
    }

    fn require_engine(&self) -> Result<(), Error> {
        if !self.shared.engine_backed {
            return Err(Error::Unsupported { kind: "plain" });
        }
        Ok(())
    }
}

// ============================================================================
// Timers and Metrics
// ============================================================================

impl Session {
    /// Calls [`Handler::timer`] with `event` after `delay`.
    pub fn schedule_timer(&self, delay: Duration, event: u64) -> TimerHandle {
        let Some(link) = self.shared.link() else {
            return TimerHandle::detached();
        };
        let id = link.handle.next_timer_id();
        let task = LoopTask::ScheduleTimer {
            id,
            token: link.token,
            delay,
            event,
        };
        if let Err(err) = link.handle.submit(task) {
            debug!(id = self.id(), ?err, "Timer not scheduled");
        }
        TimerHandle::new(id, link.handle.clone())
    }

    pub fn read_bytes(&self) -> u64 {
        self.shared.counters.read_bytes()
    }

    pub fn written_bytes(&self) -> u64 {
        self.shared.counters.written_bytes()
    }

    /// Read and write throughput in bytes per second.
    pub fn throughputs(&self) -> (f64, f64) {
        self.shared.counters.throughputs()
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.shared.id)
            .field("name", &self.shared.name)
            .field("kind", &self.shared.kind)
            .finish()
    }
}

impl PartialEq for Session {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}

impl Eq for Session {}
