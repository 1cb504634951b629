//! Per-session I/O on the loop thread.

use super::timer::{TimerKind, Timers};
use super::{LoopHandle, LoopTask, SessionOp, TaskExecutor, Transport};
use crate::buffer::{Buffer, OutQueue};
use crate::engine::driver::{DriverOutput, EngineDriver};
use crate::engine::{DelegatedTask, Engine};
use crate::error::{CloseAction, Error, IncidentKind};
use crate::session::{
    ClosingState, DataEvent, EventValidator, Handler, Session, SessionEvent, SessionKind,
};
use bytes::{Buf, Bytes};
use mio::event::Event;
use mio::{Interest, Registry, Token};
use std::collections::VecDeque;
use std::io::{self, ErrorKind, IoSlice};
use std::net::SocketAddr;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{debug, error, info, trace, warn};

/// Loop resources a session needs while it is being serviced.
pub(super) struct Context<'a> {
    pub(super) registry: &'a Registry,
    pub(super) timers: &'a mut Timers,
    pub(super) executor: &'a Arc<dyn TaskExecutor>,
    pub(super) handle: &'a LoopHandle,
}

/// A registered session as the loop sees it.
pub(super) struct SessionEntry {
    pub(super) session: Session,
    token: Token,
    transport: Box<dyn Transport>,
    // Dropped after ENDING.
    handler: Option<Box<dyn Handler>>,
    driver: Option<EngineDriver>,
    validator: EventValidator,
    interest: Interest,
    connected: bool,
    eof: bool,
    // Application bytes waiting for the handler's framing.
    inbound: Buffer,
    // Network bytes produced by the engine, not yet written.
    outbound: VecDeque<(Option<SocketAddr>, Bytes)>,
    outputs: VecDeque<DriverOutput>,
    last_peer: Option<SocketAddr>,
    close_after_flush: bool,
    handshake_timer: Option<u64>,
    finished: bool,
}

impl SessionEntry {
    pub(super) fn new(
        token: Token,
        session: Session,
        transport: Box<dyn Transport>,
        handler: Box<dyn Handler>,
        engine: Option<Box<dyn Engine>>,
        interest: Interest,
        connected: bool,
    ) -> Self {
        let shared = &session.shared;
        let capacity = match shared.kind {
            SessionKind::Stream => shared.config.min_in_buffer_capacity,
            SessionKind::Datagram => shared.config.max_datagram_size,
        };
        let inbound = shared.allocator.allocate(capacity);
        let driver = engine
            .map(|engine| EngineDriver::new(engine, shared.allocator.clone(), &shared.config));

        Self {
            session,
            token,
            transport,
            handler: Some(handler),
            driver,
            validator: EventValidator::default(),
            interest,
            connected,
            eof: false,
            inbound,
            outbound: VecDeque::new(),
            outputs: VecDeque::new(),
            last_peer: None,
            close_after_flush: false,
            handshake_timer: None,
            finished: false,
        }
    }

    fn id(&self) -> u64 {
        self.session.id()
    }

    pub(super) fn is_finished(&self) -> bool {
        self.finished
    }

    /// Moves the channel from one poll to another.
    pub(super) fn move_to(&mut self, from: &Registry, to: &Registry, token: Token) -> io::Result<()> {
        if self.finished {
            return Ok(());
        }
        from.deregister(&mut *self.transport)?;
        to.register(&mut *self.transport, token, self.interest)
    }

    // ============================================================================
    // Lifecycle
    // ============================================================================

    pub(super) fn open(&mut self, cx: &mut Context<'_>) {
        info!(
            id = self.id(),
            name = self.session.name(),
            kind = self.session.kind().name(),
            local_addr = ?self.session.local_addr(),
            peer_addr = ?self.session.peer_addr(),
            engine = self.driver.is_some(),
            "Session registered"
        );
        self.fire_event(SessionEvent::Created);
        if let Some(Err(err)) = self.driver.as_mut().map(EngineDriver::init) {
            error!(id = self.id(), ?err, "Engine initialization failed");
            self.fire_exception(err);
            return;
        }
        if self.connected {
            self.opened(cx);
        }
    }

    fn opened(&mut self, cx: &mut Context<'_>) {
        self.fire_event(SessionEvent::Opened);
        if let Some(driver) = self.driver.as_mut() {
            driver.request_handshake();
        } else {
            self.fire_event(SessionEvent::Ready);
        }
        self.process(cx);
    }

    fn finish_connect(&mut self, cx: &mut Context<'_>) {
        let failure = match self.transport.take_error() {
            Ok(None) => match self.transport.peer_addr() {
                Ok(peer_addr) => {
                    info!(id = self.id(), %peer_addr, "Connection established");
                    self.connected = true;
                    self.opened(cx);
                    return;
                }
                // Not connected yet.
                Err(err) if err.kind() == ErrorKind::NotConnected => return,
                Err(err) => err,
            },
            Ok(Some(err)) | Err(err) => err,
        };
        if failure.kind() == ErrorKind::ConnectionRefused {
            info!(id = self.id(), "Connection refused");
        } else {
            warn!(id = self.id(), err = ?failure, "Connection failed");
        }
        self.fire_exception(failure.into());
    }

    /// Closes the channel and retires the session.
    pub(super) fn finish(&mut self, cx: &mut Context<'_>) {
        if self.finished {
            return;
        }
        self.finished = true;
        {
            let mut state = self.session.shared.lock();
            state.closing.advance(ClosingState::Finished);
            state.abandon(self.session.id());
        }
        if let Err(err) = cx.registry.deregister(&mut *self.transport) {
            debug!(id = self.id(), ?err, "Failed to deregister channel");
        }
        self.transport.shutdown();
        cx.timers.cancel_session(self.token);

        info!(
            id = self.id(),
            read = self.session.read_bytes(),
            written = self.session.written_bytes(),
            "Session closed"
        );
        self.fire_event(SessionEvent::Closed);
        self.fire_event(SessionEvent::Ending);
        if let Some(driver) = self.driver.as_mut() {
            driver.cleanup();
        }
        self.handler = None;
    }

    fn maybe_finish(&mut self, cx: &mut Context<'_>) {
        if self.finished {
            return;
        }
        let closing = self.session.closing_state();
        let done = match self.driver {
            Some(_) => {
                closing == ClosingState::Finished
                    || (self.close_after_flush && self.outbound.is_empty())
            }
            None => match closing {
                ClosingState::None => false,
                ClosingState::Sending => self.session.pending_out() == 0,
                ClosingState::Finishing | ClosingState::Finished => true,
            },
        };
        if done {
            self.finish(cx);
        }
    }

    // ============================================================================
    // Events
    // ============================================================================

    fn fire_event(&mut self, event: SessionEvent) {
        if !self.validator.event(event) {
            trace!(id = self.id(), ?event, "Event out of order, suppressed");
            return;
        }
        debug!(id = self.id(), ?event, "Session event");
        if let Some(handler) = self.handler.as_mut() {
            handler.event(&self.session, event);
        }
    }

    fn fire_data(&mut self, event: DataEvent, len: usize) {
        if !self.validator.data() {
            return;
        }
        if let Some(handler) = self.handler.as_mut() {
            handler.data_event(&self.session, event, len);
        }
    }

    /// Reports `err` to the handler once, then closes the session as the
    /// error's close action says.
    pub(super) fn fire_exception(&mut self, err: Error) {
        let action = err.close_action();
        if self.validator.exception(action != CloseAction::None) {
            debug!(id = self.id(), %err, ?action, "Session exception");
            if let Some(handler) = self.handler.as_mut() {
                handler.exception(&self.session, &err);
            }
        } else {
            trace!(id = self.id(), %err, "Exception suppressed");
        }
        match action {
            CloseAction::Default => self.session.quick_close(),
            CloseAction::Gentle => self.session.close(),
            CloseAction::None => {}
        }
    }

    fn fire_incident(&mut self, kind: IncidentKind, cause: &Error) -> bool {
        let handled = match self.handler.as_mut() {
            Some(handler) => handler.incident(&self.session, kind, cause),
            None => false,
        };
        if !handled {
            warn!(id = self.id(), ?kind, %cause, "Unhandled incident");
        }
        handled
    }

    pub(super) fn timer(&mut self, kind: TimerKind, cx: &mut Context<'_>) {
        match kind {
            TimerKind::User(event) => {
                if !self.session.is_open() {
                    let cause = Error::SessionClosed { id: self.id() };
                    self.fire_incident(IncidentKind::SessionTimeout, &cause);
                    return;
                }
                if let Some(handler) = self.handler.as_mut() {
                    handler.timer(&self.session, event);
                }
            }
            TimerKind::HandshakeTimeout => {
                self.handshake_timer = None;
                let timeout_ms = self
                    .session
                    .config()
                    .handshake_timeout
                    .map_or(0, |timeout| timeout.as_millis() as u64);
                if let Some(driver) = self.driver.as_mut() {
                    if !driver.is_ready() {
                        warn!(id = self.session.id(), timeout_ms, "Handshake timed out");
                        let err = Error::HandshakeTimeout { timeout_ms };
                        driver.fail(err, &self.session.shared, &mut self.outputs);
                        self.apply_outputs(cx);
                    }
                }
            }
            TimerKind::Engine => {
                if let Some(driver) = self.driver.as_mut() {
                    driver.timer_expired(&self.session.shared, &mut self.outputs);
                    self.apply_outputs(cx);
                }
            }
        }
    }

    // ============================================================================
    // Readiness
    // ============================================================================

    pub(super) fn ready(&mut self, event: &Event, cx: &mut Context<'_>) {
        if !self.connected {
            if event.is_writable() || event.is_error() || event.is_write_closed() {
                self.finish_connect(cx);
            }
            return;
        }
        if event.is_readable() || event.is_read_closed() {
            self.read(cx);
        }
        if !self.finished && event.is_writable() {
            self.flush(cx);
        }
    }

    /// Runs the queued work of the session: closing transitions, the engine
    /// and the flush of queued data.
    pub(super) fn process(&mut self, cx: &mut Context<'_>) {
        if self.finished {
            return;
        }
        let closing = {
            let mut state = self.session.shared.lock();
            state.scheduled = false;
            state.closing
        };
        if closing == ClosingState::Finished {
            self.finish(cx);
            return;
        }
        if !self.connected {
            if closing != ClosingState::None {
                self.finish(cx);
            }
            return;
        }
        if self.driver.is_some() {
            self.run_driver(cx);
        } else {
            self.flush(cx);
        }
    }

    pub(super) fn begin_handshake(&mut self, cx: &mut Context<'_>) {
        if self.finished || !self.connected {
            return;
        }
        if let Some(driver) = self.driver.as_mut() {
            driver.request_handshake();
            self.run_driver(cx);
        }
    }

    pub(super) fn task_done(&mut self, result: Result<(), Error>, cx: &mut Context<'_>) {
        if let Some(driver) = self.driver.as_mut() {
            driver.task_done(result, &self.session.shared, &mut self.outputs);
            self.apply_outputs(cx);
        }
    }

    // ============================================================================
    // Reading
    // ============================================================================

    fn can_read(&self) -> bool {
        if self.finished || !self.connected || self.eof {
            return false;
        }
        let state = self.session.shared.lock();
        if state.read_suspended {
            return false;
        }
        match &self.driver {
            Some(driver) => !driver.is_halted(),
            None => state.closing < ClosingState::Finishing,
        }
    }

    /// Reads until the channel would block, the session suspends reading or
    /// it closes.
    pub(super) fn read(&mut self, cx: &mut Context<'_>) {
        while self.can_read() {
            match self.recv() {
                Ok((0, _)) if self.session.kind() == SessionKind::Stream => {
                    self.peer_closed(cx);
                    break;
                }
                Ok((count, addr)) => {
                    self.session.shared.counters.record_read(count);
                    self.fire_data(DataEvent::Received, count);
                    self.received(addr, cx);
                }
                Err(err) if err.is_would_block() => break,
                Err(Error::Io(err)) if err.kind() == ErrorKind::Interrupted => continue,
                Err(Error::Io(err)) => {
                    if matches!(err.kind(), ErrorKind::ConnectionReset | ErrorKind::BrokenPipe) {
                        warn!(id = self.id(), ?err, "Connection lost while reading");
                    } else {
                        error!(id = self.id(), ?err, "Read failed");
                    }
                    self.transport_failed(err, cx);
                    break;
                }
                Err(err) => {
                    error!(id = self.id(), ?err, "Read failed");
                    self.fire_exception(err);
                    break;
                }
            }
        }
        self.update_interest(cx);
        self.maybe_finish(cx);
    }

    fn recv(&mut self) -> Result<(usize, Option<SocketAddr>), Error> {
        let buffer = match self.driver.as_mut() {
            Some(driver) => driver.inbound_space()?,
            None => {
                if self.session.shared.kind == SessionKind::Stream {
                    make_room(&self.session, &mut self.inbound, 1)?;
                }
                &mut self.inbound
            }
        };
        let (count, addr) = self.transport.recv(buffer.writable())?;
        buffer.advance_mut(count);
        Ok((count, addr))
    }

    fn peer_closed(&mut self, cx: &mut Context<'_>) {
        self.eof = true;
        debug!(id = self.id(), "Peer closed its side");
        match self.driver.as_mut() {
            Some(driver) => {
                driver.peer_closed(&self.session.shared, &mut self.outputs);
                self.apply_outputs(cx);
            }
            None => self.session.close(),
        }
    }

    fn received(&mut self, addr: Option<SocketAddr>, cx: &mut Context<'_>) {
        if addr.is_some() {
            self.last_peer = addr;
        }
        if self.driver.is_some() {
            self.run_driver(cx);
            return;
        }
        match self.session.kind() {
            SessionKind::Stream => self.deliver_stream(),
            SessionKind::Datagram => {
                let data = self.inbound.to_bytes();
                self.inbound.clear();
                self.deliver_datagram(&data);
            }
        }
    }

    /// Hands complete frames of the inbound buffer to the handler.
    fn deliver_stream(&mut self) {
        loop {
            if self.session.closing_state() >= ClosingState::Finishing {
                break;
            }
            let Some(handler) = self.handler.as_mut() else {
                break;
            };
            let data = self.inbound.readable();
            if data.is_empty() {
                break;
            }
            let available = data.len();
            let frame = handler.available(data);
            if frame == 0 {
                break;
            }
            if frame > available {
                let err = Error::Framing {
                    reported: frame,
                    available,
                };
                if self.fire_incident(IncidentKind::DecodingFailure, &err) {
                    self.inbound.clear();
                } else {
                    self.fire_exception(err);
                }
                break;
            }
            let result = handler.read(&self.session, &data[..frame]);
            self.inbound.advance(frame);
            if let Err(err) = result {
                self.fire_exception(err);
            }
        }
    }

    fn deliver_datagram(&mut self, data: &[u8]) {
        let unconnected = self.session.peer_addr().is_none();
        let result = match (self.handler.as_mut(), self.last_peer) {
            (Some(handler), Some(peer)) if unconnected => {
                handler.read_from(&self.session, data, peer)
            }
            (Some(handler), _) => handler.read(&self.session, data),
            (None, _) => Ok(()),
        };
        if let Err(err) = result {
            self.fire_exception(err);
        }
    }

    fn deliver_application(&mut self, data: Bytes) {
        match self.session.kind() {
            SessionKind::Stream => match make_room(&self.session, &mut self.inbound, data.len()) {
                Ok(()) => {
                    self.inbound.put_slice(&data);
                    self.deliver_stream();
                }
                Err(err) => self.fire_exception(err),
            },
            SessionKind::Datagram => self.deliver_datagram(&data),
        }
    }

    // ============================================================================
    // Engine
    // ============================================================================

    fn run_driver(&mut self, cx: &mut Context<'_>) {
        let lazy = std::mem::take(&mut self.session.shared.lock().lazy_handshake);
        if let Some(driver) = self.driver.as_mut() {
            if lazy {
                driver.request_handshake();
            }
            driver.run(&self.session.shared, &mut self.outputs);
        }
        self.apply_outputs(cx);
    }

    fn apply_outputs(&mut self, cx: &mut Context<'_>) {
        while let Some(output) = self.outputs.pop_front() {
            match output {
                DriverOutput::Transmit { addr, data } => self.outbound.push_back((addr, data)),
                DriverOutput::Deliver(data) => self.deliver_application(data),
                DriverOutput::HandshakeStarted => self.arm_handshake_timeout(cx),
                DriverOutput::Ready => {
                    if let Some(id) = self.handshake_timer.take() {
                        cx.timers.cancel(id);
                    }
                    self.fire_event(SessionEvent::Ready);
                }
                DriverOutput::Exception(err) => self.fire_exception(err),
                DriverOutput::Incident(kind, cause) => {
                    self.fire_incident(kind, &cause);
                }
                DriverOutput::CloseTransport => self.close_after_flush = true,
                DriverOutput::SpawnTask(task) => self.spawn(task, cx),
                DriverOutput::ScheduleTimer(delay) => {
                    let id = cx.handle.next_timer_id();
                    cx.timers.schedule(id, delay, self.token, TimerKind::Engine);
                }
            }
        }
        self.flush(cx);
    }

    fn arm_handshake_timeout(&mut self, cx: &mut Context<'_>) {
        let Some(timeout) = self.session.config().handshake_timeout else {
            return;
        };
        if self.handshake_timer.is_none() {
            let id = cx.handle.next_timer_id();
            cx.timers
                .schedule(id, timeout, self.token, TimerKind::HandshakeTimeout);
            self.handshake_timer = Some(id);
        }
    }

    fn spawn(&mut self, task: DelegatedTask, cx: &mut Context<'_>) {
        let handle = cx.handle.clone();
        let token = self.token;
        let id = self.id();
        trace!(id, "Delegating engine task");
        let spawned = cx.executor.execute(Box::new(move || {
            let result = run_task(task);
            let done = LoopTask::Session {
                token,
                op: SessionOp::TaskDone(result),
            };
            if let Err(err) = handle.submit(done) {
                debug!(id, ?err, "Task finished after the loop closed");
            }
        }));
        if let Err(err) = spawned {
            error!(id, ?err, "Failed to execute delegated task");
            if let Some(driver) = self.driver.as_mut() {
                let failure = Error::DelegatedTask(err.to_string());
                driver.task_done(Err(failure), &self.session.shared, &mut self.outputs);
            }
        }
    }

    // ============================================================================
    // Writing
    // ============================================================================

    fn flush(&mut self, cx: &mut Context<'_>) {
        if self.finished || !self.connected {
            return;
        }
        let (written, failure) = if self.driver.is_some() {
            self.flush_transmits()
        } else {
            self.flush_queue()
        };
        if written > 0 {
            self.session.shared.counters.record_written(written);
            self.fire_data(DataEvent::Sent, written);
        }
        if let Some(err) = failure {
            if matches!(err.kind(), ErrorKind::BrokenPipe | ErrorKind::ConnectionReset) {
                warn!(id = self.id(), ?err, "Connection lost while writing");
            } else {
                error!(id = self.id(), ?err, "Write failed");
            }
            self.transport_failed(err, cx);
        }
        self.update_interest(cx);
        self.maybe_finish(cx);
    }

    // The channel is unusable, so no close message can reach the peer.
    fn transport_failed(&mut self, err: io::Error, cx: &mut Context<'_>) {
        self.fire_exception(err.into());
        self.finish(cx);
    }

    // Writes the session's queue directly. Completions resolve as their
    // bytes reach the channel.
    fn flush_queue(&mut self) -> (usize, Option<io::Error>) {
        let mut written = 0;
        let mut failure = None;
        let mut state = self.session.shared.lock();
        if state.write_suspended {
            return (0, None);
        }
        match &mut state.out {
            OutQueue::Stream(buffers) => loop {
                let result = {
                    let slices = buffers.io_slices();
                    if slices.is_empty() {
                        break;
                    }
                    self.transport.send(&slices, None)
                };
                match result {
                    Ok(0) => break,
                    Ok(count) => {
                        buffers.consume(count);
                        written += count;
                    }
                    Err(err) if err.kind() == ErrorKind::WouldBlock => break,
                    Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                    Err(err) => {
                        failure = Some(err);
                        break;
                    }
                }
            },
            OutQueue::Datagram(records) => loop {
                let Some(record) = records.front() else {
                    break;
                };
                let len = record.payload.len();
                let result = self
                    .transport
                    .send(&[IoSlice::new(record.payload.readable())], record.addr);
                match result {
                    Ok(_) => {
                        records.pop_front();
                        written += len;
                    }
                    Err(err) if err.kind() == ErrorKind::WouldBlock => break,
                    Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                    Err(err) => {
                        records.pop_front();
                        failure = Some(err);
                        break;
                    }
                }
            },
        }
        state.net_counter += written as u64;
        let counter = state.net_counter;
        state.completions.complete(counter);
        (written, failure)
    }

    // Writes the network bytes the engine produced.
    fn flush_transmits(&mut self) -> (usize, Option<io::Error>) {
        let datagram = self.transport.kind() == SessionKind::Datagram;
        let mut written = 0;
        while let Some((addr, data)) = self.outbound.front_mut() {
            match self.transport.send(&[IoSlice::new(&data[..])], *addr) {
                Ok(count) if datagram || count == data.len() => {
                    written += count;
                    self.outbound.pop_front();
                }
                Ok(0) => break,
                Ok(count) => {
                    written += count;
                    data.advance(count);
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => {
                    self.outbound.clear();
                    return (written, Some(err));
                }
            }
        }
        (written, None)
    }

    fn update_interest(&mut self, cx: &mut Context<'_>) {
        if self.finished || !self.connected {
            return;
        }
        let pending = match self.driver {
            Some(_) => !self.outbound.is_empty(),
            None => {
                let state = self.session.shared.lock();
                !state.out.is_empty() && !state.write_suspended
            }
        };
        let interest = if pending {
            Interest::READABLE | Interest::WRITABLE
        } else {
            Interest::READABLE
        };
        if interest == self.interest {
            return;
        }
        self.interest = interest;
        if let Err(err) = cx
            .registry
            .reregister(&mut *self.transport, self.token, interest)
        {
            error!(id = self.id(), ?err, "Failed to update interest");
            self.fire_exception(err.into());
        }
    }
}

// A panicking task fails like a task returning an error.
fn run_task(task: DelegatedTask) -> Result<(), Error> {
    match panic::catch_unwind(AssertUnwindSafe(|| task.run())) {
        Ok(result) => result,
        Err(payload) => {
            let message = payload
                .downcast_ref::<&str>()
                .map(|message| message.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "task panicked".to_string());
            Err(Error::DelegatedTask(message))
        }
    }
}

/// Compacts `buffer` and grows it until `needed` more bytes fit, up to the
/// session's maximum inbound capacity.
fn make_room(session: &Session, buffer: &mut Buffer, needed: usize) -> Result<(), Error> {
    buffer.compact();
    if buffer.remaining_mut() >= needed {
        return Ok(());
    }
    let max = session.config().max_in_buffer_capacity;
    let required = buffer.len() + needed;
    if required > max {
        return Err(Error::IncorrectFragmentSize {
            buffer: "application",
            max,
        });
    }
    let capacity = (buffer.capacity() * 2).max(required).min(max);
    session.shared.allocator.extend(buffer, capacity);
    Ok(())
}
