//! Engine driver: runs an [`Engine`] against a session's queues.
//!
//! The driver performs no I/O. Each call appends [`DriverOutput`]s describing
//! what the loop has to do next (transmit network bytes, deliver application
//! bytes, fire events, spawn tasks, arm timers, close the channel).

use super::{DelegatedTask, Engine, EngineResult, EngineStatus, HandshakeStatus};
use crate::buffer::{Buffer, BufferAllocator, OutQueue};
use crate::error::{Error, IncidentKind};
use crate::session::shared::SessionShared;
use crate::session::{ClosingState, Handshake, SessionConfig};
use bytes::Bytes;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

/// Work the loop has to carry out for the driver.
#[derive(Debug)]
pub(crate) enum DriverOutput {
    /// Network bytes for the channel, in order.
    Transmit {
        addr: Option<SocketAddr>,
        data: Bytes,
    },
    /// Application bytes for the handler.
    Deliver(Bytes),
    /// `begin_handshake` was called on the engine.
    HandshakeStarted,
    /// The first handshake completed.
    Ready,
    Exception(Error),
    Incident(IncidentKind, Error),
    /// Close the channel once all transmitted bytes are written.
    CloseTransport,
    SpawnTask(DelegatedTask),
    ScheduleTimer(Duration),
}

pub(crate) struct EngineDriver {
    engine: Box<dyn Engine>,
    allocator: Arc<dyn BufferAllocator>,
    in_net: Buffer,
    in_app: Buffer,
    out_net: Buffer,
    handshake: Handshake,
    // Filled by the last wrap/unwrap when it reported `Finished`.
    status_slot: Option<HandshakeStatus>,
    ready: bool,
    wrap_requested: bool,
    inbound_closed: bool,
    outbound_closed: bool,
    transport_closing: bool,
    failed: bool,
    tasks_in_flight: usize,
    timer_pending: bool,
    loops_threshold: usize,
    wait_for_inbound_close: bool,
    quickly_close_on_failure: bool,
}

impl EngineDriver {
    pub(crate) fn new(
        engine: Box<dyn Engine>,
        allocator: Arc<dyn BufferAllocator>,
        config: &SessionConfig,
    ) -> Self {
        let in_net = allocator.allocate(engine.min_network_buffer_size());
        let in_app = allocator.allocate(engine.min_application_buffer_size());
        let out_net = allocator.allocate(engine.min_network_buffer_size());
        Self {
            engine,
            allocator,
            in_net,
            in_app,
            out_net,
            handshake: Handshake::None,
            status_slot: None,
            ready: false,
            wrap_requested: false,
            inbound_closed: false,
            outbound_closed: false,
            transport_closing: false,
            failed: false,
            tasks_in_flight: 0,
            timer_pending: false,
            loops_threshold: config.handshake_loops_threshold,
            wait_for_inbound_close: config.wait_for_inbound_close,
            quickly_close_on_failure: config.quickly_close_engine_on_failure,
        }
    }

    pub(crate) fn init(&mut self) -> Result<(), Error> {
        self.engine.init()
    }

    pub(crate) fn cleanup(&mut self) {
        self.engine.cleanup();
    }

    /// Requests `begin_handshake` for the next run. A handshake that is
    /// already requested or running is left alone.
    pub(crate) fn request_handshake(&mut self) {
        if self.handshake == Handshake::None {
            self.handshake = Handshake::Requested;
        }
    }

    pub(crate) fn is_ready(&self) -> bool {
        self.ready
    }

    pub(crate) fn is_halted(&self) -> bool {
        self.failed || self.transport_closing
    }

    /// Buffer for incoming network bytes, compacted and with room to read
    /// into. Fails once the buffer is full at the engine's maximum.
    pub(crate) fn inbound_space(&mut self) -> Result<&mut Buffer, Error> {
        self.in_net.compact();
        if self.in_net.remaining_mut() == 0 {
            let max = self.engine.max_network_buffer_size();
            let capacity = self.in_net.capacity();
            if capacity >= max {
                return Err(Error::IncorrectFragmentSize {
                    buffer: "network",
                    max,
                });
            }
            self.allocator
                .extend(&mut self.in_net, (capacity * 2).clamp(1, max));
        }
        Ok(&mut self.in_net)
    }

    /// Drives the engine until it makes no more progress.
    pub(crate) fn run(&mut self, shared: &SessionShared, out: &mut VecDeque<DriverOutput>) {
        if self.is_halted() {
            return;
        }
        if let Err(err) = self.drive(shared, out) {
            self.fail(err, shared, out);
        }
    }

    /// Resumes after a delegated task finished on the executor.
    pub(crate) fn task_done(
        &mut self,
        result: Result<(), Error>,
        shared: &SessionShared,
        out: &mut VecDeque<DriverOutput>,
    ) {
        self.tasks_in_flight = self.tasks_in_flight.saturating_sub(1);
        match result {
            Ok(()) if self.tasks_in_flight == 0 => self.run(shared, out),
            Ok(()) => {}
            Err(err) => self.fail(err, shared, out),
        }
    }

    /// Resumes after the delay requested through `ScheduleTimer`.
    pub(crate) fn timer_expired(&mut self, shared: &SessionShared, out: &mut VecDeque<DriverOutput>) {
        self.timer_pending = false;
        if self.is_halted() {
            return;
        }
        self.engine.timer_expired();
        self.run(shared, out);
    }

    /// The peer closed the channel.
    pub(crate) fn peer_closed(&mut self, shared: &SessionShared, out: &mut VecDeque<DriverOutput>) {
        if self.is_halted() {
            return;
        }
        self.inbound_closed = true;
        if !self.engine.is_inbound_done() {
            if let Err(err) = self.engine.close_inbound() {
                out.push_back(DriverOutput::Incident(
                    IncidentKind::ClosedWithoutCloseMessage,
                    err,
                ));
            }
        }
        shared.lock().closing.advance(ClosingState::Sending);
        self.run(shared, out);
    }

    /// Fires `err`, first wrapping the engine's alert unless configured to
    /// close quickly.
    pub(crate) fn fail(&mut self, err: Error, shared: &SessionShared, out: &mut VecDeque<DriverOutput>) {
        if self.failed {
            return;
        }
        self.failed = true;
        if !self.quickly_close_on_failure
            && !self.transport_closing
            && self.engine.handshake_status() == HandshakeStatus::NeedWrap
        {
            debug!(id = shared.id, ?err, "Delaying exception until the close message is wrapped");
            self.flush_alert(shared, out);
        }
        out.push_back(DriverOutput::Exception(err));
        self.close_transport(out);
    }
}

// ============================================================================
// Driver Loop
// ============================================================================

impl EngineDriver {
    fn drive(&mut self, shared: &SessionShared, out: &mut VecDeque<DriverOutput>) -> Result<(), Error> {
        if self.handshake == Handshake::Requested {
            self.handshake = Handshake::Started;
            out.push_back(DriverOutput::HandshakeStarted);
            self.engine.begin_handshake()?;
        }
        self.begin_close(shared);

        let mut loops = 0;
        while !self.transport_closing {
            let status = match self.status_slot.take() {
                Some(status) => status,
                None => self.engine.handshake_status(),
            };
            if status.is_handshaking() && (!self.ready || self.handshake == Handshake::Started) {
                loops += 1;
                if loops > self.loops_threshold {
                    return Err(Error::HandshakeLoopsThreshold {
                        loops: self.loops_threshold,
                    });
                }
            }
            trace!(id = shared.id, ?status, loops, "Driving engine");

            let progress = match status {
                HandshakeStatus::Finished => {
                    self.finish_handshake(out);
                    true
                }
                HandshakeStatus::NotHandshaking => self.idle(shared, out)?,
                HandshakeStatus::NeedWrap => self.wrap(shared, out)?,
                HandshakeStatus::NeedUnwrap => self.unwrap(false, shared, out)?,
                HandshakeStatus::NeedUnwrapAgain => self.unwrap(true, shared, out)?,
                HandshakeStatus::NeedTask => {
                    self.spawn_tasks(out);
                    false
                }
                HandshakeStatus::NeedTimer => self.engine_timer(out),
            };
            if !progress {
                if self.outbound_closed
                    && !self.transport_closing
                    && awaits_peer(self.engine.handshake_status())
                {
                    self.abandon_handshake(shared, out)?;
                }
                break;
            }
        }
        Ok(())
    }

    // A close request closes the engine's outbound side, whatever it is
    // waiting for, so it can produce its close message.
    fn begin_close(&mut self, shared: &SessionShared) {
        let mut state = shared.lock();
        if state.closing == ClosingState::Sending && state.out.is_empty() {
            state.closing.advance(ClosingState::Finishing);
        }
        if state.closing >= ClosingState::Finishing && !self.outbound_closed {
            drop(state);
            debug!(id = shared.id, "Closing engine outbound");
            self.outbound_closed = true;
            self.engine.close_outbound();
        }
    }

    // The engine is closed for output but still waits on the peer or a task.
    // Whatever close message it has is sent, then the channel closes.
    fn abandon_handshake(
        &mut self,
        shared: &SessionShared,
        out: &mut VecDeque<DriverOutput>,
    ) -> Result<(), Error> {
        debug!(id = shared.id, "Closing while the engine waits on the peer");
        if !self.engine.is_outbound_done() {
            self.wrap(shared, out)?;
        }
        self.close_transport(out);
        Ok(())
    }

    fn idle(&mut self, shared: &SessionShared, out: &mut VecDeque<DriverOutput>) -> Result<bool, Error> {
        let mut progress = false;
        if !self.in_net.is_empty() && !self.inbound_closed {
            progress |= self.unwrap(false, shared, out)?;
        }

        let (wrap, closed) = {
            let state = shared.lock();
            let outbound_done = self.engine.is_outbound_done();
            let wrap = (!state.out.is_empty() && !state.write_suspended)
                || self.wrap_requested
                || !self.ready
                || state.closing == ClosingState::Sending
                || (state.closing >= ClosingState::Finishing && !outbound_done);
            (wrap, state.closing >= ClosingState::Finishing && outbound_done)
        };
        if wrap && !self.transport_closing {
            progress |= self.wrap(shared, out)?;
        } else if closed {
            self.outbound_done(out);
            return Ok(false);
        }

        // Engines without a handshake are ready as soon as they are idle.
        if !self.ready
            && self.status_slot.is_none()
            && self.engine.handshake_status() == HandshakeStatus::NotHandshaking
        {
            self.finish_handshake(out);
            progress = true;
        }
        Ok(progress)
    }

    fn finish_handshake(&mut self, out: &mut VecDeque<DriverOutput>) {
        self.handshake = Handshake::None;
        self.status_slot = None;
        if !self.ready {
            self.ready = true;
            out.push_back(DriverOutput::Ready);
        }
    }

    fn spawn_tasks(&mut self, out: &mut VecDeque<DriverOutput>) {
        while let Some(task) = self.engine.delegated_task() {
            self.tasks_in_flight += 1;
            out.push_back(DriverOutput::SpawnTask(task));
        }
        if self.tasks_in_flight == 0 {
            trace!("Engine needs a task but provided none");
        }
    }

    fn engine_timer(&mut self, out: &mut VecDeque<DriverOutput>) -> bool {
        if self.timer_pending {
            return false;
        }
        match self.engine.timer_delay() {
            Some(delay) if !delay.is_zero() => {
                self.timer_pending = true;
                out.push_back(DriverOutput::ScheduleTimer(delay));
                false
            }
            _ => {
                self.engine.timer_expired();
                true
            }
        }
    }
}

// ============================================================================
// Wrap and Unwrap
// ============================================================================

impl EngineDriver {
    fn wrap(&mut self, shared: &SessionShared, out: &mut VecDeque<DriverOutput>) -> Result<bool, Error> {
        self.begin_close(shared);
        let mut state = shared.lock();
        let addr = match &state.out {
            OutQueue::Datagram(records) => records.front().and_then(|record| record.addr),
            OutQueue::Stream(_) => None,
        };
        let result = {
            let sources = if state.write_suspended || self.outbound_closed {
                Vec::new()
            } else {
                state.out.sources()
            };
            self.engine.wrap(&sources, self.out_net.writable())?
        };
        trace!(id = shared.id, ?result, "Wrapped");
        self.wrap_requested = false;

        if result.bytes_consumed > 0 {
            state.out.consume(result.bytes_consumed);
            state.net_counter += result.bytes_consumed as u64;
        }
        self.note_finished(&result);
        if result.bytes_produced > 0 {
            self.out_net.advance_mut(result.bytes_produced);
            out.push_back(DriverOutput::Transmit {
                addr,
                data: self.out_net.to_bytes(),
            });
            self.out_net.clear();
            let counter = state.net_counter;
            state.completions.complete(counter);
        }
        drop(state);

        let progress = result.bytes_consumed > 0 || result.bytes_produced > 0;
        match result.status {
            EngineStatus::Ok => Ok(progress),
            EngineStatus::BufferOverflow => {
                let max = self.engine.max_network_buffer_size();
                grow(&*self.allocator, &mut self.out_net, max, "network")?;
                Ok(true)
            }
            EngineStatus::BufferUnderflow => Err(Error::UnexpectedEngineStatus {
                status: result.status.name(),
                operation: "wrap",
            }),
            EngineStatus::Closed => {
                self.outbound_done(out);
                Ok(false)
            }
        }
    }

    fn unwrap(
        &mut self,
        again: bool,
        shared: &SessionShared,
        out: &mut VecDeque<DriverOutput>,
    ) -> Result<bool, Error> {
        if self.inbound_closed || (!again && self.in_net.is_empty()) {
            return Ok(false);
        }
        let result = {
            let src: &[u8] = if again { &[] } else { self.in_net.readable() };
            self.engine.unwrap(src, self.in_app.writable())?
        };
        trace!(id = shared.id, ?result, "Unwrapped");

        if !again && result.bytes_consumed > 0 {
            self.in_net.advance(result.bytes_consumed);
        }
        self.note_finished(&result);
        if result.bytes_produced > 0 {
            self.in_app.advance_mut(result.bytes_produced);
            out.push_back(DriverOutput::Deliver(self.in_app.to_bytes()));
            self.in_app.clear();
        }

        let progress = result.bytes_consumed > 0 || result.bytes_produced > 0;
        match result.status {
            EngineStatus::Ok => Ok(progress),
            EngineStatus::BufferOverflow => {
                let max = self.engine.max_application_buffer_size();
                grow(&*self.allocator, &mut self.in_app, max, "application")?;
                Ok(true)
            }
            EngineStatus::BufferUnderflow => {
                self.in_net.compact();
                if self.in_net.remaining_mut() == 0 {
                    let max = self.engine.max_network_buffer_size();
                    grow(&*self.allocator, &mut self.in_net, max, "network")?;
                }
                Ok(progress)
            }
            EngineStatus::Closed => {
                debug!(id = shared.id, "Engine inbound closed");
                self.inbound_closed = true;
                if self.engine.is_outbound_done() {
                    self.close_transport(out);
                    Ok(false)
                } else {
                    self.wrap_requested = true;
                    shared.lock().closing.advance(ClosingState::Sending);
                    Ok(true)
                }
            }
        }
    }

    fn note_finished(&mut self, result: &EngineResult) {
        if result.handshake_status == HandshakeStatus::Finished {
            self.status_slot = Some(HandshakeStatus::Finished);
        }
    }

    // The engine's outbound side is closed and its last bytes were queued.
    fn outbound_done(&mut self, out: &mut VecDeque<DriverOutput>) {
        if self.wait_for_inbound_close && !self.inbound_closed && !self.engine.is_inbound_done() {
            trace!("Waiting for the peer's close message");
            return;
        }
        self.close_transport(out);
    }

    fn close_transport(&mut self, out: &mut VecDeque<DriverOutput>) {
        if !self.transport_closing {
            self.transport_closing = true;
            out.push_back(DriverOutput::CloseTransport);
        }
    }

    fn flush_alert(&mut self, shared: &SessionShared, out: &mut VecDeque<DriverOutput>) {
        {
            let mut state = shared.lock();
            state.closing.advance(ClosingState::Finishing);
            state.abandon(shared.id);
        }
        for _ in 0..self.loops_threshold {
            match self.wrap(shared, out) {
                Ok(true) if !self.transport_closing => continue,
                Ok(_) => break,
                Err(err) => {
                    debug!(id = shared.id, ?err, "Failed to wrap the close message");
                    break;
                }
            }
        }
    }
}

fn awaits_peer(status: HandshakeStatus) -> bool {
    matches!(
        status,
        HandshakeStatus::NeedUnwrap
            | HandshakeStatus::NeedUnwrapAgain
            | HandshakeStatus::NeedTask
            | HandshakeStatus::NeedTimer
    )
}

// Grows `buffer` toward `max`; a buffer already at `max` cannot hold a
// complete fragment.
fn grow(
    allocator: &dyn BufferAllocator,
    buffer: &mut Buffer,
    max: usize,
    name: &'static str,
) -> Result<(), Error> {
    let capacity = buffer.capacity();
    if capacity >= max {
        return Err(Error::IncorrectFragmentSize { buffer: name, max });
    }
    allocator.extend(buffer, (capacity * 2).clamp(1, max));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{Session, SessionKind};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct Calls {
        wraps: AtomicUsize,
        unwraps: AtomicUsize,
        consumed: AtomicUsize,
    }

    /// Engine with a fixed script, shared with the test through `status`.
    struct MockEngine {
        status: Arc<Mutex<HandshakeStatus>>,
        calls: Arc<Calls>,
        // Status after a wrap that produced bytes.
        after_wrap: Option<HandshakeStatus>,
        produce: usize,
        consume_limit: usize,
        unwrap_overflow: bool,
        unwrap_error: bool,
        closing: bool,
        outbound_done: bool,
        tasks: Vec<DelegatedTask>,
        min_size: usize,
        max_size: usize,
    }

    impl MockEngine {
        fn new(status: HandshakeStatus) -> Self {
            Self {
                status: Arc::new(Mutex::new(status)),
                calls: Arc::new(Calls::default()),
                after_wrap: None,
                produce: 0,
                consume_limit: usize::MAX,
                unwrap_overflow: false,
                unwrap_error: false,
                closing: false,
                outbound_done: false,
                tasks: Vec::new(),
                min_size: 64,
                max_size: 256,
            }
        }

        fn status(&self) -> HandshakeStatus {
            *self.status.lock().unwrap()
        }
    }

    impl Engine for MockEngine {
        fn begin_handshake(&mut self) -> Result<(), Error> {
            Ok(())
        }

        fn handshake_status(&mut self) -> HandshakeStatus {
            self.status()
        }

        fn delegated_task(&mut self) -> Option<DelegatedTask> {
            self.tasks.pop()
        }

        fn wrap(&mut self, sources: &[&[u8]], dst: &mut [u8]) -> Result<EngineResult, Error> {
            self.calls.wraps.fetch_add(1, Ordering::SeqCst);
            if self.outbound_done {
                return Ok(EngineResult::new(EngineStatus::Closed, self.status(), 0, 0));
            }
            let available: usize = sources.iter().map(|source| source.len()).sum();
            let consumed = available.min(self.consume_limit);
            let produced = if self.closing {
                self.outbound_done = true;
                7
            } else if consumed > 0 || self.status() == HandshakeStatus::NeedWrap {
                self.produce
            } else {
                0
            };
            if produced > dst.len() {
                return Ok(EngineResult::new(EngineStatus::BufferOverflow, self.status(), 0, 0));
            }
            dst[..produced].fill(0xab);
            self.calls.consumed.fetch_add(consumed, Ordering::SeqCst);
            if produced > 0 {
                if let Some(next) = self.after_wrap {
                    *self.status.lock().unwrap() = next;
                }
            }
            let status = if self.outbound_done {
                EngineStatus::Closed
            } else {
                EngineStatus::Ok
            };
            Ok(EngineResult::new(status, self.status(), consumed, produced))
        }

        fn unwrap(&mut self, src: &[u8], _dst: &mut [u8]) -> Result<EngineResult, Error> {
            self.calls.unwraps.fetch_add(1, Ordering::SeqCst);
            if self.unwrap_error {
                *self.status.lock().unwrap() = HandshakeStatus::NeedWrap;
                self.closing = true;
                return Err(Error::Engine("bad record".to_string()));
            }
            if self.unwrap_overflow {
                return Ok(EngineResult::new(EngineStatus::BufferOverflow, self.status(), 0, 0));
            }
            Ok(EngineResult::new(EngineStatus::Ok, self.status(), src.len(), 0))
        }

        fn close_inbound(&mut self) -> Result<(), Error> {
            Ok(())
        }

        fn close_outbound(&mut self) {
            self.closing = true;
        }

        fn is_inbound_done(&self) -> bool {
            false
        }

        fn is_outbound_done(&self) -> bool {
            self.outbound_done
        }

        fn min_application_buffer_size(&self) -> usize {
            self.min_size
        }

        fn max_application_buffer_size(&self) -> usize {
            self.max_size
        }

        fn min_network_buffer_size(&self) -> usize {
            self.min_size
        }

        fn max_network_buffer_size(&self) -> usize {
            self.max_size
        }
    }

    fn session(config: &SessionConfig) -> Session {
        Session::from_shared(Arc::new(SessionShared::detached(
            SessionKind::Stream,
            config.clone(),
            true,
        )))
    }

    fn driver(engine: MockEngine, config: &SessionConfig) -> EngineDriver {
        EngineDriver::new(Box::new(engine), Arc::new(crate::buffer::DefaultAllocator), config)
    }

    fn transmitted(out: &VecDeque<DriverOutput>) -> Vec<usize> {
        out.iter()
            .filter_map(|output| match output {
                DriverOutput::Transmit { data, .. } => Some(data.len()),
                _ => None,
            })
            .collect()
    }

    fn exception(out: &VecDeque<DriverOutput>) -> Option<&Error> {
        out.iter().find_map(|output| match output {
            DriverOutput::Exception(err) => Some(err),
            _ => None,
        })
    }

    #[test]
    fn test_wrap_hands_off_and_resolves_future() {
        let config = SessionConfig::default();
        let session = session(&config);
        let mut engine = MockEngine::new(HandshakeStatus::NeedWrap);
        engine.produce = 40;
        engine.after_wrap = Some(HandshakeStatus::NotHandshaking);
        let mut driver = driver(engine, &config);

        let mut future = session.write(vec![7u8; 100]);
        let mut out = VecDeque::new();
        driver.run(&session.shared, &mut out);

        assert_eq!(transmitted(&out), vec![40]);
        let state = session.shared.lock();
        assert_eq!(state.app_counter, 100);
        assert_eq!(state.net_counter, 100);
        assert!(state.out.is_empty());
        drop(state);
        assert!(matches!(future.try_take(), Some(Ok(()))));
        assert!(out.iter().any(|output| matches!(output, DriverOutput::Ready)));
    }

    #[test]
    fn test_net_counter_tracks_consumed_bytes() {
        let config = SessionConfig::default();
        let session = session(&config);
        let mut engine = MockEngine::new(HandshakeStatus::NotHandshaking);
        engine.produce = 10;
        engine.consume_limit = 30;
        let calls = engine.calls.clone();
        let mut driver = driver(engine, &config);

        let mut first = session.write([1u8; 50]);
        let mut second = session.write([2u8; 50]);
        let mut out = VecDeque::new();
        driver.run(&session.shared, &mut out);

        assert!(matches!(first.try_take(), Some(Ok(()))));
        assert!(matches!(second.try_take(), Some(Ok(()))));
        let state = session.shared.lock();
        assert_eq!(state.net_counter, 100);
        assert_eq!(state.net_counter as usize, calls.consumed.load(Ordering::SeqCst));
        // 30 + 30 + 30 + 10
        assert_eq!(transmitted(&out).len(), 4);
    }

    #[test]
    fn test_future_waits_for_its_threshold() {
        let config = SessionConfig::default();
        let session = session(&config);
        let mut engine = MockEngine::new(HandshakeStatus::NotHandshaking);
        engine.produce = 10;
        engine.consume_limit = 30;
        let mut driver = driver(engine, &config);

        session.suspend_write();
        let mut future = session.write([1u8; 50]);
        let mut out = VecDeque::new();
        driver.run(&session.shared, &mut out);
        assert!(future.try_take().is_none());
        assert!(transmitted(&out).is_empty());

        session.resume_write();
        driver.run(&session.shared, &mut out);
        assert!(matches!(future.try_take(), Some(Ok(()))));
        assert!(future.try_take().is_none());
    }

    #[test]
    fn test_unwrap_overflow_at_max_is_fatal() {
        let config = SessionConfig::default();
        let session = session(&config);
        let mut engine = MockEngine::new(HandshakeStatus::NeedUnwrap);
        engine.unwrap_overflow = true;
        let calls = engine.calls.clone();
        let mut driver = driver(engine, &config);

        driver.inbound_space().unwrap().put_slice(&[1, 2, 3]);
        let mut out = VecDeque::new();
        driver.run(&session.shared, &mut out);

        assert!(matches!(
            exception(&out),
            Some(Error::IncorrectFragmentSize {
                buffer: "application",
                max: 256
            })
        ));
        // 64 -> 128 -> 256, then the fatal attempt.
        assert_eq!(calls.unwraps.load(Ordering::SeqCst), 3);
        assert!(driver.is_halted());
        assert!(out
            .iter()
            .any(|output| matches!(output, DriverOutput::CloseTransport)));
    }

    #[test]
    fn test_handshake_loops_threshold() {
        let config = SessionConfig {
            quickly_close_engine_on_failure: true,
            ..SessionConfig::default()
        };
        let session = session(&config);
        let mut engine = MockEngine::new(HandshakeStatus::NeedWrap);
        engine.produce = 1;
        let calls = engine.calls.clone();
        let mut driver = driver(engine, &config);

        let mut out = VecDeque::new();
        driver.run(&session.shared, &mut out);

        assert!(matches!(
            exception(&out),
            Some(Error::HandshakeLoopsThreshold { loops: 500 })
        ));
        assert_eq!(calls.wraps.load(Ordering::SeqCst), 500);

        driver.run(&session.shared, &mut out);
        assert_eq!(calls.wraps.load(Ordering::SeqCst), 500);
    }

    #[test]
    fn test_delayed_exception_after_alert() {
        let config = SessionConfig::default();
        let session = session(&config);
        let mut engine = MockEngine::new(HandshakeStatus::NeedUnwrap);
        engine.unwrap_error = true;
        let mut driver = driver(engine, &config);

        driver.inbound_space().unwrap().put_slice(&[1]);
        let mut out = VecDeque::new();
        driver.run(&session.shared, &mut out);

        let alert = out
            .iter()
            .position(|output| matches!(output, DriverOutput::Transmit { data, .. } if data.len() == 7))
            .expect("alert transmitted");
        let exception = out
            .iter()
            .position(|output| matches!(output, DriverOutput::Exception(Error::Engine(_))))
            .expect("exception fired");
        assert!(alert < exception);
        assert_eq!(session.closing_state(), ClosingState::Finishing);
    }

    #[test]
    fn test_quick_failure_skips_alert() {
        let config = SessionConfig {
            quickly_close_engine_on_failure: true,
            ..SessionConfig::default()
        };
        let session = session(&config);
        let mut engine = MockEngine::new(HandshakeStatus::NeedUnwrap);
        engine.unwrap_error = true;
        let mut driver = driver(engine, &config);

        driver.inbound_space().unwrap().put_slice(&[1]);
        let mut out = VecDeque::new();
        driver.run(&session.shared, &mut out);

        assert!(transmitted(&out).is_empty());
        assert!(matches!(exception(&out), Some(Error::Engine(_))));
    }

    #[test]
    fn test_delegated_task_resumes_driver() {
        let config = SessionConfig::default();
        let session = session(&config);
        let mut engine = MockEngine::new(HandshakeStatus::NeedTask);
        let status = engine.status.clone();
        engine.tasks.push(DelegatedTask::new(move || {
            *status.lock().unwrap() = HandshakeStatus::NotHandshaking;
            Ok(())
        }));
        let mut driver = driver(engine, &config);

        let mut out = VecDeque::new();
        driver.run(&session.shared, &mut out);
        let index = out
            .iter()
            .position(|output| matches!(output, DriverOutput::SpawnTask(_)))
            .expect("task spawned");
        let Some(DriverOutput::SpawnTask(task)) = out.remove(index) else {
            panic!("no task spawned");
        };
        assert!(!driver.is_ready());

        let result = std::thread::spawn(move || task.run()).join().unwrap();
        driver.task_done(result, &session.shared, &mut out);
        assert!(driver.is_ready());
        assert!(out.iter().any(|output| matches!(output, DriverOutput::Ready)));
    }

    #[test]
    fn test_gentle_close_flushes_then_closes() {
        let config = SessionConfig::default();
        let session = session(&config);
        let mut engine = MockEngine::new(HandshakeStatus::NotHandshaking);
        engine.produce = 5;
        let mut driver = driver(engine, &config);

        let mut out = VecDeque::new();
        driver.run(&session.shared, &mut out);
        let mut future = session.write([1u8; 20]);
        session.close();
        driver.run(&session.shared, &mut out);

        assert!(matches!(future.try_take(), Some(Ok(()))));
        assert_eq!(transmitted(&out), vec![5, 7]);
        assert!(matches!(out.back(), Some(DriverOutput::CloseTransport)));
        assert_eq!(session.closing_state(), ClosingState::Finishing);
    }

    #[test]
    fn test_wrap_overflow_at_max_is_fatal() {
        let config = SessionConfig {
            quickly_close_engine_on_failure: true,
            ..SessionConfig::default()
        };
        let session = session(&config);
        let mut engine = MockEngine::new(HandshakeStatus::NeedWrap);
        engine.produce = 300;
        let calls = engine.calls.clone();
        let mut driver = driver(engine, &config);

        let mut out = VecDeque::new();
        driver.run(&session.shared, &mut out);

        assert!(matches!(
            exception(&out),
            Some(Error::IncorrectFragmentSize {
                buffer: "network",
                max: 256
            })
        ));
        // 64 -> 128 -> 256, then the fatal attempt.
        assert_eq!(calls.wraps.load(Ordering::SeqCst), 3);
        assert!(transmitted(&out).is_empty());
        assert!(driver.is_halted());
        assert!(matches!(out.back(), Some(DriverOutput::CloseTransport)));
    }

    #[test]
    fn test_quick_close_while_awaiting_peer_closes_transport() {
        let config = SessionConfig {
            wait_for_inbound_close: true,
            ..SessionConfig::default()
        };
        let session = session(&config);
        let mut driver = driver(MockEngine::new(HandshakeStatus::NeedUnwrap), &config);

        let mut out = VecDeque::new();
        driver.run(&session.shared, &mut out);
        assert!(out.is_empty());
        assert!(!driver.is_halted());

        session.quick_close();
        driver.run(&session.shared, &mut out);

        // The close message still goes out before the channel closes.
        assert_eq!(transmitted(&out), vec![7]);
        assert!(matches!(out.back(), Some(DriverOutput::CloseTransport)));
        assert!(driver.is_halted());
        assert!(exception(&out).is_none());
    }
}
