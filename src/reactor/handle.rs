use super::{
    abort_registration, lock, Channel, LoopShared, LoopTask, PendingRegistration, SessionFactory,
    StopKind, Transport,
};
use crate::error::Error;
use crate::future::Completion;
use crate::session::shared::{Link, SessionParts, SessionShared};
use crate::session::{Session, SessionSpec};
use mio::net::{TcpListener, TcpStream, UdpSocket};
use mio::Token;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use tracing::{debug, info, warn};

/// Thread-safe handle to a [`SelectorLoop`](super::SelectorLoop).
///
/// Cloned handles all talk to the same loop. Calls made on the loop thread
/// itself queue their work without waking the poll.
#[derive(Clone)]
pub struct LoopHandle {
    pub(crate) shared: Arc<LoopShared>,
}

impl LoopHandle {
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Whether the calling thread is the loop thread.
    pub fn in_loop(&self) -> bool {
        self.shared.thread.get() == Some(&thread::current().id())
    }

    pub fn is_stopping(&self) -> bool {
        self.shared.stopping.load(Ordering::SeqCst)
    }

    /// Tasks queued for the loop and not yet taken.
    pub fn queued_tasks(&self) -> usize {
        self.shared.queued.load(Ordering::SeqCst)
    }

    /// Sessions currently registered with the loop.
    pub fn session_count(&self) -> usize {
        self.shared.session_count.load(Ordering::SeqCst)
    }

    // ============================================================================
    // Task Execution
    // ============================================================================

    /// Runs `task` on the loop thread. On the loop thread it runs right away.
    pub fn execute(&self, task: impl FnOnce() + Send + 'static) -> Completion<()> {
        if self.in_loop() {
            task();
            return Completion::ready(Ok(()));
        }
        let (sender, completion) = Completion::pending();
        let task = LoopTask::Run(Box::new(move || {
            task();
            sender.complete(Ok(()));
        }));
        match self.submit(task) {
            Ok(()) => completion,
            Err(err) => Completion::ready(Err(err)),
        }
    }

    pub fn execute_no_future(&self, task: impl FnOnce() + Send + 'static) -> Result<(), Error> {
        if self.in_loop() {
            task();
            return Ok(());
        }
        self.submit(LoopTask::Run(Box::new(task)))
    }

    // ============================================================================
    // Channels
    // ============================================================================

    /// Registers a connected channel. The returned completion resolves once
    /// the loop took the channel over.
    pub fn register(
        &self,
        channel: Channel,
        spec: SessionSpec,
    ) -> Result<(Session, Completion<()>), Error> {
        self.enqueue(channel.into_transport(), spec, true, None)
    }

    /// Starts a non-blocking connect. OPENED fires once the connection is
    /// established; a refused connect goes through the exception path.
    pub fn connect(
        &self,
        addr: SocketAddr,
        spec: SessionSpec,
    ) -> Result<(Session, Completion<()>), Error> {
        self.check_running()?;
        let stream = TcpStream::connect(addr)?;
        stream.set_nodelay(true)?;
        debug!(%addr, "Connecting");
        self.enqueue(Box::new(stream), spec, false, Some(addr))
    }

    /// Binds a datagram session to `addr`. The session is unconnected and
    /// answers with [`Session::send`].
    pub fn bind(
        &self,
        addr: SocketAddr,
        spec: SessionSpec,
    ) -> Result<(Session, Completion<()>), Error> {
        self.check_running()?;
        let socket = UdpSocket::bind(addr)?;
        self.enqueue(Box::new(socket), spec, true, None)
    }

    /// Listens on `addr`, creating a session per accepted connection.
    /// Returns the bound address.
    pub fn listen(
        &self,
        addr: SocketAddr,
        factory: impl SessionFactory + 'static,
    ) -> Result<SocketAddr, Error> {
        self.check_running()?;
        let listener = TcpListener::bind(addr)?;
        let local_addr = listener.local_addr()?;
        let token = self.next_token();
        self.submit(LoopTask::Listen {
            token,
            listener,
            factory: Box::new(factory),
        })?;
        Ok(local_addr)
    }

    fn check_running(&self) -> Result<(), Error> {
        if self.is_stopping() {
            return Err(Error::Stopping);
        }
        Ok(())
    }

    fn enqueue(
        &self,
        transport: Box<dyn Transport>,
        spec: SessionSpec,
        connected: bool,
        peer_addr: Option<SocketAddr>,
    ) -> Result<(Session, Completion<()>), Error> {
        let mut registration = self.prepare(transport, spec, connected, peer_addr)?;
        let (sender, completion) = Completion::pending();
        registration.sender = Some(sender);
        let session = registration.session.clone();
        let token = registration.token;
        lock(&self.shared.registrations).push_back(registration);
        if let Some(registration) = self.withdraw_if_stopping(token) {
            abort_registration(registration, Error::Stopping);
            return Err(Error::Stopping);
        }
        self.wake()?;
        Ok((session, completion))
    }

    /// Builds the session of a channel about to be registered.
    pub(crate) fn prepare(
        &self,
        transport: Box<dyn Transport>,
        spec: SessionSpec,
        connected: bool,
        peer_addr: Option<SocketAddr>,
    ) -> Result<PendingRegistration, Error> {
        self.check_running()?;
        if let Some(err) = transport.take_error()? {
            debug!(?err, "Channel has a pending error");
            return Err(Error::ClosedChannel);
        }
        let local_addr = transport.local_addr().map_err(|_| Error::ClosedChannel)?;
        let peer_addr = transport.peer_addr().ok().or(peer_addr);

        let token = self.next_token();
        let SessionSpec {
            name,
            handler,
            engine,
            config,
            allocator,
            encoder,
        } = spec;
        config.validate()?;
        let parts = SessionParts {
            name,
            kind: transport.kind(),
            config,
            allocator,
            encoder,
            engine_backed: engine.is_some(),
            local_addr: Some(local_addr),
            peer_addr,
        };
        let link = Link {
            handle: self.clone(),
            token,
        };
        let shared = SessionShared::new(token.0 as u64, parts, Some(link));
        Ok(PendingRegistration {
            token,
            session: Session::from_shared(Arc::new(shared)),
            transport,
            handler,
            engine,
            connected,
            sender: None,
        })
    }

    // The loop may have drained its registrations for the last time since
    // `prepare` checked. A registration still queued then is taken back.
    fn withdraw_if_stopping(&self, token: Token) -> Option<PendingRegistration> {
        if !self.is_stopping() {
            return None;
        }
        let mut registrations = lock(&self.shared.registrations);
        let index = registrations
            .iter()
            .position(|pending| pending.token == token)?;
        registrations.remove(index)
    }

    fn next_token(&self) -> Token {
        Token(self.shared.next_token.fetch_add(1, Ordering::SeqCst))
    }

    // ============================================================================
    // Lifecycle
    // ============================================================================

    /// Stops the loop: listeners are closed and every session is closed as
    /// `kind` says. New registrations fail with [`Error::Stopping`].
    pub fn stop(&self, kind: StopKind) {
        if !self.shared.stopping.swap(true, Ordering::SeqCst) {
            info!(name = %self.shared.name, ?kind, "Stop requested");
        }
        if let Err(err) = self.submit(LoopTask::Stop(kind)) {
            debug!(?err, "Loop already closed");
        }
    }

    /// Moves all channels to a fresh poll.
    pub fn rebuild(&self) -> Result<(), Error> {
        self.submit(LoopTask::Rebuild)
    }

    /// Waits for a loop started with
    /// [`SelectorLoop::start`](super::SelectorLoop::start) to exit.
    pub fn join(&self) -> Result<(), Error> {
        if self.in_loop() {
            warn!("join called on the loop thread");
            return Ok(());
        }
        let thread = lock(&self.shared.join).take();
        match thread {
            Some(thread) => thread.join().map_err(|_| Error::SelectorClosed)?,
            None => Ok(()),
        }
    }

    // ============================================================================
    // Internal
    // ============================================================================

    pub(crate) fn submit(&self, task: LoopTask) -> Result<(), Error> {
        self.shared.queued.fetch_add(1, Ordering::SeqCst);
        if self.shared.sender.send(task).is_err() {
            self.shared.queued.fetch_sub(1, Ordering::SeqCst);
            return Err(Error::SelectorClosed);
        }
        self.wake()
    }

    /// Queues a session for the invalidated pass of the next iteration.
    pub(crate) fn invalidate(&self, token: Token) {
        lock(&self.shared.invalidated).push(token);
        if let Err(err) = self.wake() {
            debug!(?err, "Failed to wake loop");
        }
    }

    pub(crate) fn next_timer_id(&self) -> u64 {
        self.shared.next_timer_id.fetch_add(1, Ordering::SeqCst)
    }

    fn wake(&self) -> Result<(), Error> {
        if self.in_loop() {
            return Ok(());
        }
        let waker = lock(&self.shared.waker).clone();
        waker.wake()?;
        Ok(())
    }
}

impl fmt::Debug for LoopHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoopHandle")
            .field("name", &self.shared.name)
            .field("stopping", &self.is_stopping())
            .field("queued", &self.queued_tasks())
            .finish()
    }
}
