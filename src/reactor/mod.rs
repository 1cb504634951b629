//! Single-threaded selector loop.
//!
//! A [`SelectorLoop`] owns a mio [`Poll`] and every session registered with
//! it. All channel I/O, engine driving and handler callbacks happen on the
//! loop thread; other threads talk to the loop through a [`LoopHandle`],
//! which queues [`LoopTask`]s and wakes the poll.
//!
//! Each iteration polls for readiness, closes invalidated sessions,
//! dispatches I/O events, fires due timers, drains the task queue and
//! finally completes pending registrations.

mod channel;
mod dispatch;
mod executor;
mod handle;
mod timer;

pub use channel::Channel;
pub use executor::{InlineExecutor, Task, TaskExecutor, ThreadExecutor};
pub use handle::LoopHandle;
pub use timer::TimerHandle;

pub(crate) use channel::Transport;

use crate::config::{get_namespaced_u64, get_namespaced_usize, optional};
use crate::error::Error;
use crate::future::CompletionSender;
use crate::engine::Engine;
use crate::session::shared::Registration;
use crate::session::{ClosingState, Handler, Session, SessionSpec};
use ::config::Config;
use dispatch::{Context, SessionEntry};
use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Token, Waker};
use std::collections::{HashMap, VecDeque};
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};
use timer::{TimerKind, Timers};
use tracing::{debug, error, info, instrument, trace, warn};

// Token used to wake the poll from other threads.
const WAKE_TOKEN: Token = Token(2);
// Session and listener tokens start here.
const TOKEN_RANGE_START: usize = 1000;

const DEFAULT_SELECT_TIMEOUT: Duration = Duration::from_millis(1000);
const DEFAULT_REBUILD_THRESHOLD: usize = 512;
const DEFAULT_POLL_CAPACITY: usize = 256;

// ============================================================================
// Configuration
// ============================================================================

/// Tuning of a [`SelectorLoop`].
///
/// # Configuration Keys
///
/// - `select_timeout_ms`: upper bound of a single poll (default 1000)
/// - `rebuild_threshold`: consecutive premature empty polls before the poll
///   is rebuilt (default 512)
/// - `poll_capacity`: events fetched per poll (default 256)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopConfig {
    pub select_timeout: Duration,
    pub rebuild_threshold: usize,
    pub poll_capacity: usize,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            select_timeout: DEFAULT_SELECT_TIMEOUT,
            rebuild_threshold: DEFAULT_REBUILD_THRESHOLD,
            poll_capacity: DEFAULT_POLL_CAPACITY,
        }
    }
}

impl LoopConfig {
    /// Reads the loop settings, looking up `name.key` before `key`.
    pub fn from_config(config: &Config, name: &str) -> Result<Self, Error> {
        let defaults = Self::default();
        let select_timeout = optional(get_namespaced_u64(config, name, "select_timeout_ms"))?
            .map(Duration::from_millis)
            .unwrap_or(defaults.select_timeout);
        let rebuild_threshold = optional(get_namespaced_usize(config, name, "rebuild_threshold"))?
            .unwrap_or(defaults.rebuild_threshold);
        let poll_capacity = optional(get_namespaced_usize(config, name, "poll_capacity"))?
            .unwrap_or(defaults.poll_capacity);
        if poll_capacity == 0 {
            return Err(Error::InvalidConfig {
                key: "poll_capacity".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        Ok(Self {
            select_timeout,
            rebuild_threshold,
            poll_capacity,
        })
    }
}

// ============================================================================
// Loop Tasks
// ============================================================================

/// How [`LoopHandle::stop`] closes the sessions of a loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopKind {
    /// Flush queued data, then close.
    Gentle,
    /// Abandon queued data; engines still send their close message.
    Quick,
    /// Close the channels right away.
    Dirty,
}

/// Creates the sessions of connections accepted by a listener.
pub trait SessionFactory: Send {
    fn create(&mut self, peer_addr: SocketAddr) -> Result<SessionSpec, Error>;
}

impl<F> SessionFactory for F
where
    F: FnMut(SocketAddr) -> Result<SessionSpec, Error> + Send,
{
    fn create(&mut self, peer_addr: SocketAddr) -> Result<SessionSpec, Error> {
        self(peer_addr)
    }
}

/// Work queued for the loop thread.
pub(crate) enum LoopTask {
    Run(Box<dyn FnOnce() + Send>),
    Session {
        token: Token,
        op: SessionOp,
    },
    ScheduleTimer {
        id: u64,
        token: Token,
        delay: Duration,
        event: u64,
    },
    CancelTimer {
        id: u64,
    },
    Listen {
        token: Token,
        listener: TcpListener,
        factory: Box<dyn SessionFactory>,
    },
    Stop(StopKind),
    Rebuild,
}

/// Per-session work requested from outside the loop.
#[derive(Debug)]
pub(crate) enum SessionOp {
    /// Flush queued data, drive the engine and apply closing transitions.
    Process,
    BeginHandshake,
    ResumeRead,
    /// A delegated engine task finished.
    TaskDone(Result<(), Error>),
}

/// A channel waiting to be registered by the loop.
pub(crate) struct PendingRegistration {
    pub(crate) token: Token,
    pub(crate) session: Session,
    pub(crate) transport: Box<dyn Transport>,
    pub(crate) handler: Box<dyn Handler>,
    pub(crate) engine: Option<Box<dyn Engine>>,
    pub(crate) connected: bool,
    pub(crate) sender: Option<CompletionSender<()>>,
}

/// State shared between a loop and its handles.
pub(crate) struct LoopShared {
    pub(crate) name: String,
    pub(crate) sender: Sender<LoopTask>,
    pub(crate) waker: Mutex<Arc<Waker>>,
    pub(crate) thread: OnceLock<ThreadId>,
    pub(crate) join: Mutex<Option<JoinHandle<Result<(), Error>>>>,
    pub(crate) stopping: AtomicBool,
    pub(crate) next_token: AtomicUsize,
    pub(crate) next_timer_id: AtomicU64,
    /// Tasks sent and not yet taken off the queue.
    pub(crate) queued: AtomicUsize,
    pub(crate) session_count: AtomicUsize,
    pub(crate) registrations: Mutex<VecDeque<PendingRegistration>>,
    pub(crate) invalidated: Mutex<Vec<Token>>,
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ============================================================================
// Selector Loop
// ============================================================================

struct ListenerEntry {
    listener: TcpListener,
    local_addr: SocketAddr,
    factory: Box<dyn SessionFactory>,
}

/// Event loop driving the sessions registered with it.
///
/// # Examples
///
/// ```no_run
/// use enginet::reactor::{LoopConfig, SelectorLoop, StopKind};
///
/// let handle = SelectorLoop::new("io", LoopConfig::default())?.start()?;
/// // register, connect or listen through the handle ...
/// handle.stop(StopKind::Gentle);
/// handle.join()?;
/// # Ok::<(), enginet::Error>(())
/// ```
pub struct SelectorLoop {
    name: String,
    poll: Poll,
    handle: LoopHandle,
    receiver: Receiver<LoopTask>,
    sessions: HashMap<Token, SessionEntry>,
    listeners: HashMap<Token, ListenerEntry>,
    timers: Timers,
    executor: Arc<dyn TaskExecutor>,
    config: LoopConfig,
    stopping: bool,
    empty_polls: usize,
}

impl SelectorLoop {
    pub fn new(name: &str, config: LoopConfig) -> Result<Self, Error> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKE_TOKEN)?);
        let (sender, receiver) = channel();
        let shared = Arc::new(LoopShared {
            name: name.to_string(),
            sender,
            waker: Mutex::new(waker),
            thread: OnceLock::new(),
            join: Mutex::new(None),
            stopping: AtomicBool::new(false),
            next_token: AtomicUsize::new(TOKEN_RANGE_START),
            next_timer_id: AtomicU64::new(1),
            queued: AtomicUsize::new(0),
            session_count: AtomicUsize::new(0),
            registrations: Mutex::new(VecDeque::new()),
            invalidated: Mutex::new(Vec::new()),
        });

        Ok(Self {
            name: name.to_string(),
            poll,
            handle: LoopHandle { shared },
            receiver,
            sessions: HashMap::new(),
            listeners: HashMap::new(),
            timers: Timers::default(),
            executor: Arc::new(ThreadExecutor::new(name)),
            config,
            stopping: false,
            empty_polls: 0,
        })
    }

    /// Creates a loop with configuration namespacing.
    pub fn new_named(config: &Config, name: &str) -> Result<Self, Error> {
        Self::new(name, LoopConfig::from_config(config, name)?)
    }

    /// Replaces the executor running delegated engine tasks.
    pub fn with_executor(mut self, executor: impl TaskExecutor + 'static) -> Self {
        self.executor = Arc::new(executor);
        self
    }

    pub fn handle(&self) -> LoopHandle {
        self.handle.clone()
    }

    /// Runs the loop on a new thread named after the loop.
    pub fn start(self) -> Result<LoopHandle, Error> {
        let handle = self.handle.clone();
        let thread = thread::Builder::new()
            .name(self.name.clone())
            .spawn(move || self.run())?;
        let _ = handle.shared.thread.set(thread.thread().id());
        *lock(&handle.shared.join) = Some(thread);
        Ok(handle)
    }

    /// Runs the loop on the calling thread until it is stopped and its last
    /// session closed.
    #[instrument(skip(self), fields(name = %self.name))]
    pub fn run(mut self) -> Result<(), Error> {
        let _ = self.handle.shared.thread.set(thread::current().id());
        info!("Selector loop started");

        let mut events = Events::with_capacity(self.config.poll_capacity);
        let result = loop {
            if let Err(err) = self.poll_once(&mut events) {
                break Err(err);
            }
            if self.stopping && self.sessions.is_empty() {
                break Ok(());
            }
        };

        self.shutdown();
        info!("Selector loop stopped");
        result
    }

    fn poll_once(&mut self, events: &mut Events) -> Result<(), Error> {
        let timeout = self.poll_timeout();
        let started = Instant::now();
        match self.poll.poll(events, Some(timeout)) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::Interrupted => {}
            Err(err) => {
                error!(?err, "Poll failed");
                return Err(err.into());
            }
        }
        let premature = events.is_empty() && started.elapsed() < timeout;
        self.track_empty_poll(premature)?;

        self.process_invalidated();
        for event in events.iter() {
            self.dispatch(event);
        }
        self.fire_timers();
        self.drain_tasks();
        self.process_registrations();
        Ok(())
    }

    fn poll_timeout(&mut self) -> Duration {
        let shared = &self.handle.shared;
        if shared.queued.load(Ordering::SeqCst) > 0
            || !lock(&shared.invalidated).is_empty()
            || !lock(&shared.registrations).is_empty()
        {
            return Duration::ZERO;
        }
        match self.timers.next_timeout() {
            Some(next) => next.min(self.config.select_timeout),
            None => self.config.select_timeout,
        }
    }

    // A poll that returns early without events, over and over, means the
    // poll itself is broken.
    fn track_empty_poll(&mut self, premature: bool) -> Result<(), Error> {
        if !premature {
            self.empty_polls = 0;
            return Ok(());
        }
        self.empty_polls += 1;
        if self.config.rebuild_threshold > 0 && self.empty_polls >= self.config.rebuild_threshold {
            warn!(polls = self.empty_polls, "Poll keeps returning early");
            self.empty_polls = 0;
            self.rebuild()?;
        }
        Ok(())
    }

    /// Moves every session and listener to a fresh poll.
    fn rebuild(&mut self) -> Result<(), Error> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKE_TOKEN)?);
        for (token, entry) in self.sessions.iter_mut() {
            entry.move_to(self.poll.registry(), poll.registry(), *token)?;
        }
        for (token, entry) in self.listeners.iter_mut() {
            self.poll.registry().deregister(&mut entry.listener)?;
            poll.registry()
                .register(&mut entry.listener, *token, Interest::READABLE)?;
        }
        *lock(&self.handle.shared.waker) = waker;
        self.poll = poll;
        info!(
            sessions = self.sessions.len(),
            listeners = self.listeners.len(),
            "Rebuilt poll"
        );
        Ok(())
    }

    fn shutdown(&mut self) {
        self.handle.shared.stopping.store(true, Ordering::SeqCst);
        self.close_listeners();
        let tokens: Vec<Token> = self.sessions.keys().copied().collect();
        for token in tokens {
            self.with_session(token, |entry, cx| entry.finish(cx));
        }
        let pending: Vec<_> = lock(&self.handle.shared.registrations).drain(..).collect();
        for registration in pending {
            abort_registration(registration, Error::SelectorClosed);
        }
    }
}

// ============================================================================
// Event Dispatch
// ============================================================================

impl SelectorLoop {
    fn dispatch(&mut self, event: &mio::event::Event) {
        let token = event.token();
        if token == WAKE_TOKEN {
            return;
        }
        if self.listeners.contains_key(&token) {
            self.accept_connections(token);
            return;
        }
        if !self.sessions.contains_key(&token) {
            trace!(?token, "Event for unknown token");
            return;
        }
        self.with_session(token, |entry, cx| entry.ready(event, cx));
    }

    /// Runs `f` on a session with the loop context and drops the session
    /// once it finished.
    fn with_session(&mut self, token: Token, f: impl FnOnce(&mut SessionEntry, &mut Context<'_>)) {
        let Some(entry) = self.sessions.get_mut(&token) else {
            return;
        };
        let mut cx = Context {
            registry: self.poll.registry(),
            timers: &mut self.timers,
            executor: &self.executor,
            handle: &self.handle,
        };
        f(entry, &mut cx);
        if entry.is_finished() {
            self.remove_session(token);
        }
    }

    fn remove_session(&mut self, token: Token) {
        if self.sessions.remove(&token).is_some() {
            self.timers.cancel_session(token);
            self.handle
                .shared
                .session_count
                .store(self.sessions.len(), Ordering::SeqCst);
        }
    }

    fn process_invalidated(&mut self) {
        let tokens = std::mem::take(&mut *lock(&self.handle.shared.invalidated));
        for token in tokens {
            self.with_session(token, |entry, cx| entry.finish(cx));
        }
    }

    fn fire_timers(&mut self) {
        for timer in self.timers.expired(Instant::now()) {
            self.with_session(timer.token, |entry, cx| entry.timer(timer.kind, cx));
        }
    }

    fn drain_tasks(&mut self) {
        while let Ok(task) = self.receiver.try_recv() {
            self.handle.shared.queued.fetch_sub(1, Ordering::SeqCst);
            self.handle_task(task);
        }
    }

    fn handle_task(&mut self, task: LoopTask) {
        match task {
            LoopTask::Run(task) => task(),
            LoopTask::Session { token, op } => {
                if !self.sessions.contains_key(&token) {
                    trace!(?token, ?op, "Dropped op for unknown session");
                    return;
                }
                self.with_session(token, |entry, cx| match op {
                    SessionOp::Process => entry.process(cx),
                    SessionOp::BeginHandshake => entry.begin_handshake(cx),
                    SessionOp::ResumeRead => entry.read(cx),
                    SessionOp::TaskDone(result) => entry.task_done(result, cx),
                });
            }
            LoopTask::ScheduleTimer {
                id,
                token,
                delay,
                event,
            } => {
                if self.sessions.contains_key(&token) {
                    self.timers
                        .schedule(id, delay, token, TimerKind::User(event));
                } else {
                    debug!(?token, "Timer for unknown session dropped");
                }
            }
            LoopTask::CancelTimer { id } => {
                self.timers.cancel(id);
            }
            LoopTask::Listen {
                token,
                listener,
                factory,
            } => self.add_listener(token, listener, factory),
            LoopTask::Stop(kind) => self.stop(kind),
            LoopTask::Rebuild => {
                if let Err(err) = self.rebuild() {
                    error!(?err, "Failed to rebuild poll");
                }
            }
        }
    }

    fn stop(&mut self, kind: StopKind) {
        info!(?kind, sessions = self.sessions.len(), "Stopping selector loop");
        self.stopping = true;
        self.close_listeners();
        for entry in self.sessions.values() {
            match kind {
                StopKind::Gentle => entry.session.close(),
                StopKind::Quick => entry.session.quick_close(),
                StopKind::Dirty => entry.session.dirty_close(),
            }
        }
    }
}

// ============================================================================
// Listeners
// ============================================================================

impl SelectorLoop {
    fn add_listener(
        &mut self,
        token: Token,
        mut listener: TcpListener,
        factory: Box<dyn SessionFactory>,
    ) {
        if self.stopping {
            debug!(?token, "Listener dropped, loop is stopping");
            return;
        }
        let local_addr = match listener.local_addr() {
            Ok(addr) => addr,
            Err(err) => {
                error!(?err, "Listener has no local address");
                return;
            }
        };
        if let Err(err) = self
            .poll
            .registry()
            .register(&mut listener, token, Interest::READABLE)
        {
            error!(?err, %local_addr, "Failed to register listener");
            return;
        }
        info!(?token, %local_addr, "Listening");
        self.listeners.insert(
            token,
            ListenerEntry {
                listener,
                local_addr,
                factory,
            },
        );
    }

    fn close_listeners(&mut self) {
        for (_, mut entry) in self.listeners.drain() {
            if let Err(err) = self.poll.registry().deregister(&mut entry.listener) {
                debug!(?err, "Failed to deregister listener");
            }
            info!(local_addr = %entry.local_addr, "Listener closed");
        }
    }

    fn accept_connections(&mut self, token: Token) {
        let Some(entry) = self.listeners.get_mut(&token) else {
            return;
        };
        let local_addr = entry.local_addr;
        let mut accepted = Vec::new();
        let mut broken = false;

        loop {
            match entry.listener.accept() {
                Ok((stream, peer_addr)) => {
                    if let Err(err) = stream.set_nodelay(true) {
                        warn!(?err, %peer_addr, "Failed to set TCP_NODELAY");
                    }
                    debug!(%local_addr, %peer_addr, "Accepted connection");
                    match entry.factory.create(peer_addr) {
                        Ok(spec) => accepted.push((stream, spec)),
                        Err(err) => warn!(?err, %peer_addr, "Connection rejected"),
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e)
                    if matches!(
                        e.kind(),
                        ErrorKind::ConnectionAborted | ErrorKind::ConnectionReset
                    ) =>
                {
                    // The client went away before we accepted; not a
                    // listener failure.
                    warn!(%local_addr, err = ?e, "Transient accept error");
                    continue;
                }
                Err(e) => {
                    error!(%local_addr, err = ?e, "Error accepting connection");
                    broken = true;
                    break;
                }
            }
        }

        if broken {
            if let Some(mut entry) = self.listeners.remove(&token) {
                let _ = self.poll.registry().deregister(&mut entry.listener);
            }
        }

        for (stream, spec) in accepted {
            let registration = self.handle.prepare(Box::new(stream), spec, true, None);
            match registration {
                Ok(registration) => self.complete_registration(registration),
                Err(err) => warn!(?err, "Accepted connection not registered"),
            }
        }
    }
}

// ============================================================================
// Registrations
// ============================================================================

impl SelectorLoop {
    fn process_registrations(&mut self) {
        let pending: Vec<_> = lock(&self.handle.shared.registrations).drain(..).collect();
        for registration in pending {
            self.complete_registration(registration);
        }
    }

    fn complete_registration(&mut self, registration: PendingRegistration) {
        if self.stopping {
            abort_registration(registration, Error::Stopping);
            return;
        }
        let id = registration.session.id();
        {
            let mut state = registration.session.shared.lock();
            if state.registration == Registration::Aborted || state.closing != ClosingState::None {
                drop(state);
                abort_registration(registration, Error::SessionClosed { id });
                return;
            }
            state.registration = Registration::Registered;
        }

        let PendingRegistration {
            token,
            session,
            mut transport,
            handler,
            engine,
            connected,
            sender,
        } = registration;
        let interest = if connected {
            Interest::READABLE
        } else {
            Interest::WRITABLE
        };
        if let Err(err) = self
            .poll
            .registry()
            .register(&mut *transport, token, interest)
        {
            error!(id, ?err, "Failed to register session");
            session.shared.lock().closing.advance(ClosingState::Finished);
            if let Some(sender) = sender {
                sender.complete(Err(err.into()));
            }
            return;
        }

        let mut entry = SessionEntry::new(token, session, transport, handler, engine, interest, connected);
        if let Some(sender) = sender {
            sender.complete(Ok(()));
        }
        let mut cx = Context {
            registry: self.poll.registry(),
            timers: &mut self.timers,
            executor: &self.executor,
            handle: &self.handle,
        };
        entry.open(&mut cx);
        if !entry.is_finished() {
            self.sessions.insert(token, entry);
            self.handle
                .shared
                .session_count
                .store(self.sessions.len(), Ordering::SeqCst);
        }
    }
}

fn abort_registration(registration: PendingRegistration, err: Error) {
    let id = registration.session.id();
    debug!(id, %err, "Registration aborted");
    {
        let mut state = registration.session.shared.lock();
        state.registration = Registration::Aborted;
        state.closing.advance(ClosingState::Finished);
        state.abandon(id);
    }
    if let Some(sender) = registration.sender {
        sender.complete(Err(err));
    }
}
