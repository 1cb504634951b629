//! Pluggable wrap/unwrap engines and the driver that runs them.
//!
//! An [`Engine`] is a sans-I/O transform (TLS, DTLS, ...) that turns
//! application bytes into network bytes (`wrap`) and back (`unwrap`), and
//! reports what it needs next through a [`HandshakeStatus`]. It never touches
//! a socket. The crate-private `EngineDriver` feeds it from the session queues
//! on the session's loop thread.

pub(crate) mod driver;
#[cfg(feature = "tls")]
mod tls;
#[cfg(feature = "tls")]
mod tls_config;

#[cfg(feature = "tls")]
pub use tls::{TlsEngine, TlsEngineFactory};
#[cfg(feature = "tls")]
pub use tls_config::{load_tls_client_config, load_tls_server_config};

use crate::error::Error;
use std::fmt;
use std::time::Duration;

/// What the engine needs next.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandshakeStatus {
    /// No handshake in progress.
    NotHandshaking,
    /// The engine has handshake (or close) data to emit.
    NeedWrap,
    /// The engine waits for data from the peer.
    NeedUnwrap,
    /// The engine already buffered enough data and must be unwrapped again
    /// without new input.
    NeedUnwrapAgain,
    /// The engine has delegated tasks to run.
    NeedTask,
    /// The engine needs its timer callback.
    NeedTimer,
    /// The handshake just completed. Only ever reported by wrap/unwrap results.
    Finished,
}

impl HandshakeStatus {
    /// Whether this status is part of an ongoing handshake.
    pub fn is_handshaking(self) -> bool {
        !matches!(
            self,
            HandshakeStatus::NotHandshaking | HandshakeStatus::Finished
        )
    }
}

/// Outcome class of a single wrap or unwrap call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineStatus {
    Ok,
    /// The destination buffer is too small.
    BufferOverflow,
    /// The source does not hold a complete record.
    BufferUnderflow,
    /// This direction of the engine is closed.
    Closed,
}

impl EngineStatus {
    pub(crate) fn name(self) -> &'static str {
        match self {
            EngineStatus::Ok => "OK",
            EngineStatus::BufferOverflow => "BUFFER_OVERFLOW",
            EngineStatus::BufferUnderflow => "BUFFER_UNDERFLOW",
            EngineStatus::Closed => "CLOSED",
        }
    }
}

/// Result of a single wrap or unwrap call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineResult {
    pub status: EngineStatus,
    pub handshake_status: HandshakeStatus,
    pub bytes_consumed: usize,
    pub bytes_produced: usize,
}

impl EngineResult {
    pub fn new(
        status: EngineStatus,
        handshake_status: HandshakeStatus,
        bytes_consumed: usize,
        bytes_produced: usize,
    ) -> Self {
        Self {
            status,
            handshake_status,
            bytes_consumed,
            bytes_produced,
        }
    }
}

/// A costly engine operation to run off the loop thread.
pub struct DelegatedTask(Box<dyn FnOnce() -> Result<(), Error> + Send>);

impl DelegatedTask {
    pub fn new(task: impl FnOnce() -> Result<(), Error> + Send + 'static) -> Self {
        Self(Box::new(task))
    }

    pub fn run(self) -> Result<(), Error> {
        (self.0)()
    }
}

impl fmt::Debug for DelegatedTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("DelegatedTask")
    }
}

/// Capability contract of a wrap/unwrap engine.
///
/// All methods are called on the loop thread owning the session, except
/// delegated tasks, which run on the loop's executor.
pub trait Engine: Send {
    /// Called once when the session is registered.
    fn init(&mut self) -> Result<(), Error> {
        Ok(())
    }

    /// Called once after the session ended.
    fn cleanup(&mut self) {}

    fn begin_handshake(&mut self) -> Result<(), Error>;

    fn handshake_status(&mut self) -> HandshakeStatus;

    /// Returns the next delegated task, if any.
    fn delegated_task(&mut self) -> Option<DelegatedTask> {
        None
    }

    /// Asks for the delay after which [`Engine::timer_expired`] must be
    /// called, while the status is [`HandshakeStatus::NeedTimer`].
    fn timer_delay(&mut self) -> Option<Duration> {
        None
    }

    /// Called when the delay returned by [`Engine::timer_delay`] elapsed.
    fn timer_expired(&mut self) {}

    /// Wraps application bytes from `sources` (in order) into `dst`.
    fn wrap(&mut self, sources: &[&[u8]], dst: &mut [u8]) -> Result<EngineResult, Error>;

    /// Unwraps network bytes from `src` into `dst`.
    fn unwrap(&mut self, src: &[u8], dst: &mut [u8]) -> Result<EngineResult, Error>;

    fn close_inbound(&mut self) -> Result<(), Error>;

    fn close_outbound(&mut self);

    fn is_inbound_done(&self) -> bool;

    fn is_outbound_done(&self) -> bool;

    fn min_application_buffer_size(&self) -> usize;

    fn max_application_buffer_size(&self) -> usize;

    fn min_network_buffer_size(&self) -> usize;

    fn max_network_buffer_size(&self) -> usize;
}
