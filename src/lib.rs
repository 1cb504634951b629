//! enginet - non-blocking network sessions driven by pluggable engines
//!
//! enginet runs TCP and UDP channels on single-threaded selector loops. Each
//! registered channel becomes a [`Session`](session::Session) whose handler
//! receives lifecycle events and inbound data on the loop thread, while any
//! thread may write to it. A session can run its traffic through an
//! [`Engine`](engine::Engine), such as the rustls based
//! [`TlsEngine`](engine::TlsEngine), which transforms application bytes into
//! network bytes (wrap) and back (unwrap) without doing I/O itself.

// Internal-only modules
pub(crate) mod config;
pub(crate) mod error;

pub mod buffer;
pub mod engine;
pub mod future;
pub mod reactor;
pub mod session;

// These are the intended public API
pub use error::{CloseAction, Error, IncidentKind};
pub use future::{Completion, WriteFuture};
pub use reactor::{LoopConfig, LoopHandle, SelectorLoop, SessionFactory, StopKind};
pub use session::{Handler, Session, SessionConfig, SessionEvent, SessionSpec};

/// Convenient re-exports of commonly used types.
pub mod prelude {
    pub use crate::buffer::{Buffer, BufferAllocator, CachingAllocator, DefaultAllocator};
    pub use crate::engine::{DelegatedTask, Engine, EngineResult, EngineStatus, HandshakeStatus};
    pub use crate::error::{CloseAction, Error, IncidentKind};
    pub use crate::future::{Completion, WriteFuture};
    pub use crate::reactor::{
        Channel, InlineExecutor, LoopConfig, LoopHandle, SelectorLoop, SessionFactory, StopKind,
        TaskExecutor, ThreadExecutor, TimerHandle,
    };
    pub use crate::session::{
        ClosingState, DataEvent, Encoder, Handler, Session, SessionConfig, SessionEvent,
        SessionKind, SessionSpec,
    };

    // TLS support (optional feature, enabled by default)
    #[cfg(feature = "tls")]
    pub use crate::engine::{TlsEngine, TlsEngineFactory};
}
