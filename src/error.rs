use thiserror::Error;

/// How a session is closed after an error went through its exception path.
///
/// Every error fired at a session is first reported to
/// [`Handler::exception`](crate::session::Handler::exception). The session is
/// then closed according to the error's close action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CloseAction {
    /// Quick close: pending outbound data is abandoned.
    #[default]
    Default,
    /// Gentle close: pending outbound data is still flushed.
    Gentle,
    /// The session stays open.
    None,
}

/// Classes of failures that a handler may choose to treat as non-fatal.
///
/// Incidents are reported through
/// [`Handler::incident`](crate::session::Handler::incident). When the handler
/// does not handle one, a warning is logged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IncidentKind {
    /// The peer closed the connection without sending the engine's close
    /// message first (e.g. a TLS close_notify).
    ClosedWithoutCloseMessage,
    /// A timer fired for a session that is already closing.
    SessionTimeout,
    /// The inbound framing reported more bytes than are available.
    DecodingFailure,
}

/// The error type for enginet operations.
///
/// Errors raised while a session is running are not returned to callers but
/// funnelled through the session's single exception path, which reports them
/// to the handler and then applies [`Error::close_action`].
#[derive(Error, Debug)]
pub enum Error {
    // ============================================================================
    // I/O and Reactor Errors
    // ============================================================================
    /// Low-level I/O error from the operating system.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The selector loop is stopping and does not accept new work.
    #[error("Selector loop is stopping")]
    Stopping,

    /// The selector loop is gone.
    #[error("Selector loop is closed")]
    SelectorClosed,

    /// The channel handed to the loop is already closed.
    #[error("Channel is closed")]
    ClosedChannel,

    // ============================================================================
    // Session Errors
    // ============================================================================
    /// The session is closing or closed and does not accept more data.
    #[error("Session {id} is closed")]
    SessionClosed {
        /// The id of the closed session.
        id: u64,
    },

    /// The operation was abandoned before it completed.
    #[error("Operation cancelled")]
    Cancelled,

    /// A generic message was written to a session without an encoder.
    #[error("Writing messages requires an encoder")]
    CodecRequired,

    /// The operation does not apply to this kind of session.
    #[error("Operation not supported by {kind} sessions")]
    Unsupported {
        /// The session kind.
        kind: &'static str,
    },

    /// The handler's framing asked for more bytes than are buffered.
    #[error("Framing reported {reported} bytes but only {available} are buffered")]
    Framing { reported: usize, available: usize },

    /// Error raised by a handler or encoder, with an explicit close action.
    #[error("{message}")]
    Handler {
        /// Human readable cause.
        message: String,
        /// What to do with the session afterwards.
        close_action: CloseAction,
    },

    // ============================================================================
    // Engine Errors
    // ============================================================================
    /// The engine reported a failure.
    #[error("Engine failure: {0}")]
    Engine(String),

    /// The engine stayed in the handshake for too many driver iterations.
    #[error("Handshake did not complete within {loops} loops")]
    HandshakeLoopsThreshold {
        /// The configured threshold that was exceeded.
        loops: usize,
    },

    /// The handshake did not complete before the configured timeout.
    #[error("Handshake timed out after {timeout_ms} ms")]
    HandshakeTimeout {
        /// The configured timeout.
        timeout_ms: u64,
    },

    /// A buffer needed to grow beyond the maximum the engine declared.
    #[error("Incorrect maximum fragment size: {buffer} buffer would exceed {max} bytes")]
    IncorrectFragmentSize {
        /// Which buffer hit its limit ("application" or "network").
        buffer: &'static str,
        /// The maximum size.
        max: usize,
    },

    /// The engine returned a status that is not valid for the call.
    #[error("Unexpected engine status {status} during {operation}")]
    UnexpectedEngineStatus {
        /// The status name.
        status: &'static str,
        /// "wrap" or "unwrap".
        operation: &'static str,
    },

    /// A delegated engine task failed on the executor.
    #[error("Delegated task failed: {0}")]
    DelegatedTask(String),

    /// The peer closed the connection without a proper close message.
    #[error("Connection closed without close message")]
    ClosedWithoutCloseMessage,

    // ============================================================================
    // TLS Errors
    // ============================================================================
    /// rustls rejected a record or handshake message.
    #[cfg(feature = "tls")]
    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    /// Failed to load TLS certificate file from disk.
    #[cfg(feature = "tls")]
    #[error("Failed to load certificate from {path}: {source}")]
    TlsCertificateLoad {
        path: String,
        source: std::io::Error,
    },

    /// Failed to load TLS private key file from disk.
    #[cfg(feature = "tls")]
    #[error("Failed to load private key from {path}: {source}")]
    TlsKeyLoad {
        path: String,
        source: std::io::Error,
    },

    /// Certificate file format is invalid or unsupported.
    #[cfg(feature = "tls")]
    #[error("Invalid certificate format: {0}")]
    TlsInvalidCertificate(String),

    /// Private key file format is invalid or unsupported.
    #[cfg(feature = "tls")]
    #[error("Invalid private key format: {0}")]
    TlsInvalidKey(String),

    /// Server name for TLS SNI is invalid.
    #[cfg(feature = "tls")]
    #[error("Invalid server name '{0}'")]
    TlsInvalidServerName(String),

    /// A server engine was requested but `tls_server_cert`/`tls_server_key`
    /// are not configured.
    #[cfg(feature = "tls")]
    #[error("TLS server configuration not provided")]
    TlsServerConfigMissing,

    /// A client engine was requested but `tls_ca_cert` is not configured.
    #[cfg(feature = "tls")]
    #[error("TLS client configuration not provided")]
    TlsClientConfigMissing,

    /// Failed to build TLS server configuration from provided settings.
    #[cfg(feature = "tls")]
    #[error("Failed to build TLS server config: {0}")]
    TlsServerConfigBuild(String),

    /// Failed to build TLS client configuration from provided settings.
    #[cfg(feature = "tls")]
    #[error("Failed to build TLS client config: {0}")]
    TlsClientConfigBuild(String),

    // ============================================================================
    // Configuration Errors
    // ============================================================================
    /// Configuration file parsing or key lookup failed.
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// A configuration value is out of its valid range.
    #[error("Invalid value for '{key}': {message}")]
    InvalidConfig { key: String, message: String },
}

impl Error {
    /// Returns how the session should be closed after this error was fired.
    pub fn close_action(&self) -> CloseAction {
        match self {
            Error::Handler { close_action, .. } => *close_action,
            _ => CloseAction::Default,
        }
    }

    /// Creates a handler error that closes the session gently.
    pub fn gentle(message: impl Into<String>) -> Self {
        Error::Handler {
            message: message.into(),
            close_action: CloseAction::Gentle,
        }
    }

    /// Creates a handler error that leaves the session open.
    pub fn ignorable(message: impl Into<String>) -> Self {
        Error::Handler {
            message: message.into(),
            close_action: CloseAction::None,
        }
    }

    /// Returns `true` for a would-block I/O error.
    pub(crate) fn is_would_block(&self) -> bool {
        matches!(self, Error::Io(err) if err.kind() == std::io::ErrorKind::WouldBlock)
    }
}
