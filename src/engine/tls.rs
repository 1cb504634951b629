//! rustls adapter for the [`Engine`] contract.
//!
//! rustls already works on byte buffers (`read_tls`/`write_tls`), so the
//! adapter only maps its connection state onto wrap/unwrap results.

use super::tls_config::{load_tls_client_config, load_tls_server_config};
use super::{Engine, EngineResult, EngineStatus, HandshakeStatus};
use crate::config::{get_namespaced_string, optional};
use crate::error::Error;
use ::config::Config;
use rustls::pki_types::ServerName;
use std::io::{ErrorKind, Read, Write};
use std::sync::Arc;
use tracing::{debug, trace};

// Largest plaintext fragment of a TLS record.
const MAX_FRAGMENT_SIZE: usize = 16384;
// Upper bound of header, content type, padding and AEAD tag per record.
const MAX_RECORD_OVERHEAD: usize = 2048;

enum TlsConnection {
    Server(rustls::ServerConnection),
    Client(rustls::ClientConnection),
}

impl TlsConnection {
    fn read_tls(&mut self, rd: &mut dyn Read) -> Result<usize, std::io::Error> {
        match self {
            TlsConnection::Server(conn) => conn.read_tls(rd),
            TlsConnection::Client(conn) => conn.read_tls(rd),
        }
    }

    fn write_tls(&mut self, wr: &mut dyn Write) -> Result<usize, std::io::Error> {
        match self {
            TlsConnection::Server(conn) => conn.write_tls(wr),
            TlsConnection::Client(conn) => conn.write_tls(wr),
        }
    }

    fn process_new_packets(&mut self) -> Result<rustls::IoState, rustls::Error> {
        match self {
            TlsConnection::Server(conn) => conn.process_new_packets(),
            TlsConnection::Client(conn) => conn.process_new_packets(),
        }
    }

    fn wants_write(&self) -> bool {
        match self {
            TlsConnection::Server(conn) => conn.wants_write(),
            TlsConnection::Client(conn) => conn.wants_write(),
        }
    }

    fn writer(&mut self) -> rustls::Writer<'_> {
        match self {
            TlsConnection::Server(conn) => conn.writer(),
            TlsConnection::Client(conn) => conn.writer(),
        }
    }

    fn reader(&mut self) -> rustls::Reader<'_> {
        match self {
            TlsConnection::Server(conn) => conn.reader(),
            TlsConnection::Client(conn) => conn.reader(),
        }
    }

    fn is_handshaking(&self) -> bool {
        match self {
            TlsConnection::Server(conn) => conn.is_handshaking(),
            TlsConnection::Client(conn) => conn.is_handshaking(),
        }
    }

    fn send_close_notify(&mut self) {
        match self {
            TlsConnection::Server(conn) => conn.send_close_notify(),
            TlsConnection::Client(conn) => conn.send_close_notify(),
        }
    }
}

/// TLS engine over a rustls server or client connection.
pub struct TlsEngine {
    conn: TlsConnection,
    // Handshake state last reported to the driver.
    reported_handshaking: bool,
    plaintext_pending: bool,
    inbound_done: bool,
    close_sent: bool,
}

impl TlsEngine {
    pub fn server(config: Arc<rustls::ServerConfig>) -> Result<Self, Error> {
        let conn = rustls::ServerConnection::new(config)?;
        Ok(Self::with_connection(TlsConnection::Server(conn)))
    }

    /// Creates a client engine verifying the peer against `server_name`,
    /// which is also sent as SNI.
    pub fn client(config: Arc<rustls::ClientConfig>, server_name: &str) -> Result<Self, Error> {
        let name = ServerName::try_from(server_name.to_string())
            .map_err(|_| Error::TlsInvalidServerName(server_name.to_string()))?;
        let conn = rustls::ClientConnection::new(config, name)
            .map_err(|e| Error::TlsClientConfigBuild(e.to_string()))?;
        Ok(Self::with_connection(TlsConnection::Client(conn)))
    }

    fn with_connection(conn: TlsConnection) -> Self {
        Self {
            conn,
            reported_handshaking: true,
            plaintext_pending: false,
            inbound_done: false,
            close_sent: false,
        }
    }

    // Reports `Finished` once, on the first call after the handshake ended.
    fn result_status(&mut self) -> HandshakeStatus {
        if self.reported_handshaking && !self.conn.is_handshaking() {
            self.reported_handshaking = false;
            debug!("TLS handshake finished");
            return HandshakeStatus::Finished;
        }
        self.handshake_status()
    }

    fn read_plaintext(&mut self, dst: &mut [u8]) -> Result<usize, Error> {
        if dst.is_empty() {
            return Ok(0);
        }
        match self.conn.reader().read(dst) {
            Ok(count) => Ok(count),
            Err(err) if err.kind() == ErrorKind::WouldBlock => Ok(0),
            Err(err) => Err(err.into()),
        }
    }
}

impl Engine for TlsEngine {
    fn begin_handshake(&mut self) -> Result<(), Error> {
        // rustls starts on its own and TLS 1.3 has no renegotiation.
        trace!(handshaking = self.conn.is_handshaking(), "Begin handshake");
        Ok(())
    }

    fn handshake_status(&mut self) -> HandshakeStatus {
        if self.conn.wants_write() {
            HandshakeStatus::NeedWrap
        } else if self.plaintext_pending {
            HandshakeStatus::NeedUnwrapAgain
        } else if self.conn.is_handshaking() {
            HandshakeStatus::NeedUnwrap
        } else {
            HandshakeStatus::NotHandshaking
        }
    }

    fn wrap(&mut self, sources: &[&[u8]], dst: &mut [u8]) -> Result<EngineResult, Error> {
        let capacity = dst.len();
        let mut consumed = 0;
        if !self.conn.is_handshaking() && !self.close_sent && !self.conn.wants_write() {
            let mut budget = capacity
                .saturating_sub(MAX_RECORD_OVERHEAD)
                .min(MAX_FRAGMENT_SIZE);
            for source in sources {
                if budget == 0 {
                    break;
                }
                let chunk = &source[..source.len().min(budget)];
                let written = self.conn.writer().write(chunk)?;
                consumed += written;
                budget -= written;
                if written < chunk.len() {
                    break;
                }
            }
        }

        let mut produced = 0;
        let mut cursor: &mut [u8] = dst;
        while self.conn.wants_write() {
            let written = self.conn.write_tls(&mut cursor)?;
            if written == 0 {
                break;
            }
            produced += written;
        }

        let status = if capacity == 0 && self.conn.wants_write() {
            EngineStatus::BufferOverflow
        } else if self.close_sent && !self.conn.wants_write() && produced == 0 {
            EngineStatus::Closed
        } else {
            EngineStatus::Ok
        };
        Ok(EngineResult::new(
            status,
            self.result_status(),
            consumed,
            produced,
        ))
    }

    fn unwrap(&mut self, src: &[u8], dst: &mut [u8]) -> Result<EngineResult, Error> {
        let mut src = src;
        let mut consumed = 0;
        let mut produced = self.read_plaintext(dst)?;
        while produced < dst.len() && !src.is_empty() && !self.inbound_done {
            let read = self.conn.read_tls(&mut src)?;
            if read == 0 {
                break;
            }
            consumed += read;
            let io = self.conn.process_new_packets()?;
            if io.peer_has_closed() {
                debug!("Received TLS close_notify");
                self.inbound_done = true;
            }
            produced += self.read_plaintext(&mut dst[produced..])?;
        }
        self.plaintext_pending = produced == dst.len() && produced > 0;

        let status = if dst.is_empty() && self.plaintext_pending {
            EngineStatus::BufferOverflow
        } else if self.inbound_done && !self.plaintext_pending && produced == 0 {
            EngineStatus::Closed
        } else {
            EngineStatus::Ok
        };
        Ok(EngineResult::new(
            status,
            self.result_status(),
            consumed,
            produced,
        ))
    }

    fn close_inbound(&mut self) -> Result<(), Error> {
        if self.inbound_done {
            return Ok(());
        }
        self.inbound_done = true;
        Err(Error::ClosedWithoutCloseMessage)
    }

    fn close_outbound(&mut self) {
        if !self.close_sent {
            self.close_sent = true;
            self.conn.send_close_notify();
        }
    }

    fn is_inbound_done(&self) -> bool {
        self.inbound_done
    }

    fn is_outbound_done(&self) -> bool {
        self.close_sent && !self.conn.wants_write()
    }

    fn min_application_buffer_size(&self) -> usize {
        MAX_FRAGMENT_SIZE
    }

    fn max_application_buffer_size(&self) -> usize {
        4 * MAX_FRAGMENT_SIZE
    }

    fn min_network_buffer_size(&self) -> usize {
        MAX_FRAGMENT_SIZE + MAX_RECORD_OVERHEAD
    }

    fn max_network_buffer_size(&self) -> usize {
        4 * (MAX_FRAGMENT_SIZE + MAX_RECORD_OVERHEAD)
    }
}

// ============================================================================
// Engine Factory
// ============================================================================

/// Builds [`TlsEngine`]s from configuration.
///
/// # Configuration Keys
///
/// - `tls_server_cert` and `tls_server_key`: PEM files for server engines
/// - `tls_ca_cert`: PEM file with the roots trusted by client engines
/// - `tls_server_name`: name verified by client engines (default "localhost")
#[derive(Clone)]
pub struct TlsEngineFactory {
    server_config: Option<Arc<rustls::ServerConfig>>,
    client_config: Option<Arc<rustls::ClientConfig>>,
    server_name: String,
}

impl TlsEngineFactory {
    /// Creates a factory with configuration namespacing.
    pub fn new_named(config: &Config, name: &str) -> Result<Self, Error> {
        let server_config = match (
            optional_string(config, name, "tls_server_cert")?,
            optional_string(config, name, "tls_server_key")?,
        ) {
            (Some(cert_path), Some(key_path)) => {
                Some(Arc::new(load_tls_server_config(&cert_path, &key_path)?))
            }
            _ => None,
        };

        let client_config = match optional_string(config, name, "tls_ca_cert")? {
            Some(ca_cert_path) => Some(Arc::new(load_tls_client_config(&ca_cert_path)?)),
            None => None,
        };

        let server_name = optional_string(config, name, "tls_server_name")?
            .unwrap_or_else(|| "localhost".to_string());

        Ok(Self {
            server_config,
            client_config,
            server_name,
        })
    }

    pub fn new(config: &Config) -> Result<Self, Error> {
        Self::new_named(config, "")
    }

    pub fn server_engine(&self) -> Result<TlsEngine, Error> {
        let config = self
            .server_config
            .clone()
            .ok_or(Error::TlsServerConfigMissing)?;
        TlsEngine::server(config)
    }

    pub fn client_engine(&self) -> Result<TlsEngine, Error> {
        let config = self
            .client_config
            .clone()
            .ok_or(Error::TlsClientConfigMissing)?;
        TlsEngine::client(config, &self.server_name)
    }
}

fn optional_string(config: &Config, name: &str, key: &str) -> Result<Option<String>, Error> {
    Ok(optional(get_namespaced_string(config, name, key))?)
}
