use super::{DataEvent, Session, SessionEvent};
use crate::error::{Error, IncidentKind};
use bytes::BytesMut;
use std::any::Any;
use std::net::SocketAddr;

/// Application callbacks of a session.
///
/// A handler is owned by the session's loop and every method is called on
/// the loop thread. It is dropped right after the `Ending` event.
///
/// Errors returned from `read` go through the session's exception path:
/// they are reported to [`Handler::exception`] and the session is then
/// closed according to [`Error::close_action`].
pub trait Handler: Send {
    /// Called with one complete frame of inbound data, as delimited by
    /// [`Handler::available`]. Datagram sessions get one call per datagram.
    fn read(&mut self, session: &Session, data: &[u8]) -> Result<(), Error>;

    /// Called for datagrams received on an unconnected datagram session.
    fn read_from(&mut self, session: &Session, data: &[u8], peer: SocketAddr) -> Result<(), Error> {
        let _ = peer;
        self.read(session, data)
    }

    /// Returns the length of the first complete frame in `data`, or 0 if more
    /// bytes are needed. The default treats every chunk as complete.
    fn available(&mut self, data: &[u8]) -> usize {
        data.len()
    }

    fn event(&mut self, session: &Session, event: SessionEvent) {
        let _ = (session, event);
    }

    fn data_event(&mut self, session: &Session, event: DataEvent, len: usize) {
        let _ = (session, event, len);
    }

    /// Called at most once per session, with the cause that closes it.
    fn exception(&mut self, session: &Session, error: &Error) {
        let _ = (session, error);
    }

    /// Returns `true` if the incident was handled. Unhandled incidents are
    /// logged as warnings.
    fn incident(&mut self, session: &Session, kind: IncidentKind, cause: &Error) -> bool {
        let _ = (session, kind, cause);
        false
    }

    /// Called when a timer scheduled with
    /// [`Session::schedule_timer`](super::Session::schedule_timer) expires.
    fn timer(&mut self, session: &Session, event: u64) {
        let _ = (session, event);
    }
}

/// Turns application messages into bytes for
/// [`Session::write_message`](super::Session::write_message).
pub trait Encoder: Send {
    fn encode(&mut self, message: &dyn Any, out: &mut BytesMut) -> Result<(), Error>;
}
