use crate::error::Error;
use crate::session::SessionKind;
use mio::event::Source;
use mio::net::{TcpStream, UdpSocket};
use std::fmt;
use std::io::{self, IoSlice, Read, Write};
use std::net::{Shutdown, SocketAddr};

/// I/O capabilities the loop needs from a registered channel.
pub(crate) trait Transport: Source + Send + fmt::Debug {
    fn kind(&self) -> SessionKind;

    /// Reads into `buf`. Datagram transports also return the sender.
    fn recv(&mut self, buf: &mut [u8]) -> io::Result<(usize, Option<SocketAddr>)>;

    /// Writes `bufs` in order. Datagram transports send them as one datagram,
    /// to `target` if given, else to the connected peer.
    fn send(&mut self, bufs: &[IoSlice<'_>], target: Option<SocketAddr>) -> io::Result<usize>;

    fn take_error(&self) -> io::Result<Option<io::Error>>;

    fn local_addr(&self) -> io::Result<SocketAddr>;

    fn peer_addr(&self) -> io::Result<SocketAddr>;

    fn shutdown(&self);
}

impl Transport for TcpStream {
    fn kind(&self) -> SessionKind {
        SessionKind::Stream
    }

    fn recv(&mut self, buf: &mut [u8]) -> io::Result<(usize, Option<SocketAddr>)> {
        self.read(buf).map(|count| (count, None))
    }

    fn send(&mut self, bufs: &[IoSlice<'_>], _target: Option<SocketAddr>) -> io::Result<usize> {
        self.write_vectored(bufs)
    }

    fn take_error(&self) -> io::Result<Option<io::Error>> {
        TcpStream::take_error(self)
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        TcpStream::local_addr(self)
    }

    fn peer_addr(&self) -> io::Result<SocketAddr> {
        TcpStream::peer_addr(self)
    }

    fn shutdown(&self) {
        // The peer may already be gone; the socket is dropped either way.
        let _ = TcpStream::shutdown(self, Shutdown::Both);
    }
}

impl Transport for UdpSocket {
    fn kind(&self) -> SessionKind {
        SessionKind::Datagram
    }

    fn recv(&mut self, buf: &mut [u8]) -> io::Result<(usize, Option<SocketAddr>)> {
        self.recv_from(buf).map(|(count, addr)| (count, Some(addr)))
    }

    fn send(&mut self, bufs: &[IoSlice<'_>], target: Option<SocketAddr>) -> io::Result<usize> {
        let joined;
        let datagram: &[u8] = match bufs {
            [single] => &single[..],
            _ => {
                joined = bufs.iter().flat_map(|buf| buf.iter().copied()).collect::<Vec<_>>();
                &joined[..]
            }
        };
        match target {
            Some(addr) => self.send_to(datagram, addr),
            None => UdpSocket::send(self, datagram),
        }
    }

    fn take_error(&self) -> io::Result<Option<io::Error>> {
        UdpSocket::take_error(self)
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        UdpSocket::local_addr(self)
    }

    fn peer_addr(&self) -> io::Result<SocketAddr> {
        UdpSocket::peer_addr(self)
    }

    fn shutdown(&self) {}
}

/// A non-blocking channel to register with a selector loop.
#[derive(Debug)]
pub enum Channel {
    Stream(TcpStream),
    Datagram(UdpSocket),
}

impl Channel {
    /// Wraps a connected std stream, switching it to non-blocking mode.
    pub fn stream(stream: std::net::TcpStream) -> Result<Self, Error> {
        stream.set_nonblocking(true)?;
        stream.set_nodelay(true)?;
        Ok(Channel::Stream(TcpStream::from_std(stream)))
    }

    /// Wraps a bound (and optionally connected) std datagram socket,
    /// switching it to non-blocking mode.
    pub fn datagram(socket: std::net::UdpSocket) -> Result<Self, Error> {
        socket.set_nonblocking(true)?;
        Ok(Channel::Datagram(UdpSocket::from_std(socket)))
    }

    pub fn kind(&self) -> SessionKind {
        match self {
            Channel::Stream(_) => SessionKind::Stream,
            Channel::Datagram(_) => SessionKind::Datagram,
        }
    }

    pub(crate) fn into_transport(self) -> Box<dyn Transport> {
        match self {
            Channel::Stream(stream) => Box::new(stream),
            Channel::Datagram(socket) => Box::new(socket),
        }
    }
}

impl From<TcpStream> for Channel {
    fn from(stream: TcpStream) -> Self {
        Channel::Stream(stream)
    }
}

impl From<UdpSocket> for Channel {
    fn from(socket: UdpSocket) -> Self {
        Channel::Datagram(socket)
    }
}
