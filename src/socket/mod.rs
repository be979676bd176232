//! Unified socket layer.
//!
//! This module wraps a single transport endpoint, either a connected stream or a datagram
//! endpoint, behind one send/receive/close contract. Every [`Socket`] pairs a [`Transport`]
//! with a [`Protocol`](crate::protocol::Protocol) that turns application payloads into wire
//! bytes and back.
//!
//! # Overview
//!
//! - A stream socket has exactly one peer, fixed when the connection is established.
//! - A datagram socket reports the sender of every received message. When no peer was
//!   configured, the first sender becomes the socket's peer so replies have a destination.
//!
//! All I/O failures are surfaced as [`SocketError::Transport`]. Calling any operation on a
//! closed socket yields [`SocketError::Closed`], including a receive that was blocked when
//! [`Socket::close`] was called from another thread.
//!
//! # Key Components
//!
//! - [`Socket`]: The unified send/receive/close endpoint.
//! - [`Server`]: Binds an address and hands out one [`Socket`] per `handle` call.
//! - [`Client`]: Connects to a server using the same protocol.
//! - [`SenderQueue`]: Buffers outbound payloads until a driver flushes them in order.
//! - [`Transport`]: Raw byte transport implemented for TCP streams and UDP endpoints.
//!
//! # See Also
//!
//! - [`protocol`](crate::protocol): Message framing on top of a transport.
//! - [`pubsub`](crate::pubsub): Streaming built on sockets.
mod client;
mod queue;
mod server;
mod transport;

use std::{
    fmt, io,
    net::SocketAddr,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
};

use log::trace;
use thiserror::Error;

use crate::protocol::Protocol;

pub use client::Client;
pub use queue::SenderQueue;
pub use server::Server;
pub use transport::{DatagramTransport, StreamTransport, Transport};

/// Network address of a socket endpoint.
pub type Address = SocketAddr;

/// Kind of transport a socket or protocol operates on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    /// Connection oriented byte stream with no message boundaries.
    Stream,
    /// Connectionless transport delivering one message per receive.
    Datagram,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Stream => write!(f, "stream"),
            TransportKind::Datagram => write!(f, "datagram"),
        }
    }
}

#[derive(Debug, Error)]
pub enum SocketError {
    #[error("operation on a closed socket")]
    Closed,
    #[error("transport error: {0}")]
    Transport(#[from] io::Error),
    #[error("peer closed mid-frame; expected {expected} bytes, received {received}")]
    TruncatedMessage { expected: usize, received: usize },
    #[error("peer closed the connection")]
    ConnectionClosed,
    #[error("protocol mismatch: {0}")]
    ProtocolMismatch(String),
    #[error("payload of {len} bytes exceeds the maximum of {max} bytes")]
    PayloadTooLarge { len: u64, max: u64 },
    #[error("invalid header width {0}; expected 1 to 8 bytes")]
    InvalidHeaderWidth(usize),
    #[error("datagram socket has no peer to send to")]
    MissingPeer,
}

/// A transport endpoint combined with a framing protocol.
///
/// Sends and receives are serialised separately, so one thread may block in
/// [`Socket::receive`] while another sends or closes the socket.
pub struct Socket {
    transport: Box<dyn Transport>,
    protocol: Arc<dyn Protocol>,
    peer: Mutex<Option<Address>>,
    closed: AtomicBool,
    writer: Mutex<()>,
    reader: Mutex<()>,
}

impl Socket {
    /// Wraps a transport under a protocol. Both must agree on the transport kind, a
    /// datagram protocol cannot recover message boundaries from a stream and a stream
    /// protocol cannot span datagrams.
    pub fn new<T>(
        transport: T,
        protocol: Arc<dyn Protocol>,
        peer: Option<Address>,
    ) -> Result<Self, SocketError>
    where
        T: Transport + 'static,
    {
        if transport.kind() != protocol.kind() {
            return Err(SocketError::ProtocolMismatch(format!(
                "{} protocol cannot run over a {} transport",
                protocol.kind(),
                transport.kind()
            )));
        }

        Ok(Self {
            transport: Box::new(transport),
            protocol,
            peer: Mutex::new(peer),
            closed: AtomicBool::new(false),
            writer: Mutex::new(()),
            reader: Mutex::new(()),
        })
    }

    pub fn kind(&self) -> TransportKind {
        self.transport.kind()
    }

    pub fn protocol(&self) -> &Arc<dyn Protocol> {
        &self.protocol
    }

    pub fn peer(&self) -> Option<Address> {
        *lock(&self.peer)
    }

    pub fn local_addr(&self) -> Result<Address, SocketError> {
        Ok(self.transport.local_addr()?)
    }

    pub fn closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Packs `payload` under the socket's protocol and writes it to the peer.
    pub fn send(&self, payload: &[u8]) -> Result<(), SocketError> {
        self.ensure_open()?;
        let frame = self.protocol.pack(payload)?;
        let peer = self.peer();
        if self.kind() == TransportKind::Datagram && peer.is_none() {
            return Err(SocketError::MissingPeer);
        }

        let _guard = lock(&self.writer);
        trace!("sending {} byte frame", frame.len());
        self.transport
            .send(&frame, peer)
            .map_err(|e| self.closed_or(e.into()))
    }

    /// Blocks until one full message has been unpacked, returning it with the address it
    /// came from.
    pub fn receive(&self) -> Result<(Vec<u8>, Option<Address>), SocketError> {
        self.ensure_open()?;
        let _guard = lock(&self.reader);
        let result = self.protocol.unpack(self.transport.as_ref());
        self.ensure_open()?;

        let (payload, from) = result?;
        let mut peer = lock(&self.peer);
        if peer.is_none() {
            *peer = from;
        }
        trace!("received {} byte message", payload.len());
        Ok((payload, from.or(*peer)))
    }

    /// Closes the socket. Any receive blocked on another thread returns
    /// [`SocketError::Closed`]. Closing twice is a no-op.
    pub fn close(&self) -> Result<(), SocketError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        trace!("closing {} socket", self.kind());
        self.transport.shutdown()?;
        Ok(())
    }

    fn ensure_open(&self) -> Result<(), SocketError> {
        if self.closed() {
            Err(SocketError::Closed)
        } else {
            Ok(())
        }
    }

    fn closed_or(&self, err: SocketError) -> SocketError {
        if self.closed() { SocketError::Closed } else { err }
    }
}

impl fmt::Debug for Socket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Socket")
            .field("kind", &self.kind())
            .field("protocol", &self.protocol)
            .field("peer", &self.peer())
            .field("closed", &self.closed())
            .finish()
    }
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use std::{
        net::{TcpListener, TcpStream},
        thread,
    };

    use crate::protocol::{Bhp, Datagram};

    use super::*;

    fn stream_pair() -> (Socket, Socket) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let address = listener.local_addr().unwrap();
        let client = TcpStream::connect(address).unwrap();
        let (server, peer) = listener.accept().unwrap();
        let protocol: Arc<dyn Protocol> = Arc::new(Bhp::default());

        (
            Socket::new(StreamTransport::new(server), protocol.clone(), Some(peer)).unwrap(),
            Socket::new(StreamTransport::new(client), protocol, Some(address)).unwrap(),
        )
    }

    #[test]
    fn send_receive_over_stream() {
        let (server, client) = stream_pair();

        client.send(b"hello").unwrap();
        let (payload, from) = server.receive().unwrap();

        assert_eq!(payload, b"hello");
        assert_eq!(from, server.peer());
    }

    #[test]
    fn operations_on_closed_socket() {
        let (server, _client) = stream_pair();
        server.close().unwrap();

        assert!(server.closed());
        assert!(matches!(server.send(b"x"), Err(SocketError::Closed)));
        assert!(matches!(server.receive(), Err(SocketError::Closed)));
        server.close().unwrap();
    }

    #[test]
    fn close_unblocks_receive() {
        let (server, _client) = stream_pair();
        let server = Arc::new(server);

        let blocked = {
            let server = Arc::clone(&server);
            thread::spawn(move || server.receive())
        };
        thread::sleep(std::time::Duration::from_millis(50));
        server.close().unwrap();

        let result = blocked.join().unwrap();
        assert!(matches!(result, Err(SocketError::Closed)));
    }

    #[test]
    fn peer_close_is_connection_closed() {
        let (server, client) = stream_pair();
        drop(client);

        assert!(matches!(server.receive(), Err(SocketError::ConnectionClosed)));
    }

    #[test]
    fn protocol_must_match_transport() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let stream = TcpStream::connect(listener.local_addr().unwrap()).unwrap();

        let res = Socket::new(StreamTransport::new(stream), Arc::new(Datagram::default()), None);
        assert!(matches!(res, Err(SocketError::ProtocolMismatch(_))));
    }

    #[test]
    fn datagram_without_peer_cannot_send() {
        let udp = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let socket = Socket::new(
            DatagramTransport::new(Arc::new(udp)),
            Arc::new(Datagram::default()),
            None,
        )
        .unwrap();

        assert!(matches!(socket.send(b"x"), Err(SocketError::MissingPeer)));
    }
}
