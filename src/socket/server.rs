use std::{
    io::ErrorKind,
    net::{TcpListener, TcpStream, ToSocketAddrs, UdpSocket},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use log::{debug, info, warn};

use crate::protocol::Protocol;

use super::{
    Address, DatagramTransport, Socket, SocketError, StreamTransport, TransportKind,
    transport::loopback,
};

enum Listener {
    Stream(TcpListener),
    Datagram(Arc<UdpSocket>),
}

/// Bound endpoint handing out one [`Socket`] per [`Server::handle`] call.
///
/// The server does not loop by itself; a driver calls `handle` repeatedly.
pub struct Server {
    listener: Listener,
    protocol: Arc<dyn Protocol>,
    address: Address,
    closed: AtomicBool,
}

impl Server {
    /// Binds a listener of the kind the protocol requires.
    pub fn bind<P, A>(protocol: P, address: A) -> Result<Self, SocketError>
    where
        P: Protocol + 'static,
        A: ToSocketAddrs,
    {
        Self::bind_shared(Arc::new(protocol), address)
    }

    pub fn bind_shared<A>(protocol: Arc<dyn Protocol>, address: A) -> Result<Self, SocketError>
    where
        A: ToSocketAddrs,
    {
        let listener = match protocol.kind() {
            TransportKind::Stream => Listener::Stream(TcpListener::bind(address)?),
            TransportKind::Datagram => Listener::Datagram(Arc::new(UdpSocket::bind(address)?)),
        };
        let address = match &listener {
            Listener::Stream(l) => l.local_addr()?,
            Listener::Datagram(s) => s.local_addr()?,
        };
        info!("{} server bound at {address}", protocol.kind());

        Ok(Self {
            listener,
            protocol,
            address,
            closed: AtomicBool::new(false),
        })
    }

    /// Address the server is actually bound to.
    pub fn address(&self) -> Address {
        self.address
    }

    pub fn protocol(&self) -> &Arc<dyn Protocol> {
        &self.protocol
    }

    pub fn closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Waits for the next connection. A datagram server returns a socket over its own
    /// bound endpoint immediately.
    pub fn accept(&self) -> Result<Socket, SocketError> {
        if self.closed() {
            return Err(SocketError::Closed);
        }

        match &self.listener {
            Listener::Stream(listener) => {
                let (stream, peer) = loop {
                    match listener.accept() {
                        Ok(accepted) => break accepted,
                        Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                        Err(e) if self.closed() => {
                            debug!("accept failed after close: {e}");
                            return Err(SocketError::Closed);
                        }
                        Err(e) => return Err(e.into()),
                    }
                };
                if self.closed() {
                    return Err(SocketError::Closed);
                }
                info!("accepted connection from {peer}");
                Socket::new(
                    StreamTransport::new(stream),
                    Arc::clone(&self.protocol),
                    Some(peer),
                )
            }
            Listener::Datagram(socket) => Socket::new(
                DatagramTransport::new(Arc::clone(socket)),
                Arc::clone(&self.protocol),
                None,
            ),
        }
    }

    /// Accepts one connection and invokes `action` with it.
    pub fn handle<F, R>(&self, action: F) -> Result<R, SocketError>
    where
        F: FnOnce(&Server, Socket) -> R,
    {
        let socket = self.accept()?;
        Ok(action(self, socket))
    }

    /// Stops accepting connections, waking an `accept` blocked on another thread.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("closing server at {}", self.address);

        if let Listener::Stream(_) = self.listener {
            if let Err(e) = TcpStream::connect(loopback(self.address)) {
                warn!("failed to wake listener: {e}");
            }
        }
    }
}
