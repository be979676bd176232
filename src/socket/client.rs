use std::{
    io::{self, ErrorKind},
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, TcpStream, ToSocketAddrs, UdpSocket},
    sync::Arc,
};

use log::info;

use crate::protocol::Protocol;

use super::{Address, DatagramTransport, Socket, SocketError, StreamTransport, TransportKind};

/// Builds sockets connected to a server.
///
/// Nothing on the wire identifies the protocol, so the client must be configured with the
/// same protocol (and for BHP, the same header width) as the server it targets.
#[derive(Debug, Clone)]
pub struct Client {
    protocol: Arc<dyn Protocol>,
}

impl Client {
    pub fn new<P: Protocol + 'static>(protocol: P) -> Self {
        Self {
            protocol: Arc::new(protocol),
        }
    }

    pub fn with_shared(protocol: Arc<dyn Protocol>) -> Self {
        Self { protocol }
    }

    pub fn protocol(&self) -> &Arc<dyn Protocol> {
        &self.protocol
    }

    pub fn connect<A: ToSocketAddrs>(&self, address: A) -> Result<Socket, SocketError> {
        let address = resolve(address)?;

        let socket = match self.protocol.kind() {
            TransportKind::Stream => {
                let stream = TcpStream::connect(address)?;
                stream.set_nodelay(true)?;
                Socket::new(
                    StreamTransport::new(stream),
                    Arc::clone(&self.protocol),
                    Some(address),
                )?
            }
            TransportKind::Datagram => {
                let local = SocketAddr::new(local_ip(address), 0);
                let udp = UdpSocket::bind(local)?;
                Socket::new(
                    DatagramTransport::new(Arc::new(udp)),
                    Arc::clone(&self.protocol),
                    Some(address),
                )?
            }
        };
        info!("{} client connected to {address}", self.protocol.kind());

        Ok(socket)
    }
}

fn resolve<A: ToSocketAddrs>(address: A) -> Result<Address, SocketError> {
    address.to_socket_addrs()?.next().ok_or_else(|| {
        SocketError::Transport(io::Error::new(
            ErrorKind::InvalidInput,
            "address resolved to nothing",
        ))
    })
}

// A loopback peer answers from the loopback address, so bind there to keep the reported
// local address identical to what the peer sees.
fn local_ip(peer: Address) -> IpAddr {
    match peer.ip() {
        ip if ip.is_loopback() => ip,
        IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
    }
}

#[cfg(test)]
mod tests {
    use std::net::TcpListener;

    use crate::protocol::{Bhp, Datagram};

    use super::*;

    #[test]
    fn connect_failure_propagates() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let address = listener.local_addr().unwrap();
        drop(listener);

        let res = Client::new(Bhp::default()).connect(address);
        assert!(matches!(res, Err(SocketError::Transport(_))));
    }

    #[test]
    fn datagram_client_has_fixed_peer() {
        let peer: Address = "127.0.0.1:9".parse().unwrap();
        let socket = Client::new(Datagram::default()).connect(peer).unwrap();

        assert_eq!(socket.kind(), TransportKind::Datagram);
        assert_eq!(socket.peer(), Some(peer));
        assert!(socket.local_addr().unwrap().ip().is_loopback());
    }
}
