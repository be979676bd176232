use std::{
    fmt,
    io::{self, ErrorKind, Read, Write},
    net::{IpAddr, Ipv4Addr, Ipv6Addr, Shutdown, TcpStream, UdpSocket},
    sync::Arc,
};

use log::trace;

use super::{Address, TransportKind};

/// Raw byte transport underneath a [`Socket`](super::Socket).
///
/// Implementations take `&self` so that a receive blocked on one thread does not prevent a
/// send or a shutdown on another.
pub trait Transport: Send + Sync + fmt::Debug {
    fn kind(&self) -> TransportKind;

    /// Writes all of `bytes`. Datagram transports send them as one message to `peer`.
    fn send(&self, bytes: &[u8], peer: Option<Address>) -> io::Result<()>;

    /// Reads up to `buf.len()` bytes. A stream returns `0` once the peer has closed.
    fn recv(&self, buf: &mut [u8]) -> io::Result<(usize, Option<Address>)>;

    /// Releases the endpoint and wakes any blocked [`Transport::recv`].
    fn shutdown(&self) -> io::Result<()>;

    fn local_addr(&self) -> io::Result<Address>;
}

#[derive(Debug)]
pub struct StreamTransport {
    stream: TcpStream,
    peer: Option<Address>,
}

impl StreamTransport {
    pub fn new(stream: TcpStream) -> Self {
        let peer = stream.peer_addr().ok();
        Self { stream, peer }
    }
}

impl Transport for StreamTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Stream
    }

    fn send(&self, bytes: &[u8], _peer: Option<Address>) -> io::Result<()> {
        let mut stream = &self.stream;
        stream.write_all(bytes)?;
        stream.flush()
    }

    fn recv(&self, buf: &mut [u8]) -> io::Result<(usize, Option<Address>)> {
        let mut stream = &self.stream;
        loop {
            match stream.read(buf) {
                Ok(n) => return Ok((n, self.peer)),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    fn shutdown(&self) -> io::Result<()> {
        match self.stream.shutdown(Shutdown::Both) {
            Err(e) if e.kind() == ErrorKind::NotConnected => Ok(()),
            res => res,
        }
    }

    fn local_addr(&self) -> io::Result<Address> {
        self.stream.local_addr()
    }
}

/// Datagram endpoint, possibly shared by every socket a datagram server hands out.
#[derive(Debug, Clone)]
pub struct DatagramTransport {
    socket: Arc<UdpSocket>,
}

impl DatagramTransport {
    pub fn new(socket: Arc<UdpSocket>) -> Self {
        Self { socket }
    }
}

impl Transport for DatagramTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Datagram
    }

    fn send(&self, bytes: &[u8], peer: Option<Address>) -> io::Result<()> {
        let peer = peer.ok_or_else(|| io::Error::new(ErrorKind::NotConnected, "no peer"))?;
        let sent = self.socket.send_to(bytes, peer)?;
        if sent != bytes.len() {
            return Err(io::Error::new(
                ErrorKind::WriteZero,
                format!("datagram truncated to {sent} of {} bytes", bytes.len()),
            ));
        }
        Ok(())
    }

    fn recv(&self, buf: &mut [u8]) -> io::Result<(usize, Option<Address>)> {
        let (n, from) = self.socket.recv_from(buf)?;
        Ok((n, Some(from)))
    }

    // UDP has no shutdown; an empty datagram to ourselves wakes a blocked recv_from so the
    // socket can observe its closed flag.
    fn shutdown(&self) -> io::Result<()> {
        let address = loopback(self.socket.local_addr()?);
        trace!("waking datagram receiver at {address}");
        self.socket.send_to(&[], address)?;
        Ok(())
    }

    fn local_addr(&self) -> io::Result<Address> {
        self.socket.local_addr()
    }
}

/// Replaces an unspecified bind address with the loopback address of the same family.
pub(crate) fn loopback(mut address: Address) -> Address {
    if address.ip().is_unspecified() {
        let ip = match address.ip() {
            IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::LOCALHOST),
            IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::LOCALHOST),
        };
        address.set_ip(ip);
    }
    address
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loopback_replaces_unspecified() {
        let address: Address = "0.0.0.0:4000".parse().unwrap();
        assert_eq!(loopback(address), "127.0.0.1:4000".parse().unwrap());

        let address: Address = "10.0.0.2:4000".parse().unwrap();
        assert_eq!(loopback(address), address);
    }

    #[test]
    fn datagram_reports_sender() {
        let a = UdpSocket::bind("127.0.0.1:0").unwrap();
        let b = DatagramTransport::new(Arc::new(UdpSocket::bind("127.0.0.1:0").unwrap()));
        a.send_to(b"ping", b.local_addr().unwrap()).unwrap();

        let mut buf = [0; 16];
        let (n, from) = b.recv(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"ping");
        assert_eq!(from, Some(a.local_addr().unwrap()));
    }
}
