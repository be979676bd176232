use crate::socket::{Address, SocketError, Transport, TransportKind};

use super::Protocol;

/// Largest payload a single UDP datagram can carry over IPv4.
pub const DEFAULT_DATAGRAM_BUFFER: usize = 65_507;

/// Identity framing. Relies on the transport delivering exactly one message per receive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Datagram {
    buffer: usize,
}

impl Default for Datagram {
    fn default() -> Self {
        Self {
            buffer: DEFAULT_DATAGRAM_BUFFER,
        }
    }
}

impl Datagram {
    /// Sets the receive buffer size; longer datagrams are cut by the OS.
    pub fn with_buffer(buffer: usize) -> Self {
        Self { buffer }
    }

    pub fn buffer(&self) -> usize {
        self.buffer
    }
}

impl Protocol for Datagram {
    fn kind(&self) -> TransportKind {
        TransportKind::Datagram
    }

    fn pack(&self, payload: &[u8]) -> Result<Vec<u8>, SocketError> {
        if payload.len() > self.buffer {
            return Err(SocketError::PayloadTooLarge {
                len: payload.len() as u64,
                max: self.buffer as u64,
            });
        }
        Ok(payload.to_vec())
    }

    fn unpack(
        &self,
        transport: &dyn Transport,
    ) -> Result<(Vec<u8>, Option<Address>), SocketError> {
        let mut buf = vec![0u8; self.buffer];
        let (n, from) = transport.recv(&mut buf)?;
        buf.truncate(n);
        Ok((buf, from))
    }
}

#[cfg(test)]
mod tests {
    use std::{net::UdpSocket, sync::Arc};

    use crate::socket::DatagramTransport;

    use super::*;

    #[test]
    fn pack_is_identity() {
        assert_eq!(Datagram::default().pack(b"raw").unwrap(), b"raw");
    }

    #[test]
    fn pack_rejects_oversized_payload() {
        assert!(matches!(
            Datagram::with_buffer(4).pack(b"12345"),
            Err(SocketError::PayloadTooLarge { len: 5, max: 4 })
        ));
    }

    #[test]
    fn one_send_is_one_receive() {
        let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
        let receiver = DatagramTransport::new(Arc::new(UdpSocket::bind("127.0.0.1:0").unwrap()));
        let target = receiver.local_addr().unwrap();
        sender.send_to(b"one", target).unwrap();
        sender.send_to(b"", target).unwrap();
        sender.send_to(b"three", target).unwrap();

        let protocol = Datagram::default();
        assert_eq!(protocol.unpack(&receiver).unwrap().0, b"one");
        assert_eq!(protocol.unpack(&receiver).unwrap().0, b"");
        let (payload, from) = protocol.unpack(&receiver).unwrap();
        assert_eq!(payload, b"three");
        assert_eq!(from, Some(sender.local_addr().unwrap()));
    }
}
