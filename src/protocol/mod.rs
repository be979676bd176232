//! Message framing protocols.
//!
//! A [`Protocol`] converts application payloads into wire bytes and recovers whole payloads
//! from a [`Transport`]. Datagram and stream transports need different strategies: a
//! datagram already carries one message per receive, while a stream is an unbounded byte
//! sequence that must be cut back into messages.
//!
//! # Key Components
//!
//! - [`Datagram`]: Identity framing for datagram transports.
//! - [`Bhp`]: Binary header protocol; each message is prefixed with its length.
//!
//! # Binary Format
//!
//! Under [`Bhp`] every frame is laid out as:
//!
//! - A header of `N` bytes holding the payload length as a big-endian unsigned integer.
//! - Exactly that many payload bytes.
//!
//! `N` is fixed when the protocol is constructed and must be the same on both ends of a
//! connection. A zero length header is a complete, empty message.
//!
//! # See Also
//!
//! - [`socket`](crate::socket): Sockets pair a transport with one of these protocols.
mod bhp;
mod datagram;

use std::fmt;

use crate::socket::{Address, SocketError, Transport, TransportKind};

pub use bhp::{Bhp, DEFAULT_HEADER_WIDTH, DEFAULT_MAX_PAYLOAD, MAX_HEADER_WIDTH};
pub use datagram::{DEFAULT_DATAGRAM_BUFFER, Datagram};

/// Strategy for turning payloads into wire bytes and back.
pub trait Protocol: Send + Sync + fmt::Debug {
    /// Transport kind this protocol is able to frame.
    fn kind(&self) -> TransportKind;

    fn pack(&self, payload: &[u8]) -> Result<Vec<u8>, SocketError>;

    /// Reads one complete message from `transport`, performing as many reads as needed.
    fn unpack(&self, transport: &dyn Transport)
    -> Result<(Vec<u8>, Option<Address>), SocketError>;
}

#[cfg(test)]
pub(crate) mod testing {
    use std::{collections::VecDeque, io, sync::Mutex};

    use crate::socket::{Address, Transport, TransportKind, lock};

    /// In-memory stream that hands out at most `chunk` bytes per read, then reports EOF.
    #[derive(Debug)]
    pub struct ChunkedStream {
        bytes: Mutex<VecDeque<u8>>,
        chunk: usize,
        reads: Mutex<usize>,
    }

    impl ChunkedStream {
        pub fn new(bytes: &[u8], chunk: usize) -> Self {
            assert!(chunk > 0);
            Self {
                bytes: Mutex::new(bytes.iter().copied().collect()),
                chunk,
                reads: Mutex::new(0),
            }
        }

        pub fn reads(&self) -> usize {
            *lock(&self.reads)
        }

        pub fn remaining(&self) -> usize {
            lock(&self.bytes).len()
        }
    }

    impl Transport for ChunkedStream {
        fn kind(&self) -> TransportKind {
            TransportKind::Stream
        }

        fn send(&self, bytes: &[u8], _peer: Option<Address>) -> io::Result<()> {
            lock(&self.bytes).extend(bytes);
            Ok(())
        }

        fn recv(&self, buf: &mut [u8]) -> io::Result<(usize, Option<Address>)> {
            *lock(&self.reads) += 1;
            let mut bytes = lock(&self.bytes);
            let n = buf.len().min(self.chunk).min(bytes.len());
            for (slot, byte) in buf.iter_mut().zip(bytes.drain(..n)) {
                *slot = byte;
            }
            Ok((n, None))
        }

        fn shutdown(&self) -> io::Result<()> {
            Ok(())
        }

        fn local_addr(&self) -> io::Result<Address> {
            Ok(([127, 0, 0, 1], 0).into())
        }
    }
}
