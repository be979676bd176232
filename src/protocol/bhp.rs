use log::trace;

use crate::socket::{Address, SocketError, Transport, TransportKind};

use super::Protocol;

pub const DEFAULT_HEADER_WIDTH: usize = 4;
pub const MAX_HEADER_WIDTH: usize = size_of::<u64>();
/// Largest frame accepted by default. A declared length above the limit almost always means
/// the peer speaks a different protocol or header width.
pub const DEFAULT_MAX_PAYLOAD: u64 = 64 * 1024 * 1024;

/// Binary header protocol: `[length: N bytes, big-endian][payload: length bytes]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bhp {
    header_width: usize,
    max_payload: u64,
}

impl Default for Bhp {
    fn default() -> Self {
        Self {
            header_width: DEFAULT_HEADER_WIDTH,
            max_payload: DEFAULT_MAX_PAYLOAD,
        }
    }
}

impl Bhp {
    pub fn new(header_width: usize) -> Result<Self, SocketError> {
        if header_width == 0 || header_width > MAX_HEADER_WIDTH {
            return Err(SocketError::InvalidHeaderWidth(header_width));
        }
        Ok(Self {
            header_width,
            ..Self::default()
        })
    }

    pub fn with_max_payload(mut self, max_payload: u64) -> Self {
        self.max_payload = max_payload;
        self
    }

    pub fn header_width(&self) -> usize {
        self.header_width
    }

    /// Largest payload both the header width and the configured limit allow.
    pub fn max_payload(&self) -> u64 {
        let representable = match self.header_width {
            MAX_HEADER_WIDTH => u64::MAX,
            width => (1u64 << (8 * width)) - 1,
        };
        representable.min(self.max_payload)
    }

    fn encode_header(&self, len: u64) -> impl Iterator<Item = u8> {
        len.to_be_bytes().into_iter().skip(MAX_HEADER_WIDTH - self.header_width)
    }

    fn decode_header(&self, header: &[u8]) -> u64 {
        let mut bytes = [0u8; MAX_HEADER_WIDTH];
        bytes[MAX_HEADER_WIDTH - self.header_width..].copy_from_slice(header);
        u64::from_be_bytes(bytes)
    }
}

impl Protocol for Bhp {
    fn kind(&self) -> TransportKind {
        TransportKind::Stream
    }

    fn pack(&self, payload: &[u8]) -> Result<Vec<u8>, SocketError> {
        let len = payload.len() as u64;
        let max = self.max_payload();
        if len > max {
            return Err(SocketError::PayloadTooLarge { len, max });
        }

        let mut frame = Vec::with_capacity(self.header_width + payload.len());
        frame.extend(self.encode_header(len));
        frame.extend_from_slice(payload);
        Ok(frame)
    }

    fn unpack(
        &self,
        transport: &dyn Transport,
    ) -> Result<(Vec<u8>, Option<Address>), SocketError> {
        let mut header = [0u8; MAX_HEADER_WIDTH];
        let header = &mut header[..self.header_width];

        let (read, address) = fill(transport, header)?;
        if read == 0 {
            return Err(SocketError::ConnectionClosed);
        }
        if read < self.header_width {
            return Err(SocketError::TruncatedMessage {
                expected: self.header_width,
                received: read,
            });
        }

        let len = self.decode_header(header);
        let max = self.max_payload();
        if len > max {
            return Err(SocketError::ProtocolMismatch(format!(
                "declared frame length {len} exceeds the limit of {max} bytes"
            )));
        }
        trace!("frame header declares {len} bytes");

        // Bounded by max_payload above, which fits in memory by construction.
        let len = len as usize;
        let mut payload = vec![0u8; len];
        if len > 0 {
            let (read, _) = fill(transport, &mut payload)?;
            if read < len {
                return Err(SocketError::TruncatedMessage {
                    expected: len,
                    received: read,
                });
            }
        }

        Ok((payload, address))
    }
}

/// Reads until `buf` is full or the stream ends, returning how many bytes arrived.
fn fill(
    transport: &dyn Transport,
    buf: &mut [u8],
) -> Result<(usize, Option<Address>), SocketError> {
    let mut filled = 0;
    let mut address = None;

    while filled < buf.len() {
        let (n, from) = transport.recv(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
        address = address.or(from);
    }

    Ok((filled, address))
}
