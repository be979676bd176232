use std::{fmt, sync::Arc};

use bincode::{
    Decode, Encode,
    config::{BigEndian, Configuration, Fixint},
    decode_from_slice, encode_to_vec,
};
use log::trace;

use crate::socket::Socket;

use super::{Authorization, Credentials, Datum, StreamError};

/// Messages sent by a subscriber.
#[derive(Debug, Clone, Encode, Decode, PartialEq, Eq)]
pub enum Request {
    Authenticate(Credentials),
    Subscribe(Vec<String>),
    Unsubscribe(Vec<String>),
    Pause,
    Unpause,
}

/// Messages sent by the streamer.
#[derive(Debug, Clone, Encode, Decode, PartialEq, Eq)]
pub enum Response {
    Authorization(Authorization),
    Data(Datum),
    Invalid { reason: String },
}

/// Typed request/response exchange over a shared socket.
#[derive(Clone)]
pub struct MessageChannel {
    socket: Arc<Socket>,
    config: Configuration<BigEndian, Fixint>,
}

impl MessageChannel {
    pub fn new(socket: Arc<Socket>) -> Self {
        let config = bincode::config::standard()
            .with_big_endian()
            .with_fixed_int_encoding();
        Self { socket, config }
    }

    pub fn socket(&self) -> &Arc<Socket> {
        &self.socket
    }

    pub fn write_request(&self, req: &Request) -> Result<(), StreamError> {
        self.write(req)
    }

    pub fn write_response(&self, resp: &Response) -> Result<(), StreamError> {
        self.write(resp)
    }

    pub fn read_request(&self) -> Result<Request, StreamError> {
        self.read()
    }

    pub fn read_response(&self) -> Result<Response, StreamError> {
        self.read()
    }

    fn write<T: Encode>(&self, message: &T) -> Result<(), StreamError> {
        let bytes = encode_to_vec(message, self.config)?;
        self.socket.send(&bytes)?;
        Ok(())
    }

    fn read<T: Decode<()>>(&self) -> Result<T, StreamError> {
        let (bytes, _) = self.socket.receive()?;
        let (message, read) = decode_from_slice(&bytes, self.config)?;
        if read != bytes.len() {
            trace!("ignoring {} trailing bytes", bytes.len() - read);
        }
        Ok(message)
    }
}

impl fmt::Debug for MessageChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageChannel")
            .field("socket", &self.socket)
            .finish()
    }
}
