//! Publish/subscribe distribution over sockets.
//!
//! A producer appends [`Datum`] records to a shared [`DataStore`]. Each accepted connection is
//! wrapped in a [`Controller`] created by the [`SubscriptionStreamer`], which authenticates the
//! peer, tracks its topics and pushes every new matching record. On the other end a
//! [`ClientSubscriber`] sends the commands and queues what arrives.
//!
//! # Overview
//!
//! ```text
//! producer -> DataStore::insert
//!                 |
//!   Controller::send_once  (since(topics, cursor), advance cursor)
//!                 |
//!        Socket + Protocol  ---- wire ---->  SubscriberReceiver -> ClientSubscriber::data
//! ```
//!
//! The first message on a connection must be [`Request::Authenticate`]; the decision comes from
//! the host's [`SubscriptionHooks::authenticate`]. Until it is accepted the connection never
//! receives data.
//!
//! # Wire Payloads
//!
//! [`Request`] and [`Response`] are encoded with bincode (big-endian, fixed-width integers) and
//! carried as one framed message each, under whichever protocol the socket uses.
//!
//! # See Also
//!
//! - [`socket`](crate::socket): Transport and framing underneath.
//! - [`driver`](crate::driver): Repeats the single-shot operations exposed here.
mod auth;
mod datum;
mod message;
mod store;
mod streamer;
mod subscriber;

use thiserror::Error;

use crate::socket::SocketError;

pub use auth::{AllowList, Authorization, Credentials, SubscriptionHooks};
pub use datum::{Datum, timestamp};
pub use message::{MessageChannel, Request, Response};
pub use store::{Cursor, DataStore, Delta};
pub use streamer::{Controller, ControllerState, RunMode, StreamerConfig, SubscriptionStreamer};
pub use subscriber::{ClientSubscriber, Inbound, SubscriberReceiver};

#[derive(Debug, Error)]
pub enum StreamError {
    #[error(transparent)]
    Socket(#[from] SocketError),
    #[error("failed to encode message: {0}")]
    Encode(#[from] bincode::error::EncodeError),
    #[error("failed to decode message: {0}")]
    Decode(#[from] bincode::error::DecodeError),
    #[error("authentication rejected{}", .0.as_ref().map(|r| format!(": {r}")).unwrap_or_default())]
    AuthenticationRejected(Option<String>),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("connection is closed")]
    Closed,
}

impl StreamError {
    /// True when the error only reports that the connection ended.
    pub fn is_disconnect(&self) -> bool {
        matches!(
            self,
            StreamError::Closed
                | StreamError::Socket(SocketError::Closed)
                | StreamError::Socket(SocketError::ConnectionClosed)
        )
    }
}
