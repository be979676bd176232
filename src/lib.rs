pub mod cli;
pub mod driver;
pub mod protocol;
pub mod pubsub;
pub mod socket;

pub use cli::{Command, prompt};
pub use protocol::{Bhp, Datagram, Protocol};
pub use pubsub::{
    Authorization, ClientSubscriber, Controller, Credentials, DataStore, Datum, StreamError,
    StreamerConfig, SubscriptionHooks, SubscriptionStreamer,
};
pub use socket::{Address, Client, SenderQueue, Server, Socket, SocketError, TransportKind};
