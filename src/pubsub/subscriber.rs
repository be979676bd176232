//! Client side of the subscription protocol.
//!
//! A [`ClientSubscriber`] sends authentication and subscription commands. Pushed data is read
//! by a [`SubscriberReceiver`], which the host drives from its own thread, and handed to the
//! application through [`ClientSubscriber::data`].
use std::{
    collections::{BTreeSet, VecDeque},
    sync::{
        Arc, Condvar, Mutex, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
};

use log::{debug, warn};

use crate::{
    driver::{Flow, Operation},
    socket::{Socket, lock},
};

use super::{
    Authorization, Credentials, DataStore, Datum, MessageChannel, Request, Response, StreamError,
};

#[derive(Debug, Default)]
struct Inbox {
    queue: Mutex<VecDeque<Datum>>,
    ready: Condvar,
    closed: AtomicBool,
}

impl Inbox {
    fn push(&self, datum: Datum) {
        lock(&self.queue).push_back(datum);
        self.ready.notify_one();
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        // Taking the lock orders the store before any waiter re-checks the flag.
        drop(lock(&self.queue));
        self.ready.notify_all();
    }

    fn closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// What one [`SubscriberReceiver::receive_once`] call read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// A datum was queued.
    Data,
    Authorization(Authorization),
    Invalid(String),
}

/// Reads pushed messages and queues them for a [`ClientSubscriber`].
#[derive(Debug, Clone)]
pub struct SubscriberReceiver {
    channel: MessageChannel,
    inbox: Arc<Inbox>,
    store: Option<Arc<DataStore>>,
}

impl SubscriberReceiver {
    /// Blocks for one inbound message. Any failure other than an undecodable message ends
    /// the subscription and wakes callers blocked in [`ClientSubscriber::data`].
    pub fn receive_once(&self) -> Result<Inbound, StreamError> {
        let response = match self.channel.read_response() {
            Ok(response) => response,
            Err(e @ StreamError::Decode(_)) => return Err(e),
            Err(e) => {
                self.inbox.close();
                return Err(e);
            }
        };

        Ok(match response {
            Response::Data(datum) => {
                if let Some(store) = &self.store {
                    store.insert(datum.clone());
                }
                self.inbox.push(datum);
                Inbound::Data
            }
            Response::Authorization(authorization) => Inbound::Authorization(authorization),
            Response::Invalid { reason } => {
                warn!("server reported an invalid request: {reason}");
                Inbound::Invalid(reason)
            }
        })
    }
}

impl Operation for SubscriberReceiver {
    type Error = StreamError;

    fn run_once(&mut self) -> Result<Flow, StreamError> {
        self.receive_once()?;
        Ok(Flow::Continue)
    }
}

#[derive(Debug)]
pub struct ClientSubscriber {
    channel: MessageChannel,
    inbox: Arc<Inbox>,
    store: Option<Arc<DataStore>>,
    topics: Mutex<BTreeSet<String>>,
    paused: AtomicBool,
}

impl ClientSubscriber {
    pub fn new(socket: Socket) -> Self {
        Self {
            channel: MessageChannel::new(Arc::new(socket)),
            inbox: Arc::default(),
            store: None,
            topics: Mutex::default(),
            paused: AtomicBool::new(false),
        }
    }

    /// Also records every received datum in `store`.
    pub fn with_store(mut self, store: Arc<DataStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn socket(&self) -> &Arc<Socket> {
        self.channel.socket()
    }

    pub fn store(&self) -> Option<&Arc<DataStore>> {
        self.store.as_ref()
    }

    /// Topics requested so far.
    pub fn topics(&self) -> BTreeSet<String> {
        lock(&self.topics).clone()
    }

    pub fn paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    /// Handle that reads and queues inbound messages.
    pub fn receiver(&self) -> SubscriberReceiver {
        SubscriberReceiver {
            channel: self.channel.clone(),
            inbox: Arc::clone(&self.inbox),
            store: self.store.clone(),
        }
    }

    /// Sends the credentials and blocks until the server's decision arrives.
    ///
    /// Must be called before a [`SubscriberReceiver`] is driven elsewhere, since it reads
    /// from the socket itself.
    pub fn authenticate(&self, credentials: Credentials) -> Result<Authorization, StreamError> {
        self.channel
            .write_request(&Request::Authenticate(credentials))?;

        let receiver = self.receiver();
        loop {
            match receiver.receive_once()? {
                Inbound::Authorization(authorization) => {
                    debug!("authentication answered: {authorization:?}");
                    return Ok(authorization);
                }
                Inbound::Invalid(reason) => return Err(StreamError::InvalidRequest(reason)),
                Inbound::Data => continue,
            }
        }
    }

    pub fn subscribe<I, S>(&self, names: I) -> Result<(), StreamError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let names: Vec<String> = names.into_iter().map(Into::into).collect();
        self.channel
            .write_request(&Request::Subscribe(names.clone()))?;
        lock(&self.topics).extend(names);
        Ok(())
    }

    pub fn unsubscribe<I, S>(&self, names: I) -> Result<(), StreamError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let names: Vec<String> = names.into_iter().map(Into::into).collect();
        self.channel
            .write_request(&Request::Unsubscribe(names.clone()))?;
        let mut topics = lock(&self.topics);
        for name in &names {
            topics.remove(name);
        }
        Ok(())
    }

    pub fn pause(&self) -> Result<(), StreamError> {
        self.channel.write_request(&Request::Pause)?;
        self.paused.store(true, Ordering::Release);
        Ok(())
    }

    pub fn unpause(&self) -> Result<(), StreamError> {
        self.channel.write_request(&Request::Unpause)?;
        self.paused.store(false, Ordering::Release);
        Ok(())
    }

    /// Next received datum, blocking until one arrives. Once the connection has ended and
    /// the queue is drained, returns [`StreamError::Closed`].
    pub fn data(&self) -> Result<Datum, StreamError> {
        let mut queue = lock(&self.inbox.queue);
        loop {
            if let Some(datum) = queue.pop_front() {
                return Ok(datum);
            }
            if self.inbox.closed() || self.socket().closed() {
                return Err(StreamError::Closed);
            }
            queue = self
                .inbox
                .ready
                .wait(queue)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Next received datum if one is already queued.
    pub fn try_data(&self) -> Option<Datum> {
        lock(&self.inbox.queue).pop_front()
    }

    pub fn close(&self) -> Result<(), StreamError> {
        self.inbox.close();
        self.socket().close()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::{
        net::{TcpListener, TcpStream},
        thread,
    };

    use crate::{
        protocol::{Bhp, Protocol},
        socket::StreamTransport,
    };

    use super::*;

    fn pair() -> (MessageChannel, ClientSubscriber) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();
        let protocol: Arc<dyn Protocol> = Arc::new(Bhp::default());
        let wrap =
            |stream| Socket::new(StreamTransport::new(stream), protocol.clone(), None).unwrap();

        (
            MessageChannel::new(Arc::new(wrap(server))),
            ClientSubscriber::new(wrap(client)),
        )
    }

    #[test]
    fn authenticate_sends_credentials_and_waits() {
        let (server, subscriber) = pair();
        let credentials = Credentials::from([("name".to_string(), "abc".to_string())]);

        let responder = thread::spawn(move || {
            let req = server.read_request().unwrap();
            server
                .write_response(&Response::Authorization(Authorization::accepted()))
                .unwrap();
            req
        });

        let authorization = subscriber.authenticate(credentials.clone()).unwrap();
        assert!(authorization.authenticated());
        assert_eq!(
            responder.join().unwrap(),
            Request::Authenticate(credentials)
        );
    }

    #[test]
    fn subscribe_tracks_topics() {
        let (server, subscriber) = pair();

        subscriber.subscribe(["AAPL", "GOOG"]).unwrap();
        subscriber.unsubscribe(["GOOG"]).unwrap();

        assert_eq!(
            server.read_request().unwrap(),
            Request::Subscribe(vec!["AAPL".into(), "GOOG".into()])
        );
        assert_eq!(
            server.read_request().unwrap(),
            Request::Unsubscribe(vec!["GOOG".into()])
        );
        assert_eq!(subscriber.topics(), BTreeSet::from(["AAPL".to_string()]));
    }

    #[test]
    fn received_data_is_queued_and_stored() {
        let (server, subscriber) = pair();
        let store = Arc::new(DataStore::new());
        let subscriber = subscriber.with_store(Arc::clone(&store));
        let datum = Datum::new("AAPL", b"buy".to_vec(), 1);

        server
            .write_response(&Response::Data(datum.clone()))
            .unwrap();
        assert_eq!(subscriber.receiver().receive_once().unwrap(), Inbound::Data);

        assert_eq!(subscriber.data().unwrap(), datum);
        assert!(subscriber.try_data().is_none());
        assert_eq!(store.latest("AAPL").as_deref(), Some(&datum));
    }

    #[test]
    fn data_unblocks_when_connection_ends() {
        let (server, subscriber) = pair();
        let receiver = subscriber.receiver();
        let background = thread::spawn(move || receiver.receive_once());

        drop(server);
        assert!(matches!(subscriber.data(), Err(StreamError::Closed)));
        assert!(background.join().unwrap().is_err());
    }

    #[test]
    fn pause_sends_command() {
        let (server, subscriber) = pair();

        subscriber.pause().unwrap();
        assert!(subscriber.paused());
        subscriber.unpause().unwrap();

        assert_eq!(server.read_request().unwrap(), Request::Pause);
        assert_eq!(server.read_request().unwrap(), Request::Unpause);
        assert!(!subscriber.paused());
    }
}
