//! End-to-end streaming over real sockets.
//!
//! Each test binds a server on an ephemeral loopback port, wraps accepted sockets in
//! controllers and drives both halves on their own threads, the way a host would.

use std::{
    sync::Arc,
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use pubsock::{
    Authorization, Bhp, Client, ClientSubscriber, Controller, Credentials, DataStore, Datagram,
    Datum, Protocol, Server, StreamError, SubscriptionHooks, SubscriptionStreamer, TransportKind,
    pubsub::{AllowList, RunMode},
};

const TIMEOUT: Duration = Duration::from_secs(5);

fn credentials(name: &str, password: &str) -> Credentials {
    Credentials::from([
        ("name".to_string(), name.to_string()),
        ("password".to_string(), password.to_string()),
    ])
}

fn wait_until<F: Fn() -> bool>(condition: F) {
    let start = Instant::now();
    while !condition() {
        assert!(start.elapsed() < TIMEOUT, "condition not met in {TIMEOUT:?}");
        thread::sleep(Duration::from_millis(5));
    }
}

fn drive(controller: Controller) {
    let pusher = controller.clone();
    thread::spawn(move || pusher.run(RunMode::PUSH));
    thread::spawn(move || controller.run(RunMode::INTAKE));
}

struct Host {
    server: Arc<Server>,
    streamer: Arc<SubscriptionStreamer>,
    store: Arc<DataStore>,
    acceptor: Option<JoinHandle<()>>,
}

impl Host {
    fn start<P: Protocol + 'static, H: SubscriptionHooks + 'static>(protocol: P, hooks: H) -> Self {
        let server = Arc::new(Server::bind(protocol, "127.0.0.1:0").unwrap());
        let store = Arc::new(DataStore::new());
        let streamer = Arc::new(SubscriptionStreamer::new(Arc::clone(&store), hooks));

        let acceptor = {
            let server = Arc::clone(&server);
            let streamer = Arc::clone(&streamer);
            // A datagram server has a single shared endpoint, so it is accepted once.
            let once = server.protocol().kind() == TransportKind::Datagram;
            thread::spawn(move || {
                while let Ok(controller) = server.handle(|_, socket| streamer.controller(socket)) {
                    drive(controller);
                    if once {
                        break;
                    }
                }
            })
        };

        Self {
            server,
            streamer,
            store,
            acceptor: Some(acceptor),
        }
    }

    fn allow_abc() -> AllowList {
        AllowList::default().allow(credentials("abc", "123"))
    }

    fn subscriber(&self) -> ClientSubscriber {
        let protocol = Arc::clone(self.server.protocol());
        ClientSubscriber::new(
            Client::with_shared(protocol)
                .connect(self.server.address())
                .unwrap(),
        )
    }

    fn wait_for_topic(&self, topic: &str) {
        wait_until(|| {
            self.streamer
                .controllers()
                .iter()
                .any(|c| c.topics().contains(topic))
        });
    }
}

impl Drop for Host {
    fn drop(&mut self) {
        self.server.close();
        self.streamer.stop();
        if let Some(acceptor) = self.acceptor.take() {
            let _ = acceptor.join();
        }
    }
}

fn listen(subscriber: &ClientSubscriber) -> JoinHandle<StreamError> {
    let receiver = subscriber.receiver();
    thread::spawn(move || {
        loop {
            if let Err(e) = receiver.receive_once() {
                return e;
            }
        }
    })
}

#[test]
fn subscriber_receives_only_subscribed_topic() {
    let host = Host::start(Bhp::default(), Host::allow_abc());
    let subscriber = host.subscriber();

    let authorization = subscriber.authenticate(credentials("abc", "123")).unwrap();
    assert!(authorization.authenticated());
    subscriber.subscribe(["AAPL"]).unwrap();
    let listener = listen(&subscriber);
    host.wait_for_topic("AAPL");

    let aapl = Datum::new("AAPL", b"buy".to_vec(), 1);
    host.store.insert(aapl.clone());
    host.store.insert(Datum::new("GOOG", b"sell".to_vec(), 2));
    // Marker proving the GOOG entry was skipped rather than still in flight.
    host.store.insert(Datum::new("AAPL", b"sell".to_vec(), 3));

    assert_eq!(subscriber.data().unwrap(), aapl);
    let next = subscriber.data().unwrap();
    assert_eq!(next.name(), "AAPL");
    assert_eq!(next.time(), 3);

    subscriber.close().unwrap();
    assert!(listener.join().unwrap().is_disconnect());
    assert!(matches!(subscriber.data(), Err(StreamError::Closed)));
}

#[test]
fn disjoint_topics_fan_out() {
    let host = Host::start(Bhp::default(), Host::allow_abc());
    let topics = ["AAPL", "AMZN", "GOOG", "TSLA"];

    let subscribers: Vec<_> = topics
        .iter()
        .map(|topic| {
            let subscriber = host.subscriber();
            assert!(
                subscriber
                    .authenticate(credentials("abc", "123"))
                    .unwrap()
                    .authenticated()
            );
            subscriber.subscribe([*topic]).unwrap();
            listen(&subscriber);
            subscriber
        })
        .collect();
    for topic in topics {
        host.wait_for_topic(topic);
    }
    assert_eq!(host.streamer.connections(), topics.len());

    for (i, topic) in topics.iter().enumerate() {
        host.store.insert(Datum::new(*topic, b"buy".to_vec(), i as u64));
    }

    for (subscriber, topic) in subscribers.iter().zip(topics) {
        let datum = subscriber.data().unwrap();
        assert_eq!(datum.name(), topic);
        assert!(subscriber.try_data().is_none());
    }
}

#[test]
fn unauthenticated_client_never_receives_data() {
    let host = Host::start(Bhp::default(), Host::allow_abc());
    let subscriber = host.subscriber();

    let authorization = subscriber.authenticate(credentials("abc", "wrong")).unwrap();
    assert!(!authorization.authenticated());
    assert!(matches!(
        authorization.into_result(),
        Err(StreamError::AuthenticationRejected(Some(_)))
    ));

    let listener = listen(&subscriber);
    host.store.insert(Datum::new("AAPL", b"buy".to_vec(), 0));

    assert!(matches!(subscriber.data(), Err(StreamError::Closed)));
    assert!(listener.join().unwrap().is_disconnect());
    wait_until(|| host.streamer.connections() == 0);
}

#[test]
fn command_before_authentication_is_rejected() {
    let host = Host::start(Bhp::default(), Host::allow_abc());
    let subscriber = host.subscriber();

    subscriber.subscribe(["AAPL"]).unwrap();
    let reply = subscriber.receiver().receive_once().unwrap();

    match reply {
        pubsock::pubsub::Inbound::Authorization(a) => assert!(!a.authenticated()),
        other => panic!("unexpected reply {other:?}"),
    }
    wait_until(|| host.streamer.connections() == 0);
}

#[test]
fn datagram_round_trip() {
    let host = Host::start(Datagram::default(), Host::allow_abc());
    let subscriber = host.subscriber();

    assert!(
        subscriber
            .authenticate(credentials("abc", "123"))
            .unwrap()
            .authenticated()
    );
    subscriber.subscribe(["TSLA"]).unwrap();
    listen(&subscriber);
    host.wait_for_topic("TSLA");

    let datum = Datum::new("TSLA", b"sell".to_vec(), 9);
    host.store.insert(Datum::new("META", b"buy".to_vec(), 8));
    host.store.insert(datum.clone());

    assert_eq!(subscriber.data().unwrap(), datum);
}

#[test]
fn custom_hooks_see_lifecycle() {
    use std::sync::Mutex;

    #[derive(Clone, Default)]
    struct Journal(Arc<Mutex<Vec<&'static str>>>);

    impl SubscriptionHooks for Journal {
        fn authenticate(&self, _: &Controller, credentials: &Credentials) -> Authorization {
            self.0.lock().unwrap().push("authenticate");
            credentials.contains_key("token").into()
        }

        fn on_join(&self, _: &Controller) {
            self.0.lock().unwrap().push("join");
        }

        fn on_disconnect(&self, _: &Controller) {
            self.0.lock().unwrap().push("disconnect");
        }
    }

    let journal = Journal::default();
    let host = Host::start(Bhp::default(), journal.clone());
    let subscriber = host.subscriber();

    let token = Credentials::from([("token".to_string(), "t".to_string())]);
    assert!(subscriber.authenticate(token).unwrap().authenticated());
    subscriber.close().unwrap();
    wait_until(|| host.streamer.connections() == 0);

    assert_eq!(
        *journal.0.lock().unwrap(),
        vec!["join", "authenticate", "disconnect"]
    );
}
