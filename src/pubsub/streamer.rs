//! Server side of the subscription protocol.
//!
//! Every accepted socket becomes a [`Controller`] moving through
//! `Connected -> Authenticating -> Authenticated <-> Streaming -> Closed`. A rejected
//! authentication goes straight to `Closed`.
//!
//! A controller has two halves. Command intake ([`Controller::receive_once`]) blocks on the
//! socket and applies authentication and subscription commands. Data push
//! ([`Controller::send_once`]) scans the store beyond the connection's cursor and sends every
//! matching entry. [`Controller::run`] performs either or both halves; the host decides which
//! thread drives which half.
use std::{
    collections::{BTreeSet, HashMap},
    fmt,
    sync::{
        Arc, Mutex, Weak,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use log::{debug, info, warn};

use crate::{
    driver::Flow,
    socket::{Address, Socket, lock},
};

use super::{
    Authorization, Cursor, DataStore, Datum, MessageChannel, Request, Response, StreamError,
    SubscriptionHooks,
};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone)]
pub struct StreamerConfig {
    /// Longest a blocking push loop waits for new entries before re-checking the connection.
    pub poll_interval: Duration,
    /// Push the newest already-stored entry of a topic as soon as it is subscribed.
    pub snapshot_on_subscribe: bool,
}

impl Default for StreamerConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            snapshot_on_subscribe: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControllerState {
    Connected,
    Authenticating,
    Authenticated,
    Streaming,
    Closed,
}

impl ControllerState {
    pub fn is_authenticated(&self) -> bool {
        matches!(
            self,
            ControllerState::Authenticated | ControllerState::Streaming
        )
    }
}

/// Which halves a [`Controller::run`] call performs, and whether it loops until the
/// connection closes.
///
/// Running both halves in one blocking call alternates them, so data is only pushed after
/// each inbound command. Continuous delivery needs the halves on separate threads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunMode {
    pub send: bool,
    pub receive: bool,
    pub block: bool,
}

impl RunMode {
    /// Command intake only, looping until closed.
    pub const INTAKE: RunMode = RunMode {
        send: false,
        receive: true,
        block: true,
    };

    /// Data push only, looping until closed.
    pub const PUSH: RunMode = RunMode {
        send: true,
        receive: false,
        block: true,
    };

    /// The same halves, performed a single time.
    pub fn once(self) -> Self {
        Self {
            block: false,
            ..self
        }
    }
}

#[derive(Debug)]
struct Subscription {
    state: ControllerState,
    authorization: Option<Authorization>,
    topics: BTreeSet<String>,
    cursor: Cursor,
    paused: bool,
}

type Registry = Mutex<HashMap<u64, Controller>>;

struct ControllerInner {
    id: u64,
    channel: MessageChannel,
    store: Arc<DataStore>,
    hooks: Arc<dyn SubscriptionHooks>,
    config: StreamerConfig,
    subscription: Mutex<Subscription>,
    alive: AtomicBool,
    registry: Weak<Registry>,
}

/// Per-connection handle. Clones share the same connection state.
#[derive(Clone)]
pub struct Controller {
    inner: Arc<ControllerInner>,
}

impl Controller {
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn socket(&self) -> &Arc<Socket> {
        self.inner.channel.socket()
    }

    pub fn peer(&self) -> Option<Address> {
        self.socket().peer()
    }

    pub fn state(&self) -> ControllerState {
        lock(&self.inner.subscription).state
    }

    pub fn authenticated(&self) -> bool {
        self.state().is_authenticated()
    }

    pub fn authorization(&self) -> Option<Authorization> {
        lock(&self.inner.subscription).authorization.clone()
    }

    pub fn topics(&self) -> BTreeSet<String> {
        lock(&self.inner.subscription).topics.clone()
    }

    pub fn cursor(&self) -> Cursor {
        lock(&self.inner.subscription).cursor
    }

    pub fn paused(&self) -> bool {
        lock(&self.inner.subscription).paused
    }

    pub fn alive(&self) -> bool {
        self.inner.alive.load(Ordering::Acquire)
    }

    /// Blocks for one inbound message and applies it.
    ///
    /// The first message decides authentication. A rejection is replied to, handed to
    /// [`SubscriptionHooks::on_unauthenticated`], closes the controller and returns
    /// [`StreamError::AuthenticationRejected`].
    pub fn receive_once(&self) -> Result<(), StreamError> {
        self.ensure_alive()?;
        let request = self.inner.channel.read_request();
        self.ensure_alive()?;

        match self.state() {
            ControllerState::Connected => self.authenticate(request),
            ControllerState::Authenticated | ControllerState::Streaming => match request {
                Ok(request) => self.command(request),
                Err(StreamError::Decode(e)) => self.invalid(format!("malformed request: {e}")),
                Err(e) => Err(e),
            },
            ControllerState::Authenticating | ControllerState::Closed => Err(StreamError::Closed),
        }
    }

    /// Sends every stored entry beyond the cursor that matches a subscribed topic, moving
    /// the cursor past them. Returns how many entries were sent.
    pub fn send_once(&self) -> Result<usize, StreamError> {
        self.ensure_alive()?;
        // The delta and the cursor move under the subscription lock, so a concurrent
        // subscribe lands either wholly before or wholly after this scan. Lock order is
        // subscription, then store log.
        let data = {
            let mut sub = lock(&self.inner.subscription);
            if !sub.state.is_authenticated() || sub.paused {
                return Ok(0);
            }
            let delta = self.inner.store.since_any(&sub.topics, sub.cursor);
            if delta.cursor > sub.cursor {
                sub.cursor = delta.cursor;
            }
            delta.data
        };

        for datum in &data {
            self.push(datum)?;
        }

        Ok(data.len())
    }

    /// Drives the selected halves. Per-connection failures are routed to
    /// [`SubscriptionHooks::on_error`] and close this controller only.
    pub fn run(&self, mode: RunMode) -> Flow {
        loop {
            if !self.alive() {
                return Flow::Stop;
            }
            if let Err(err) = self.step(mode) {
                self.fail(err);
                return Flow::Stop;
            }
            if !mode.block {
                return Flow::Continue;
            }
        }
    }

    /// Closes the connection and releases its subscription state. Only the first call has
    /// an effect.
    pub fn close(&self) {
        if !self.inner.alive.swap(false, Ordering::AcqRel) {
            return;
        }
        {
            let mut sub = lock(&self.inner.subscription);
            sub.state = ControllerState::Closed;
            sub.topics.clear();
        }
        if let Err(e) = self.socket().close() {
            debug!("controller {} socket close failed: {e}", self.id());
        }
        info!("controller {} disconnected", self.id());
        self.inner.hooks.on_disconnect(self);

        if let Some(registry) = self.inner.registry.upgrade() {
            lock(&*registry).remove(&self.id());
        }
    }

    fn step(&self, mode: RunMode) -> Result<(), StreamError> {
        if mode.receive {
            self.receive_once()?;
        }
        if mode.send {
            let sent = self.send_once()?;
            if mode.block && !mode.receive && sent == 0 {
                let store = &self.inner.store;
                store.wait_for(store.cursor(), self.inner.config.poll_interval);
            }
        }
        Ok(())
    }

    fn fail(&self, err: StreamError) {
        match &err {
            StreamError::AuthenticationRejected(_) => {}
            e if e.is_disconnect() => debug!("controller {} ended: {e}", self.id()),
            e => {
                warn!("controller {} failed: {e}", self.id());
                self.inner.hooks.on_error(self, e);
            }
        }
        self.close();
    }

    fn authenticate(&self, request: Result<Request, StreamError>) -> Result<(), StreamError> {
        self.set_state(ControllerState::Authenticating);

        let authorization = match request {
            Ok(Request::Authenticate(credentials)) => {
                self.inner.hooks.authenticate(self, &credentials)
            }
            Ok(_) => Authorization::rejected("expected an authentication request"),
            Err(StreamError::Decode(_)) => {
                Authorization::rejected("malformed authentication request")
            }
            Err(e) => return Err(e),
        };

        {
            let mut sub = lock(&self.inner.subscription);
            sub.authorization = Some(authorization.clone());
            if authorization.authenticated() {
                sub.state = ControllerState::Authenticated;
            }
        }
        let reply = self
            .inner
            .channel
            .write_response(&Response::Authorization(authorization.clone()));

        if authorization.authenticated() {
            reply?;
            info!("controller {} authenticated", self.id());
            return Ok(());
        }

        warn!(
            "controller {} rejected: {}",
            self.id(),
            authorization.reason().unwrap_or("no reason given")
        );
        // A peer that is already gone still counts as rejected.
        if let Err(e) = reply {
            debug!("controller {} rejection reply not delivered: {e}", self.id());
        }
        self.inner.hooks.on_unauthenticated(self, &authorization);
        self.close();
        Err(StreamError::AuthenticationRejected(
            authorization.reason().map(str::to_string),
        ))
    }

    fn command(&self, request: Request) -> Result<(), StreamError> {
        match request {
            Request::Subscribe(names) => self.subscribe(names),
            Request::Unsubscribe(names) => {
                let mut sub = lock(&self.inner.subscription);
                for name in &names {
                    sub.topics.remove(name);
                }
                if sub.topics.is_empty() {
                    sub.state = ControllerState::Authenticated;
                }
                debug!("controller {} unsubscribed from {names:?}", self.id());
                Ok(())
            }
            Request::Pause => {
                lock(&self.inner.subscription).paused = true;
                debug!("controller {} paused", self.id());
                Ok(())
            }
            Request::Unpause => {
                lock(&self.inner.subscription).paused = false;
                debug!("controller {} unpaused", self.id());
                Ok(())
            }
            Request::Authenticate(_) => self.invalid("already authenticated".to_string()),
        }
    }

    fn subscribe(&self, names: Vec<String>) -> Result<(), StreamError> {
        let snapshots = {
            let mut sub = lock(&self.inner.subscription);
            let mut snapshots = Vec::new();
            for name in names {
                if !sub.topics.insert(name.clone()) || !self.inner.config.snapshot_on_subscribe {
                    continue;
                }
                if let Some(datum) = self.inner.store.latest_before(&name, sub.cursor) {
                    snapshots.push(datum);
                }
            }
            if !sub.topics.is_empty() {
                sub.state = ControllerState::Streaming;
            }
            debug!("controller {} subscribed to {:?}", self.id(), sub.topics);
            if sub.paused { Vec::new() } else { snapshots }
        };

        for datum in &snapshots {
            self.push(datum)?;
        }
        Ok(())
    }

    fn invalid(&self, reason: String) -> Result<(), StreamError> {
        debug!("controller {} invalid request: {reason}", self.id());
        self.inner
            .channel
            .write_response(&Response::Invalid { reason })
    }

    fn push(&self, datum: &Datum) -> Result<(), StreamError> {
        self.inner
            .channel
            .write_response(&Response::Data(datum.clone()))
    }

    fn set_state(&self, state: ControllerState) {
        lock(&self.inner.subscription).state = state;
    }

    fn ensure_alive(&self) -> Result<(), StreamError> {
        if self.alive() {
            Ok(())
        } else {
            Err(StreamError::Closed)
        }
    }
}

impl fmt::Debug for Controller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Controller")
            .field("id", &self.id())
            .field("peer", &self.peer())
            .field("alive", &self.alive())
            .field("subscription", &*lock(&self.inner.subscription))
            .finish()
    }
}

/// Creates and tracks one [`Controller`] per accepted connection over a shared store.
pub struct SubscriptionStreamer {
    store: Arc<DataStore>,
    hooks: Arc<dyn SubscriptionHooks>,
    config: StreamerConfig,
    registry: Arc<Registry>,
    next_id: AtomicU64,
}

impl SubscriptionStreamer {
    pub fn new<H>(store: Arc<DataStore>, hooks: H) -> Self
    where
        H: SubscriptionHooks + 'static,
    {
        Self {
            store,
            hooks: Arc::new(hooks),
            config: StreamerConfig::default(),
            registry: Arc::default(),
            next_id: AtomicU64::new(0),
        }
    }

    pub fn with_config(mut self, config: StreamerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn store(&self) -> &Arc<DataStore> {
        &self.store
    }

    pub fn config(&self) -> &StreamerConfig {
        &self.config
    }

    /// Wraps an accepted socket. The cursor starts at the current end of the store, so only
    /// entries inserted from now on are delivered.
    pub fn controller(&self, socket: Socket) -> Controller {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let controller = Controller {
            inner: Arc::new(ControllerInner {
                id,
                channel: MessageChannel::new(Arc::new(socket)),
                store: Arc::clone(&self.store),
                hooks: Arc::clone(&self.hooks),
                config: self.config.clone(),
                subscription: Mutex::new(Subscription {
                    state: ControllerState::Connected,
                    authorization: None,
                    topics: BTreeSet::new(),
                    cursor: self.store.cursor(),
                    paused: false,
                }),
                alive: AtomicBool::new(true),
                registry: Arc::downgrade(&self.registry),
            }),
        };

        lock(&*self.registry).insert(id, controller.clone());
        info!("controller {id} joined from {:?}", controller.peer());
        self.hooks.on_join(&controller);

        controller
    }

    /// Live controllers.
    pub fn connections(&self) -> usize {
        lock(&*self.registry).len()
    }

    pub fn controllers(&self) -> Vec<Controller> {
        lock(&*self.registry).values().cloned().collect()
    }

    /// Closes every live controller.
    pub fn stop(&self) {
        for controller in self.controllers() {
            controller.close();
        }
    }
}

impl fmt::Debug for SubscriptionStreamer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionStreamer")
            .field("config", &self.config)
            .field("connections", &self.connections())
            .finish()
    }
}
