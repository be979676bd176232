use std::{error::Error, net::SocketAddr, sync::Arc, thread, time::Duration};

use clap::{Parser, ValueEnum};
use log::{error, info, warn};
use pubsock::{
    Authorization, Bhp, Controller, Credentials, DataStore, Datagram, Datum, Protocol, Server,
    StreamError, StreamerConfig, SubscriptionHooks, SubscriptionStreamer,
    driver::{CancellationToken, Driver, Flow, Handler, Operator, ThreadPool},
    pubsub::{AllowList, RunMode, timestamp},
    socket::SocketError,
};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Transport {
    Bhp,
    Datagram,
}

#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Listen for new connections at address
    #[arg(default_value = "127.0.0.1:8000")]
    address: SocketAddr,
    /// Framing used on the wire
    #[arg(short, long, value_enum, default_value = "bhp")]
    transport: Transport,
    /// Width of the BHP length header in bytes
    #[arg(long, default_value_t = pubsock::protocol::DEFAULT_HEADER_WIDTH)]
    header_width: usize,
    /// Accepted credentials as NAME:PASSWORD
    #[arg(short, long, default_value = "abc:123")]
    user: Vec<String>,
    /// Topics the producer publishes
    #[arg(long, value_delimiter = ',', default_value = "AAPL,AMZN,GOOG,TSLA,META")]
    topics: Vec<String>,
    /// Milliseconds between produced entries
    #[arg(short, long, default_value_t = 500)]
    delay: u64,
    /// Worker threads driving connections, two per client
    #[arg(short, long, default_value_t = 16)]
    workers: usize,
    /// Send the newest stored entry of a topic when it is subscribed
    #[arg(long)]
    snapshot: bool,
}

/// Allow-list authentication that holds a rejected peer briefly before dropping it.
struct Gatekeeper {
    allow: AllowList,
}

impl SubscriptionHooks for Gatekeeper {
    fn authenticate(&self, _controller: &Controller, credentials: &Credentials) -> Authorization {
        self.allow.check(credentials)
    }

    fn on_join(&self, controller: &Controller) {
        info!("client {} joined from {:?}", controller.id(), controller.peer());
    }

    fn on_unauthenticated(&self, controller: &Controller, authorization: &Authorization) {
        warn!(
            "client {} failed to authenticate: {}",
            controller.id(),
            authorization.reason().unwrap_or("rejected")
        );
        thread::sleep(Duration::from_millis(500));
        controller.close();
    }

    fn on_disconnect(&self, controller: &Controller) {
        info!("client {} left", controller.id());
    }

    fn on_error(&self, controller: &Controller, error: &StreamError) {
        error!("client {} error: {error}", controller.id());
    }
}

fn parse_credentials(user: &str) -> Result<Credentials, String> {
    let (name, password) = user
        .split_once(':')
        .ok_or_else(|| format!("invalid credentials '{user}', expected NAME:PASSWORD"))?;
    Ok(Credentials::from([
        ("name".to_string(), name.to_string()),
        ("password".to_string(), password.to_string()),
    ]))
}

fn produce(store: Arc<DataStore>, topics: Vec<String>, delay: Duration, token: CancellationToken) {
    let mut tick: u64 = 0;
    let mut next = move || -> Result<Flow, StreamError> {
        if topics.is_empty() {
            return Ok(Flow::Stop);
        }
        let name = &topics[tick as usize % topics.len()];
        let side: &[u8] = if (timestamp() ^ tick) % 2 == 0 { b"buy" } else { b"sell" };
        store.insert(Datum::now(name.clone(), side.to_vec()));
        tick += 1;
        Ok(Flow::Continue)
    };

    Operator::new(token)
        .with_delay(delay)
        .run_until_cancelled(&mut next, Handler::new());
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let cli = Cli::parse();
    let allow = cli
        .user
        .iter()
        .map(|u| parse_credentials(u))
        .collect::<Result<Vec<_>, _>>()?;

    let protocol: Arc<dyn Protocol> = match cli.transport {
        Transport::Bhp => Arc::new(Bhp::new(cli.header_width)?),
        Transport::Datagram => Arc::new(Datagram::default()),
    };
    let server = Arc::new(Server::bind_shared(protocol, cli.address)?);
    let store = Arc::new(DataStore::new());
    let streamer = Arc::new(
        SubscriptionStreamer::new(Arc::clone(&store), Gatekeeper {
            allow: AllowList::new(allow),
        })
        .with_config(StreamerConfig {
            snapshot_on_subscribe: cli.snapshot,
            ..StreamerConfig::default()
        }),
    );

    let token = CancellationToken::new();
    {
        let token = token.clone();
        let server = Arc::clone(&server);
        let streamer = Arc::clone(&streamer);
        ctrlc::set_handler(move || {
            info!("shutting down");
            token.cancel();
            server.close();
            streamer.stop();
        })?;
    }

    let producer = {
        let store = Arc::clone(&store);
        let delay = Duration::from_millis(cli.delay);
        let token = token.clone();
        thread::spawn(move || produce(store, cli.topics, delay, token))
    };

    // Each connection occupies two workers, one per controller half.
    let pool = ThreadPool::new(cli.workers.max(2));
    let datagram = matches!(cli.transport, Transport::Datagram);
    let mut accept = || -> Result<Flow, SocketError> {
        let accepted = server.handle(|_, socket| {
            if pool.idle() < 2 {
                warn!("refusing {:?}: all {} workers busy", socket.peer(), pool.size());
                if let Err(e) = socket.close() {
                    warn!("failed to close refused connection: {e}");
                }
                return None;
            }
            Some(streamer.controller(socket))
        })?;
        let Some(controller) = accepted else {
            return Ok(Flow::Continue);
        };

        let pusher = controller.clone();
        let intake = controller.clone();
        let scheduled = pool.execute(move || {
            pusher.run(RunMode::PUSH);
        }) && pool.execute(move || {
            intake.run(RunMode::INTAKE);
        });
        if !scheduled {
            error!("worker pool shut down; dropping client {}", controller.id());
            controller.close();
            return Ok(Flow::Stop);
        }

        Ok(if datagram { Flow::Stop } else { Flow::Continue })
    };
    let handler = Handler::new().on_exception(|e: &SocketError| match e {
        SocketError::Closed => Flow::Stop,
        e => {
            error!("accept failed: {e}");
            Flow::Continue
        }
    });

    info!("streaming on {}", server.address());
    Operator::new(token.clone()).run_until_cancelled(&mut accept, handler);

    if datagram {
        while !token.is_cancelled() {
            thread::sleep(Duration::from_millis(100));
        }
    }
    if producer.join().is_err() {
        warn!("producer thread panicked");
    }
    streamer.stop();

    Ok(())
}
