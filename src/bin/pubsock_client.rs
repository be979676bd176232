use std::{
    error::Error,
    io::{self, Write},
    net::SocketAddr,
    sync::Arc,
    thread,
};

use clap::{Parser, ValueEnum};
use log::{debug, error, info};
use pubsock::{
    Bhp, Client, ClientSubscriber, Command, Credentials, DataStore, Datagram, Protocol,
    StreamError,
    driver::{CancellationToken, Driver, Flow, Handler, Operator},
    prompt,
};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Transport {
    Bhp,
    Datagram,
}

#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Address of the streaming server
    #[arg(default_value = "127.0.0.1:8000")]
    address: SocketAddr,
    /// Framing used on the wire
    #[arg(short, long, value_enum, default_value = "bhp")]
    transport: Transport,
    /// Width of the BHP length header in bytes
    #[arg(long, default_value_t = pubsock::protocol::DEFAULT_HEADER_WIDTH)]
    header_width: usize,
    #[arg(short, long, default_value = "abc")]
    name: String,
    #[arg(short, long, default_value = "123")]
    password: String,
    /// Topics to subscribe to after authenticating
    #[arg(short, long, value_delimiter = ',', default_value = "AAPL")]
    subscribe: Vec<String>,
    /// Read subscription commands from stdin while data is printed
    #[arg(short, long)]
    interactive: bool,
}

fn interact(subscriber: &ClientSubscriber) {
    let stdin = io::stdin();

    loop {
        let cmd = match prompt(stdin.lock(), io::stdout()) {
            Ok(c) => c,
            Err(e) => {
                eprintln!("{e}");
                continue;
            }
        };

        let res = match cmd {
            Command::Subscribe(names) => subscriber.subscribe(names),
            Command::Unsubscribe(names) => subscriber.unsubscribe(names),
            Command::Pause => subscriber.pause(),
            Command::Unpause => subscriber.unpause(),
            Command::Exit => break,
        };
        if let Err(e) = res {
            eprintln!("command failed: {e}");
            if e.is_disconnect() {
                break;
            }
        }
    }

    if let Err(e) = subscriber.close() {
        debug!("close failed: {e}");
    }
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let cli = Cli::parse();
    let protocol: Arc<dyn Protocol> = match cli.transport {
        Transport::Bhp => Arc::new(Bhp::new(cli.header_width)?),
        Transport::Datagram => Arc::new(Datagram::default()),
    };

    let socket = Client::with_shared(protocol).connect(cli.address)?;
    let subscriber = Arc::new(ClientSubscriber::new(socket).with_store(Arc::new(DataStore::new())));

    let credentials = Credentials::from([
        ("name".to_string(), cli.name),
        ("password".to_string(), cli.password),
    ]);
    let authorization = subscriber.authenticate(credentials)?.into_result()?;
    info!("authenticated: {authorization:?}");
    subscriber.subscribe(cli.subscribe)?;

    let token = CancellationToken::new();
    {
        let subscriber = Arc::clone(&subscriber);
        let token = token.clone();
        ctrlc::set_handler(move || {
            token.cancel();
            if let Err(e) = subscriber.close() {
                debug!("close failed: {e}");
            }
        })?;
    }

    let receiver = {
        let mut receiver = subscriber.receiver();
        let operator = Operator::new(token.clone());
        thread::spawn(move || {
            let handler = Handler::new().on_exception(|e: &StreamError| {
                if e.is_disconnect() {
                    info!("connection closed");
                    return Flow::Stop;
                }
                error!("receive failed: {e}");
                match e {
                    StreamError::Decode(_) => Flow::Continue,
                    _ => Flow::Stop,
                }
            });
            operator.run_until_cancelled(&mut receiver, handler);
        })
    };

    if cli.interactive {
        let subscriber = Arc::clone(&subscriber);
        thread::spawn(move || interact(&subscriber));
    }

    let mut stdout = io::stdout();
    loop {
        match subscriber.data() {
            Ok(datum) => writeln!(
                stdout,
                "{} {} {}",
                datum.time(),
                datum.name(),
                String::from_utf8_lossy(datum.data())
            )?,
            Err(StreamError::Closed) => break,
            Err(e) => return Err(e.into()),
        }
    }

    token.cancel();
    if receiver.join().is_err() {
        error!("receiver thread panicked");
    }
    if let Some(store) = subscriber.store() {
        info!("received {} entries across {:?}", store.len(), store.names());
    }

    Ok(())
}
