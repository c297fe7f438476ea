use kvrndz::tcp::{Client, Server};
use kvrndz::{ClientConfig, Error, FileStore, Result, ServerConfig, Timeout, Token, Validator};
use std::path::PathBuf;
use std::time::Duration;
use structopt::StructOpt;

#[derive(StructOpt, Debug)]
#[structopt(name = "kvrndz")]
enum Opt {
    Client(ClientOpt),
    Server(ServerOpt),
}

#[derive(StructOpt, Debug)]
struct Common {
    /// Directory shared by both sides
    #[structopt(long = "store-dir", parse(from_os_str))]
    store_dir: PathBuf,

    /// Path of the primary record inside the store
    #[structopt(long = "key")]
    key: String,

    #[structopt(long = "port")]
    port: u16,

    #[structopt(long = "secret")]
    secret: Option<String>,

    #[structopt(long = "timeout-ms")]
    timeout_ms: Option<u64>,

    /// Wait forever on every connect and accept
    #[structopt(long = "no-timeout")]
    no_timeout: bool,

    /// Host written to the store instead of the detected one
    #[structopt(long = "advertise")]
    advertise: Option<String>,

    #[structopt(short = "v", long = "verbose")]
    verbose: bool,
}

impl Common {
    fn timeout(&self) -> Result<Timeout> {
        match (self.timeout_ms, self.no_timeout) {
            (Some(ms), false) => Ok(Timeout::After(Duration::from_millis(ms))),
            (None, true) => Ok(Timeout::Unbounded),
            _ => Err(Error::InvalidConfig(
                "pass --timeout-ms, or --no-timeout to wait forever".into(),
            )),
        }
    }
}

#[derive(StructOpt, Debug)]
struct ClientOpt {
    #[structopt(flatten)]
    common: Common,

    /// Name of the pending record, random by default
    #[structopt(long = "name")]
    name: Option<String>,
}

#[derive(StructOpt, Debug)]
struct ServerOpt {
    #[structopt(flatten)]
    common: Common,

    /// Seconds between reconciliation passes
    #[structopt(long = "interval-secs", default_value = "30")]
    interval_secs: u64,
}

fn main() -> Result<()> {
    let opt: Opt = StructOpt::from_args();

    let verbose = match opt {
        Opt::Client(ref o) => o.common.verbose,
        Opt::Server(ref o) => o.common.verbose,
    };
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(if verbose { "info" } else { "warn" }),
    )
    .init();

    match opt {
        Opt::Server(opt) => run_server(opt),
        Opt::Client(opt) => run_client(opt),
    }
}

fn run_server(opt: ServerOpt) -> Result<()> {
    let c = &opt.common;
    let secret = c
        .secret
        .as_deref()
        .map(Token::from)
        .unwrap_or(Token::Empty);

    let mut config =
        ServerConfig::new(c.key.as_str(), c.port, secret, c.timeout()?).verbose(c.verbose);
    if let Some(ref host) = c.advertise {
        config = config.with_advertise_host(host.as_str());
    }

    let (s, report) = Server::start(FileStore::new(&c.store_dir), config)?;
    log::info!(
        "serving {}, called back {} of {} pending",
        s.advertised(),
        report.delivered(),
        report.callbacks.len()
    );

    s.run(Duration::from_secs(opt.interval_secs), |_stream, peer| {
        println!("{}", peer);
    })
}

fn run_client(opt: ClientOpt) -> Result<()> {
    let c = &opt.common;
    let secret = c
        .secret
        .as_deref()
        .map(Validator::from)
        .unwrap_or(Validator::Any);

    let mut config =
        ClientConfig::new(c.key.as_str(), c.port, secret, c.timeout()?).verbose(c.verbose);
    if let Some(ref host) = c.advertise {
        config = config.with_advertise_host(host.as_str());
    }
    if let Some(ref name) = opt.name {
        config = config.with_pending_name(name.as_str());
    }

    let mut client = Client::new(FileStore::new(&c.store_dir), config)?;
    let conn = client.connect()?;
    println!("{}", conn.peer);

    Ok(())
}
