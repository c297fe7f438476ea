use super::{accept, connect_from, listen, local_addr, local_ip};
use crate::config::{ServerConfig, Timeout};
use crate::error::Result;
use crate::record::{self, Address};
use crate::store::{self, AddressStore, EntryKind, StoreError, Version};
use socket2::Socket;
use std::io::{self, Write};
use std::net::{SocketAddr, TcpStream};
use std::time::{Duration, Instant};

/// What happened to one pending record during reconciliation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Connected and sent the secret.
    Delivered,
    Unreachable(io::ErrorKind),
    /// Value was not `HOST:PORT`. The record is removed all the same.
    Malformed(String),
    /// Changed or consumed by someone else before we could delete it.
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Callback {
    pub key: String,
    pub address: Option<Address>,
    pub outcome: Outcome,
}

/// Result of one reconciliation pass, one entry per pending record seen.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reconciliation {
    pub callbacks: Vec<Callback>,
}

impl Reconciliation {
    pub fn delivered(&self) -> usize {
        self.callbacks
            .iter()
            .filter(|c| c.outcome == Outcome::Delivered)
            .count()
    }
}

/// Tcp rendezvous server
///
/// Holds the service socket, advertises its address as the primary record and
/// calls back clients that left a pending record while it was away.
///
/// # example
/// ```no_run
/// use kvrndz::{FileStore, ServerConfig, Timeout};
/// use kvrndz::tcp::Server;
/// use std::time::Duration;
///
/// let store = FileStore::new("/mnt/shared/rndz");
/// let config = ServerConfig::new("svc/primary", 5000, "s3cret", Timeout::After(Duration::from_secs(3)));
/// let (s, report) = Server::start(store, config).unwrap();
/// println!("called back {} clients", report.delivered());
/// let (stream, peer) = s.accept().unwrap();
/// ```
pub struct Server<S: AddressStore> {
    store: S,
    config: ServerConfig,
    listener: Socket,
    local_addr: SocketAddr,
}

impl<S: AddressStore> Server<S> {
    /// Bind the service port. Nothing is written to the store yet.
    pub fn bind(store: S, config: ServerConfig) -> Result<Self> {
        config.timeout.validate("rendezvous server")?;

        let listener = listen(SocketAddr::new(config.bind_ip, config.port))?;
        let local_addr = local_addr(&listener)?;
        progress!(config.verbose, "service socket bound {}", local_addr);

        Ok(Self {
            store,
            config,
            listener,
            local_addr,
        })
    }

    /// Bind, publish the primary record and reconcile waiting clients.
    pub fn start(store: S, config: ServerConfig) -> Result<(Self, Reconciliation)> {
        let mut s = Self::bind(store, config)?;
        s.publish()?;
        let report = s.reconcile()?;
        Ok((s, report))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Address advertised in the primary record.
    pub fn advertised(&self) -> Address {
        let host = match self.config.advertise_host {
            Some(ref host) => host.clone(),
            None if self.local_addr.ip().is_unspecified() => local_ip().to_string(),
            None => self.local_addr.ip().to_string(),
        };
        Address::new(host, self.local_addr.port())
    }

    /// Create or update the primary record with our address.
    pub fn publish(&mut self) -> Result<Version> {
        let me = self.advertised();
        let version = store::publish(
            &self.store,
            &self.config.rendezvous_key,
            &me.to_string(),
            "publish primary",
            self.config.publish_attempts,
        )?;
        progress!(
            self.config.verbose,
            "published {} at {}",
            me,
            self.config.rendezvous_key
        );
        Ok(version)
    }

    /// Consume every pending record and call its client back once.
    pub fn reconcile(&mut self) -> Result<Reconciliation> {
        let verbose = self.config.verbose;
        let key = self.config.rendezvous_key.clone();

        let pending: Vec<_> = self
            .store
            .list(record::parent(&key))?
            .into_iter()
            .filter(|e| e.kind == EntryKind::File && e.path != key)
            .collect();

        let mut report = Reconciliation::default();
        if pending.is_empty() {
            progress!(verbose, "no pending clients");
            return Ok(report);
        }

        for entry in pending {
            let parsed = entry.content.parse::<Address>();

            match self.store.delete(&entry.path, "consume pending", &entry.version) {
                Ok(()) => {}
                Err(StoreError::Conflict(_)) | Err(StoreError::NotFound(_)) => {
                    log::debug!("pending {} changed under us, skipped", entry.path);
                    report.callbacks.push(Callback {
                        key: entry.path,
                        address: parsed.ok(),
                        outcome: Outcome::Skipped,
                    });
                    continue;
                }
                Err(e) => return Err(e.into()),
            }

            let (address, outcome) = match parsed {
                Ok(address) => {
                    let outcome = self.call_back(&address);
                    (Some(address), outcome)
                }
                Err(reason) => {
                    log::warn!("dropped malformed pending {}: {}", entry.path, reason);
                    (None, Outcome::Malformed(reason))
                }
            };

            report.callbacks.push(Callback {
                key: entry.path,
                address,
                outcome,
            });
        }

        Ok(report)
    }

    fn call_back(&mut self, address: &Address) -> Outcome {
        let verbose = self.config.verbose;
        progress!(verbose, "calling back {}", address);

        let target = match address.resolve() {
            Ok(target) => target,
            Err(e) => {
                progress!(verbose, "{}", e);
                return Outcome::Unreachable(io::ErrorKind::NotFound);
            }
        };

        let sent = connect_from(self.local_addr, target, self.config.timeout).and_then(
            |mut stream| {
                let token = self.config.secret.produce();
                stream.write_all(&token)
            },
        );

        match sent {
            Ok(()) => {
                progress!(verbose, "called back {}", target);
                Outcome::Delivered
            }
            Err(e) => {
                progress!(verbose, "call back {} failed: {}", target, e);
                Outcome::Unreachable(e.kind())
            }
        }
    }

    /// Wait for a service connection.
    pub fn accept(&self) -> Result<(TcpStream, SocketAddr)> {
        loop {
            if let Some(accepted) = self.accept_timeout(Timeout::Unbounded)? {
                return Ok(accepted);
            }
        }
    }

    /// Wait at most `timeout` for a service connection.
    pub fn accept_timeout(&self, timeout: Timeout) -> Result<Option<(TcpStream, SocketAddr)>> {
        Ok(accept(&self.listener, timeout)?)
    }

    /// Serve forever: hand service connections to `handle` and reconcile
    /// again every `interval`.
    pub fn run<F>(mut self, interval: Duration, mut handle: F) -> Result<()>
    where
        F: FnMut(TcpStream, SocketAddr),
    {
        let mut next = Instant::now() + interval;
        loop {
            let left = next.saturating_duration_since(Instant::now());
            if !left.is_zero() {
                if let Some((stream, peer)) = self.accept_timeout(Timeout::After(left))? {
                    log::debug!("service connection from {}", peer);
                    handle(stream, peer);
                }
                continue;
            }

            self.reconcile_pass(interval);
            next = Instant::now() + interval;
        }
    }

    /// One periodic pass. A failure is logged and left to the next pass.
    fn reconcile_pass(&mut self, interval: Duration) -> Option<Reconciliation> {
        match self.reconcile() {
            Ok(report) => {
                if !report.callbacks.is_empty() {
                    log::info!(
                        "reconciled {} pending, {} called back",
                        report.callbacks.len(),
                        report.delivered()
                    );
                }
                Some(report)
            }
            Err(e) => {
                log::warn!("reconcile failed, retrying in {:?}: {}", interval, e);
                None
            }
        }
    }
}
