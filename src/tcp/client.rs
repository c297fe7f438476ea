use super::{accept, connect, is_unreachable, listen, local_addr, local_ip, read_handshake};
use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::record::{self, Address, RendezvousRecord};
use crate::store::{self, AddressStore};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, TcpStream};

/// An established connection to the server.
#[derive(Debug)]
pub struct Connection {
    pub stream: TcpStream,
    pub peer: SocketAddr,
    /// Set when the address came from a callback rather than the primary record.
    pub corrected: Option<SocketAddr>,
}

/// Tcp rendezvous client
///
/// Looks up the primary record and connects to it. When nobody answers, it
/// leaves a pending record with its own address and waits for the server to
/// call back.
///
/// # example
/// ```no_run
/// use kvrndz::{ClientConfig, FileStore, Timeout};
/// use kvrndz::tcp::Client;
/// use std::time::Duration;
///
/// let store = FileStore::new("/mnt/shared/rndz");
/// let config = ClientConfig::new("svc/primary", 9100, "s3cret", Timeout::After(Duration::from_secs(30)));
/// let mut c = Client::new(store, config).unwrap();
/// let conn = c.connect().unwrap();
/// println!("connected to {}", conn.peer);
/// ```
pub struct Client<S: AddressStore> {
    store: S,
    config: ClientConfig,
    pending_key: String,
}

impl<S: AddressStore> Client<S> {
    pub fn new(store: S, config: ClientConfig) -> Result<Self> {
        config.timeout.validate("rendezvous client")?;

        let name = match config.pending_name {
            Some(ref name) => name.clone(),
            None => format!("pending-{:08x}", rand::random::<u32>()),
        };
        if name.is_empty() || name.contains('/') {
            return Err(Error::InvalidConfig(format!(
                "pending record name {:?} must be a plain file name",
                name
            )));
        }

        let pending_key = record::sibling(&config.rendezvous_key, &name);
        if pending_key == config.rendezvous_key {
            return Err(Error::InvalidConfig(format!(
                "pending record {} collides with the primary record",
                pending_key
            )));
        }

        Ok(Self {
            store,
            config,
            pending_key,
        })
    }

    /// Path this client publishes its pending record under.
    pub fn pending_key(&self) -> &str {
        &self.pending_key
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    fn read_primary(&self) -> Result<RendezvousRecord> {
        let entry = self.store.get(&self.config.rendezvous_key)?;
        RendezvousRecord::from_entry(entry)
    }

    pub fn connect(&mut self) -> Result<Connection> {
        let verbose = self.config.verbose;

        let primary = self.read_primary()?;
        progress!(verbose, "server address {}", primary.address);

        let mut target = primary.address.resolve()?;
        let mut corrected = None;

        loop {
            progress!(verbose, "connecting {}", target);
            match connect(target, self.config.timeout) {
                Ok(stream) => {
                    progress!(verbose, "connected {}", target);
                    return Ok(Connection {
                        stream,
                        peer: target,
                        corrected,
                    });
                }
                Err(e) if is_unreachable(&e) => {
                    progress!(verbose, "server {} not online: {}", target, e);
                }
                Err(e) => return Err(Error::Transport(e)),
            }

            target = self.await_callback(target)?;
            corrected = Some(target);
        }
    }

    /// Wildcard address of the family we advertise, or else of the server's.
    fn choose_bind_addr(&self, server: SocketAddr) -> SocketAddr {
        let advertised = self
            .config
            .advertise_host
            .as_deref()
            .map(|host| host.trim_start_matches('[').trim_end_matches(']'))
            .and_then(|host| host.parse::<IpAddr>().ok());

        let v6 = match advertised {
            Some(ip) => ip.is_ipv6(),
            None => server.is_ipv6(),
        };
        let ip = if v6 {
            IpAddr::V6(Ipv6Addr::UNSPECIFIED)
        } else {
            IpAddr::V4(Ipv4Addr::UNSPECIFIED)
        };

        SocketAddr::new(ip, self.config.port)
    }

    /// Publish our address and wait for a server to call back with the secret.
    fn await_callback(&mut self, server: SocketAddr) -> Result<SocketAddr> {
        let verbose = self.config.verbose;
        let timeout = self.config.timeout;

        let listener = listen(self.choose_bind_addr(server))?;
        let port = local_addr(&listener)?.port();

        let host = match self.config.advertise_host {
            Some(ref host) => host.clone(),
            None => local_ip().to_string(),
        };
        let me = Address::new(host, port);
        store::publish(
            &self.store,
            &self.pending_key,
            &me.to_string(),
            "publish pending",
            self.config.publish_attempts,
        )?;
        progress!(verbose, "waiting for callback on {} as {}", me, self.pending_key);

        loop {
            let (mut stream, peer) = match accept(&listener, timeout)? {
                Some(accepted) => accepted,
                None => {
                    progress!(verbose, "no callback received");
                    return Err(Error::RendezvousTimeout {
                        waited: timeout.as_duration().unwrap_or_default(),
                    });
                }
            };

            let payload = match read_handshake(&mut stream, timeout) {
                Ok(payload) => payload,
                Err(e) => {
                    log::debug!("handshake read from {} failed: {}", peer, e);
                    continue;
                }
            };

            if self.config.secret.accepts(&payload) {
                progress!(verbose, "handshake accepted from {}", peer);
                return Ok(peer);
            }

            // the rejected stream is dropped here, one attempt per connection
            progress!(verbose, "handshake rejected from {}", peer);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Timeout;
    use crate::handshake::Validator;
    use crate::store::{MemoryStore, StoreError};
    use crate::tcp::connect_from;
    use std::io::Write;
    use std::net::TcpListener;
    use std::sync::atomic::{AtomicUsize, Ordering::SeqCst};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    const KEY: &str = "rndz/primary";

    fn closed_port() -> u16 {
        TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    fn config<V: Into<Validator>>(secret: V, timeout: Duration) -> ClientConfig {
        ClientConfig::new(KEY, 0, secret, Timeout::After(timeout))
            .with_pending_name("pending-self")
            .with_advertise_host("127.0.0.1")
    }

    /// Address published by a waiting client.
    fn wait_pending(store: &MemoryStore, key: &str) -> SocketAddr {
        for _ in 0..500 {
            if let Ok(entry) = store.get(key) {
                return entry.content.parse::<Address>().unwrap().resolve().unwrap();
            }
            thread::sleep(Duration::from_millis(10));
        }
        panic!("no pending record at {}", key);
    }

    #[test]
    fn test_direct_connect() {
        let server = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = server.local_addr().unwrap();

        let store = MemoryStore::new();
        store.create(KEY, &addr.to_string(), "publish").unwrap();

        let mut c = Client::new(store.clone(), config("s", Duration::from_secs(5))).unwrap();
        let conn = c.connect().unwrap();
        assert_eq!(conn.peer, addr);
        assert!(conn.corrected.is_none());

        // nothing published when the server answers
        assert!(matches!(
            store.get("rndz/pending-self"),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn test_missing_primary() {
        let mut c = Client::new(MemoryStore::new(), config("s", Duration::from_secs(1))).unwrap();
        match c.connect() {
            Err(Error::StoreLookup { key }) => assert_eq!(key, KEY),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_timeout_leaves_pending_record() {
        let store = MemoryStore::new();
        store
            .create(KEY, &format!("127.0.0.1:{}", closed_port()), "publish")
            .unwrap();

        let mut c = Client::new(store.clone(), config("s", Duration::from_millis(200))).unwrap();
        assert!(matches!(
            c.connect(),
            Err(Error::RendezvousTimeout { .. })
        ));

        let pending = store.get("rndz/pending-self").unwrap();
        assert!(pending.content.starts_with("127.0.0.1:"));

        // retrying overwrites the same record
        assert!(c.connect().is_err());
        let files = store.list("rndz").unwrap();
        assert_eq!(files.len(), 2);
    }

    #[test]
    fn test_rejected_handshake_keeps_listening() {
        let store = MemoryStore::new();
        store
            .create(KEY, &format!("127.0.0.1:{}", closed_port()), "publish")
            .unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let secret = Validator::predicate(move |payload| {
            counter.fetch_add(1, SeqCst);
            payload == b"s3cret"
        });

        let client_store = store.clone();
        let t = thread::spawn(move || {
            let mut c = Client::new(client_store, config(secret, Duration::from_secs(5))).unwrap();
            c.connect()
        });

        let waiting = wait_pending(&store, "rndz/pending-self");
        let timeout = Timeout::After(Duration::from_secs(5));

        let mut bad = connect(waiting, timeout).unwrap();
        bad.write_all(b"wrong").unwrap();

        // the real server calls back from its service port
        let service = listen("127.0.0.1:0".parse().unwrap()).unwrap();
        let service_addr = local_addr(&service).unwrap();
        let mut good = connect_from(service_addr, waiting, timeout).unwrap();
        good.write_all(b"s3cret").unwrap();
        drop(good);

        let conn = t.join().unwrap().unwrap();
        assert_eq!(conn.peer, service_addr);
        assert_eq!(conn.corrected, Some(service_addr));
        assert_eq!(calls.load(SeqCst), 2);
    }

    #[test]
    fn test_pending_name_must_differ() {
        let config = ClientConfig::new(KEY, 0, "s", Timeout::Unbounded).with_pending_name("primary");
        assert!(matches!(
            Client::new(MemoryStore::new(), config),
            Err(Error::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_bind_family() {
        let v4: SocketAddr = "10.0.0.1:9000".parse().unwrap();
        let v6: SocketAddr = "[fd00::1]:9000".parse().unwrap();
        let client = |advertise: Option<&str>| {
            let mut config = ClientConfig::new(KEY, 7000, "s", Timeout::Unbounded);
            if let Some(host) = advertise {
                config = config.with_advertise_host(host);
            }
            Client::new(MemoryStore::new(), config).unwrap()
        };

        let c = client(None);
        assert_eq!(c.choose_bind_addr(v4), "0.0.0.0:7000".parse::<SocketAddr>().unwrap());
        assert_eq!(c.choose_bind_addr(v6), "[::]:7000".parse::<SocketAddr>().unwrap());

        let c = client(Some("::1"));
        assert_eq!(c.choose_bind_addr(v4), "[::]:7000".parse::<SocketAddr>().unwrap());
        let c = client(Some("[fd00::2]"));
        assert_eq!(c.choose_bind_addr(v4), "[::]:7000".parse::<SocketAddr>().unwrap());

        // the advertised family wins, names fall back to the server's
        let c = client(Some("10.1.1.1"));
        assert_eq!(c.choose_bind_addr(v6), "0.0.0.0:7000".parse::<SocketAddr>().unwrap());
        let c = client(Some("box.local"));
        assert_eq!(c.choose_bind_addr(v6), "[::]:7000".parse::<SocketAddr>().unwrap());
    }

    #[test]
    fn test_random_pending_name() {
        let config = ClientConfig::new(KEY, 0, "s", Timeout::Unbounded);
        let c = Client::new(MemoryStore::new(), config).unwrap();
        assert!(c.pending_key().starts_with("rndz/pending-"));
    }
}
