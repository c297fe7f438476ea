//! TCP rendezvous agents.
//!
//! use `Server` to publish the service address and call back waiting clients.
//!
//! use `Client` to reach the published address, or wait to be called back.

#[cfg(feature = "client")]
mod client;
#[cfg(feature = "client")]
pub use client::{Client, Connection};

#[cfg(feature = "server")]
mod server;
#[cfg(feature = "server")]
pub use server::{Callback, Outcome, Reconciliation, Server};

use crate::config::Timeout;
use crate::handshake::MAX_HANDSHAKE;
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use socket2::{Domain, Protocol, Socket, Type};
use std::io::{Error, ErrorKind, ErrorKind::Other, Read, Result};
use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpStream, UdpSocket};
use std::os::fd::AsFd;
use std::time::Instant;

/// Address other hosts most likely reach us on.
///
/// Routes a udp socket towards a public address, nothing is sent. Falls back
/// to loopback on hosts without a route.
pub fn local_ip() -> IpAddr {
    let probe = || -> Result<IpAddr> {
        let s = UdpSocket::bind("0.0.0.0:0")?;
        s.connect("8.8.8.8:53")?;
        Ok(s.local_addr()?.ip())
    };

    probe().unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST))
}

fn bind(local_addr: SocketAddr) -> Result<Socket> {
    let s = Socket::new(Domain::for_address(local_addr), Type::STREAM, Some(Protocol::TCP))?;
    s.set_reuse_address(true)?;
    #[cfg(unix)]
    s.set_reuse_port(true)?;
    s.bind(&local_addr.into())?;

    Ok(s)
}

fn listen(local_addr: SocketAddr) -> Result<Socket> {
    let s = bind(local_addr)?;
    s.listen(10)?;
    s.set_nonblocking(true)?;
    Ok(s)
}

fn local_addr(s: &Socket) -> Result<SocketAddr> {
    s.local_addr()?
        .as_socket()
        .ok_or_else(|| Error::new(Other, "not an inet socket"))
}

fn dial(s: Socket, target: SocketAddr, timeout: Timeout) -> Result<TcpStream> {
    match timeout.as_duration() {
        Some(d) => s.connect_timeout(&target.into(), d)?,
        None => s.connect(&target.into())?,
    }
    Ok(s.into())
}

fn connect(target: SocketAddr, timeout: Timeout) -> Result<TcpStream> {
    let s = Socket::new(Domain::for_address(target), Type::STREAM, Some(Protocol::TCP))?;
    dial(s, target, timeout)
}

/// Connect from a fixed local address, shared with a listener on the same port.
fn connect_from(local_addr: SocketAddr, target: SocketAddr, timeout: Timeout) -> Result<TcpStream> {
    dial(bind(local_addr)?, target, timeout)
}

/// Wait for one connection. `None` when the timeout expires first.
fn accept(listener: &Socket, timeout: Timeout) -> Result<Option<(TcpStream, SocketAddr)>> {
    let deadline = timeout.as_duration().map(|d| Instant::now() + d);

    loop {
        let wait = match deadline {
            Some(deadline) => {
                let left = deadline.saturating_duration_since(Instant::now());
                if left.is_zero() {
                    return Ok(None);
                }
                let ms = left.as_micros().div_ceil(1000);
                PollTimeout::from(u16::try_from(ms).unwrap_or(u16::MAX))
            }
            None => PollTimeout::NONE,
        };

        let mut fds = [PollFd::new(listener.as_fd(), PollFlags::POLLIN)];
        match poll(&mut fds, wait) {
            Ok(0) | Err(Errno::EINTR) => continue,
            Ok(_) => {}
            Err(e) => return Err(e.into()),
        }

        match listener.accept() {
            Ok((s, addr)) => {
                s.set_nonblocking(false)?;
                let addr = addr
                    .as_socket()
                    .ok_or_else(|| Error::new(Other, "not an inet peer"))?;
                return Ok(Some((s.into(), addr)));
            }
            // the peer went away between poll and accept
            Err(e) if e.kind() == ErrorKind::WouldBlock => continue,
            Err(e) if e.kind() == ErrorKind::ConnectionAborted => continue,
            Err(e) => return Err(e),
        }
    }
}

/// A single read of at most [`MAX_HANDSHAKE`] bytes.
fn read_handshake(stream: &mut TcpStream, timeout: Timeout) -> Result<Vec<u8>> {
    stream.set_read_timeout(timeout.as_duration())?;
    let mut buf = [0u8; MAX_HANDSHAKE];
    let n = stream.read(&mut buf)?;
    Ok(buf[..n].to_vec())
}

/// Errors meaning nobody is listening at the target (yet).
fn is_unreachable(e: &Error) -> bool {
    matches!(
        e.kind(),
        ErrorKind::ConnectionRefused
            | ErrorKind::TimedOut
            | ErrorKind::WouldBlock
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::NotConnected
            | ErrorKind::AddrNotAvailable
    ) || matches!(
        e.raw_os_error().map(Errno::from_raw),
        Some(Errno::EHOSTUNREACH | Errno::ENETUNREACH)
    )
}


#[cfg(all(test, feature = "client", feature = "server"))]
mod rendezvous_tests {
    use super::*;
    use crate::config::{ClientConfig, ServerConfig};
    use crate::store::{AddressStore, MemoryStore};
    use crate::Error;
    use std::io::Write;
    use std::net::TcpListener;
    use std::thread;
    use std::time::Duration;

    const KEY: &str = "rndz/primary";

    fn wait_for(store: &MemoryStore, key: &str) {
        for _ in 0..500 {
            if store.get(key).is_ok() {
                return;
            }
            thread::sleep(Duration::from_millis(10));
        }
        panic!("{} never published", key);
    }

    #[test]
    fn test_client_called_back_by_late_server() {
        let store = MemoryStore::new();
        let dead = TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap();
        store.create(KEY, &dead.to_string(), "old server").unwrap();

        let client_store = store.clone();
        let t = thread::spawn(move || {
            let config = ClientConfig::new(KEY, 0, "s3cret", Timeout::After(Duration::from_secs(5)))
                .with_pending_name("self")
                .with_advertise_host("127.0.0.1");
            let mut c = Client::new(client_store, config)?;
            let mut conn = c.connect()?;
            conn.stream.write_all(b"hello")?;
            Ok::<_, Error>(conn)
        });

        wait_for(&store, "rndz/self");

        let config = ServerConfig::new(KEY, 0, "s3cret", Timeout::After(Duration::from_secs(5)))
            .with_advertise_host("127.0.0.1");
        let (s, report) = Server::start(store.clone(), config).unwrap();
        assert_eq!(report.delivered(), 1);
        assert!(store.get("rndz/self").is_err());

        let conn = t.join().unwrap().unwrap();
        assert_eq!(conn.peer.port(), s.local_addr().port());
        assert_eq!(conn.corrected, Some(conn.peer));

        let (mut stream, _) = s
            .accept_timeout(Timeout::After(Duration::from_secs(5)))
            .unwrap()
            .unwrap();
        let mut buf = [0u8; 5];
        stream.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn test_wrong_secret_times_out() {
        let store = MemoryStore::new();
        let dead = TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap();
        store.create(KEY, &dead.to_string(), "old server").unwrap();

        let client_store = store.clone();
        let t = thread::spawn(move || {
            let config =
                ClientConfig::new(KEY, 0, "s3cret", Timeout::After(Duration::from_millis(500)))
                    .with_pending_name("self")
                    .with_advertise_host("127.0.0.1");
            Client::new(client_store, config).and_then(|mut c| c.connect())
        });

        wait_for(&store, "rndz/self");

        let config = ServerConfig::new(KEY, 0, "guess", Timeout::After(Duration::from_secs(5)))
            .with_advertise_host("127.0.0.1");
        let (_s, report) = Server::start(store.clone(), config).unwrap();
        assert_eq!(report.delivered(), 1);

        assert!(matches!(
            t.join().unwrap(),
            Err(Error::RendezvousTimeout { .. })
        ));
    }
}
