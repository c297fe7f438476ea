//! Address records kept in the store.
//!
//! A record value is the text `HOST:PORT`. The primary record advertises the
//! service, pending records sit next to it under the same directory.

use crate::error::{Error, Result};
use crate::store::{Entry, Version};
use std::fmt;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::str::FromStr;

/// Host and port as written in a record.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Address {
    pub host: String,
    pub port: u16,
}

impl Address {
    pub fn new<H: Into<String>>(host: H, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Resolve to the first socket address of the host.
    pub fn resolve(&self) -> Result<SocketAddr> {
        (self.host.as_str(), self.port)
            .to_socket_addrs()
            .and_then(|mut addrs| {
                addrs
                    .next()
                    .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no address"))
            })
            .map_err(|source| Error::Resolve {
                host: self.host.clone(),
                source,
            })
    }
}

impl From<SocketAddr> for Address {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip().to_string(), addr.port())
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') && !self.host.starts_with('[') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for Address {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let s = s.trim();
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| format!("expected HOST:PORT, got {:?}", s))?;

        let host = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(host);
        if host.is_empty() {
            return Err(format!("empty host in {:?}", s));
        }

        let port = port
            .parse::<u16>()
            .map_err(|_| format!("invalid port in {:?}", s))?;

        Ok(Self::new(host, port))
    }
}

/// A parsed address entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RendezvousRecord {
    pub key: String,
    pub address: Address,
    pub version: Version,
}

impl RendezvousRecord {
    pub fn from_entry(entry: Entry) -> Result<Self> {
        let address = entry
            .content
            .parse()
            .map_err(|reason| Error::InvalidRecord {
                key: entry.path.clone(),
                reason,
            })?;

        Ok(Self {
            key: entry.path,
            address,
            version: entry.version,
        })
    }

    pub fn encode(&self) -> String {
        self.address.to_string()
    }
}

/// Directory holding `key`. Top level keys live in the root, `""`.
pub fn parent(key: &str) -> &str {
    key.rsplit_once('/').map(|(dir, _)| dir).unwrap_or("")
}

/// Sibling of `key` named `name`.
pub fn sibling(key: &str, name: &str) -> String {
    join(parent(key), name)
}

pub fn join(dir: &str, name: &str) -> String {
    if dir.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", dir.trim_end_matches('/'), name)
    }
}
