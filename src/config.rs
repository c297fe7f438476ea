//! Agent configuration.

use crate::error::{Error, Result};
use crate::handshake::{Token, Validator};
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

/// How long a blocking network call may wait.
///
/// There is no default: waiting forever has to be asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timeout {
    After(Duration),
    Unbounded,
}

impl Timeout {
    pub fn as_duration(self) -> Option<Duration> {
        match self {
            Timeout::After(d) => Some(d),
            Timeout::Unbounded => None,
        }
    }

    pub(crate) fn validate(self, who: &str) -> Result<()> {
        match self {
            Timeout::After(d) if d.is_zero() => Err(Error::InvalidConfig(
                "timeout must be non-zero, use Timeout::Unbounded to wait forever".into(),
            )),
            Timeout::After(_) => Ok(()),
            Timeout::Unbounded => {
                log::warn!("{} configured without timeout, it may wait forever", who);
                Ok(())
            }
        }
    }
}

impl From<Duration> for Timeout {
    fn from(d: Duration) -> Self {
        Timeout::After(d)
    }
}

/// Attempts made when a store write loses a version race.
pub const DEFAULT_PUBLISH_ATTEMPTS: u32 = 3;

#[derive(Debug)]
pub struct ClientConfig {
    /// Path of the primary record.
    pub rendezvous_key: String,
    /// Port listened on while waiting for a callback, 0 picks one.
    pub port: u16,
    pub secret: Validator,
    pub timeout: Timeout,
    /// Log progress at info instead of debug level.
    pub verbose: bool,
    /// Name of the pending record, random when unset.
    pub pending_name: Option<String>,
    /// Host written to the pending record, detected when unset.
    pub advertise_host: Option<String>,
    pub publish_attempts: u32,
}

impl ClientConfig {
    pub fn new<K: Into<String>, V: Into<Validator>>(
        rendezvous_key: K,
        port: u16,
        secret: V,
        timeout: Timeout,
    ) -> Self {
        Self {
            rendezvous_key: rendezvous_key.into(),
            port,
            secret: secret.into(),
            timeout,
            verbose: false,
            pending_name: None,
            advertise_host: None,
            publish_attempts: DEFAULT_PUBLISH_ATTEMPTS,
        }
    }

    pub fn verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn with_pending_name<S: Into<String>>(mut self, name: S) -> Self {
        self.pending_name = Some(name.into());
        self
    }

    pub fn with_advertise_host<S: Into<String>>(mut self, host: S) -> Self {
        self.advertise_host = Some(host.into());
        self
    }

    pub fn with_publish_attempts(mut self, attempts: u32) -> Self {
        self.publish_attempts = attempts;
        self
    }
}

#[derive(Debug)]
pub struct ServerConfig {
    /// Path of the primary record.
    pub rendezvous_key: String,
    /// Service port, 0 picks one.
    pub port: u16,
    pub bind_ip: IpAddr,
    pub secret: Token,
    pub timeout: Timeout,
    pub verbose: bool,
    /// Host written to the primary record, detected when unset.
    pub advertise_host: Option<String>,
    pub publish_attempts: u32,
}

impl ServerConfig {
    pub fn new<K: Into<String>, T: Into<Token>>(
        rendezvous_key: K,
        port: u16,
        secret: T,
        timeout: Timeout,
    ) -> Self {
        Self {
            rendezvous_key: rendezvous_key.into(),
            port,
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            secret: secret.into(),
            timeout,
            verbose: false,
            advertise_host: None,
            publish_attempts: DEFAULT_PUBLISH_ATTEMPTS,
        }
    }

    pub fn verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn with_bind_ip(mut self, ip: IpAddr) -> Self {
        self.bind_ip = ip;
        self
    }

    pub fn with_advertise_host<S: Into<String>>(mut self, host: S) -> Self {
        self.advertise_host = Some(host.into());
        self
    }

    pub fn with_publish_attempts(mut self, attempts: u32) -> Self {
        self.publish_attempts = attempts;
        self
    }
}
