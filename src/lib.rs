//!A rendezvous protocol that lets two processes find each other through a shared key/value store.
//!
//!Neither side knows the other's address in advance. What they share is a store they can both
//!read and write (a synced directory, an object bucket, a repository...) and a secret.
//!
//!## How kvrndz works
//!The server binds its service port and writes its address, `HOST:PORT`, to a fixed key, the
//!primary record. A client reads the primary record and connects.
//!
//!If nobody answers, the client writes its own address to a pending record next to the primary
//!one, and listens. When a server starts it lists those pending records, deletes each one and
//!connects back to it from its service port, sending the secret. The client checks the secret,
//!takes the source address of that connection as the server's real address, and connects again.
//!
//!Every store write names the version it replaces, so processes racing on the same key get a
//!conflict error instead of losing a write.
//!
//!The implementation depends on socket option SO_REUSE_ADDR and SO_REUSE_PORT: the server calls
//!back from the same port it listens on.
//!
//!## Feature flags
//!- `client`: tcp client agent
//!- `server`: tcp server agent
//!- `env_logger`, `structopt`: the `kvrndz` command line tool

/// Progress line, at info level when the agent is verbose.
macro_rules! progress {
    ($verbose:expr, $($arg:tt)+) => {
        if $verbose {
            log::info!($($arg)+)
        } else {
            log::debug!($($arg)+)
        }
    };
}

pub mod config;
pub mod error;
pub mod handshake;
pub mod record;
pub mod store;
pub mod tcp;

pub use config::{ClientConfig, ServerConfig, Timeout};
pub use error::{Error, Result};
pub use handshake::{Token, Validator};
pub use record::{Address, RendezvousRecord};
pub use store::{AddressStore, FileStore, MemoryStore};
