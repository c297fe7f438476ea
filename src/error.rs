use crate::store::StoreError;
use std::io;
use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the rendezvous agents.
#[derive(Debug, Error)]
pub enum Error {
    #[error("no record at {key}")]
    StoreLookup { key: String },
    #[error("version conflict while writing {key}")]
    StoreConflict { key: String },
    #[error("store failure. {0}")]
    Store(StoreError),
    #[error("malformed record {key}: {reason}")]
    InvalidRecord { key: String, reason: String },
    #[error("could not resolve {host}. {source}")]
    Resolve {
        host: String,
        #[source]
        source: io::Error,
    },
    #[error("transport error. {0}")]
    Transport(#[source] io::Error),
    #[error("no valid handshake received within {waited:?}")]
    RendezvousTimeout { waited: Duration },
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("I/O error. {0}")]
    Io(#[from] io::Error),
}

impl From<StoreError> for Error {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(key) => Error::StoreLookup { key },
            StoreError::Conflict(key) => Error::StoreConflict { key },
            other => Error::Store(other),
        }
    }
}
