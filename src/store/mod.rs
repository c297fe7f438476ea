//! Versioned key/value store used as the signaling channel.
//!
//! Every write carries the version it expects to replace, so independent
//! processes racing on the same key see a [`StoreError::Conflict`] instead of
//! silently overwriting each other.
//!
//! use [`MemoryStore`] inside one process, [`FileStore`] for a shared directory.

mod file;
mod memory;
pub use file::FileStore;
pub use memory::{MemoryStore, Op, OpKind};

use std::fmt;
use std::io;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{0} not found")]
    NotFound(String),
    #[error("{0} was modified concurrently")]
    Conflict(String),
    #[error("invalid key {0:?}")]
    InvalidKey(String),
    #[error("I/O error. {0}")]
    Io(#[from] io::Error),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Opaque version tag of a stored value.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Version(String);

impl Version {
    pub fn new<S: Into<String>>(tag: S) -> Self {
        Self(tag.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Dir,
}

/// A listed or fetched store entry. Directories have empty content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub path: String,
    pub kind: EntryKind,
    pub content: String,
    pub version: Version,
}

pub trait AddressStore {
    fn get(&self, path: &str) -> StoreResult<Entry>;

    /// Fails with `Conflict` if `path` already exists.
    fn create(&self, path: &str, content: &str, message: &str) -> StoreResult<Version>;

    fn update(
        &self,
        path: &str,
        content: &str,
        message: &str,
        expected: &Version,
    ) -> StoreResult<Version>;

    fn delete(&self, path: &str, message: &str, expected: &Version) -> StoreResult<()>;

    /// Direct children of `dir`. A missing directory lists as empty.
    fn list(&self, dir: &str) -> StoreResult<Vec<Entry>>;
}

macro_rules! forward_store {
    ($($ty:ty),*) => {$(
        impl<T: AddressStore + ?Sized> AddressStore for $ty {
            fn get(&self, path: &str) -> StoreResult<Entry> {
                (**self).get(path)
            }

            fn create(&self, path: &str, content: &str, message: &str) -> StoreResult<Version> {
                (**self).create(path, content, message)
            }

            fn update(
                &self,
                path: &str,
                content: &str,
                message: &str,
                expected: &Version,
            ) -> StoreResult<Version> {
                (**self).update(path, content, message, expected)
            }

            fn delete(&self, path: &str, message: &str, expected: &Version) -> StoreResult<()> {
                (**self).delete(path, message, expected)
            }

            fn list(&self, dir: &str) -> StoreResult<Vec<Entry>> {
                (**self).list(dir)
            }
        }
    )*};
}

forward_store!(&T, Box<T>, Arc<T>);

/// Create `path`, or update it matching the version just read.
///
/// A lost race re-reads and tries again, `attempts` times in total.
pub fn publish<S: AddressStore + ?Sized>(
    store: &S,
    path: &str,
    content: &str,
    message: &str,
    attempts: u32,
) -> StoreResult<Version> {
    for attempt in 1..=attempts.max(1) {
        let written = match store.get(path) {
            Ok(current) => store.update(path, content, message, &current.version),
            Err(StoreError::NotFound(_)) => store.create(path, content, message),
            Err(e) => return Err(e),
        };

        match written {
            Err(StoreError::Conflict(_)) | Err(StoreError::NotFound(_)) => {
                log::debug!("publish {} lost a race, attempt {}", path, attempt);
            }
            other => return other,
        }
    }

    Err(StoreError::Conflict(path.to_string()))
}
