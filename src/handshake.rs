//! Shared secret exchanged on the first bytes of a callback connection.
//!
//! The server writes a [`Token`], the waiting client checks it with a
//! [`Validator`]. Comparison is plain equality, not constant time.

use std::fmt;

/// Most bytes read from a freshly accepted connection.
pub const MAX_HANDSHAKE: usize = 1024;

/// Decides whether a callback came from the expected peer.
pub enum Validator {
    /// Accept whatever arrives.
    Any,
    Exact(Vec<u8>),
    Predicate(Box<dyn FnMut(&[u8]) -> bool + Send>),
}

impl Validator {
    pub fn predicate<F>(f: F) -> Self
    where
        F: FnMut(&[u8]) -> bool + Send + 'static,
    {
        Validator::Predicate(Box::new(f))
    }

    /// Called once per accepted connection.
    pub fn accepts(&mut self, payload: &[u8]) -> bool {
        match self {
            Validator::Any => true,
            Validator::Exact(secret) => secret.as_slice() == payload,
            Validator::Predicate(f) => f(payload),
        }
    }
}

impl fmt::Debug for Validator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Validator::Any => f.write_str("Any"),
            Validator::Exact(secret) => write!(f, "Exact({} bytes)", secret.len()),
            Validator::Predicate(_) => f.write_str("Predicate"),
        }
    }
}

impl From<Vec<u8>> for Validator {
    fn from(secret: Vec<u8>) -> Self {
        Validator::Exact(secret)
    }
}

impl From<&[u8]> for Validator {
    fn from(secret: &[u8]) -> Self {
        Validator::Exact(secret.to_vec())
    }
}

impl From<&str> for Validator {
    fn from(secret: &str) -> Self {
        Validator::Exact(secret.as_bytes().to_vec())
    }
}

/// What the server sends on a callback.
pub enum Token {
    /// Connect and close without writing.
    Empty,
    Fixed(Vec<u8>),
    Producer(Box<dyn FnMut() -> Vec<u8> + Send>),
}

impl Token {
    pub fn producer<F>(f: F) -> Self
    where
        F: FnMut() -> Vec<u8> + Send + 'static,
    {
        Token::Producer(Box::new(f))
    }

    pub fn produce(&mut self) -> Vec<u8> {
        match self {
            Token::Empty => Vec::new(),
            Token::Fixed(secret) => secret.clone(),
            Token::Producer(f) => f(),
        }
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Empty => f.write_str("Empty"),
            Token::Fixed(secret) => write!(f, "Fixed({} bytes)", secret.len()),
            Token::Producer(_) => f.write_str("Producer"),
        }
    }
}

impl From<Vec<u8>> for Token {
    fn from(secret: Vec<u8>) -> Self {
        Token::Fixed(secret)
    }
}

impl From<&[u8]> for Token {
    fn from(secret: &[u8]) -> Self {
        Token::Fixed(secret.to_vec())
    }
}

impl From<&str> for Token {
    fn from(secret: &str) -> Self {
        Token::Fixed(secret.as_bytes().to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering::SeqCst};
    use std::sync::Arc;

    #[test]
    fn test_exact() {
        let mut v = Validator::from("s3cret");
        assert!(v.accepts(b"s3cret"));
        assert!(!v.accepts(b"s3cre"));
        assert!(!v.accepts(b"s3cret\n"));
        assert!(!v.accepts(b""));
    }

    #[test]
    fn test_predicate_called_per_payload() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let mut v = Validator::predicate(move |payload| {
            counter.fetch_add(1, SeqCst);
            payload.starts_with(b"ok")
        });

        assert!(!v.accepts(b"no"));
        assert!(v.accepts(b"ok-1"));
        assert_eq!(calls.load(SeqCst), 2);
    }

    #[test]
    fn test_any() {
        assert!(Validator::Any.accepts(b""));
        assert!(Validator::Any.accepts(b"whatever"));
    }

    #[test]
    fn test_token() {
        assert!(Token::Empty.produce().is_empty());
        assert_eq!(Token::from("s3cret").produce(), b"s3cret");

        let mut n = 0u8;
        let mut t = Token::producer(move || {
            n += 1;
            vec![n]
        });
        assert_eq!(t.produce(), [1]);
        assert_eq!(t.produce(), [2]);
    }
}
