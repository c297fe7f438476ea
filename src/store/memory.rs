use super::{AddressStore, Entry, EntryKind, StoreError, StoreResult, Version};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    Create,
    Update,
    Delete,
}

/// A successful write, as recorded in the journal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Op {
    pub kind: OpKind,
    pub path: String,
    pub message: String,
}

#[derive(Default)]
struct Inner {
    values: BTreeMap<String, (String, u64)>,
    next_version: u64,
    journal: Vec<Op>,
}

impl Inner {
    fn bump(&mut self) -> u64 {
        self.next_version += 1;
        self.next_version
    }

    fn record(&mut self, kind: OpKind, path: &str, message: &str) {
        self.journal.push(Op {
            kind,
            path: path.to_string(),
            message: message.to_string(),
        });
    }

    fn check(&self, path: &str, expected: &Version) -> StoreResult<()> {
        match self.values.get(path) {
            None => Err(StoreError::NotFound(path.to_string())),
            Some((_, v)) if v.to_string() != expected.as_str() => {
                Err(StoreError::Conflict(path.to_string()))
            }
            Some(_) => Ok(()),
        }
    }
}

/// In-process store. Clones share the same contents.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every successful write so far, oldest first.
    pub fn journal(&self) -> Vec<Op> {
        self.lock().journal.clone()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // a panic while holding the lock cannot leave the map half written
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn entry(path: &str, content: &str, version: u64) -> Entry {
    Entry {
        path: path.to_string(),
        kind: EntryKind::File,
        content: content.to_string(),
        version: Version::new(version.to_string()),
    }
}

impl AddressStore for MemoryStore {
    fn get(&self, path: &str) -> StoreResult<Entry> {
        self.lock()
            .values
            .get(path)
            .map(|(content, v)| entry(path, content, *v))
            .ok_or_else(|| StoreError::NotFound(path.to_string()))
    }

    fn create(&self, path: &str, content: &str, message: &str) -> StoreResult<Version> {
        let mut inner = self.lock();
        if inner.values.contains_key(path) {
            return Err(StoreError::Conflict(path.to_string()));
        }

        let v = inner.bump();
        inner.values.insert(path.to_string(), (content.to_string(), v));
        inner.record(OpKind::Create, path, message);
        Ok(Version::new(v.to_string()))
    }

    fn update(
        &self,
        path: &str,
        content: &str,
        message: &str,
        expected: &Version,
    ) -> StoreResult<Version> {
        let mut inner = self.lock();
        inner.check(path, expected)?;

        let v = inner.bump();
        inner.values.insert(path.to_string(), (content.to_string(), v));
        inner.record(OpKind::Update, path, message);
        Ok(Version::new(v.to_string()))
    }

    fn delete(&self, path: &str, message: &str, expected: &Version) -> StoreResult<()> {
        let mut inner = self.lock();
        inner.check(path, expected)?;

        inner.values.remove(path);
        inner.record(OpKind::Delete, path, message);
        Ok(())
    }

    fn list(&self, dir: &str) -> StoreResult<Vec<Entry>> {
        let prefix = if dir.is_empty() {
            String::new()
        } else {
            format!("{}/", dir.trim_end_matches('/'))
        };

        let inner = self.lock();
        let mut files = Vec::new();
        let mut dirs = BTreeSet::new();
        for (path, (content, v)) in inner.values.range(prefix.clone()..) {
            let rest = match path.strip_prefix(&prefix) {
                Some(rest) => rest,
                None => break,
            };
            match rest.split_once('/') {
                Some((sub, _)) => {
                    dirs.insert(format!("{}{}", prefix, sub));
                }
                None => files.push(entry(path, content, *v)),
            }
        }

        files.extend(dirs.into_iter().map(|path| Entry {
            path,
            kind: EntryKind::Dir,
            content: String::new(),
            version: Version::new(""),
        }));
        Ok(files)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_versioned_writes() {
        let store = MemoryStore::new();
        let v1 = store.create("rndz/primary", "h:1", "create").unwrap();
        assert!(matches!(
            store.create("rndz/primary", "h:2", "create"),
            Err(StoreError::Conflict(_))
        ));

        let v2 = store.update("rndz/primary", "h:2", "update", &v1).unwrap();
        assert!(matches!(
            store.update("rndz/primary", "h:3", "update", &v1),
            Err(StoreError::Conflict(_))
        ));
        assert!(matches!(
            store.delete("rndz/primary", "delete", &v1),
            Err(StoreError::Conflict(_))
        ));

        store.delete("rndz/primary", "delete", &v2).unwrap();
        assert!(matches!(
            store.get("rndz/primary"),
            Err(StoreError::NotFound(_))
        ));
        assert!(matches!(
            store.update("rndz/primary", "h:4", "update", &v2),
            Err(StoreError::NotFound(_))
        ));

        let kinds: Vec<OpKind> = store.journal().iter().map(|op| op.kind).collect();
        assert_eq!(kinds, [OpKind::Create, OpKind::Update, OpKind::Delete]);
    }

    #[test]
    fn test_list() {
        let store = MemoryStore::new();
        store.create("rndz/primary", "h:1", "c").unwrap();
        store.create("rndz/pending-a", "h:2", "c").unwrap();
        store.create("rndz/nested/x", "h:3", "c").unwrap();
        store.create("rndzz", "h:4", "c").unwrap();
        store.create("other/y", "h:5", "c").unwrap();

        let listed = store.list("rndz").unwrap();
        let files: Vec<&str> = listed
            .iter()
            .filter(|e| e.kind == EntryKind::File)
            .map(|e| e.path.as_str())
            .collect();
        assert_eq!(files, ["rndz/pending-a", "rndz/primary"]);

        let dirs: Vec<&str> = listed
            .iter()
            .filter(|e| e.kind == EntryKind::Dir)
            .map(|e| e.path.as_str())
            .collect();
        assert_eq!(dirs, ["rndz/nested"]);

        assert!(store.list("missing").unwrap().is_empty());
        assert_eq!(store.list("").unwrap().len(), 3);
    }
}
