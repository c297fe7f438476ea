use super::{AddressStore, Entry, EntryKind, StoreError, StoreResult, Version};
use blake2::{Blake2s256, Digest};
use nix::fcntl::{Flock, FlockArg};
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Component, Path, PathBuf};
use tempfile::NamedTempFile;

/// Per-directory lock file, hidden from `list`.
const LOCK_FILE: &str = ".lock";

/// Store backed by a directory, e.g. a network mount or a synced folder.
///
/// The version of a value is the blake2s digest of its content. Writes land in
/// a temp file which is then renamed over the target, so readers never see a
/// partial value, and a create never replaces an existing file. Updates and
/// deletes hold an exclusive `flock` on the directory's lock file from the
/// version check until the rename or unlink, so of two writers expecting the
/// same version exactly one succeeds.
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, key: &str) -> StoreResult<PathBuf> {
        let rel = Path::new(key);
        let clean = rel
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
        if !clean {
            return Err(StoreError::InvalidKey(key.to_string()));
        }

        Ok(self.root.join(rel))
    }

    fn read(&self, key: &str) -> StoreResult<(PathBuf, String)> {
        let path = self.resolve(key)?;
        match fs::read_to_string(&path) {
            Ok(content) => Ok((path, content)),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(StoreError::NotFound(key.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn write(path: &Path, content: &str) -> StoreResult<()> {
        let dir = path.parent().unwrap_or(Path::new("."));
        fs::create_dir_all(dir)?;

        let mut tmp = NamedTempFile::new_in(dir)?;
        tmp.write_all(content.as_bytes())?;
        tmp.persist(path).map_err(|e| e.error)?;
        Ok(())
    }

    /// Lock the directory holding `key`. Released when the guard drops.
    fn lock(&self, key: &str) -> StoreResult<Flock<File>> {
        let path = self.resolve(key)?;
        let dir = path.parent().unwrap_or(Path::new("."));
        let file = match OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(dir.join(LOCK_FILE))
        {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(StoreError::NotFound(key.to_string()))
            }
            Err(e) => return Err(e.into()),
        };

        Flock::lock(file, FlockArg::LockExclusive)
            .map_err(|(_, errno)| StoreError::Io(errno.into()))
    }

    /// Must be called with the directory lock held.
    fn check(&self, key: &str, expected: &Version) -> StoreResult<PathBuf> {
        let (path, current) = self.read(key)?;
        if version_of(&current) != *expected {
            return Err(StoreError::Conflict(key.to_string()));
        }

        Ok(path)
    }
}

fn version_of(content: &str) -> Version {
    Version::new(hex::encode(Blake2s256::digest(content.as_bytes())))
}

impl AddressStore for FileStore {
    fn get(&self, path: &str) -> StoreResult<Entry> {
        let (_, content) = self.read(path)?;
        Ok(Entry {
            path: path.to_string(),
            kind: EntryKind::File,
            version: version_of(&content),
            content,
        })
    }

    fn create(&self, path: &str, content: &str, message: &str) -> StoreResult<Version> {
        let target = self.resolve(path)?;
        let dir = target.parent().unwrap_or(Path::new("."));
        fs::create_dir_all(dir)?;

        let mut tmp = NamedTempFile::new_in(dir)?;
        tmp.write_all(content.as_bytes())?;
        match tmp.persist_noclobber(&target) {
            Ok(_) => {}
            Err(e) if e.error.kind() == ErrorKind::AlreadyExists => {
                return Err(StoreError::Conflict(path.to_string()))
            }
            Err(e) => return Err(e.error.into()),
        }

        log::trace!("create {}: {}", path, message);
        Ok(version_of(content))
    }

    fn update(
        &self,
        path: &str,
        content: &str,
        message: &str,
        expected: &Version,
    ) -> StoreResult<Version> {
        let _lock = self.lock(path)?;
        let target = self.check(path, expected)?;
        Self::write(&target, content)?;
        log::trace!("update {}: {}", path, message);
        Ok(version_of(content))
    }

    fn delete(&self, path: &str, message: &str, expected: &Version) -> StoreResult<()> {
        let _lock = self.lock(path)?;
        let target = self.check(path, expected)?;
        match fs::remove_file(&target) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(StoreError::NotFound(path.to_string()))
            }
            Err(e) => return Err(e.into()),
        }

        log::trace!("delete {}: {}", path, message);
        Ok(())
    }

    fn list(&self, dir: &str) -> StoreResult<Vec<Entry>> {
        let base = self.resolve(dir)?;
        let iter = match fs::read_dir(&base) {
            Ok(iter) => iter,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut entries = Vec::new();
        for item in iter {
            let item = item?;
            let name = match item.file_name().into_string() {
                Ok(name) if !name.starts_with('.') => name,
                _ => continue,
            };

            let key = crate::record::join(dir, &name);
            if item.file_type()?.is_dir() {
                entries.push(Entry {
                    path: key,
                    kind: EntryKind::Dir,
                    content: String::new(),
                    version: Version::new(""),
                });
                continue;
            }

            // removed between read_dir and here
            match self.get(&key) {
                Ok(entry) => entries.push(entry),
                Err(StoreError::NotFound(_)) => continue,
                Err(e) => return Err(e),
            }
        }

        entries.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(entries)
    }
}
