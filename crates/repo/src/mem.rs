//! An in-memory repository for testing.

use std::collections::BTreeMap;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use super::Repo;

type SharedLock<T> = Arc<RwLock<T>>;

/// Counters of the operations a [`Memory`] repository has served.
///
/// Tests assert on these to prove deduplication claims ("re-running backup
/// uploads zero new objects") without inspecting the engine's internals.
#[derive(Debug, Default)]
pub struct Counters {
    puts: AtomicUsize,
    gets: AtomicUsize,
    deletes: AtomicUsize,
}

/// A repository backed by a [`BTreeMap`].
///
/// Note that this is not a faithful model of remote storage: the map is
/// protected by a lock, so torn reads and partial writes cannot occur. Tests
/// that need failure behavior wrap [`Memory`] in a fault-injecting [`Repo`]
/// decorator instead.
#[derive(Clone, Debug, Default)]
pub struct Memory {
    map: SharedLock<BTreeMap<String, Vec<u8>>>,
    counters: Arc<Counters>,
}

impl Memory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys currently stored.
    pub fn len(&self) -> usize {
        self.map.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, key: &str) -> bool {
        self.map.read().unwrap().contains_key(key)
    }

    /// Total number of `put` calls served so far.
    pub fn puts(&self) -> usize {
        self.counters.puts.load(Ordering::Relaxed)
    }

    /// Total number of `get` calls served so far.
    pub fn gets(&self) -> usize {
        self.counters.gets.load(Ordering::Relaxed)
    }

    /// Total number of `delete` calls served so far.
    pub fn deletes(&self) -> usize {
        self.counters.deletes.load(Ordering::Relaxed)
    }

    /// All stored keys, for test assertions.
    pub fn keys(&self) -> Vec<String> {
        self.map.read().unwrap().keys().cloned().collect()
    }

    /// Overwrite the value stored under `key`, bypassing the counters.
    ///
    /// Intended for tests which deliberately corrupt stored objects.
    pub fn corrupt(&self, key: &str, f: impl FnOnce(&mut Vec<u8>)) {
        let mut map = self.map.write().unwrap();
        let buf = map.get_mut(key).expect("corrupting a key that exists");
        f(buf);
    }
}

impl Repo for Memory {
    type List = std::vec::IntoIter<io::Result<String>>;

    fn put(&self, key: &str, bytes: &[u8]) -> io::Result<()> {
        self.counters.puts.fetch_add(1, Ordering::Relaxed);
        self.map
            .write()
            .unwrap()
            .insert(key.to_owned(), bytes.to_vec());
        Ok(())
    }

    fn get(&self, key: &str) -> io::Result<Vec<u8>> {
        self.counters.gets.fetch_add(1, Ordering::Relaxed);
        self.map.read().unwrap().get(key).cloned().ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, format!("no such key: {key}"))
        })
    }

    fn delete(&self, key: &str) -> io::Result<()> {
        self.counters.deletes.fetch_add(1, Ordering::Relaxed);
        self.map.write().unwrap().remove(key);
        Ok(())
    }

    fn list(&self, prefix: &str) -> io::Result<Self::List> {
        let keys = self
            .map
            .read()
            .unwrap()
            .range(prefix.to_owned()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| Ok(k.clone()))
            .collect::<Vec<_>>();
        Ok(keys.into_iter())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_track_operations() {
        let repo = Memory::new();
        repo.put("objects/aa", b"1").unwrap();
        repo.put("objects/aa", b"1").unwrap();
        let _ = repo.get("objects/aa").unwrap();
        repo.delete("objects/aa").unwrap();

        assert_eq!((repo.puts(), repo.gets(), repo.deletes()), (2, 1, 1));
        assert!(repo.is_empty());
    }

    #[test]
    fn list_is_prefix_scoped() {
        let repo = Memory::new();
        repo.put("objects/aa", b"1").unwrap();
        repo.put("snapshots/s1", b"2").unwrap();

        let keys: Vec<_> = repo.list("objects/").unwrap().map(Result::unwrap).collect();
        assert_eq!(keys, ["objects/aa"]);
    }
}
