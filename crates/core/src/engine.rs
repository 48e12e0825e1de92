//! The engine facade: one handle wiring the repository driver, the key
//! material, the local cache and the tunables together.

use std::io;
use std::path::Path;

use magpie_crypto::{KeyRing, Keyfile};
use magpie_repo::{layout, Repo};

use crate::cache::{Db, SnapshotRow};
use crate::cancel::CancelToken;
use crate::config::RepoConfig;
use crate::error::{Error, Result};
use crate::gc::{self, GcStats};
use crate::object::SnapshotMeta;
use crate::restore::{self, RestoreStats};
use crate::scanner::{ScanStats, Scanner};
use crate::snapshot;
use crate::walker::{Backup, BackupStats};
use crate::Options;

pub struct Engine<R> {
    db: Db,
    repo: R,
    keys: KeyRing,
    opts: Options,
}

impl<R: Repo + Send + Sync> Engine<R> {
    /// Initialize a fresh repository: write `meta/config` and `meta/keys`,
    /// and open the local cache.
    ///
    /// Refuses to touch a repository that already has a config document.
    pub fn init(
        repo: R,
        keys: KeyRing,
        keyfile: &Keyfile,
        config: RepoConfig,
        cache_path: impl AsRef<Path>,
    ) -> Result<Self> {
        config.validate()?;
        match repo.get(layout::META_CONFIG) {
            Ok(_) => {
                return Err(Error::Config(
                    "repository is already initialized".into(),
                ))
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(Error::Storage(e)),
        }

        repo.put(layout::META_CONFIG, &config.to_bytes())?;
        repo.put(layout::META_KEYS, &keyfile.to_bytes())?;

        let db = Db::open(cache_path)?;
        Ok(Self {
            db,
            repo,
            keys,
            opts: Options::from_config(&config),
        })
    }

    /// Open an existing repository, validating its config against this build.
    pub fn open(repo: R, keys: KeyRing, cache_path: impl AsRef<Path>) -> Result<Self> {
        let config = Self::fetch_config(&repo)?;
        let db = Db::open(cache_path)?;
        Ok(Self {
            db,
            repo,
            keys,
            opts: Options::from_config(&config),
        })
    }

    /// The repository's config document.
    pub fn fetch_config(repo: &R) -> Result<RepoConfig> {
        let bytes = repo.get(layout::META_CONFIG).map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                Error::Config("repository is not initialized".into())
            } else {
                Error::Storage(e)
            }
        })?;
        RepoConfig::from_bytes(&bytes)
    }

    /// The key envelope stored in the repository, for clients starting from
    /// nothing but the repository and the password.
    pub fn fetch_keyfile(repo: &R) -> Result<Keyfile> {
        let bytes = repo.get(layout::META_KEYS).map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                Error::Config("repository has no key envelope".into())
            } else {
                Error::Storage(e)
            }
        })?;
        Ok(Keyfile::from_bytes(&bytes)?)
    }

    /// Register a backup set rooted at `path` under `name`.
    pub fn add_backup_set(&self, name: &str, path: &Path) -> Result<()> {
        self.db.ensure_backup_set(name, path).map(|_| ())
    }

    /// Detect changes under a backup set and mark them dirty.
    pub fn scan(&self, set_name: &str, cancel: &CancelToken) -> Result<ScanStats> {
        Scanner::new(&self.db, cancel).scan(set_name)
    }

    /// Upload everything dirty under `set_name` and commit the result as a
    /// snapshot named `snapshot_name`.
    pub fn backup(
        &self,
        set_name: &str,
        snapshot_name: &str,
        cancel: &CancelToken,
    ) -> Result<(SnapshotMeta, BackupStats)> {
        Backup::new(&self.db, &self.repo, &self.keys, &self.opts, cancel).run(set_name, snapshot_name)
    }

    /// All registered snapshots, oldest first.
    pub fn snapshots(&self) -> Result<Vec<SnapshotRow>> {
        snapshot::list(&self.db)
    }

    /// Drop a snapshot; its objects become eligible for the next [`Self::gc`].
    pub fn prune(&self, snapshot_name: &str) -> Result<SnapshotRow> {
        snapshot::remove(&self.db, &self.repo, snapshot_name)
    }

    /// Collect objects no longer reachable from any snapshot.
    pub fn gc(&self, cancel: &CancelToken) -> Result<GcStats> {
        gc::collect(&self.db, &self.repo, cancel)
    }

    /// Materialize a snapshot into an empty directory. Requires an unlocked
    /// keyring.
    pub fn restore(
        &self,
        snapshot_name: &str,
        target: &Path,
        cancel: &CancelToken,
    ) -> Result<RestoreStats> {
        restore::restore(&self.repo, &self.keys, snapshot_name, target, cancel)
    }

    /// Check the local cache's cross-table invariants.
    pub fn verify_cache(&self) -> Result<()> {
        self.db.check_invariants()
    }

    pub fn cache(&self) -> &Db {
        &self.db
    }

    pub fn keys(&self) -> &KeyRing {
        &self.keys
    }

    pub fn options(&self) -> &Options {
        &self.opts
    }

    pub fn options_mut(&mut self) -> &mut Options {
        &mut self.opts
    }
}
