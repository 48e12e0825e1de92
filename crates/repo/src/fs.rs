use std::fs::{self, File};
use std::io::{self, Read as _, Write as _};
use std::path::{Path, PathBuf};

use log::{debug, warn};
use tempfile::NamedTempFile;

use super::Repo;

/// A repository stored as plain files in a local directory.
///
/// Each key maps to the file `<root>/<key>`; the key space (see
/// [`crate::layout`]) is flat enough that no further sharding is applied.
/// Writes go through a temporary file in the same directory and are persisted
/// with a rename, so a crashed put never leaves a torn object behind.
#[derive(Clone, Debug)]
pub struct Fs {
    root: PathBuf,
}

impl Fs {
    /// Open (creating if necessary) the repository rooted at `root`.
    pub fn create(root: impl Into<PathBuf>) -> io::Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    /// Open an existing repository rooted at `root`.
    ///
    /// Returns [`io::ErrorKind::NotFound`] if `root` is not a directory.
    pub fn open(root: impl Into<PathBuf>) -> io::Result<Self> {
        let root = root.into();
        if !root.is_dir() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no repository at {}", root.display()),
            ));
        }
        Ok(Self { root })
    }

    /// The directory this repository lives in.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn key_path(&self, key: &str) -> io::Result<PathBuf> {
        let (dir, name) = split_key(key)?;
        Ok(self.root.join(dir).join(name))
    }
}

/// Split `key` into its directory and file components, rejecting anything
/// that could escape the repository root.
fn split_key(key: &str) -> io::Result<(&str, &str)> {
    let invalid = || {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("invalid repository key: {key:?}"),
        )
    };
    let (dir, name) = key.split_once('/').ok_or_else(invalid)?;
    if dir.is_empty()
        || name.is_empty()
        || name.contains('/')
        || dir == ".."
        || name == ".."
        || dir == "."
        || name == "."
    {
        return Err(invalid());
    }
    Ok((dir, name))
}

impl Repo for Fs {
    type List = List;

    fn put(&self, key: &str, bytes: &[u8]) -> io::Result<()> {
        let path = self.key_path(key)?;
        let dir = path.parent().expect("key paths always have a parent");
        fs::create_dir_all(dir)?;

        let mut tmp = NamedTempFile::new_in(dir)?;
        tmp.write_all(bytes)?;
        tmp.as_file().sync_data()?;
        tmp.persist(&path)?;

        debug!("put {key} ({} bytes)", bytes.len());
        Ok(())
    }

    fn get(&self, key: &str) -> io::Result<Vec<u8>> {
        let mut file = File::open(self.key_path(key)?)?;
        let mut buf = Vec::with_capacity(file.metadata().map(|m| m.len() as usize).unwrap_or(0));
        file.read_to_end(&mut buf)?;
        Ok(buf)
    }

    fn delete(&self, key: &str) -> io::Result<()> {
        match fs::remove_file(self.key_path(key)?) {
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            res => res,
        }
    }

    fn list(&self, prefix: &str) -> io::Result<Self::List> {
        // Keys are `<dir>/<name>`, so a useful prefix is either a whole
        // directory (`objects/`) or a directory plus a name prefix.
        let (dir, name_prefix) = match prefix.split_once('/') {
            Some((dir, rest)) => (dir, rest),
            None => (prefix, ""),
        };

        let inner = match fs::read_dir(self.root.join(dir)) {
            Ok(rd) => Some(rd),
            Err(e) if e.kind() == io::ErrorKind::NotFound => None,
            Err(e) => return Err(e),
        };

        Ok(List {
            dir: dir.to_owned(),
            name_prefix: name_prefix.to_owned(),
            inner,
        })
    }
}

/// Lazy key enumeration over one directory of an [`Fs`] repository.
pub struct List {
    dir: String,
    name_prefix: String,
    inner: Option<fs::ReadDir>,
}

impl Iterator for List {
    type Item = io::Result<String>;

    fn next(&mut self) -> Option<Self::Item> {
        let rd = self.inner.as_mut()?;
        loop {
            let entry = match rd.next()? {
                Ok(entry) => entry,
                Err(e) => return Some(Err(e)),
            };
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                warn!("skipping non-UTF-8 entry in {}", self.dir);
                continue;
            };
            if !name.starts_with(&self.name_prefix) {
                continue;
            }
            match entry.file_type() {
                Ok(ft) if ft.is_file() => return Some(Ok(format!("{}/{}", self.dir, name))),
                Ok(_) => continue,
                Err(e) => return Some(Err(e)),
            }
        }
    }
}
