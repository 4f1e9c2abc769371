//! Persistent state surviving between invocations.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io;

use camino::{Utf8Path, Utf8PathBuf};
use fs4::FileExt;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::Pkgbase;

pub const STORE_FILE: &str = "store.json";
pub const LOCK_FILE: &str = "store.lock";

/// The single value persisted across cycles.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct Store {
    /// VCS revision last fully processed; empty on the first run.
    #[serde(default)]
    pub last_commit: String,
    /// Packages whose most recent attempt did not succeed, mapped to the
    /// upstream version that attempt was for (None if no verdict existed,
    /// e.g. a recipe load error).
    #[serde(default)]
    pub failed: HashMap<Pkgbase, Option<String>>,
}

#[derive(Error, Debug)]
pub enum LoadStoreError {
    #[error("io error: {0:#}")]
    IoError(#[from] io::Error),
    #[error("json error: {0:#}")]
    JsonError(#[from] serde_json::Error),
}

#[derive(Error, Debug)]
pub enum SaveStoreError {
    #[error("io error: {0:#}")]
    IoError(#[from] io::Error),
    #[error("json error: {0:#}")]
    JsonError(#[from] serde_json::Error),
}

impl Store {
    pub fn load(path: &Utf8Path) -> Result<Self, LoadStoreError> {
        if !path.exists() {
            return Ok(Store::default());
        }
        let content = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Write atomically: a torn store would make the next cycle rebuild
    /// the world or forget failures.
    pub fn save(&self, path: &Utf8Path) -> Result<(), SaveStoreError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = Utf8PathBuf::from(format!("{path}.tmp"));
        fs::write(&tmp, serde_json::to_vec_pretty(self)?)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }
}

/// Exclusive lock serializing whole invocations against each other.
/// Held for the lifetime of the value; released by the OS on drop or
/// process death.
pub struct StoreLock {
    _file: File,
}

impl StoreLock {
    pub fn acquire(path: &Utf8Path) -> Result<Self, io::Error> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)?;
        file.try_lock_exclusive()?;
        Ok(StoreLock { _file: file })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_store_loads_as_default() {
        let tmp = tempfile::tempdir().unwrap();
        let path = Utf8Path::from_path(tmp.path()).unwrap().join(STORE_FILE);
        let store = Store::load(&path).unwrap();
        assert!(store.last_commit.is_empty());
        assert!(store.failed.is_empty());
    }

    #[test]
    fn store_round_trips() {
        let tmp = tempfile::tempdir().unwrap();
        let path = Utf8Path::from_path(tmp.path()).unwrap().join(STORE_FILE);

        let mut store = Store::default();
        store.last_commit = "deadbeef".to_string();
        store.failed.insert(Pkgbase::from("foo"), Some("1.2".to_string()));
        store.failed.insert(Pkgbase::from("bar"), None);
        store.save(&path).unwrap();

        let loaded = Store::load(&path).unwrap();
        assert_eq!(loaded.last_commit, "deadbeef");
        assert_eq!(loaded.failed[&Pkgbase::from("foo")], Some("1.2".to_string()));
        assert_eq!(loaded.failed[&Pkgbase::from("bar")], None);
    }

    #[test]
    fn second_lock_on_the_same_path_fails() {
        let tmp = tempfile::tempdir().unwrap();
        let path = Utf8Path::from_path(tmp.path()).unwrap().join(LOCK_FILE);
        let _held = StoreLock::acquire(&path).unwrap();
        assert!(StoreLock::acquire(&path).is_err());
    }
}
