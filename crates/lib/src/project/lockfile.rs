//! Lock file management for pinned external sources.
//!
//! The lock file (`bramble.lock`) lives next to `bramble.toml` and maps an
//! external source identifier (usually a URL) to the SHA-256 of its content.
//! Entries are append-only: a source that is already pinned can never be
//! silently re-pinned to another hash.
//!
//! # Lock File Format
//!
//! ```toml
//! [url_hashes]
//! "https://example.com/busybox.tar.gz" = "2ae410370b8e9113968ffa6e52f38eea7f17df5f436bd6a69cc41c6ca01541a1"
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockFile {
  #[serde(default)]
  pub url_hashes: BTreeMap<String, String>,
}

#[derive(Debug, Error)]
pub enum LockFileError {
  #[error("failed to read lock file {path}: {source}")]
  Read {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("failed to write lock file {path}: {source}")]
  Write {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("failed to parse lock file {path}: {message}")]
  Parse { path: PathBuf, message: String },

  #[error("failed to serialize lock file: {0}")]
  Serialize(String),

  #[error("found existing hash for {source_id:?} with value {existing:?} not {requested:?}")]
  Conflict {
    source_id: String,
    existing: String,
    requested: String,
  },
}

impl LockFile {
  /// Load a lock file. A missing file loads as empty.
  pub fn load(path: &Path) -> Result<Self, LockFileError> {
    let contents = match fs::read_to_string(path) {
      Ok(contents) => contents,
      Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Self::default()),
      Err(source) => {
        return Err(LockFileError::Read {
          path: path.to_path_buf(),
          source,
        });
      }
    };

    toml::from_str(&contents).map_err(|e| LockFileError::Parse {
      path: path.to_path_buf(),
      message: e.to_string(),
    })
  }

  /// Replace the file at `path` with this lock file in one rename.
  pub fn save(&self, path: &Path) -> Result<(), LockFileError> {
    let write_err = |source| LockFileError::Write {
      path: path.to_path_buf(),
      source,
    };
    let serialized = toml::to_string(self).map_err(|e| LockFileError::Serialize(e.to_string()))?;
    let dir = path.parent().unwrap_or(Path::new("."));
    let mut temp = NamedTempFile::new_in(dir).map_err(write_err)?;
    temp.write_all(serialized.as_bytes()).map_err(write_err)?;
    temp.persist(path).map_err(|e| write_err(e.error))?;
    Ok(())
  }

  pub fn get(&self, source_id: &str) -> Option<&str> {
    self.url_hashes.get(source_id).map(String::as_str)
  }
}

/// Serializes read-modify-write cycles on one project's lock file.
#[derive(Debug)]
pub struct LockFileManager {
  path: PathBuf,
  guard: Mutex<()>,
}

impl LockFileManager {
  pub fn new(path: PathBuf) -> Self {
    Self {
      path,
      guard: Mutex::new(()),
    }
  }

  pub fn path(&self) -> &Path {
    &self.path
  }

  /// The pinned hash for `source_id`, if any.
  pub fn get(&self, source_id: &str) -> Result<Option<String>, LockFileError> {
    let _guard = self.guard.lock().unwrap_or_else(|e| e.into_inner());
    Ok(LockFile::load(&self.path)?.get(source_id).map(str::to_string))
  }

  /// Pin `source_id` to `hash`.
  ///
  /// Confirming an existing pin is a no-op. Pinning to a different hash fails
  /// with [`LockFileError::Conflict`] and leaves the file untouched.
  pub fn pin(&self, source_id: &str, hash: &str) -> Result<(), LockFileError> {
    let _guard = self.guard.lock().unwrap_or_else(|e| e.into_inner());
    let mut lock = LockFile::load(&self.path)?;

    match lock.get(source_id) {
      Some(existing) if existing == hash => return Ok(()),
      Some(existing) => {
        return Err(LockFileError::Conflict {
          source_id: source_id.to_string(),
          existing: existing.to_string(),
          requested: hash.to_string(),
        });
      }
      None => {}
    }

    lock.url_hashes.insert(source_id.to_string(), hash.to_string());
    lock.save(&self.path)?;
    info!(source = source_id, hash, "pinned source in lock file");
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::Arc;
  use tempfile::TempDir;

  fn manager() -> (TempDir, LockFileManager) {
    let temp = TempDir::new().unwrap();
    let manager = LockFileManager::new(temp.path().join("bramble.lock"));
    (temp, manager)
  }

  #[test]
  fn missing_file_loads_empty() {
    let temp = TempDir::new().unwrap();
    let lock = LockFile::load(&temp.path().join("bramble.lock")).unwrap();
    assert!(lock.url_hashes.is_empty());
  }

  #[test]
  fn pin_writes_entry() {
    let (_temp, manager) = manager();
    manager.pin("https://example.com/a.tar.gz", "abc").unwrap();

    assert_eq!(manager.get("https://example.com/a.tar.gz").unwrap().as_deref(), Some("abc"));
    let contents = fs::read_to_string(manager.path()).unwrap();
    assert!(contents.contains("[url_hashes]"));
    assert!(contents.contains("\"https://example.com/a.tar.gz\" = \"abc\""));
  }

  #[test]
  fn conflicting_pin_fails_and_keeps_original() {
    let (_temp, manager) = manager();
    manager.pin("X", "a").unwrap();

    let err = manager.pin("X", "b").unwrap_err();
    assert!(matches!(err, LockFileError::Conflict { ref existing, .. } if existing == "a"));

    let lock = LockFile::load(manager.path()).unwrap();
    assert_eq!(lock.url_hashes.len(), 1);
    assert_eq!(lock.get("X"), Some("a"));
  }

  #[test]
  fn confirming_a_pin_is_allowed() {
    let (_temp, manager) = manager();
    manager.pin("X", "a").unwrap();
    manager.pin("X", "a").unwrap();
    assert_eq!(manager.get("X").unwrap().as_deref(), Some("a"));
  }

  #[test]
  fn invalid_toml_is_an_error() {
    let (_temp, manager) = manager();
    fs::write(manager.path(), "url_hashes = [").unwrap();
    assert!(matches!(manager.pin("X", "a"), Err(LockFileError::Parse { .. })));
  }

  #[test]
  fn concurrent_pins_are_all_kept() {
    let (_temp, manager) = manager();
    let manager = Arc::new(manager);

    let handles: Vec<_> = (0..8)
      .map(|i| {
        let manager = Arc::clone(&manager);
        std::thread::spawn(move || manager.pin(&format!("source-{i}"), &format!("hash-{i}")).unwrap())
      })
      .collect();
    for handle in handles {
      handle.join().unwrap();
    }

    assert_eq!(LockFile::load(manager.path()).unwrap().url_hashes.len(), 8);
  }
}
