//! On-disk cache of compiled configuration modules, keyed by source hash.

use std::fs;
use std::io::{self, Write};
use std::path::PathBuf;

use tempfile::NamedTempFile;
use tracing::trace;

use super::StoreError;
use crate::util::hash::ContentHash;

#[derive(Debug, Clone)]
pub struct ModuleCache {
  dir: PathBuf,
}

impl ModuleCache {
  pub fn new(dir: PathBuf) -> Self {
    Self { dir }
  }

  fn path(&self, source: &ContentHash) -> PathBuf {
    self.dir.join(format!("{}.luac", source.as_str()))
  }

  /// Compiled bytes for a source hash, if cached.
  pub fn get(&self, source: &ContentHash) -> Option<Vec<u8>> {
    match fs::read(self.path(source)) {
      Ok(bytes) => {
        trace!(source = %source, "module cache hit");
        Some(bytes)
      }
      Err(_) => None,
    }
  }

  pub fn put(&self, source: &ContentHash, compiled: &[u8]) -> Result<(), StoreError> {
    let mut temp = NamedTempFile::new_in(&self.dir).map_err(StoreError::io("creating module cache file"))?;
    temp.write_all(compiled).map_err(StoreError::io("writing module cache file"))?;
    temp
      .persist(self.path(source))
      .map_err(|e| StoreError::io("persisting module cache file")(e.error))?;
    Ok(())
  }

  /// Drop a cache entry that failed to load.
  pub fn evict(&self, source: &ContentHash) -> io::Result<()> {
    match fs::remove_file(self.path(source)) {
      Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
      _ => Ok(()),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::util::hash::hash_bytes;
  use tempfile::TempDir;

  #[test]
  fn put_then_get() {
    let temp = TempDir::new().unwrap();
    let cache = ModuleCache::new(temp.path().to_path_buf());
    let key = hash_bytes(b"return 1");

    assert!(cache.get(&key).is_none());
    cache.put(&key, b"\x1bLua").unwrap();
    assert_eq!(cache.get(&key).unwrap(), b"\x1bLua");

    cache.evict(&key).unwrap();
    assert!(cache.get(&key).is_none());
    cache.evict(&key).unwrap();
  }
}
