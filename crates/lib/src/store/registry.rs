//! Config registry: which store entries each configuration location produced.
//!
//! Garbage collection treats every entry named in the registry as live.

use std::collections::BTreeSet;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::debug;

use super::{Store, StoreError};
use crate::consts::CONFIG_REGISTRY_DIR;
use crate::util::hash::hash_bytes;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryEntry {
  pub location: String,
  #[serde(default)]
  pub derivations: BTreeSet<String>,
}

impl Store {
  fn registry_path(&self, location: &str) -> PathBuf {
    let hash = hash_bytes(location.as_bytes());
    self
      .root()
      .join(CONFIG_REGISTRY_DIR)
      .join(format!("{}-metadata.toml", hash.store_name()))
  }

  /// Union `derivations` into the registry entry for `location`.
  ///
  /// The read-modify-write runs under the registry mutex and the new record
  /// replaces the old one with a rename.
  pub fn record_config_registry<I, S>(&self, location: &str, derivations: I) -> Result<RegistryEntry, StoreError>
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    let _guard = self.registry_lock.lock().unwrap_or_else(|e| e.into_inner());
    let path = self.registry_path(location);

    let mut entry = read_entry(&path)?.unwrap_or_default();
    entry.location = location.to_string();
    entry.derivations.extend(derivations.into_iter().map(Into::into));

    let serialized = toml::to_string(&entry).map_err(|e| StoreError::Registry {
      path: path.clone(),
      message: e.to_string(),
    })?;
    let mut temp = NamedTempFile::new_in(self.tmp_dir()).map_err(StoreError::io("creating registry temp file"))?;
    temp
      .write_all(serialized.as_bytes())
      .map_err(StoreError::io("writing registry entry"))?;
    temp
      .persist(&path)
      .map_err(|e| StoreError::io(format!("replacing {}", path.display()))(e.error))?;

    debug!(location, count = entry.derivations.len(), "recorded config registry entry");
    Ok(entry)
  }

  /// Every registry entry on disk.
  pub fn registry_entries(&self) -> Result<Vec<RegistryEntry>, StoreError> {
    let dir = self.root().join(CONFIG_REGISTRY_DIR);
    let mut entries = Vec::new();
    let listing = match fs::read_dir(&dir) {
      Ok(listing) => listing,
      Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(entries),
      Err(e) => return Err(StoreError::io("listing config registry")(e)),
    };

    for file in listing {
      let file = file.map_err(StoreError::io("listing config registry"))?;
      let path = file.path();
      if path.extension().is_some_and(|ext| ext == "toml")
        && let Some(entry) = read_entry(&path)?
      {
        entries.push(entry);
      }
    }
    entries.sort_by(|a, b| a.location.cmp(&b.location));
    Ok(entries)
  }
}

/// Missing and empty files both read as `None`.
fn read_entry(path: &Path) -> Result<Option<RegistryEntry>, StoreError> {
  let contents = match fs::read_to_string(path) {
    Ok(contents) => contents,
    Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
    Err(e) => return Err(StoreError::io(format!("reading {}", path.display()))(e)),
  };
  if contents.trim().is_empty() {
    return Ok(None);
  }
  toml::from_str(&contents).map(Some).map_err(|e| StoreError::Registry {
    path: path.to_path_buf(),
    message: e.to_string(),
  })
}
