//! Committing directory trees into the store.
//!
//! A build writes its output into a staging directory that already lives in
//! the store directory under a name of the same length as its final name.
//! Paths the builder embeds in the output therefore only need a same-length
//! rewrite once the content hash is known.

use std::fs;
use std::path::{Path, PathBuf};

use tempfile::TempDir;
use tracing::{debug, instrument, warn};

use super::padding::canonical_store_prefix;
use super::{Store, StoreError, entry_name, validate_label};
use crate::consts::HASH_PREFIX_LEN;
use crate::util::fs::{remove_path, rewrite_tree};
use crate::util::hash::{ContentHash, hash_tree_normalized};

/// An uncommitted output directory. Dropping it removes the directory.
#[derive(Debug)]
pub struct Staging {
  dir: TempDir,
  label: String,
}

impl Staging {
  pub fn path(&self) -> &Path {
    self.dir.path()
  }

  /// The random part of the staging name, as long as a content hash prefix.
  fn placeholder(&self) -> String {
    self
      .dir
      .path()
      .file_name()
      .map(|n| n.to_string_lossy()[..HASH_PREFIX_LEN].to_string())
      .unwrap_or_default()
  }
}

/// A directory that made it into the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Committed {
  pub hash: ContentHash,
  pub name: String,
  pub path: PathBuf,
}

impl Store {
  /// Create a staging directory named `<random>-<label>` in the store directory.
  pub fn stage(&self, label: &str) -> Result<Staging, StoreError> {
    validate_label(label)?;
    let dir = tempfile::Builder::new()
      .prefix("")
      .rand_bytes(HASH_PREFIX_LEN)
      .suffix(&format!("-{label}"))
      .tempdir_in(self.store_dir())
      .map_err(StoreError::io("creating staging directory"))?;
    Ok(Staging {
      dir,
      label: label.to_string(),
    })
  }

  /// Hash a staged tree and move it to `<hash>-<label>`.
  ///
  /// The hash is computed as if self references were a fixed token and the
  /// local store prefix were the canonical one, so the same output built in
  /// two stores gets the same name. Those substitutions only feed the hash.
  /// On disk, references to the staging name are rewritten to the final
  /// name, which has the same length, and nothing else is touched. On a
  /// mismatch against `expected` the staging directory is removed and
  /// nothing is renamed.
  #[instrument(skip(self, staging), fields(label = %staging.label))]
  pub fn commit_directory(&self, staging: Staging, expected: Option<&str>) -> Result<Committed, StoreError> {
    let placeholder = staging.placeholder();
    let self_token = "0".repeat(HASH_PREFIX_LEN);
    let local = self.store_prefix();
    let canonical = canonical_store_prefix()?;
    let hash = hash_tree_normalized(
      staging.path(),
      &[
        (placeholder.as_bytes(), self_token.as_bytes()),
        (local.as_bytes(), canonical.as_bytes()),
      ],
    )
    .map_err(StoreError::io("hashing staged output"))?;

    if let Some(expected) = expected.filter(|e| !e.is_empty())
      && expected != hash.as_str()
    {
      return Err(StoreError::HashMismatch {
        expected: expected.to_string(),
        actual: hash.0,
      });
    }

    rewrite_tree(staging.path(), &placeholder, hash.store_name())
      .map_err(StoreError::io("rewriting self references"))?;

    let name = entry_name(&hash, Some(&staging.label));
    let path = self.join(&name);
    if self.contains(&name) {
      debug!(entry = %name, "identical output already committed");
      return Ok(Committed { hash, name, path });
    }

    let staged = staging.dir.keep();
    if let Err(e) = fs::rename(&staged, &path) {
      // lost a race against an identical commit
      if let Err(cleanup) = remove_path(&staged) {
        warn!(path = ?staged, error = %cleanup, "failed to remove staging directory");
      }
      if !self.contains(&name) {
        return Err(StoreError::io(format!("moving {name} into store"))(e));
      }
    }

    debug!(entry = %name, "committed directory");
    Ok(Committed { hash, name, path })
  }
}
