//! Hashing utilities for content-addressed storage and verification.
//!
//! This module provides:
//! - `Hasher`: a streaming SHA-256 writer used wherever identity comes from bytes
//! - `ContentHash`: a full 64-character hash, with a short form for store names
//! - `hash_tree()`: deterministic hashing of a file or directory tree
//! - `hash_file()` and `hash_bytes()`

use std::fs;
use std::io::{self, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use walkdir::WalkDir;

use crate::consts::HASH_PREFIX_LEN;
use crate::util::fs::{is_executable, replace_all};

pub type HashError = serde_json::Error;

/// Streaming SHA-256 digest.
///
/// Implements [`Write`] so it can sit on the far side of `io::copy` or a tee.
#[derive(Default)]
pub struct Hasher(Sha256);

impl Hasher {
  pub fn new() -> Self {
    Self(Sha256::new())
  }

  pub fn update(&mut self, data: &[u8]) {
    self.0.update(data);
  }

  pub fn finish(self) -> ContentHash {
    ContentHash(hex::encode(self.0.finalize()))
  }
}

impl Write for Hasher {
  fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
    self.0.update(buf);
    Ok(buf.len())
  }

  fn flush(&mut self) -> io::Result<()> {
    Ok(())
  }
}

/// A full 64-character SHA-256 hash, lowercase hex.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ContentHash(pub String);

impl ContentHash {
  /// The truncated form used to name store entries.
  pub fn store_name(&self) -> &str {
    &self.0[..HASH_PREFIX_LEN.min(self.0.len())]
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }
}

impl std::fmt::Display for ContentHash {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}", self.0)
  }
}

/// Identity hash of a serializable description, computed over its JSON form.
pub trait Hashable: Serialize {
  fn content_hash(&self) -> Result<ContentHash, HashError> {
    let serialized = serde_json::to_vec(self)?;
    Ok(hash_bytes(&serialized))
  }
}

/// Compute a deterministic hash of a file or directory tree.
///
/// The hash covers directory structure, file contents, the executable bit and
/// symlink targets. Timestamps and ownership are ignored. Entries are visited
/// in file-name order.
pub fn hash_tree(path: &Path) -> io::Result<ContentHash> {
  hash_tree_normalized(path, &[])
}

/// Like [`hash_tree`], but each `(from, to)` replacement is applied to file
/// contents and symlink targets before they are hashed. The files themselves
/// are left untouched.
pub fn hash_tree_normalized(path: &Path, replacements: &[(&[u8], &[u8])]) -> io::Result<ContentHash> {
  let mut hasher = Hasher::new();

  for entry in WalkDir::new(path).sort_by_file_name() {
    let entry = entry?;
    let entry_path = entry.path();
    let rel_path = entry_path
      .strip_prefix(path)
      .unwrap_or(entry_path)
      .to_string_lossy()
      .into_owned();

    let file_type = entry.file_type();
    if file_type.is_dir() {
      if entry.depth() > 0 {
        writeln!(hasher, "D {rel_path}")?;
      }
    } else if file_type.is_file() {
      let exec = if is_executable(&entry.metadata()?) { "x" } else { "-" };
      if replacements.is_empty() {
        let mut file = fs::File::open(entry_path)?;
        writeln!(hasher, "F {rel_path} {exec} {}", entry.metadata()?.len())?;
        io::copy(&mut file, &mut hasher)?;
      } else {
        let mut content = fs::read(entry_path)?;
        for (from, to) in replacements {
          if let Some(replaced) = replace_all(&content, from, to) {
            content = replaced;
          }
        }
        writeln!(hasher, "F {rel_path} {exec} {}", content.len())?;
        hasher.update(&content);
      }
    } else if file_type.is_symlink() {
      let mut target = fs::read_link(entry_path)?.to_string_lossy().into_owned().into_bytes();
      for (from, to) in replacements {
        if let Some(replaced) = replace_all(&target, from, to) {
          target = replaced;
        }
      }
      write!(hasher, "L {rel_path} ")?;
      hasher.update(&target);
      hasher.update(b"\n");
    }
  }

  Ok(hasher.finish())
}

/// Hash a file's contents.
pub fn hash_file(path: &Path) -> io::Result<ContentHash> {
  let mut file = fs::File::open(path)?;
  let mut hasher = Hasher::new();
  io::copy(&mut file, &mut hasher)?;
  Ok(hasher.finish())
}

/// Hash arbitrary bytes.
pub fn hash_bytes(data: &[u8]) -> ContentHash {
  let mut hasher = Hasher::new();
  hasher.update(data);
  hasher.finish()
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::fs;
  use tempfile::tempdir;

  #[test]
  fn hasher_matches_known_digest() {
    let hash = hash_bytes(b"hello world");
    assert_eq!(
      hash.as_str(),
      "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
    );
    assert_eq!(hash.store_name(), "b94d27b9934d3e08a52e52d7da7dabfa");
  }

  #[test]
  fn streaming_equals_one_shot() {
    let mut hasher = Hasher::new();
    hasher.write_all(b"hello ").unwrap();
    hasher.write_all(b"world").unwrap();
    assert_eq!(hasher.finish(), hash_bytes(b"hello world"));
  }

  #[test]
  fn hash_is_deterministic() {
    let temp = tempdir().unwrap();
    fs::write(temp.path().join("a.txt"), "content a").unwrap();
    fs::write(temp.path().join("b.txt"), "content b").unwrap();

    let hash1 = hash_tree(temp.path()).unwrap();
    let hash2 = hash_tree(temp.path()).unwrap();

    assert_eq!(hash1, hash2);
  }

  #[test]
  fn hash_ignores_location_of_tree() {
    let temp1 = tempdir().unwrap();
    let temp2 = tempdir().unwrap();
    for dir in [temp1.path(), temp2.path()] {
      fs::create_dir(dir.join("sub")).unwrap();
      fs::write(dir.join("sub/file.txt"), "nested").unwrap();
    }

    assert_eq!(hash_tree(temp1.path()).unwrap(), hash_tree(temp2.path()).unwrap());
  }

  #[test]
  fn hash_changes_with_content() {
    let temp = tempdir().unwrap();
    fs::write(temp.path().join("file.txt"), "original").unwrap();
    let hash1 = hash_tree(temp.path()).unwrap();

    fs::write(temp.path().join("file.txt"), "modified").unwrap();
    let hash2 = hash_tree(temp.path()).unwrap();

    assert_ne!(hash1, hash2);
  }

  #[test]
  fn same_content_different_structure_different_hash() {
    let temp1 = tempdir().unwrap();
    fs::write(temp1.path().join("file.txt"), "content").unwrap();

    let temp2 = tempdir().unwrap();
    fs::create_dir(temp2.path().join("subdir")).unwrap();
    fs::write(temp2.path().join("subdir/file.txt"), "content").unwrap();

    assert_ne!(hash_tree(temp1.path()).unwrap(), hash_tree(temp2.path()).unwrap());
  }

  #[cfg(unix)]
  #[test]
  fn hash_includes_executable_bit() {
    use std::os::unix::fs::PermissionsExt;

    let temp = tempdir().unwrap();
    let file = temp.path().join("run.sh");
    fs::write(&file, "#!/bin/sh\n").unwrap();
    let before = hash_tree(temp.path()).unwrap();

    fs::set_permissions(&file, fs::Permissions::from_mode(0o755)).unwrap();
    let after = hash_tree(temp.path()).unwrap();

    assert_ne!(before, after);
  }

  #[test]
  fn normalized_hash_applies_replacements() {
    let temp1 = tempdir().unwrap();
    fs::write(temp1.path().join("ref"), "/first/path/bin").unwrap();
    let temp2 = tempdir().unwrap();
    fs::write(temp2.path().join("ref"), "/other/path/bin").unwrap();

    let h1 = hash_tree_normalized(temp1.path(), &[(b"/first", b"/canon")]).unwrap();
    let h2 = hash_tree_normalized(temp2.path(), &[(b"/other", b"/canon")]).unwrap();
    assert_eq!(h1, h2);

    // the files on disk are untouched
    assert_eq!(fs::read_to_string(temp1.path().join("ref")).unwrap(), "/first/path/bin");
  }

  #[test]
  fn single_file_tree_hashes() {
    let temp = tempdir().unwrap();
    let file = temp.path().join("only");
    fs::write(&file, "data").unwrap();

    assert_eq!(hash_tree(&file).unwrap(), hash_tree(&file).unwrap());
    assert_eq!(hash_file(&file).unwrap(), hash_bytes(b"data"));
  }
}
