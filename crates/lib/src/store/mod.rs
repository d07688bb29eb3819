//! The content-addressed store.
//!
//! # Layout
//!
//! ```text
//! <root>/
//! ├── store -> ./bramble_store_padding/...   # stable symlink to the padded directory
//! ├── bramble_store_padding/.../             # store directory, prefix length is fixed
//! │   ├── <hash>-<label>                     # committed content
//! │   └── <identity>-<name>.drv              # derivation records
//! ├── tmp/                                   # staging for atomic writes
//! └── var/
//!     ├── config-registry/<hash>-metadata.toml
//!     └── star-cache/<hash>.luac
//! ```
//!
//! Entries are named after the SHA-256 of their content, so writes of
//! distinct content never collide and writes of identical content produce
//! byte-identical results. Renames into the store directory are atomic.

mod commit;
mod paths;
pub mod lock;
pub mod module_cache;
pub mod padding;
pub mod registry;

use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{debug, info, instrument};

pub use commit::{Committed, Staging};
pub use module_cache::ModuleCache;
pub use registry::RegistryEntry;

use crate::consts::{
  CONFIG_REGISTRY_DIR, MODULE_CACHE_DIR, PADDING_TARGET_LEN, STORE_LINK_NAME, TMP_DIR, VAR_DIR,
};
use crate::util::fs::{copy_tree, symlink};
use crate::util::hash::{ContentHash, Hasher, hash_tree_normalized};
use paths::clean;

#[derive(Debug, Error)]
pub enum StoreError {
  #[error("could not determine the store location: set BRAMBLE_PATH or HOME")]
  NoRoot,

  #[error("store path {0} must be absolute")]
  RelativeRoot(PathBuf),

  #[error("store location {parent:?} is too long to pad to {target} characters")]
  PathTooLong { parent: String, target: usize },

  #[error("calculated store path {0} doesn't exist, did the location change?")]
  StoreDoesNotExist(PathBuf),

  #[error("hash mismatch: expected {expected}, got {actual}")]
  HashMismatch { expected: String, actual: String },

  #[error("invalid store label {0:?}")]
  InvalidLabel(String),

  #[error("invalid registry entry {path}: {message}")]
  Registry { path: PathBuf, message: String },

  #[error("{context}: {source}")]
  Io {
    context: String,
    #[source]
    source: io::Error,
  },
}

impl StoreError {
  pub(crate) fn io(context: impl Into<String>) -> impl FnOnce(io::Error) -> StoreError {
    let context = context.into();
    move |source| StoreError::Io { context, source }
  }
}

/// Handle to an initialized store.
#[derive(Debug)]
pub struct Store {
  root: PathBuf,
  store_dir: PathBuf,
  registry_lock: Mutex<()>,
}

impl Store {
  /// Open the store at `BRAMBLE_PATH`, or `$HOME/bramble` when unset.
  pub fn initialize() -> Result<Self, StoreError> {
    let root = paths::store_root().ok_or(StoreError::NoRoot)?;
    Self::open(&root)
  }

  /// Open (creating on first use) the store rooted at `root`.
  #[instrument(skip_all, fields(root = %root.display()))]
  pub fn open(root: &Path) -> Result<Self, StoreError> {
    let root = clean(root);
    if !root.is_absolute() {
      return Err(StoreError::RelativeRoot(root));
    }

    let parent = root.to_string_lossy().into_owned();
    let padding = padding::padded_directory_name(&parent, PADDING_TARGET_LEN)?;
    let store_dir = PathBuf::from(format!("{parent}{padding}"));

    if !root.exists() {
      info!("store root doesn't exist, creating");
      fs::create_dir_all(&root).map_err(StoreError::io(format!("creating store root {}", root.display())))?;
    }

    // The link is only made alongside the padded directory. A root that was
    // moved keeps its old link and fails the existence check below.
    let link = root.join(STORE_LINK_NAME);
    if fs::symlink_metadata(&link).is_err() {
      fs::create_dir_all(&store_dir).map_err(StoreError::io("creating store directory"))?;
      symlink(Path::new(&format!(".{padding}")), &link).map_err(StoreError::io("linking store directory"))?;
      debug!(store = %store_dir.display(), "created store directory");
    }

    for dir in [TMP_DIR, VAR_DIR, CONFIG_REGISTRY_DIR, MODULE_CACHE_DIR] {
      let path = root.join(dir);
      if !path.exists() {
        fs::create_dir(&path).map_err(StoreError::io(format!("creating {}", path.display())))?;
      }
    }

    if !store_dir.is_dir() {
      return Err(StoreError::StoreDoesNotExist(store_dir));
    }

    Ok(Self {
      root,
      store_dir,
      registry_lock: Mutex::new(()),
    })
  }

  pub fn root(&self) -> &Path {
    &self.root
  }

  /// The padded directory holding committed entries.
  pub fn store_dir(&self) -> &Path {
    &self.store_dir
  }

  /// The store directory with its trailing separator. Always exactly
  /// `PADDING_TARGET_LEN` characters.
  pub fn store_prefix(&self) -> String {
    format!("{}/", self.store_dir.display())
  }

  /// Digest of every committed entry, with this store's prefix read as the
  /// canonical one. Two stores holding the same builds agree on it wherever
  /// they are mounted.
  pub fn content_digest(&self) -> Result<ContentHash, StoreError> {
    let local = self.store_prefix();
    let canonical = padding::canonical_store_prefix()?;
    hash_tree_normalized(&self.store_dir, &[(local.as_bytes(), canonical.as_bytes())])
      .map_err(StoreError::io("hashing store contents"))
  }

  pub fn tmp_dir(&self) -> PathBuf {
    self.root.join(TMP_DIR)
  }

  /// Absolute path of a store entry.
  pub fn join(&self, name: &str) -> PathBuf {
    self.store_dir.join(name)
  }

  pub fn contains(&self, name: &str) -> bool {
    fs::symlink_metadata(self.join(name)).is_ok()
  }

  pub fn module_cache(&self) -> ModuleCache {
    ModuleCache::new(self.root.join(MODULE_CACHE_DIR))
  }

  /// Names of every entry in the store directory.
  pub fn entries(&self) -> Result<Vec<String>, StoreError> {
    let mut names = Vec::new();
    let dir = fs::read_dir(&self.store_dir).map_err(StoreError::io("listing store directory"))?;
    for entry in dir {
      let entry = entry.map_err(StoreError::io("listing store directory"))?;
      names.push(entry.file_name().to_string_lossy().into_owned());
    }
    names.sort();
    Ok(names)
  }

  /// Stream `source` into the store.
  ///
  /// The bytes are hashed while they are copied into a temporary file under
  /// `tmp/`. When `expected` is given and does not match the SHA-256 of the
  /// content, the temporary file is discarded and nothing reaches the store.
  /// Otherwise the file is renamed to `<hash>[-<label>]`.
  #[instrument(skip(self, source))]
  pub fn write_content(
    &self,
    mut source: impl Read,
    label: Option<&str>,
    expected: Option<&str>,
  ) -> Result<(ContentHash, PathBuf), StoreError> {
    if let Some(label) = label {
      validate_label(label)?;
    }

    let mut temp = NamedTempFile::new_in(self.tmp_dir()).map_err(StoreError::io("creating a temporary store file"))?;
    let mut hasher = Hasher::new();
    let mut buffer = [0u8; 8192];
    loop {
      let read = source
        .read(&mut buffer)
        .map_err(StoreError::io("reading content for the store"))?;
      if read == 0 {
        break;
      }
      hasher.update(&buffer[..read]);
      temp
        .write_all(&buffer[..read])
        .map_err(StoreError::io("writing to the temporary store file"))?;
    }
    let hash = hasher.finish();

    if let Some(expected) = expected.filter(|e| !e.is_empty())
      && expected != hash.as_str()
    {
      return Err(StoreError::HashMismatch {
        expected: expected.to_string(),
        actual: hash.0,
      });
    }

    set_entry_permissions(temp.as_file()).map_err(StoreError::io("setting store file permissions"))?;
    let name = entry_name(&hash, label);
    let path = self.join(&name);
    temp
      .persist(&path)
      .map_err(|e| StoreError::io("moving file into store")(e.error))?;

    debug!(entry = %name, "wrote content");
    Ok((hash, path))
  }

  /// Import a local file or directory as a store entry and return its name.
  pub fn add_path(&self, path: &Path, label: &str) -> Result<String, StoreError> {
    let meta = fs::metadata(path).map_err(StoreError::io(format!("reading {}", path.display())))?;
    if meta.is_file() {
      let file = fs::File::open(path).map_err(StoreError::io(format!("opening {}", path.display())))?;
      let (hash, _) = self.write_content(file, Some(label), None)?;
      return Ok(entry_name(&hash, Some(label)));
    }

    let staging = self.stage(label)?;
    let copy_root = staging.path().to_path_buf();
    // the staging directory exists already, copy its children in
    for entry in fs::read_dir(path).map_err(StoreError::io(format!("reading {}", path.display())))? {
      let entry = entry.map_err(StoreError::io(format!("reading {}", path.display())))?;
      copy_tree(&entry.path(), &copy_root.join(entry.file_name()))
        .map_err(StoreError::io(format!("copying {}", entry.path().display())))?;
    }
    let committed = self.commit_directory(staging, None)?;
    Ok(committed.name)
  }

  /// Atomically write a small metadata file directly into the store directory.
  pub fn write_entry(&self, name: &str, contents: &[u8]) -> Result<PathBuf, StoreError> {
    validate_label(name)?;
    let mut temp = NamedTempFile::new_in(self.tmp_dir()).map_err(StoreError::io("creating a temporary store file"))?;
    temp
      .write_all(contents)
      .map_err(StoreError::io("writing to the temporary store file"))?;
    set_entry_permissions(temp.as_file()).map_err(StoreError::io("setting store file permissions"))?;
    let path = self.join(name);
    temp
      .persist(&path)
      .map_err(|e| StoreError::io(format!("moving {name} into store"))(e.error))?;
    Ok(path)
  }

  /// Read a store entry written by [`Store::write_entry`]. Missing entries are `None`.
  pub fn read_entry(&self, name: &str) -> Result<Option<Vec<u8>>, StoreError> {
    match fs::read(self.join(name)) {
      Ok(bytes) => Ok(Some(bytes)),
      Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
      Err(e) => Err(StoreError::io(format!("reading store entry {name}"))(e)),
    }
  }
}

/// `<hash>` or `<hash>-<label>`.
pub fn entry_name(hash: &ContentHash, label: Option<&str>) -> String {
  match label {
    Some(label) if !label.is_empty() => format!("{}-{}", hash.store_name(), label),
    _ => hash.store_name().to_string(),
  }
}

fn validate_label(label: &str) -> Result<(), StoreError> {
  if label.is_empty() || label.contains('/') || label.contains('\0') || label == "." || label == ".." {
    return Err(StoreError::InvalidLabel(label.to_string()));
  }
  Ok(())
}

#[cfg(unix)]
fn set_entry_permissions(file: &fs::File) -> io::Result<()> {
  use std::os::unix::fs::PermissionsExt;
  file.set_permissions(fs::Permissions::from_mode(0o644))
}

#[cfg(not(unix))]
fn set_entry_permissions(_file: &fs::File) -> io::Result<()> {
  Ok(())
}
