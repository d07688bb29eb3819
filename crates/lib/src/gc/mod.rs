use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::{fs, io};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::store::lock::{LockMode, StoreLock, StoreLockError};
use crate::store::{Store, StoreError};
use crate::util::fs::{remove_path, tree_size};

#[derive(Debug, Error)]
pub enum GcError {
  #[error(transparent)]
  Store(#[from] StoreError),

  #[error(transparent)]
  Lock(#[from] StoreLockError),

  #[error("failed to read {path}: {source}")]
  Read {
    path: PathBuf,
    #[source]
    source: io::Error,
  },
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct GcStats {
  pub entries_scanned: usize,
  pub entries_deleted: usize,
  pub entries_bytes_freed: u64,
  pub tmp_deleted: usize,
  pub tmp_bytes_freed: u64,
}

impl GcStats {
  pub fn total_deleted(&self) -> usize {
    self.entries_deleted + self.tmp_deleted
  }

  pub fn total_bytes_freed(&self) -> u64 {
    self.entries_bytes_freed + self.tmp_bytes_freed
  }
}

#[derive(Debug)]
pub struct GcResult {
  pub stats: GcStats,
  pub deleted_paths: Vec<PathBuf>,
}

/// Every store entry named by a config registry record.
fn collect_live_entries(store: &Store) -> Result<HashSet<String>, GcError> {
  let live: HashSet<String> = store
    .registry_entries()?
    .into_iter()
    .flat_map(|entry| entry.derivations)
    .collect();
  debug!(count = live.len(), "collected live entries from config registry");
  Ok(live)
}

/// Delete store entries no registry record refers to, and whatever was left
/// behind in `tmp/`. With `dry_run` nothing is removed, but the result lists
/// what would have been.
///
/// Holds the store lock exclusively, so it fails rather than waits when a
/// build is running.
pub fn collect_garbage(store: &Store, dry_run: bool) -> Result<GcResult, GcError> {
  let _lock = StoreLock::acquire(store, LockMode::Exclusive, "gc")?;
  let live = collect_live_entries(store)?;

  let mut stats = GcStats::default();
  let mut deleted_paths = Vec::new();

  for name in store.entries()? {
    stats.entries_scanned += 1;
    if live.contains(&name) {
      continue;
    }
    let path = store.join(&name);
    debug!(path = %path.display(), "removing unreferenced entry");
    if let Some(size) = sweep(&path, dry_run) {
      stats.entries_deleted += 1;
      stats.entries_bytes_freed += size;
      deleted_paths.push(path);
    }
  }

  for path in list_dir(&store.tmp_dir())? {
    debug!(path = %path.display(), "removing stale temporary file");
    if let Some(size) = sweep(&path, dry_run) {
      stats.tmp_deleted += 1;
      stats.tmp_bytes_freed += size;
      deleted_paths.push(path);
    }
  }

  info!(
    entries_deleted = stats.entries_deleted,
    tmp_deleted = stats.tmp_deleted,
    bytes_freed = stats.total_bytes_freed(),
    dry_run,
    "garbage collection complete"
  );

  Ok(GcResult { stats, deleted_paths })
}

/// Size of `path` if it was (or, in a dry run, would be) deleted.
fn sweep(path: &Path, dry_run: bool) -> Option<u64> {
  let size = tree_size(path);
  if dry_run {
    return Some(size);
  }
  match remove_path(path) {
    Ok(()) => Some(size),
    Err(e) => {
      warn!(path = %path.display(), error = %e, "failed to delete");
      None
    }
  }
}

fn list_dir(dir: &Path) -> Result<Vec<PathBuf>, GcError> {
  let read_err = |source| GcError::Read {
    path: dir.to_path_buf(),
    source,
  };
  let listing = match fs::read_dir(dir) {
    Ok(listing) => listing,
    Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
    Err(e) => return Err(read_err(e)),
  };
  let mut paths = Vec::new();
  for entry in listing {
    paths.push(entry.map_err(read_err)?.path());
  }
  paths.sort();
  Ok(paths)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::util::testutil::temp_store;

  fn add(store: &Store, contents: &str, label: &str) -> String {
    let (_, path) = store.write_content(contents.as_bytes(), Some(label), None).unwrap();
    path.file_name().unwrap().to_string_lossy().into_owned()
  }

  #[test]
  fn gc_stats_totals() {
    let stats = GcStats {
      entries_scanned: 10,
      entries_deleted: 3,
      entries_bytes_freed: 1000,
      tmp_deleted: 2,
      tmp_bytes_freed: 500,
    };

    assert_eq!(stats.total_deleted(), 5);
    assert_eq!(stats.total_bytes_freed(), 1500);
  }

  #[test]
  fn keeps_registered_entries() {
    let (_temp, store) = temp_store();
    let live = add(&store, "live", "live.txt");
    let dead = add(&store, "dead!", "dead.txt");
    store.record_config_registry("/proj/default.bramble", [live.clone()]).unwrap();
    fs::write(store.tmp_dir().join("leftover"), "xx").unwrap();

    let result = collect_garbage(&store, false).unwrap();
    assert_eq!(result.stats.entries_scanned, 2);
    assert_eq!(result.stats.entries_deleted, 1);
    assert_eq!(result.stats.entries_bytes_freed, 5);
    assert_eq!(result.stats.tmp_deleted, 1);
    assert!(store.contains(&live));
    assert!(!store.contains(&dead));
    assert!(list_dir(&store.tmp_dir()).unwrap().is_empty());
  }

  #[test]
  fn dry_run_deletes_nothing() {
    let (_temp, store) = temp_store();
    let dead = add(&store, "dead", "dead.txt");

    let result = collect_garbage(&store, true).unwrap();
    assert_eq!(result.stats.entries_deleted, 1);
    assert_eq!(result.deleted_paths, vec![store.join(&dead)]);
    assert!(store.contains(&dead));
  }

  #[cfg(unix)]
  #[test]
  fn refuses_while_store_is_in_use() {
    let (_temp, store) = temp_store();
    let _held = StoreLock::acquire(&store, LockMode::Shared, "run").unwrap();

    let err = collect_garbage(&store, false).unwrap_err();
    assert!(matches!(err, GcError::Lock(_)), "{err}");
  }
}
