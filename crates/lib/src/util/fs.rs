//! Filesystem helpers for store staging.

use std::fs;
use std::io;
use std::path::Path;

use walkdir::WalkDir;

/// Replace every occurrence of `from` in `data` with `to`.
///
/// Returns `None` when `from` does not occur, so callers can skip rewriting.
pub fn replace_all(data: &[u8], from: &[u8], to: &[u8]) -> Option<Vec<u8>> {
  if from.is_empty() || data.len() < from.len() {
    return None;
  }

  let mut out: Option<Vec<u8>> = None;
  let mut last = 0;
  let mut i = 0;
  while i + from.len() <= data.len() {
    if &data[i..i + from.len()] == from {
      let buf = out.get_or_insert_with(|| Vec::with_capacity(data.len()));
      buf.extend_from_slice(&data[last..i]);
      buf.extend_from_slice(to);
      i += from.len();
      last = i;
    } else {
      i += 1;
    }
  }

  out.map(|mut buf| {
    buf.extend_from_slice(&data[last..]);
    buf
  })
}

/// Rewrite `from` to `to` in every file and symlink target under `root`.
///
/// Both strings must have the same length so that no artifact changes size.
pub fn rewrite_tree(root: &Path, from: &str, to: &str) -> io::Result<usize> {
  if from.len() != to.len() {
    return Err(io::Error::new(
      io::ErrorKind::InvalidInput,
      format!("length-changing rewrite from {from:?} to {to:?}"),
    ));
  }

  let mut rewritten = 0;
  for entry in WalkDir::new(root) {
    let entry = entry?;
    let path = entry.path();
    let file_type = entry.file_type();

    if file_type.is_file() {
      let content = fs::read(path)?;
      if let Some(replaced) = replace_all(&content, from.as_bytes(), to.as_bytes()) {
        let permissions = entry.metadata()?.permissions();
        make_writable(path)?;
        fs::write(path, replaced)?;
        fs::set_permissions(path, permissions)?;
        rewritten += 1;
      }
    } else if file_type.is_symlink() {
      let target = fs::read_link(path)?;
      let target = target.to_string_lossy();
      if target.contains(from) {
        let new_target = target.replace(from, to);
        fs::remove_file(path)?;
        symlink(Path::new(&new_target), path)?;
        rewritten += 1;
      }
    }
  }

  Ok(rewritten)
}

/// Copy a file or directory tree, preserving permissions and symlinks.
pub fn copy_tree(src: &Path, dst: &Path) -> io::Result<()> {
  let meta = fs::symlink_metadata(src)?;
  if meta.is_file() {
    fs::copy(src, dst)?;
    return Ok(());
  }
  if meta.file_type().is_symlink() {
    return symlink(&fs::read_link(src)?, dst);
  }

  for entry in WalkDir::new(src) {
    let entry = entry?;
    let rel = entry.path().strip_prefix(src).unwrap_or(entry.path());
    let target = dst.join(rel);
    let file_type = entry.file_type();

    if file_type.is_dir() {
      fs::create_dir_all(&target)?;
    } else if file_type.is_symlink() {
      symlink(&fs::read_link(entry.path())?, &target)?;
    } else if file_type.is_file() {
      fs::copy(entry.path(), &target)?;
    }
  }
  Ok(())
}

/// Total size in bytes of a file or tree. Symlinks count as zero.
pub fn tree_size(path: &Path) -> u64 {
  WalkDir::new(path)
    .into_iter()
    .filter_map(|e| e.ok())
    .filter(|e| e.file_type().is_file())
    .filter_map(|e| e.metadata().ok())
    .map(|m| m.len())
    .sum()
}

/// Remove a file, symlink or directory tree.
pub fn remove_path(path: &Path) -> io::Result<()> {
  let meta = fs::symlink_metadata(path)?;
  if meta.is_dir() {
    make_tree_writable(path)?;
    fs::remove_dir_all(path)
  } else {
    fs::remove_file(path)
  }
}

fn make_tree_writable(path: &Path) -> io::Result<()> {
  for entry in WalkDir::new(path) {
    let entry = entry?;
    if entry.file_type().is_dir() {
      make_writable(entry.path())?;
    }
  }
  Ok(())
}

#[cfg(unix)]
fn make_writable(path: &Path) -> io::Result<()> {
  use std::os::unix::fs::PermissionsExt;

  let mut permissions = fs::metadata(path)?.permissions();
  permissions.set_mode(permissions.mode() | 0o200);
  fs::set_permissions(path, permissions)
}

#[cfg(not(unix))]
fn make_writable(path: &Path) -> io::Result<()> {
  let mut permissions = fs::metadata(path)?.permissions();
  #[allow(clippy::permissions_set_readonly_false)]
  permissions.set_readonly(false);
  fs::set_permissions(path, permissions)
}

#[cfg(unix)]
pub fn is_executable(meta: &fs::Metadata) -> bool {
  use std::os::unix::fs::PermissionsExt;
  meta.permissions().mode() & 0o111 != 0
}

#[cfg(not(unix))]
pub fn is_executable(_meta: &fs::Metadata) -> bool {
  false
}

#[cfg(unix)]
pub fn symlink(target: &Path, link: &Path) -> io::Result<()> {
  std::os::unix::fs::symlink(target, link)
}

#[cfg(windows)]
pub fn symlink(target: &Path, link: &Path) -> io::Result<()> {
  if target.is_dir() {
    std::os::windows::fs::symlink_dir(target, link)
  } else {
    std::os::windows::fs::symlink_file(target, link)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use tempfile::tempdir;

  #[test]
  fn replace_all_handles_multiple_matches() {
    let out = replace_all(b"aXbXc", b"X", b"Y").unwrap();
    assert_eq!(out, b"aYbYc");
    assert!(replace_all(b"abc", b"X", b"Y").is_none());
  }

  #[test]
  fn rewrite_tree_is_length_preserving() {
    let temp = tempdir().unwrap();
    fs::create_dir(temp.path().join("bin")).unwrap();
    fs::write(temp.path().join("bin/tool"), "prefix-AAAA-suffix").unwrap();

    let count = rewrite_tree(temp.path(), "AAAA", "BBBB").unwrap();
    assert_eq!(count, 1);
    assert_eq!(
      fs::read_to_string(temp.path().join("bin/tool")).unwrap(),
      "prefix-BBBB-suffix"
    );

    assert!(rewrite_tree(temp.path(), "BBBB", "C").is_err());
  }

  #[cfg(unix)]
  #[test]
  fn rewrite_tree_updates_symlinks() {
    let temp = tempdir().unwrap();
    symlink(Path::new("/store/AAAA/bin"), &temp.path().join("link")).unwrap();

    rewrite_tree(temp.path(), "AAAA", "BBBB").unwrap();
    assert_eq!(
      fs::read_link(temp.path().join("link")).unwrap(),
      Path::new("/store/BBBB/bin")
    );
  }

  #[test]
  fn copy_tree_copies_nested_files() {
    let src = tempdir().unwrap();
    fs::create_dir_all(src.path().join("a/b")).unwrap();
    fs::write(src.path().join("a/b/c.txt"), "deep").unwrap();

    let dst = tempdir().unwrap();
    let target = dst.path().join("copy");
    copy_tree(src.path(), &target).unwrap();

    assert_eq!(fs::read_to_string(target.join("a/b/c.txt")).unwrap(), "deep");
    assert_eq!(tree_size(&target), 4);
  }

  #[test]
  fn remove_path_handles_readonly_trees() {
    let temp = tempdir().unwrap();
    let tree = temp.path().join("tree");
    fs::create_dir_all(tree.join("inner")).unwrap();
    fs::write(tree.join("inner/file"), "x").unwrap();
    let mut permissions = fs::metadata(tree.join("inner")).unwrap().permissions();
    permissions.set_readonly(true);
    fs::set_permissions(tree.join("inner"), permissions).unwrap();

    remove_path(&tree).unwrap();
    assert!(!tree.exists());
  }
}
