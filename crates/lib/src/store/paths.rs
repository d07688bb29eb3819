use std::path::{Component, Path, PathBuf};

use crate::consts::{APP_NAME, STORE_ROOT_ENV};

/// Returns the user's home directory
pub fn home_dir() -> Option<PathBuf> {
  std::env::var_os("HOME").filter(|h| !h.is_empty()).map(PathBuf::from)
}

/// Returns the requested store root: `BRAMBLE_PATH` if set, otherwise
/// `$HOME/bramble`. The result is lexically cleaned but not checked.
pub fn store_root() -> Option<PathBuf> {
  match std::env::var_os(STORE_ROOT_ENV) {
    Some(path) if !path.is_empty() => Some(clean(Path::new(&path))),
    _ => home_dir().map(|home| home.join(APP_NAME)),
  }
}

/// Normalize a path lexically: drop `.` components, resolve `..` against
/// preceding components and remove trailing separators.
pub fn clean(path: &Path) -> PathBuf {
  let mut normalized = PathBuf::new();
  for component in path.components() {
    match component {
      Component::ParentDir => {
        if !normalized.pop() && !path.is_absolute() {
          normalized.push("..");
        }
      }
      Component::CurDir => {}
      _ => normalized.push(component),
    }
  }
  if normalized.as_os_str().is_empty() {
    normalized.push(".");
  }
  normalized
}
