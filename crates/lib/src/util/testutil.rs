//! Test helpers for bramble-lib.

use std::fs;
use std::path::Path;

use tempfile::TempDir;

use crate::consts::PROJECT_FILE;
use crate::derivation::Derivation;
use crate::store::Store;

/// A fresh store under a temporary directory.
pub fn temp_store() -> (TempDir, Store) {
  let temp = TempDir::new().unwrap();
  let store = Store::open(&temp.path().join("bramble")).unwrap();
  (temp, store)
}

/// A derivation that runs `script` with `/bin/sh -c`.
///
/// Builders get no `PATH`, so scripts should stick to shell builtins.
pub fn shell_derivation(name: &str, script: &str) -> Derivation {
  let mut drv = Derivation::new(name, "/bin/sh");
  drv.args = vec!["-c".to_string(), script.to_string()];
  drv
}

/// Write a `bramble.toml` declaring `module` and the given files.
pub fn write_project(dir: &Path, module: &str, files: &[(&str, &str)]) {
  fs::create_dir_all(dir).unwrap();
  fs::write(dir.join(PROJECT_FILE), format!("[module]\nname = \"{module}\"\n")).unwrap();
  for (path, contents) in files {
    let path = dir.join(path);
    if let Some(parent) = path.parent() {
      fs::create_dir_all(parent).unwrap();
    }
    fs::write(path, contents).unwrap();
  }
}
