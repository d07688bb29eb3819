//! Shared test helpers for CLI integration tests.

use std::path::{Path, PathBuf};

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use tempfile::TempDir;

pub const MODULE: &str = "example.com/proj";

/// Isolated test environment.
///
/// Each test gets its own project directory and store root.
pub struct TestEnv {
  pub temp: TempDir,
}

impl TestEnv {
  /// A project declaring [`MODULE`] with the given files.
  pub fn project(files: &[(&str, &str)]) -> Self {
    let env = Self {
      temp: TempDir::new().unwrap(),
    };
    env.write_file("proj/bramble.toml", &format!("[module]\nname = \"{MODULE}\"\n"));
    for (path, contents) in files {
      env.write_file(&format!("proj/{path}"), contents);
    }
    env
  }

  /// Write a file relative to the temp directory.
  pub fn write_file(&self, relative_path: &str, content: &str) {
    let path = self.temp.path().join(relative_path);
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(&path, content).unwrap();
  }

  pub fn project_dir(&self) -> PathBuf {
    self.temp.path().join("proj")
  }

  pub fn store_root(&self) -> PathBuf {
    self.temp.path().join("bramble")
  }

  /// `bramble` running in the project directory against this env's store.
  pub fn bramble_cmd(&self) -> Command {
    self.bramble_cmd_with_store(&self.store_root())
  }

  pub fn bramble_cmd_with_store(&self, store_root: &Path) -> Command {
    let mut cmd = cargo_bin_cmd!("bramble");
    cmd
      .current_dir(self.project_dir())
      .env("BRAMBLE_PATH", store_root)
      .env_remove("RUST_LOG");
    cmd
  }
}

/// Store paths printed on stdout.
pub fn printed_paths(stdout: &[u8]) -> Vec<PathBuf> {
  String::from_utf8_lossy(stdout)
    .lines()
    .filter(|l| !l.trim().is_empty())
    .map(PathBuf::from)
    .collect()
}
