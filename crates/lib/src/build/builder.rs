//! Running a derivation's builder process.
//!
//! Builders run with a cleared environment so that anything they need has to
//! come in through the derivation itself.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use tokio::process::Command;
use tracing::{debug, info};

use super::BuildError;

/// 1980-01-01T00:00:00Z, the ZIP epoch.
pub const SOURCE_DATE_EPOCH: &str = "315532800";

/// A fully substituted builder invocation.
#[derive(Debug)]
pub struct Invocation<'a> {
  pub name: &'a str,
  pub builder: &'a str,
  pub args: &'a [String],
  pub env: &'a BTreeMap<String, String>,
  /// Output name -> staging directory.
  pub outputs: &'a BTreeMap<String, PathBuf>,
  pub build_dir: &'a Path,
  pub tmp_dir: &'a Path,
}

#[derive(Debug, Default)]
pub struct BuilderOutput {
  pub stdout: String,
  pub stderr: String,
}

/// Spawn the builder and wait for it.
///
/// The environment is cleared and then set to:
/// - `PATH=/path-not-set` and `HOME=/homeless-shelter`
/// - `TMPDIR`, `TMP`, `TEMP` pointing at a per-build directory
/// - `LANG=C` and `SOURCE_DATE_EPOCH`
/// - one variable per output, named after the output
/// - the derivation's own `env`, which wins over all of the above
pub async fn run(invocation: &Invocation<'_>) -> Result<BuilderOutput, BuildError> {
  info!(derivation = %invocation.name, builder = %invocation.builder, "running builder");

  let mut command = Command::new(invocation.builder);
  command
    .args(invocation.args)
    .current_dir(invocation.build_dir)
    .env_clear()
    .env("PATH", "/path-not-set")
    .env("HOME", "/homeless-shelter")
    .env("TMPDIR", invocation.tmp_dir)
    .env("TMP", invocation.tmp_dir)
    .env("TEMP", invocation.tmp_dir)
    .env("LANG", "C")
    .env("SOURCE_DATE_EPOCH", SOURCE_DATE_EPOCH)
    .stdin(std::process::Stdio::null())
    .kill_on_drop(true);

  for (output, path) in invocation.outputs {
    command.env(output, path);
  }
  for (key, value) in invocation.env {
    command.env(key, value);
  }

  let output = command.output().await.map_err(|source| BuildError::Spawn {
    builder: invocation.builder.to_string(),
    source,
  })?;

  let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
  let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
  if !stdout.is_empty() {
    debug!(derivation = %invocation.name, stdout = %stdout.trim_end(), "builder stdout");
  }
  if !stderr.is_empty() {
    debug!(derivation = %invocation.name, stderr = %stderr.trim_end(), "builder stderr");
  }

  if !output.status.success() {
    return Err(BuildError::BuilderFailed {
      name: invocation.name.to_string(),
      code: output.status.code(),
      stderr: stderr.trim_end().to_string(),
    });
  }

  Ok(BuilderOutput { stdout, stderr })
}
