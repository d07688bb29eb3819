//! Implementation of the `bramble run` command.
//!
//! Evaluates `[path]:function`, builds every derivation the function returns
//! and prints the store path of each output, one per line, on stdout.

use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result, bail};

use bramble_lib::build::BuildConfig;
use bramble_lib::run::{RunOptions, run};
use bramble_lib::store::Store;

use crate::output::{
  format_duration, print_detail, print_error, print_stat, print_success, print_warning, symbols, truncate_hash,
};

pub fn cmd_run(target: &str, args: Vec<String>, jobs: Option<usize>) -> Result<()> {
  let start = Instant::now();

  let cwd = std::env::current_dir().context("Failed to read current directory")?;
  let store = Arc::new(Store::initialize().context("Failed to open store")?);

  let mut build = BuildConfig::default();
  if let Some(jobs) = jobs {
    build.parallelism = jobs;
  }
  let options = RunOptions {
    target: target.to_string(),
    args,
    cwd,
    build,
  };

  let rt = tokio::runtime::Runtime::new().context("Failed to create async runtime")?;
  let outcome = rt.block_on(run(store, &options))?;
  let report = &outcome.report;

  for failure in &report.failed {
    print_error(&format!("{} failed: {}", failure.name, failure.error));
    if failure.chain.len() > 1 {
      let chain: Vec<&str> = failure.chain.iter().map(|id| truncate_hash(&id.0)).collect();
      print_detail(&format!("required by {}", chain.join(&format!(" {} ", symbols::ARROW))));
    }
  }
  for (skipped, blocker) in &report.skipped {
    print_warning(&format!(
      "skipped {} because {} failed",
      truncate_hash(&skipped.0),
      truncate_hash(&blocker.0)
    ));
  }

  print_stat("Built", &report.built.len().to_string());
  print_stat("Cached", &report.cached.len().to_string());
  print_stat("Duration", &format_duration(start.elapsed()));

  if !outcome.is_success() {
    bail!("{} derivation(s) failed to build", report.failed.len());
  }

  print_success(&format!("{}:{}", outcome.module, outcome.function));
  for root in &outcome.roots {
    for path in root.outputs.values() {
      println!("{}", path.display());
    }
  }

  Ok(())
}
