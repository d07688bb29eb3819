//! Implementation of the `bramble gc` command.

use std::time::Instant;

use anyhow::{Context, Result};

use bramble_lib::gc::collect_garbage;
use bramble_lib::store::Store;

use crate::output::{format_bytes, format_duration, print_info, print_stat, print_success};

pub fn cmd_gc(dry_run: bool) -> Result<()> {
  let start = Instant::now();

  let store = Store::initialize().context("Failed to open store")?;
  let result = collect_garbage(&store, dry_run).context("Garbage collection failed")?;

  if dry_run {
    for path in &result.deleted_paths {
      println!("{}", path.display());
    }
    print_info("Dry run - no changes made");
  } else {
    print_success("Garbage collection complete!");
  }
  print_stat("Entries scanned", &result.stats.entries_scanned.to_string());
  print_stat("Entries removed", &result.stats.entries_deleted.to_string());
  print_stat("Temporary files removed", &result.stats.tmp_deleted.to_string());
  print_stat("Space freed", &format_bytes(result.stats.total_bytes_freed()));
  print_stat("Duration", &format_duration(start.elapsed()));

  Ok(())
}
