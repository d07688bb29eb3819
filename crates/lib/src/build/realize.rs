//! Turning one derivation into store entries.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use super::{BuildError, builder, fetch};
use crate::derivation::placeholder::{self, PlaceholderError, Resolver};
use crate::derivation::{Derivation, DerivationId, DerivationRecord};
use crate::project::lockfile::LockFileManager;
use crate::store::{Staging, Store};
use crate::util::fs::copy_tree;

/// Output name -> store entry name.
pub type Outputs = BTreeMap<String, String>;

#[derive(Debug)]
pub struct Realized {
  pub outputs: Outputs,
  pub cached: bool,
}

/// The outputs recorded for `id`, if every one of them is still in the store.
pub fn lookup(store: &Store, id: &DerivationId, drv: &Derivation) -> Result<Option<Outputs>, BuildError> {
  let name = drv.record_name(id);
  let Some(bytes) = store.read_entry(&name)? else {
    return Ok(None);
  };
  let record: DerivationRecord = match serde_json::from_slice(&bytes) {
    Ok(record) => record,
    Err(e) => {
      warn!(record = %name, error = %e, "ignoring unreadable derivation record");
      return Ok(None);
    }
  };
  if record.outputs.values().all(|entry| store.contains(entry)) && record.outputs.len() == drv.outputs.len() {
    Ok(Some(record.outputs))
  } else {
    debug!(record = %name, "derivation record points at missing outputs");
    Ok(None)
  }
}

/// Build `drv` unless a record of an earlier build is found.
///
/// `inputs` maps every input identity to its committed outputs.
#[instrument(skip_all, fields(derivation = %id, name = %drv.name))]
pub async fn realize(
  id: &DerivationId,
  drv: &Derivation,
  inputs: &BTreeMap<DerivationId, Outputs>,
  store: Arc<Store>,
  lockfile: Option<Arc<LockFileManager>>,
) -> Result<Realized, BuildError> {
  if let Some(outputs) = lookup(&store, id, drv)? {
    debug!("cache hit");
    return Ok(Realized { outputs, cached: true });
  }

  let outputs = if drv.is_builtin_fetch() {
    fetch::fetch_url(drv, store.clone(), lockfile.as_deref()).await?
  } else {
    run_builder(drv, inputs, store.clone()).await?
  };

  let record = DerivationRecord {
    id: id.clone(),
    derivation: drv.clone(),
    outputs: outputs.clone(),
  };
  let bytes = serde_json::to_vec_pretty(&record).map_err(|source| BuildError::Record {
    name: drv.record_name(id),
    source,
  })?;
  store.write_entry(&drv.record_name(id), &bytes)?;

  info!(outputs = ?outputs.values().collect::<Vec<_>>(), "built");
  Ok(Realized { outputs, cached: false })
}

async fn run_builder(
  drv: &Derivation,
  inputs: &BTreeMap<DerivationId, Outputs>,
  store: Arc<Store>,
) -> Result<Outputs, BuildError> {
  let mut staging = Vec::with_capacity(drv.outputs.len());
  for output in &drv.outputs {
    staging.push((output.clone(), store.stage(&drv.output_label(output))?));
  }

  let work = tempfile::Builder::new()
    .prefix("build-")
    .tempdir_in(store.tmp_dir())
    .map_err(BuildError::io("creating build directory"))?;
  let build_dir = work.path().join("build");
  let tmp_dir = work.path().join("tmp");
  for dir in [&build_dir, &tmp_dir] {
    std::fs::create_dir(dir).map_err(BuildError::io("creating build directory"))?;
  }
  for (file, entry) in &drv.sources {
    copy_tree(&store.join(entry), &build_dir.join(file)).map_err(BuildError::io(format!("copying source {entry}")))?;
  }

  let paths = StorePaths::new(&store, drv, inputs, &staging);
  let builder_path = placeholder::substitute(&drv.builder, &paths)?;
  let args = drv
    .args
    .iter()
    .map(|arg| placeholder::substitute(arg, &paths))
    .collect::<Result<Vec<_>, _>>()?;
  let env = drv
    .env
    .iter()
    .map(|(k, v)| Ok((k.clone(), placeholder::substitute(v, &paths)?)))
    .collect::<Result<BTreeMap<_, _>, PlaceholderError>>()?;
  let output_dirs: BTreeMap<String, PathBuf> = staging
    .iter()
    .map(|(name, staged)| (name.clone(), staged.path().to_path_buf()))
    .collect();

  builder::run(&builder::Invocation {
    name: &drv.name,
    builder: &builder_path,
    args: &args,
    env: &env,
    outputs: &output_dirs,
    build_dir: &build_dir,
    tmp_dir: &tmp_dir,
  })
  .await?;
  drop(work);

  let expected = drv.fixed_hash().map(str::to_string);
  tokio::task::spawn_blocking(move || {
    let mut outputs = Outputs::new();
    for (name, staged) in staging {
      let committed = store.commit_directory(staged, expected.as_deref())?;
      outputs.insert(name, committed.name);
    }
    Ok::<_, BuildError>(outputs)
  })
  .await
  .map_err(|e| BuildError::Join(e.to_string()))?
}

/// Resolves placeholders to absolute paths for one build.
struct StorePaths {
  derivations: BTreeMap<(String, String), String>,
  sources: BTreeMap<String, String>,
  outs: BTreeMap<String, String>,
}

impl StorePaths {
  fn new(
    store: &Store,
    drv: &Derivation,
    inputs: &BTreeMap<DerivationId, Outputs>,
    staging: &[(String, Staging)],
  ) -> Self {
    let path = |entry: &str| store.join(entry).to_string_lossy().into_owned();
    let mut derivations = BTreeMap::new();
    for (id, outputs) in inputs {
      for (output, entry) in outputs {
        derivations.insert((id.0.clone(), output.clone()), path(entry));
      }
    }
    Self {
      derivations,
      sources: drv.sources.values().map(|entry| (entry.clone(), path(entry))).collect(),
      outs: staging
        .iter()
        .map(|(name, staged)| (name.clone(), staged.path().to_string_lossy().into_owned()))
        .collect(),
    }
  }
}

impl Resolver for StorePaths {
  fn resolve_derivation(&self, id: &str, output: &str) -> Result<&str, PlaceholderError> {
    self
      .derivations
      .get(&(id.to_string(), output.to_string()))
      .map(String::as_str)
      .ok_or_else(|| PlaceholderError::UnresolvedDerivation {
        id: id.to_string(),
        output: output.to_string(),
      })
  }

  fn resolve_source(&self, entry: &str) -> Result<&str, PlaceholderError> {
    self
      .sources
      .get(entry)
      .map(String::as_str)
      .ok_or_else(|| PlaceholderError::UnresolvedSource(entry.to_string()))
  }

  fn resolve_out(&self, output: &str) -> Result<&str, PlaceholderError> {
    self
      .outs
      .get(output)
      .map(String::as_str)
      .ok_or_else(|| PlaceholderError::UnresolvedOut(output.to_string()))
  }
}
