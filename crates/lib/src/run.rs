//! `bramble run`: evaluate one function and build the derivations it returns.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::rc::Rc;
use std::sync::Arc;

use thiserror::Error;
use tracing::{info, instrument};

use crate::build::{BuildConfig, BuildReport, DerivationGraph, GraphError, build};
use crate::derivation::DerivationId;
use crate::lua::{EvalContext, EvalError, FailFast};
use crate::project::{Project, ProjectError};
use crate::store::lock::{LockMode, StoreLock, StoreLockError};
use crate::store::{Store, StoreError};

#[derive(Debug, Error)]
pub enum RunError {
  #[error(transparent)]
  Project(#[from] ProjectError),

  #[error(transparent)]
  Store(#[from] StoreError),

  #[error(transparent)]
  Lock(#[from] StoreLockError),

  #[error(transparent)]
  Eval(#[from] EvalError),

  #[error(transparent)]
  Graph(#[from] GraphError),

  #[error("failed to search {path} for tests: {source}")]
  Discover {
    path: PathBuf,
    #[source]
    source: walkdir::Error,
  },
}

#[derive(Debug, Clone)]
pub struct RunOptions {
  /// `[path]:function`, relative to `cwd`.
  pub target: String,
  /// Extra arguments handed to the function and exposed as `bramble.args`.
  pub args: Vec<String>,
  pub cwd: PathBuf,
  pub build: BuildConfig,
}

/// A derivation returned by the function, with its output paths.
#[derive(Debug, Clone)]
pub struct RootOutput {
  pub id: DerivationId,
  pub name: String,
  pub outputs: BTreeMap<String, PathBuf>,
}

#[derive(Debug)]
pub struct RunOutcome {
  pub module: String,
  pub function: String,
  /// Requested derivations that have outputs, in identity order.
  pub roots: Vec<RootOutput>,
  pub report: BuildReport,
}

impl RunOutcome {
  pub fn is_success(&self) -> bool {
    self.report.is_success()
  }
}

/// Evaluate `options.target` and build everything its result refers to.
///
/// Build failures are part of the returned report. Errors are reserved for
/// problems that stop the run before or around the build.
#[instrument(skip_all, fields(target = %options.target))]
pub async fn run(store: Arc<Store>, options: &RunOptions) -> Result<RunOutcome, RunError> {
  let _lock = StoreLock::acquire(&store, LockMode::Shared, "run")?;

  let project = Arc::new(Project::locate(&options.cwd)?);
  let (module, function) = project.parse_module_function(&options.target, &options.cwd)?;
  info!(module = %module, function = %function, "evaluating");

  let (pool, roots) = {
    let ctx = EvalContext::new(project.clone(), store.clone(), Rc::new(FailFast), options.args.clone())?;
    let value = ctx.call(&module, &function)?;
    (ctx.derivations(), ctx.roots(&value)?)
  };

  let graph = DerivationGraph::new(&pool, &roots)?;
  let report = build(&graph, store.clone(), Some(project.lockfile().clone()), &options.build).await;

  let entries = live_entries(&graph, &report);
  if !entries.is_empty() {
    let location = project.module_name_to_path(&module)?;
    store.record_config_registry(&location.display().to_string(), entries)?;
  }

  let roots = roots
    .iter()
    .filter_map(|id| {
      let drv = graph.get(id)?;
      let outputs = report.outputs(id)?;
      Some(RootOutput {
        id: id.clone(),
        name: drv.name.clone(),
        outputs: outputs.iter().map(|(name, entry)| (name.clone(), store.join(entry))).collect(),
      })
    })
    .collect();

  Ok(RunOutcome {
    module,
    function,
    roots,
    report,
  })
}

/// Store entries a finished build depends on: outputs, derivation records and sources.
fn live_entries(graph: &DerivationGraph, report: &BuildReport) -> BTreeSet<String> {
  let mut entries = BTreeSet::new();
  for (id, drv) in graph.derivations() {
    if let Some(outputs) = report.outputs(id) {
      entries.extend(outputs.values().cloned());
      entries.insert(drv.record_name(id));
      entries.extend(drv.sources.values().cloned());
    }
  }
  entries
}
