//! The build engine.
//!
//! Given a [`DerivationGraph`], every derivation is realized once all of its
//! inputs have committed outputs. Ready derivations run concurrently, bounded
//! by [`BuildConfig::parallelism`]. A failure skips everything downstream of
//! it while independent branches keep going.

pub mod builder;
pub mod fetch;
pub mod graph;
pub mod realize;

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::io;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};

pub use graph::{DerivationGraph, GraphError};
pub use realize::Outputs;

use crate::derivation::DerivationId;
use crate::derivation::placeholder::PlaceholderError;
use crate::project::lockfile::{LockFileError, LockFileManager};
use crate::store::{Store, StoreError};

#[derive(Debug, Clone)]
pub struct BuildConfig {
  /// Maximum number of builders running at once.
  pub parallelism: usize,
}

impl Default for BuildConfig {
  fn default() -> Self {
    Self {
      parallelism: std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1),
    }
  }
}

#[derive(Debug, Error)]
pub enum BuildError {
  #[error("builder for {name} failed with {}", describe_exit(.code, .stderr))]
  BuilderFailed {
    name: String,
    code: Option<i32>,
    stderr: String,
  },

  #[error("failed to spawn builder {builder}: {source}")]
  Spawn {
    builder: String,
    #[source]
    source: io::Error,
  },

  #[error("failed to fetch {url}: {message}")]
  Fetch { url: String, message: String },

  #[error("failed to write derivation record {name}: {source}")]
  Record {
    name: String,
    #[source]
    source: serde_json::Error,
  },

  #[error(transparent)]
  Store(#[from] StoreError),

  #[error(transparent)]
  Placeholder(#[from] PlaceholderError),

  #[error(transparent)]
  LockFile(#[from] LockFileError),

  #[error("{context}: {source}")]
  Io {
    context: String,
    #[source]
    source: io::Error,
  },

  #[error("build task failed: {0}")]
  Join(String),
}

fn describe_exit(code: &Option<i32>, stderr: &str) -> String {
  let status = match code {
    Some(code) => format!("exit code {code}"),
    None => "no exit code".to_string(),
  };
  if stderr.is_empty() {
    status
  } else {
    format!("{status}:\n{stderr}")
  }
}

impl BuildError {
  pub(crate) fn io(context: impl Into<String>) -> impl FnOnce(io::Error) -> BuildError {
    let context = context.into();
    move |source| BuildError::Io { context, source }
  }
}

#[derive(Debug)]
pub struct BuildFailure {
  pub id: DerivationId,
  pub name: String,
  /// Identities from a requested root down to the failed derivation.
  pub chain: Vec<DerivationId>,
  pub error: BuildError,
}

#[derive(Debug, Default)]
pub struct BuildReport {
  /// Derivations whose builder ran in this build.
  pub built: BTreeMap<DerivationId, Outputs>,
  /// Derivations found in the store.
  pub cached: BTreeMap<DerivationId, Outputs>,
  pub failed: Vec<BuildFailure>,
  /// Skipped derivation -> the failed derivation that blocked it.
  pub skipped: BTreeMap<DerivationId, DerivationId>,
}

impl BuildReport {
  pub fn is_success(&self) -> bool {
    self.failed.is_empty() && self.skipped.is_empty()
  }

  /// Outputs of `id`, whether it was built or cached.
  pub fn outputs(&self, id: &DerivationId) -> Option<&Outputs> {
    self.built.get(id).or_else(|| self.cached.get(id))
  }

  /// Store entry names of every output produced or reused.
  pub fn entries(&self) -> impl Iterator<Item = &String> {
    self.built.values().chain(self.cached.values()).flat_map(|o| o.values())
  }
}

/// Realize every derivation in `graph`.
///
/// `lockfile` receives the pins of content-mode fetches.
#[instrument(skip_all, fields(derivations = graph.len()))]
pub async fn build(
  graph: &DerivationGraph,
  store: Arc<Store>,
  lockfile: Option<Arc<LockFileManager>>,
  config: &BuildConfig,
) -> BuildReport {
  info!(parallelism = config.parallelism, "starting build");

  let mut waiting: HashMap<DerivationId, usize> = graph
    .derivations()
    .map(|(id, _)| (id.clone(), graph.inputs(id).len()))
    .collect();
  let mut ready: VecDeque<DerivationId> = graph
    .derivations()
    .filter(|(id, _)| waiting[*id] == 0)
    .map(|(id, _)| id.clone())
    .collect();

  let semaphore = Arc::new(Semaphore::new(config.parallelism.max(1)));
  let mut tasks = JoinSet::new();
  let mut running: HashMap<tokio::task::Id, DerivationId> = HashMap::new();
  let mut done: HashMap<DerivationId, Outputs> = HashMap::new();
  let mut report = BuildReport::default();

  loop {
    while let Some(id) = ready.pop_front() {
      let Some(drv) = graph.get(&id).cloned() else {
        continue;
      };
      let inputs: BTreeMap<DerivationId, Outputs> = graph
        .inputs(&id)
        .into_iter()
        .filter_map(|input| done.get(&input).map(|outputs| (input, outputs.clone())))
        .collect();
      let store = store.clone();
      let lockfile = lockfile.clone();
      let semaphore = semaphore.clone();
      let task_id = id.clone();

      let handle = tasks.spawn(async move {
        let _permit = semaphore.acquire_owned().await.ok();
        realize::realize(&task_id, &drv, &inputs, store, lockfile).await
      });
      running.insert(handle.id(), id);
    }

    let Some(joined) = tasks.join_next_with_id().await else {
      break;
    };
    let (task, result) = match joined {
      Ok((task, result)) => (task, result),
      Err(e) => (e.id(), Err(BuildError::Join(e.to_string()))),
    };
    let Some(id) = running.remove(&task) else {
      continue;
    };

    match result {
      Ok(realized) => {
        for dependent in graph.dependents(&id) {
          if let Some(count) = waiting.get_mut(&dependent) {
            *count -= 1;
            if *count == 0 {
              ready.push_back(dependent);
            }
          }
        }
        done.insert(id.clone(), realized.outputs.clone());
        if realized.cached {
          report.cached.insert(id, realized.outputs);
        } else {
          report.built.insert(id, realized.outputs);
        }
      }
      Err(err) => {
        let name = graph.get(&id).map(|d| d.name.clone()).unwrap_or_default();
        error!(derivation = %id, name = %name, error = %err, "build failed");
        skip_dependents(graph, &id, &mut report.skipped);
        report.failed.push(BuildFailure {
          chain: graph.chain_to(&id),
          id,
          name,
          error: err,
        });
      }
    }
  }

  info!(
    built = report.built.len(),
    cached = report.cached.len(),
    failed = report.failed.len(),
    skipped = report.skipped.len(),
    "build finished"
  );
  report
}

/// Mark everything downstream of `failed` as skipped.
fn skip_dependents(graph: &DerivationGraph, failed: &DerivationId, skipped: &mut BTreeMap<DerivationId, DerivationId>) {
  let mut queue: VecDeque<DerivationId> = graph.dependents(failed).into();
  while let Some(id) = queue.pop_front() {
    if skipped.contains_key(&id) {
      continue;
    }
    warn!(derivation = %id, failed = %failed, "skipping build due to failed dependency");
    queue.extend(graph.dependents(&id));
    skipped.insert(id, failed.clone());
  }
  debug!(skipped = skipped.len(), "propagated failure");
}
