//! `bramble test`: find test files and run their `test_` functions.
//!
//! Each file gets its own evaluation context on its own thread. Assertion
//! failures are collected per test function so one test can report several
//! problems. Tests evaluate derivations but do not build them.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use tracing::{debug, info, instrument, warn};
use walkdir::WalkDir;

use crate::consts::{CONFIG_EXTENSION, TEST_FUNCTION_PREFIX};
use crate::lua::{Collector, EvalContext, EvalError};
use crate::project::{Project, ProjectError};
use crate::run::RunError;
use crate::store::Store;
use crate::store::lock::{LockMode, StoreLock};

#[derive(Debug, Clone)]
pub struct TestOptions {
  /// File or directory to search for tests.
  pub path: PathBuf,
  /// Stop starting new tests after the first failure.
  pub fail_fast: bool,
  /// Files evaluated at once.
  pub parallelism: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestCase {
  pub name: String,
  pub errors: Vec<String>,
}

impl TestCase {
  pub fn passed(&self) -> bool {
    self.errors.is_empty()
  }
}

#[derive(Debug, Clone)]
pub struct TestFile {
  pub path: PathBuf,
  pub module: String,
  pub cases: Vec<TestCase>,
  /// Set when the file could not be loaded at all.
  pub error: Option<String>,
}

#[derive(Debug, Default)]
pub struct TestReport {
  pub files: Vec<TestFile>,
}

impl TestReport {
  pub fn passed(&self) -> usize {
    self.cases().filter(|c| c.passed()).count()
  }

  pub fn failed(&self) -> usize {
    self.cases().filter(|c| !c.passed()).count()
  }

  pub fn broken_files(&self) -> usize {
    self.files.iter().filter(|f| f.error.is_some()).count()
  }

  pub fn is_success(&self) -> bool {
    self.failed() == 0 && self.broken_files() == 0
  }

  fn cases(&self) -> impl Iterator<Item = &TestCase> {
    self.files.iter().flat_map(|f| f.cases.iter())
  }
}

/// Whether `path` names a test file: `test_*.bramble` or `*_test.bramble`.
pub fn is_test_file(path: &Path) -> bool {
  let Some(stem) = path
    .file_name()
    .and_then(|n| n.to_str())
    .and_then(|n| n.strip_suffix(CONFIG_EXTENSION))
  else {
    return false;
  };
  stem.starts_with(TEST_FUNCTION_PREFIX) || stem.ends_with("_test")
}

/// Test files under `root`, sorted. A file given directly is used as is.
pub fn find_test_files(root: &Path) -> Result<Vec<PathBuf>, RunError> {
  if root.is_file() {
    return Ok(vec![root.to_path_buf()]);
  }

  let mut files = Vec::new();
  for entry in WalkDir::new(root).sort_by_file_name() {
    let entry = entry.map_err(|source| RunError::Discover {
      path: root.to_path_buf(),
      source,
    })?;
    if entry.file_type().is_file() && is_test_file(entry.path()) {
      files.push(entry.into_path());
    }
  }
  files.sort();
  Ok(files)
}

/// `path` as given, or `path.bramble` when only the latter exists.
fn resolve_test_path(path: &Path) -> PathBuf {
  if !path.exists() {
    let with_ext = PathBuf::from(format!("{}{CONFIG_EXTENSION}", path.display()));
    if with_ext.is_file() {
      return with_ext;
    }
  }
  path.to_path_buf()
}

/// Run every test under `options.path`.
#[instrument(skip_all, fields(path = %options.path.display()))]
pub fn test(store: Arc<Store>, options: &TestOptions) -> Result<TestReport, RunError> {
  let _lock = StoreLock::acquire(&store, LockMode::Shared, "test")?;

  let root = dunce::canonicalize(resolve_test_path(&options.path)).map_err(|source| ProjectError::Io {
    path: options.path.clone(),
    source,
  })?;
  let project = Arc::new(Project::locate(&root)?);
  let files = find_test_files(&root)?;
  info!(files = files.len(), "running tests");

  let queue: Mutex<VecDeque<(usize, PathBuf)>> = Mutex::new(files.into_iter().enumerate().collect());
  let results: Mutex<Vec<(usize, TestFile)>> = Mutex::new(Vec::new());
  let stop = AtomicBool::new(false);
  let workers = options.parallelism.max(1);

  thread::scope(|scope| {
    for _ in 0..workers {
      scope.spawn(|| {
        loop {
          let next = queue.lock().unwrap_or_else(|e| e.into_inner()).pop_front();
          let Some((index, path)) = next else {
            break;
          };
          if stop.load(Ordering::SeqCst) {
            break;
          }
          let file = run_file(&project, &store, &path, options.fail_fast, &stop);
          results.lock().unwrap_or_else(|e| e.into_inner()).push((index, file));
        }
      });
    }
  });

  let mut results = results.into_inner().unwrap_or_else(|e| e.into_inner());
  results.sort_by_key(|(index, _)| *index);
  Ok(TestReport {
    files: results.into_iter().map(|(_, file)| file).collect(),
  })
}

fn run_file(project: &Arc<Project>, store: &Arc<Store>, path: &Path, fail_fast: bool, stop: &AtomicBool) -> TestFile {
  let mut file = TestFile {
    path: path.to_path_buf(),
    module: String::new(),
    cases: Vec::new(),
    error: None,
  };

  let result = (|| -> Result<(), EvalError> {
    file.module = project.path_to_module_name(path)?;
    let collector = Rc::new(Collector::new());
    let ctx = EvalContext::new(project.clone(), store.clone(), collector.clone(), Vec::new())?;

    for name in ctx.test_functions(&file.module)? {
      if stop.load(Ordering::SeqCst) {
        break;
      }
      ctx.reset_build_context();
      let raised = ctx.call(&file.module, &name).err();

      let mut errors = collector.take_errors();
      errors.extend(raised.map(|e| e.to_string()));
      debug!(test = %name, failures = errors.len(), "test finished");
      if !errors.is_empty() && fail_fast {
        stop.store(true, Ordering::SeqCst);
      }
      file.cases.push(TestCase { name, errors });
    }
    Ok(())
  })();

  if let Err(e) = result {
    warn!(path = %path.display(), error = %e, "failed to load test file");
    file.error = Some(e.to_string());
    if fail_fast {
      stop.store(true, Ordering::SeqCst);
    }
  }
  file
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::util::testutil::{temp_store, write_project};
  use tempfile::TempDir;

  fn options(path: &Path, fail_fast: bool) -> TestOptions {
    TestOptions {
      path: path.to_path_buf(),
      fail_fast,
      parallelism: 1,
    }
  }

  #[test]
  fn recognises_test_files() {
    assert!(is_test_file(Path::new("a/test_build.bramble")));
    assert!(is_test_file(Path::new("build_test.bramble")));
    assert!(!is_test_file(Path::new("build.bramble")));
    assert!(!is_test_file(Path::new("test_build.lua")));
    assert!(!is_test_file(Path::new("testing.bramble")));
  }

  #[test]
  fn finds_test_files_recursively_in_order() {
    let dir = TempDir::new().unwrap();
    write_project(
      dir.path(),
      "example.com/proj",
      &[
        ("default.bramble", ""),
        ("z_test.bramble", ""),
        ("sub/test_a.bramble", ""),
        ("sub/helper.bramble", ""),
        ("test_b.bramble", ""),
      ],
    );

    let names: Vec<String> = find_test_files(dir.path())
      .unwrap()
      .iter()
      .map(|p| p.strip_prefix(dir.path()).unwrap().display().to_string())
      .collect();
    assert_eq!(names, vec!["sub/test_a.bramble", "test_b.bramble", "z_test.bramble"]);
  }

  #[test]
  fn aggregates_failures_per_test() {
    let dir = TempDir::new().unwrap();
    write_project(
      dir.path(),
      "example.com/proj",
      &[
        (
          "test_math.bramble",
          r#"
function test_add()
  bramble.assert.eq(1 + 1, 2)
end

function test_wrong()
  bramble.assert.eq(1, 2)
  bramble.assert.eq(3, 4)
end

function test_raises()
  error("boom")
end

function helper() end
"#,
        ),
        ("sub/derive_test.bramble", r#"
function test_derivation_then_cmd()
  bramble.derivation{ name = "a", builder = "/bin/sh" }
end

function test_gate_resets_between_tests()
  bramble.fs.mkdir(bramble.dir .. "/made")
end
"#),
      ],
    );
    let (_temp, store) = temp_store();

    let report = test(Arc::new(store), &options(dir.path(), false)).unwrap();
    assert_eq!(report.files.len(), 2);
    assert!(!report.is_success());
    assert_eq!(report.passed(), 3);
    assert_eq!(report.failed(), 2);

    let math = &report.files[1];
    assert_eq!(math.module, "example.com/proj/test_math");
    let names: Vec<&str> = math.cases.iter().map(|c| c.name.as_str()).collect();
    assert_eq!(names, vec!["test_add", "test_raises", "test_wrong"]);
    assert!(math.cases[1].errors[0].contains("boom"));
    assert_eq!(math.cases[2].errors, vec!["1 != 2".to_string(), "3 != 4".to_string()]);

    assert!(dir.path().join("sub/made").is_dir());
  }

  #[test]
  fn test_path_without_extension_finds_the_file() {
    let dir = TempDir::new().unwrap();
    write_project(
      dir.path(),
      "example.com/proj",
      &[
        ("test_math.bramble", "function test_add() bramble.assert.eq(2, 1 + 1) end\n"),
        ("test_other.bramble", "function test_fails() error(\"nope\") end\n"),
      ],
    );
    let (_temp, store) = temp_store();

    let report = test(Arc::new(store), &options(&dir.path().join("test_math"), false)).unwrap();
    assert_eq!(report.files.len(), 1);
    assert_eq!(report.files[0].module, "example.com/proj/test_math");
    assert!(report.is_success());

    assert!(resolve_test_path(&dir.path().join("missing")).ends_with("missing"));
  }

  #[test]
  fn fail_fast_stops_after_first_failure() {
    let dir = TempDir::new().unwrap();
    write_project(
      dir.path(),
      "example.com/proj",
      &[
        ("test_a.bramble", "function test_1() bramble.assert.fail('first') end\nfunction test_2() end"),
        ("test_b.bramble", "function test_1() end"),
      ],
    );
    let (_temp, store) = temp_store();

    let report = test(Arc::new(store), &options(dir.path(), true)).unwrap();
    assert_eq!(report.files.len(), 1);
    assert_eq!(report.files[0].cases.len(), 1);
    assert_eq!(report.failed(), 1);
  }

  #[test]
  fn broken_files_are_reported() {
    let dir = TempDir::new().unwrap();
    write_project(dir.path(), "example.com/proj", &[("test_bad.bramble", "function (")]);
    let (_temp, store) = temp_store();

    let report = test(Arc::new(store), &options(dir.path(), false)).unwrap();
    assert_eq!(report.broken_files(), 1);
    assert!(!report.is_success());
  }
}
