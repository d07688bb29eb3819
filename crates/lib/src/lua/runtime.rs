//! Evaluation contexts.
//!
//! An [`EvalContext`] owns one Lua state together with everything the
//! builtins running inside it may touch. Contexts are never shared: code that
//! needs concurrency creates one context per thread.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::rc::Rc;
use std::sync::Arc;

use mlua::prelude::*;
use mlua::{LuaOptions, StdLib};
use thiserror::Error;
use tracing::debug;

use super::assert::{ErrorReporter, create_assert_table};
use super::derivation::{create_derivation_fn, create_fetch_url_fn};
use super::loaders::{create_import_fn, load_module};
use super::os::{create_args_table, create_cmd_fn, create_fs_table, create_input_fn};
use super::value::collect_derivations;
use crate::consts::TEST_FUNCTION_PREFIX;
use crate::derivation::{Derivation, DerivationId};
use crate::project::{Project, ProjectError};
use crate::store::{Store, StoreError};

#[derive(Debug, Error)]
pub enum EvalError {
  #[error(transparent)]
  Lua(#[from] LuaError),

  #[error(transparent)]
  Project(#[from] ProjectError),

  #[error(transparent)]
  Store(#[from] StoreError),

  #[error("build context is dirty, can't call {0} after derivation()")]
  DirtyContext(String),

  #[error("module {module} has no function {function:?}")]
  NotAFunction { module: String, function: String },

  #[error("import cycle: {}", .0.join(" -> "))]
  ImportCycle(Vec<String>),

  #[error("failed to read module {module}: {source}")]
  Read {
    module: String,
    #[source]
    source: std::io::Error,
  },
}

/// State shared by every builtin of one context.
pub struct EvalState {
  pub(crate) project: Arc<Project>,
  pub(crate) store: Arc<Store>,
  pub(crate) derivations: RefCell<BTreeMap<DerivationId, Derivation>>,
  /// Set by the first `derivation()` call; gated builtins refuse to run after it.
  pub(crate) called_derivation: Cell<bool>,
  pub(crate) reporter: Rc<dyn ErrorReporter>,
  pub(crate) args: Vec<String>,
  /// Modules compiled from source rather than taken from a cache.
  pub(crate) compilations: Cell<usize>,
  /// Compiled chunks by source hash.
  pub(crate) compiled: RefCell<HashMap<String, Vec<u8>>>,
  /// Modules currently being evaluated, outermost first.
  pub(crate) loading: RefCell<Vec<String>>,
}

impl EvalState {
  pub(crate) fn check_clean(&self, builtin: &str) -> LuaResult<()> {
    if self.called_derivation.get() {
      return Err(LuaError::external(EvalError::DirtyContext(builtin.to_string())));
    }
    Ok(())
  }
}

/// Open a Lua state with the libraries configuration code may use.
fn new_lua() -> LuaResult<Lua> {
  let libs = StdLib::TABLE | StdLib::STRING | StdLib::MATH | StdLib::UTF8 | StdLib::COROUTINE;
  // SAFETY: none of the opened libraries can load native code. Unsafe mode is
  // what allows precompiled chunks from the module cache to be loaded, and
  // the chunk loaders reachable from Lua are removed below.
  let lua = unsafe { Lua::unsafe_new_with(libs, LuaOptions::new()) };

  let globals = lua.globals();
  for name in ["dofile", "loadfile", "load"] {
    globals.raw_set(name, LuaNil)?;
  }
  Ok(lua)
}

/// The `bramble` table for code living in `dir`.
pub(crate) fn builtins_for(lua: &Lua, state: &Rc<EvalState>, dir: &Path) -> LuaResult<LuaTable> {
  let bramble = lua.create_table()?;
  bramble.set("derivation", create_derivation_fn(lua, state.clone(), dir.to_path_buf())?)?;
  bramble.set("fetch_url", create_fetch_url_fn(lua, state.clone())?)?;
  bramble.set("import", create_import_fn(lua, state.clone())?)?;
  bramble.set("cmd", create_cmd_fn(lua, state.clone(), dir.to_path_buf())?)?;
  bramble.set("fs", create_fs_table(lua, state.clone())?)?;
  bramble.set("input", create_input_fn(lua, state.clone())?)?;
  bramble.set("args", create_args_table(lua, &state.args)?)?;
  bramble.set("dir", dir.to_string_lossy())?;
  bramble.set("assert", create_assert_table(lua, state.clone())?)?;
  Ok(bramble)
}

pub struct EvalContext {
  lua: Lua,
  state: Rc<EvalState>,
}

impl EvalContext {
  pub fn new(
    project: Arc<Project>,
    store: Arc<Store>,
    reporter: Rc<dyn ErrorReporter>,
    args: Vec<String>,
  ) -> Result<Self, EvalError> {
    let lua = new_lua()?;
    let location = project.location().to_path_buf();
    let state = Rc::new(EvalState {
      project,
      store,
      derivations: RefCell::new(BTreeMap::new()),
      called_derivation: Cell::new(false),
      reporter,
      args,
      compilations: Cell::new(0),
      compiled: RefCell::new(HashMap::new()),
      loading: RefCell::new(Vec::new()),
    });

    let bramble = builtins_for(&lua, &state, &location)?;
    lua.globals().set("bramble", bramble)?;
    Ok(Self { lua, state })
  }

  pub fn lua(&self) -> &Lua {
    &self.lua
  }

  pub fn project(&self) -> &Arc<Project> {
    &self.state.project
  }

  /// Bindings of `module`, evaluated at most once per context.
  pub fn load(&self, module: &str) -> Result<LuaTable, EvalError> {
    load_module(&self.lua, &self.state, module).map_err(unwrap_eval_error)
  }

  /// Call `function` from `module` with the context arguments.
  pub fn call(&self, module: &str, function: &str) -> Result<LuaValue, EvalError> {
    let bindings = self.load(module)?;
    let LuaValue::Function(func) = bindings.raw_get::<LuaValue>(function)? else {
      return Err(EvalError::NotAFunction {
        module: module.to_string(),
        function: function.to_string(),
      });
    };

    debug!(module, function, "calling");
    let args: LuaVariadic<String> = self.state.args.iter().cloned().collect();
    Ok(func.call::<LuaValue>(args)?)
  }

  /// Names of the `test_` functions defined by `module`, sorted.
  pub fn test_functions(&self, module: &str) -> Result<Vec<String>, EvalError> {
    let bindings = self.load(module)?;
    let mut names = Vec::new();
    for pair in bindings.pairs::<LuaValue, LuaValue>() {
      let (key, value) = pair?;
      if let (LuaValue::String(key), LuaValue::Function(_)) = (key, value) {
        let key = key.to_string_lossy();
        if key.starts_with(TEST_FUNCTION_PREFIX) {
          names.push(key);
        }
      }
    }
    names.sort();
    Ok(names)
  }

  /// Every derivation defined in this context so far.
  pub fn derivations(&self) -> BTreeMap<DerivationId, Derivation> {
    self.state.derivations.borrow().clone()
  }

  /// The derivations a returned value refers to.
  pub fn roots(&self, value: &LuaValue) -> Result<Vec<DerivationId>, EvalError> {
    Ok(collect_derivations(value)?.into_iter().collect())
  }

  /// Allow gated builtins again, e.g. between two test functions.
  pub fn reset_build_context(&self) {
    self.state.called_derivation.set(false);
  }

  /// How many modules this context compiled from source.
  pub fn compilations(&self) -> usize {
    self.state.compilations.get()
  }
}

/// Errors raised in builtins travel through Lua as callback errors. Pull a
/// resolution error back out when it is the whole story.
fn unwrap_eval_error(err: LuaError) -> EvalError {
  if let LuaError::ExternalError(ref inner) = err
    && let Some(project) = inner.downcast_ref::<ProjectError>()
    && let ProjectError::ModuleDoesNotExist(name) = project
  {
    return EvalError::Project(ProjectError::ModuleDoesNotExist(name.clone()));
  }
  EvalError::Lua(err)
}
