//! Module loading.
//!
//! Every module file runs in its own environment table. The table falls back
//! to the globals for lookups, carries its own `bramble` table (so builtins
//! know which directory they were called from), and becomes the module's
//! bindings once the file has run.
//!
//! Compiled chunks are cached twice: in memory for the lifetime of a context,
//! and on disk in the store's module cache, both keyed by source hash.

use std::fs;
use std::path::Path;
use std::rc::Rc;

use mlua::ChunkMode;
use mlua::prelude::*;
use tracing::{debug, trace, warn};

use super::runtime::{EvalError, EvalState, builtins_for};
use super::value::MODULE_MARKER;
use crate::util::hash::hash_bytes;

/// Named registry table holding the bindings of every loaded module.
const MODULES_KEY: &str = "bramble.modules";

fn modules_table(lua: &Lua) -> LuaResult<LuaTable> {
  if let Some(table) = lua.named_registry_value::<Option<LuaTable>>(MODULES_KEY)? {
    return Ok(table);
  }
  let table = lua.create_table()?;
  lua.set_named_registry_value(MODULES_KEY, &table)?;
  Ok(table)
}

/// Bindings of `module`, evaluating it the first time it is asked for.
pub(crate) fn load_module(lua: &Lua, state: &Rc<EvalState>, module: &str) -> LuaResult<LuaTable> {
  let modules = modules_table(lua)?;
  if let Some(bindings) = modules.get::<Option<LuaTable>>(module)? {
    return Ok(bindings);
  }

  {
    let mut loading = state.loading.borrow_mut();
    if let Some(start) = loading.iter().position(|m| m == module) {
      let mut cycle = loading[start..].to_vec();
      cycle.push(module.to_string());
      return Err(LuaError::external(EvalError::ImportCycle(cycle)));
    }
    loading.push(module.to_string());
  }

  let result = evaluate(lua, state, module);
  state.loading.borrow_mut().pop();

  let bindings = result?;
  modules.set(module, &bindings)?;
  Ok(bindings)
}

fn evaluate(lua: &Lua, state: &Rc<EvalState>, module: &str) -> LuaResult<LuaTable> {
  let path = state.project.module_name_to_path(module).map_err(LuaError::external)?;
  let source = fs::read(&path).map_err(|source| {
    LuaError::external(EvalError::Read {
      module: module.to_string(),
      source,
    })
  })?;
  let dir = path.parent().unwrap_or(Path::new("/"));
  debug!(module, path = ?path, "loading module");

  let env = module_env(lua, state, module, dir)?;
  let chunk = compile(lua, state, &path, &source, env.clone())?;
  chunk.call::<()>(())?;
  Ok(env)
}

fn module_env(lua: &Lua, state: &Rc<EvalState>, module: &str, dir: &Path) -> LuaResult<LuaTable> {
  let env = lua.create_table()?;
  env.raw_set("bramble", builtins_for(lua, state, dir)?)?;

  let mt = lua.create_table()?;
  mt.set("__index", lua.globals())?;
  mt.set(MODULE_MARKER, module)?;
  env.set_metatable(Some(mt))?;
  Ok(env)
}

fn compile(lua: &Lua, state: &EvalState, path: &Path, source: &[u8], env: LuaTable) -> LuaResult<LuaFunction> {
  let key = hash_bytes(source);
  let name = format!("@{}", path.display());

  let memoised = state.compiled.borrow().get(key.as_str()).cloned();
  let cache = state.store.module_cache();
  if let Some(bytecode) = memoised.or_else(|| cache.get(&key)) {
    match lua
      .load(&bytecode[..])
      .set_name(&name)
      .set_mode(ChunkMode::Binary)
      .set_environment(env.clone())
      .into_function()
    {
      Ok(chunk) => {
        trace!(path = ?path, "using compiled module");
        state.compiled.borrow_mut().insert(key.as_str().to_string(), bytecode);
        return Ok(chunk);
      }
      Err(e) => {
        warn!(path = ?path, error = %e, "discarding unusable compiled module");
        state.compiled.borrow_mut().remove(key.as_str());
        if let Err(e) = cache.evict(&key) {
          warn!(error = %e, "failed to evict module cache entry");
        }
      }
    }
  }

  let chunk = lua
    .load(source)
    .set_name(&name)
    .set_mode(ChunkMode::Text)
    .set_environment(env)
    .into_function()?;
  state.compilations.set(state.compilations.get() + 1);

  // keep debug info so errors still carry file:line
  let bytecode = chunk.dump(false);
  if let Err(e) = cache.put(&key, &bytecode) {
    warn!(path = ?path, error = %e, "failed to write module cache entry");
  }
  state.compiled.borrow_mut().insert(key.as_str().to_string(), bytecode);
  Ok(chunk)
}

/// `bramble.import(name)`: the bindings of another module.
pub(crate) fn create_import_fn(lua: &Lua, state: Rc<EvalState>) -> LuaResult<LuaFunction> {
  lua.create_function(move |lua, module: String| load_module(lua, &state, &module))
}
