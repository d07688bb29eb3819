//! `bramble.derivation{}` and `bramble.fetch_url{}`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use mlua::prelude::*;
use tracing::debug;

use super::runtime::EvalState;
use super::value::{Capability, to_text};
use crate::build::fetch::URL_ENV;
use crate::consts::DEFAULT_OUTPUT;
use crate::derivation::{Derivation, DerivationId, FETCH_URL_BUILDER, HashMode, fetch_url_name, output_placeholder};

/// A derivation as configuration code sees it.
///
/// Indexing by an output name gives that output's placeholder, and the value
/// itself stands for its default output wherever a string is expected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DerivationValue {
  pub id: DerivationId,
  pub name: String,
  pub outputs: Vec<String>,
}

impl DerivationValue {
  fn new(id: DerivationId, drv: &Derivation) -> Self {
    Self {
      id,
      name: drv.name.clone(),
      outputs: drv.outputs.clone(),
    }
  }

  fn default_output(&self) -> &str {
    if self.outputs.iter().any(|o| o == DEFAULT_OUTPUT) {
      DEFAULT_OUTPUT
    } else {
      self.outputs.first().map(String::as_str).unwrap_or(DEFAULT_OUTPUT)
    }
  }

  pub fn placeholder(&self) -> String {
    output_placeholder(&self.id, self.default_output())
  }
}

impl LuaUserData for DerivationValue {
  fn add_methods<M: LuaUserDataMethods<Self>>(methods: &mut M) {
    methods.add_meta_method(LuaMetaMethod::Index, |lua, this, key: String| {
      let value = match key.as_str() {
        "name" => LuaValue::String(lua.create_string(&this.name)?),
        "id" => LuaValue::String(lua.create_string(&this.id.0)?),
        output if this.outputs.iter().any(|o| o == output) => {
          LuaValue::String(lua.create_string(output_placeholder(&this.id, output))?)
        }
        _ => LuaValue::Nil,
      };
      Ok(value)
    });

    methods.add_meta_method(LuaMetaMethod::ToString, |_, this, ()| Ok(this.placeholder()));

    methods.add_meta_method(LuaMetaMethod::Eq, |_, this, other: LuaAnyUserData| {
      Ok(other.borrow::<DerivationValue>().is_ok_and(|o| o.id == this.id))
    });

    methods.add_meta_function(LuaMetaMethod::Concat, |_, (a, b): (LuaValue, LuaValue)| {
      Ok(format!("{}{}", to_text(&a, "concatenated value")?, to_text(&b, "concatenated value")?))
    });
  }
}

/// Add a finished derivation to the context and hand back its Lua value.
fn register_derivation(lua: &Lua, state: &EvalState, drv: Derivation) -> LuaResult<LuaAnyUserData> {
  let drv = drv.finalize().map_err(LuaError::external)?;
  let id = drv.id().map_err(LuaError::external)?;
  debug!(derivation = %id, name = %drv.name, "derivation defined");

  let value = DerivationValue::new(id.clone(), &drv);
  state.derivations.borrow_mut().insert(id, drv);
  state.called_derivation.set(true);
  lua.create_userdata(value)
}

/// `bramble.derivation{ name, builder, args, env, sources, outputs, sha256 }`.
///
/// Relative source paths are taken from `dir`, the directory of the module
/// the function belongs to.
pub fn create_derivation_fn(lua: &Lua, state: Rc<EvalState>, dir: PathBuf) -> LuaResult<LuaFunction> {
  lua.create_function(move |lua, spec: LuaTable| {
    let name: String = spec
      .get::<Option<String>>("name")?
      .ok_or_else(|| LuaError::external("derivation requires a 'name' field"))?;
    let builder = to_text(&spec.get::<LuaValue>("builder")?, "derivation builder")?;

    let mut drv = Derivation::new(name, builder);

    if let Some(args) = spec.get::<Option<LuaTable>>("args")? {
      drv.args = args
        .sequence_values::<LuaValue>()
        .map(|v| to_text(&v?, "derivation argument"))
        .collect::<LuaResult<_>>()?;
    }

    if let Some(env) = spec.get::<Option<LuaTable>>("env")? {
      for pair in env.pairs::<String, LuaValue>() {
        let (key, value) = pair?;
        let value = to_text(&value, &format!("env value {key}"))?;
        drv.env.insert(key, value);
      }
    }

    if let Some(outputs) = spec.get::<Option<LuaTable>>("outputs")? {
      drv.outputs = outputs.sequence_values::<String>().collect::<LuaResult<_>>()?;
    }

    if let Some(sha256) = spec.get::<Option<String>>("sha256")? {
      drv.hash_mode = HashMode::Fixed { sha256 };
    }

    if let Some(sources) = spec.get::<Option<LuaTable>>("sources")? {
      drv.sources = add_sources(&state, &dir, sources)?;
    }

    register_derivation(lua, &state, drv)
  })
}

/// Import each source into the store. Array entries keep their file name,
/// keyed entries are renamed to the key.
fn add_sources(state: &EvalState, dir: &Path, sources: LuaTable) -> LuaResult<BTreeMap<String, String>> {
  let mut added = BTreeMap::new();
  for pair in sources.pairs::<LuaValue, String>() {
    let (key, path) = pair?;
    let path = dir.join(path);
    let file_name = match key {
      LuaValue::String(s) => s.to_string_lossy(),
      _ => path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| LuaError::external(format!("source {} has no file name", path.display())))?,
    };
    let entry = state.store.add_path(&path, &file_name).map_err(LuaError::external)?;
    added.insert(file_name, entry);
  }
  Ok(added)
}

/// `bramble.fetch_url{ url, sha256? }` or `bramble.fetch_url(url)`.
///
/// Without a hash, a pin in the project lockfile is used when there is one.
pub fn create_fetch_url_fn(lua: &Lua, state: Rc<EvalState>) -> LuaResult<LuaFunction> {
  lua.create_function(move |lua, spec: LuaValue| {
    let (url, sha256, name) = match &spec {
      LuaValue::Table(t) => (
        t.get::<Option<String>>("url")?,
        t.get::<Option<String>>("sha256")?,
        t.get::<Option<String>>("name")?,
      ),
      other => match Capability::of(other) {
        Some(Capability::Stringable(url)) => (Some(url), None, None),
        _ => (None, None, None),
      },
    };
    let url = url.ok_or_else(|| LuaError::external("fetch_url requires a 'url'"))?;

    let sha256 = match sha256 {
      Some(sha256) => Some(sha256),
      None => state.project.lockfile().get(&url).map_err(LuaError::external)?,
    };

    let mut drv = Derivation::new(name.unwrap_or_else(|| fetch_url_name(&url)), FETCH_URL_BUILDER);
    drv.env.insert(URL_ENV.to_string(), url);
    if let Some(sha256) = sha256 {
      drv.hash_mode = HashMode::Fixed { sha256 };
    }

    register_derivation(lua, &state, drv)
  })
}
