//! What builtins accept from configuration code.
//!
//! Builtins never look at raw Lua types. They convert arguments into a
//! [`Capability`] and match on what the value can do.

use std::collections::{BTreeSet, HashSet};

use mlua::prelude::*;

use super::derivation::DerivationValue;
use crate::derivation::DerivationId;

/// Metatable field marking a table as the bindings of a module.
pub const MODULE_MARKER: &str = "__module";

#[derive(Debug, Clone)]
pub enum Capability {
  /// Strings, numbers and booleans.
  Stringable(String),
  /// A derivation. Also stringable, to its default output placeholder.
  Hashable(DerivationValue),
  Callable(LuaFunction),
  Module { name: String, bindings: LuaTable },
}

impl Capability {
  /// `None` for nil, plain tables and values no builtin accepts.
  pub fn of(value: &LuaValue) -> Option<Capability> {
    match value {
      LuaValue::String(s) => Some(Capability::Stringable(s.to_string_lossy())),
      LuaValue::Integer(i) => Some(Capability::Stringable(i.to_string())),
      LuaValue::Number(n) => Some(Capability::Stringable(n.to_string())),
      LuaValue::Boolean(b) => Some(Capability::Stringable(b.to_string())),
      LuaValue::Function(f) => Some(Capability::Callable(f.clone())),
      LuaValue::UserData(ud) => ud
        .borrow::<DerivationValue>()
        .ok()
        .map(|d| Capability::Hashable(d.clone())),
      LuaValue::Table(t) => module_name(t).map(|name| Capability::Module {
        name,
        bindings: t.clone(),
      }),
      _ => None,
    }
  }

  pub fn as_text(&self) -> Option<String> {
    match self {
      Capability::Stringable(s) => Some(s.clone()),
      Capability::Hashable(d) => Some(d.placeholder()),
      Capability::Callable(_) | Capability::Module { .. } => None,
    }
  }
}

/// Text form of `value`, or an error naming `what` was being converted.
pub fn to_text(value: &LuaValue, what: &str) -> LuaResult<String> {
  Capability::of(value)
    .and_then(|c| c.as_text())
    .ok_or_else(|| LuaError::external(format!("{what} must be a string or derivation, got {}", value.type_name())))
}

/// The module name stored on a bindings table.
pub fn module_name(table: &LuaTable) -> Option<String> {
  table.metatable()?.get::<Option<String>>(MODULE_MARKER).ok().flatten()
}

/// Every derivation reachable from `value` through plain tables.
pub fn collect_derivations(value: &LuaValue) -> LuaResult<BTreeSet<DerivationId>> {
  let mut found = BTreeSet::new();
  let mut seen = HashSet::new();
  collect_into(value, &mut found, &mut seen)?;
  Ok(found)
}

fn collect_into(
  value: &LuaValue,
  found: &mut BTreeSet<DerivationId>,
  seen: &mut HashSet<*const std::ffi::c_void>,
) -> LuaResult<()> {
  match Capability::of(value) {
    Some(Capability::Hashable(d)) => {
      found.insert(d.id);
    }
    Some(_) => {}
    None => {
      if let LuaValue::Table(t) = value
        && seen.insert(t.to_pointer())
      {
        for pair in t.pairs::<LuaValue, LuaValue>() {
          let (_, v) = pair?;
          collect_into(&v, found, seen)?;
        }
      }
    }
  }
  Ok(())
}
