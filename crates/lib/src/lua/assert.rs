//! `bramble.assert` and the reporters behind it.
//!
//! A run stops at the first failed assertion. A test run records every
//! failure of a test function and keeps going, so one test can report
//! several problems at once.

use std::cell::RefCell;
use std::rc::Rc;

use mlua::prelude::*;

use super::runtime::EvalState;

/// Where assertion failures go.
pub trait ErrorReporter {
  fn report(&self, message: &str);

  /// Whether a failure should also raise an error in the evaluator.
  fn fail_now(&self) -> bool;
}

/// Raises on the first failure.
#[derive(Debug, Default)]
pub struct FailFast;

impl ErrorReporter for FailFast {
  fn report(&self, _message: &str) {}

  fn fail_now(&self) -> bool {
    true
  }
}

/// Records failures and lets evaluation continue.
#[derive(Debug, Default)]
pub struct Collector {
  errors: RefCell<Vec<String>>,
}

impl Collector {
  pub fn new() -> Self {
    Self::default()
  }

  /// Failures reported since the last call.
  pub fn take_errors(&self) -> Vec<String> {
    std::mem::take(&mut *self.errors.borrow_mut())
  }
}

impl ErrorReporter for Collector {
  fn report(&self, message: &str) {
    self.errors.borrow_mut().push(message.to_string());
  }

  fn fail_now(&self) -> bool {
    false
  }
}

fn fail(state: &EvalState, message: String) -> LuaResult<()> {
  state.reporter.report(&message);
  if state.reporter.fail_now() {
    return Err(LuaError::external(message));
  }
  Ok(())
}

fn describe(lua: &Lua, value: &LuaValue) -> String {
  match value {
    LuaValue::String(s) => format!("{:?}", s.to_string_lossy()),
    other => lua
      .globals()
      .get::<LuaFunction>("tostring")
      .and_then(|f| f.call::<String>(other.clone()))
      .unwrap_or_else(|_| other.type_name().to_string()),
  }
}

pub fn create_assert_table(lua: &Lua, state: Rc<EvalState>) -> LuaResult<LuaTable> {
  let assert = lua.create_table()?;

  let eq_state = state.clone();
  let eq = lua.create_function(move |lua, (a, b, msg): (LuaValue, LuaValue, Option<String>)| {
    if !a.equals(&b)? {
      let detail = format!("{} != {}", describe(lua, &a), describe(lua, &b));
      let message = match msg {
        Some(msg) => format!("{msg}: {detail}"),
        None => detail,
      };
      fail(&eq_state, message)?;
    }
    Ok(())
  })?;
  assert.set("eq", eq)?;

  let ok_state = state.clone();
  let ok = lua.create_function(move |_, (value, msg): (LuaValue, Option<String>)| {
    if matches!(value, LuaValue::Nil | LuaValue::Boolean(false)) {
      fail(&ok_state, msg.unwrap_or_else(|| "assertion failed".to_string()))?;
    }
    Ok(())
  })?;
  assert.set("ok", ok)?;

  let fail_fn = lua.create_function(move |_, msg: Option<String>| {
    fail(&state, msg.unwrap_or_else(|| "failed".to_string()))
  })?;
  assert.set("fail", fail_fn)?;

  Ok(assert)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn collector_hands_out_errors_once() {
    let collector = Collector::new();
    collector.report("first");
    collector.report("second");
    assert!(!collector.fail_now());
    assert_eq!(collector.take_errors(), vec!["first", "second"]);
    assert!(collector.take_errors().is_empty());
  }

  #[test]
  fn describe_quotes_strings_only() {
    let lua = Lua::new();
    let s = LuaValue::String(lua.create_string("x").unwrap());
    assert_eq!(describe(&lua, &s), "\"x\"");
    assert_eq!(describe(&lua, &LuaValue::Integer(3)), "3");
    assert_eq!(describe(&lua, &LuaValue::Nil), "nil");
    assert_eq!(describe(&lua, &LuaValue::Boolean(true)), "true");
  }
}
