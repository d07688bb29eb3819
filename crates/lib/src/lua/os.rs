//! Evaluation-time builtins that touch the host: `bramble.cmd`,
//! `bramble.fs`, `bramble.input` and `bramble.args`.
//!
//! Everything with side effects here is refused once the context has
//! defined a derivation. A build step must not appear to depend on state
//! that was changed behind its back.

use std::collections::BTreeMap;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::process::Command;
use std::rc::Rc;

use mlua::prelude::*;
use tracing::{debug, info};

use super::runtime::EvalState;
use super::value::to_text;
use crate::util::fs::copy_tree;

struct CmdSpec {
  program: String,
  args: Vec<String>,
  env: BTreeMap<String, String>,
  dir: Option<PathBuf>,
}

fn parse_cmd(value: LuaValue) -> LuaResult<CmdSpec> {
  match value {
    LuaValue::Table(t) => {
      let mut argv = t
        .sequence_values::<LuaValue>()
        .map(|v| to_text(&v?, "cmd argument"))
        .collect::<LuaResult<Vec<_>>>()?
        .into_iter();
      let program = argv
        .next()
        .ok_or_else(|| LuaError::external("cmd() needs at least a program"))?;
      let mut env = BTreeMap::new();
      if let Some(table) = t.get::<Option<LuaTable>>("env")? {
        for pair in table.pairs::<String, LuaValue>() {
          let (key, value) = pair?;
          env.insert(key.clone(), to_text(&value, &format!("cmd env {key}"))?);
        }
      }
      Ok(CmdSpec {
        program,
        args: argv.collect(),
        env,
        dir: t.get::<Option<String>>("dir")?.map(PathBuf::from),
      })
    }
    other => Ok(CmdSpec {
      program: "/bin/sh".to_string(),
      args: vec!["-c".to_string(), to_text(&other, "cmd")?],
      env: BTreeMap::new(),
      dir: None,
    }),
  }
}

/// `bramble.cmd("script")` or `bramble.cmd{ "prog", "arg", env = {}, dir = "" }`.
///
/// Runs in `dir` unless the table names another directory, and returns
/// `{ stdout, stderr, code }`. A nonzero exit is an error.
pub fn create_cmd_fn(lua: &Lua, state: Rc<EvalState>, dir: PathBuf) -> LuaResult<LuaFunction> {
  lua.create_function(move |lua, value: LuaValue| {
    state.check_clean("cmd()")?;
    let spec = parse_cmd(value)?;
    let cwd = spec.dir.map(|d| dir.join(d)).unwrap_or_else(|| dir.clone());

    info!(program = %spec.program, args = ?spec.args, "running command");
    let output = Command::new(&spec.program)
      .args(&spec.args)
      .envs(&spec.env)
      .current_dir(&cwd)
      .output()
      .map_err(|e| LuaError::external(format!("failed to run {}: {e}", spec.program)))?;

    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
    if !output.status.success() {
      return Err(LuaError::external(format!(
        "command {} exited with {}: {}",
        spec.program,
        output.status.code().map_or("a signal".to_string(), |c| c.to_string()),
        stderr.trim_end()
      )));
    }

    let result = lua.create_table()?;
    result.set("stdout", stdout)?;
    result.set("stderr", stderr)?;
    result.set("code", output.status.code().unwrap_or(0))?;
    Ok(result)
  })
}

fn absolute(path: &str, builtin: &str) -> LuaResult<PathBuf> {
  let path = PathBuf::from(path);
  if !path.is_absolute() {
    return Err(LuaError::external(format!("{builtin} only accepts absolute paths, got {}", path.display())));
  }
  Ok(path)
}

/// `bramble.fs.cp(src..., dst)` and `bramble.fs.mkdir(path)`.
pub fn create_fs_table(lua: &Lua, state: Rc<EvalState>) -> LuaResult<LuaTable> {
  let fs = lua.create_table()?;

  let cp_state = state.clone();
  let cp = lua.create_function(move |_, paths: LuaVariadic<String>| {
    cp_state.check_clean("fs.cp()")?;
    if paths.len() < 2 {
      return Err(LuaError::external("fs.cp() needs a source and a destination"));
    }
    let paths = paths
      .iter()
      .map(|p| absolute(p, "fs.cp()"))
      .collect::<LuaResult<Vec<_>>>()?;
    let (dst, sources) = paths.split_last().ok_or_else(|| LuaError::external("fs.cp() needs a destination"))?;

    for src in sources {
      // copying several sources means copying into a directory
      let target = if sources.len() > 1 || dst.is_dir() {
        dst.join(src.file_name().unwrap_or_default())
      } else {
        dst.clone()
      };
      debug!(src = ?src, dst = ?target, "copying");
      copy_tree(src, &target).map_err(|e| LuaError::external(format!("fs.cp() {}: {e}", src.display())))?;
    }
    Ok(())
  })?;
  fs.set("cp", cp)?;

  let mkdir = lua.create_function(move |_, path: String| {
    state.check_clean("fs.mkdir()")?;
    let path = absolute(&path, "fs.mkdir()")?;
    std::fs::create_dir_all(&path).map_err(|e| LuaError::external(format!("fs.mkdir() {}: {e}", path.display())))
  })?;
  fs.set("mkdir", mkdir)?;

  Ok(fs)
}

/// `bramble.input(prompt?)`: one line from stdin without its line ending.
pub fn create_input_fn(lua: &Lua, state: Rc<EvalState>) -> LuaResult<LuaFunction> {
  lua.create_function(move |_, prompt: Option<String>| {
    state.check_clean("input()")?;
    if let Some(prompt) = prompt {
      let mut stderr = io::stderr();
      let _ = write!(stderr, "{prompt}");
      let _ = stderr.flush();
    }
    let mut line = String::new();
    io::stdin()
      .lock()
      .read_line(&mut line)
      .map_err(|e| LuaError::external(format!("input(): {e}")))?;
    Ok(line.trim_end_matches(['\n', '\r']).to_string())
  })
}

pub fn create_args_table(lua: &Lua, args: &[String]) -> LuaResult<LuaTable> {
  lua.create_sequence_from(args.iter().cloned())
}
