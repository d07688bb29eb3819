#![cfg(unix)]

use std::fs;

use predicates::prelude::*;

use super::common::{TestEnv, printed_paths};

const HELLO: &str = r#"
function hello()
  return bramble.derivation{
    name = "hello",
    builder = "/bin/sh",
    args = { "-c", "echo hello > $out/greeting" },
  }
end

function greet(name)
  return bramble.derivation{
    name = "greet",
    builder = "/bin/sh",
    args = { "-c", "echo " .. name .. " > $out/greeting" },
  }
end

function broken()
  local base = bramble.derivation{ name = "base", builder = "/bin/sh", args = { "-c", "echo oops >&2; exit 3" } }
  return bramble.derivation{ name = "top", builder = "/bin/sh", args = { "-c", "cat " .. base .. "/x" } }
end

function dirty()
  bramble.derivation{ name = "a", builder = "/bin/sh" }
  return bramble.cmd("true")
end
"#;

#[test]
fn run_builds_and_prints_output_path() {
  let env = TestEnv::project(&[("default.bramble", HELLO)]);

  let output = env.bramble_cmd().args(["run", ":hello"]).assert().success().get_output().clone();
  let paths = printed_paths(&output.stdout);
  assert_eq!(paths.len(), 1);
  assert_eq!(fs::read_to_string(paths[0].join("greeting")).unwrap(), "hello\n");
  assert!(paths[0].file_name().unwrap().to_string_lossy().ends_with("-hello"));
}

#[test]
fn second_run_uses_the_cache() {
  let env = TestEnv::project(&[("default.bramble", HELLO)]);

  let first = env
    .bramble_cmd()
    .args(["run", ":hello"])
    .assert()
    .success()
    .stderr(predicate::str::contains("Built: 1"))
    .get_output()
    .clone();

  let second = env
    .bramble_cmd()
    .args(["run", ":hello"])
    .assert()
    .success()
    .stderr(predicate::str::contains("Built: 0"))
    .stderr(predicate::str::contains("Cached: 1"))
    .get_output()
    .clone();

  assert_eq!(printed_paths(&first.stdout), printed_paths(&second.stdout));
}

#[test]
fn different_store_roots_agree_on_names() {
  let env = TestEnv::project(&[("default.bramble", HELLO)]);
  let other = env.temp.path().join("elsewhere");

  let a = env.bramble_cmd().args(["run", "hello"]).assert().success().get_output().clone();
  let b = env
    .bramble_cmd_with_store(&other)
    .args(["run", "hello"])
    .assert()
    .success()
    .get_output()
    .clone();

  let a = printed_paths(&a.stdout);
  let b = printed_paths(&b.stdout);
  assert_ne!(a[0], b[0]);
  assert_eq!(a[0].file_name(), b[0].file_name());
  assert_eq!(a[0].to_string_lossy().len(), b[0].to_string_lossy().len());
}

#[test]
fn arguments_reach_the_function() {
  let env = TestEnv::project(&[("default.bramble", HELLO)]);

  let output = env
    .bramble_cmd()
    .args(["run", ":greet", "world"])
    .assert()
    .success()
    .get_output()
    .clone();
  let paths = printed_paths(&output.stdout);
  assert_eq!(fs::read_to_string(paths[0].join("greeting")).unwrap(), "world\n");
}

#[test]
fn module_paths_resolve_from_cwd() {
  let env = TestEnv::project(&[
    ("default.bramble", ""),
    ("sub/default.bramble", HELLO),
    ("sub.bramble", "function hello() error('picked the file') end"),
  ]);

  env.bramble_cmd().args(["run", "sub:hello"]).assert().success();
  env
    .bramble_cmd()
    .args(["run", "example.com/proj/sub:hello"])
    .assert()
    .success();
}

#[test]
fn build_failures_exit_with_one() {
  let env = TestEnv::project(&[("default.bramble", HELLO)]);

  env
    .bramble_cmd()
    .args(["run", ":broken"])
    .assert()
    .code(1)
    .stdout(predicate::str::is_empty())
    .stderr(predicate::str::contains("base failed"))
    .stderr(predicate::str::contains("oops"))
    .stderr(predicate::str::contains("skipped"));
}

#[test]
fn missing_function_fails() {
  let env = TestEnv::project(&[("default.bramble", HELLO)]);

  env
    .bramble_cmd()
    .args(["run", ":nope"])
    .assert()
    .code(1)
    .stderr(predicate::str::contains("has no function \"nope\""));
}

#[test]
fn dirty_context_is_an_error() {
  let env = TestEnv::project(&[("default.bramble", HELLO)]);

  env
    .bramble_cmd()
    .args(["run", ":dirty"])
    .assert()
    .code(1)
    .stderr(predicate::str::contains(
      "build context is dirty, can't call cmd() after derivation()",
    ));
}

#[test]
fn too_many_colons_fails() {
  let env = TestEnv::project(&[("default.bramble", HELLO)]);

  env
    .bramble_cmd()
    .args(["run", "a:b:c"])
    .assert()
    .code(1)
    .stderr(predicate::str::contains("too many colons"));
}
