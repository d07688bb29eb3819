use std::fs;

use predicates::prelude::*;

use super::common::{TestEnv, printed_paths};

#[test]
fn gc_on_a_fresh_store_succeeds() {
  let env = TestEnv::project(&[]);

  env
    .bramble_cmd()
    .arg("gc")
    .assert()
    .success()
    .stderr(predicate::str::contains("Garbage collection complete"))
    .stderr(predicate::str::contains("Entries removed: 0"));
}

#[cfg(unix)]
#[test]
fn gc_keeps_what_a_run_registered() {
  let env = TestEnv::project(&[(
    "default.bramble",
    r#"
function hello()
  return bramble.derivation{ name = "hello", builder = "/bin/sh", args = { "-c", "echo hi > $out/x" } }
end
"#,
  )]);

  let output = env.bramble_cmd().args(["run", ":hello"]).assert().success().get_output().clone();
  let built = printed_paths(&output.stdout).remove(0);

  // an entry nobody refers to
  let store_dir = built.parent().unwrap().to_path_buf();
  fs::write(store_dir.join("0123456789abcdef0123456789abcdef-stray"), "stray").unwrap();

  env
    .bramble_cmd()
    .args(["gc", "--dry-run"])
    .assert()
    .success()
    .stdout(predicate::str::contains("-stray"))
    .stderr(predicate::str::contains("Dry run"));
  assert!(store_dir.join("0123456789abcdef0123456789abcdef-stray").exists());

  env
    .bramble_cmd()
    .arg("gc")
    .assert()
    .success()
    .stderr(predicate::str::contains("Entries removed: 1"));
  assert!(!store_dir.join("0123456789abcdef0123456789abcdef-stray").exists());
  assert!(built.join("x").exists());
}
