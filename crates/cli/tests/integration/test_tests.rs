use predicates::prelude::*;

use super::common::TestEnv;

const PASSING: &str = r#"
function test_math()
  bramble.assert.eq(2 + 2, 4)
end

function test_derivation_name()
  local d = bramble.derivation{ name = "thing", builder = "/bin/sh" }
  bramble.assert.eq(d.name, "thing")
end
"#;

const FAILING: &str = r#"
function test_several_problems()
  bramble.assert.eq(1, 2)
  bramble.assert.ok(false, "not ok")
end

function test_fine()
end
"#;

#[test]
fn passing_tests_succeed() {
  let env = TestEnv::project(&[("test_things.bramble", PASSING), ("helper.bramble", "")]);

  env
    .bramble_cmd()
    .arg("test")
    .assert()
    .success()
    .stderr(predicate::str::contains("example.com/proj/test_things:test_math"))
    .stderr(predicate::str::contains("Passed: 2"))
    .stderr(predicate::str::contains("Failed: 0"));
}

#[test]
fn failures_are_collected_and_reported() {
  let env = TestEnv::project(&[("test_things.bramble", PASSING), ("sub/thing_test.bramble", FAILING)]);

  env
    .bramble_cmd()
    .arg("test")
    .assert()
    .code(1)
    .stderr(predicate::str::contains("1 != 2"))
    .stderr(predicate::str::contains("not ok"))
    .stderr(predicate::str::contains("Passed: 3"))
    .stderr(predicate::str::contains("Failed: 1"));
}

#[test]
fn path_argument_limits_the_search() {
  let env = TestEnv::project(&[("test_things.bramble", PASSING), ("sub/thing_test.bramble", FAILING)]);

  env
    .bramble_cmd()
    .args(["test", "test_things.bramble"])
    .assert()
    .success()
    .stderr(predicate::str::contains("Passed: 2"));
}

#[test]
fn path_argument_may_omit_the_extension() {
  let env = TestEnv::project(&[("test_things.bramble", PASSING), ("sub/thing_test.bramble", FAILING)]);

  env
    .bramble_cmd()
    .args(["test", "test_things"])
    .assert()
    .success()
    .stderr(predicate::str::contains("Passed: 2"));
}

#[test]
fn fail_fast_stops_early() {
  let env = TestEnv::project(&[("a_test.bramble", FAILING), ("b_test.bramble", PASSING)]);

  env
    .bramble_cmd()
    .args(["test", "--fail-fast", "--jobs", "1"])
    .assert()
    .code(1)
    .stderr(predicate::str::contains("a_test:test_fine"))
    .stderr(predicate::str::contains("b_test").not())
    .stderr(predicate::str::contains("Passed: 1"))
    .stderr(predicate::str::contains("Failed: 1"));
}
