//! CLI integration tests: real projects, real stores, real builders.

mod common;
mod gc_tests;
mod run_tests;
mod test_tests;
