mod gc;
mod run;

pub use gc::cmd_gc;
pub use run::cmd_run;
pub use test::cmd_test;
