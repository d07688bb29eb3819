//! Lua evaluation of configuration modules.
//!
//! Configuration files are Lua with the `.bramble` extension. They are run
//! inside an [`EvalContext`], which exposes the `bramble` builtins and keeps
//! track of every derivation the code defines.
//!
//! # Submodules
//!
//! - [`runtime`] - evaluation contexts and the `bramble` table
//! - [`loaders`] - module environments, `bramble.import` and the compiled-module cache
//! - [`derivation`] - `bramble.derivation` and `bramble.fetch_url`
//! - [`os`] - builtins touching the host, gated after the first derivation
//! - [`assert`] - assertions and the reporters behind them
//! - [`value`] - what builtins accept from Lua

pub mod assert;
pub mod derivation;
pub mod loaders;
pub mod os;
pub mod runtime;
pub mod value;

pub use assert::{Collector, ErrorReporter, FailFast};
pub use runtime::{EvalContext, EvalError};
