//! bramble-lib: content-addressed builds driven by Lua configuration.
//!
//! - `store`: the padded, content-addressed store and its metadata
//! - `project`: project discovery, module names and the lockfile
//! - `derivation`: build recipes, their identities and placeholders
//! - `build`: the derivation graph and the engine that realizes it
//! - `lua`: evaluation contexts and the `bramble` builtins
//! - `run`, `testing`, `gc`: the operations behind the CLI commands

pub mod build;
pub mod consts;
pub mod derivation;
pub mod gc;
pub mod lua;
pub mod project;
pub mod run;
pub mod store;
pub mod testing;
pub mod util;
