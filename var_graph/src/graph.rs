//! The explicit dependency graph between variables.
//!
//! Edges run from an input `uid` to every derived (or state) variable that
//! reads it. Writing to a variable walks its transitive dependents in
//! topological order, so that a derived variable is always invalidated after
//! every derived variable it depends on.

mod dependency;
mod node;

pub use dependency::*;
pub use node::*;
