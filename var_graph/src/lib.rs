//! The data model and reactive core of a server-driven UI runtime.
//!
//! A backend declares *variables*; the client holds their current values and
//! keeps them consistent as inputs change. This crate provides the pieces that
//! every other part of the runtime builds on:
//! 1. **Variables** ([`variable`]): a tagged union over plain values,
//!    server-derived values, URL-bound values, tabular data, and the
//!    loading/error state of another variable. Every variable carries a
//!    globally stable `uid`.
//! 2. **The Variable Store** ([`store`]): a process-wide map from a
//!    [`CellKey`](store::CellKey) (a `uid` plus the active
//!    [`RequestExtras`](extras::RequestExtras)) to a reactive
//!    [`Cell`](store::Cell) holding the current value, its status, and its
//!    subscribers.
//! 3. **The dependency graph** ([`graph`]): explicit edges from each input
//!    `uid` to the derived variables that read it. Writing to a cell marks
//!    every transitive dependent dirty in topological order, so that the next
//!    read recomputes it.
//!
//! ```rust
//! use serde_json::json;
//! use var_graph::{
//!     extras::RequestExtras,
//!     store::{CellKey, VariableStore},
//!     variable::{DerivedVariable, PlainVariable},
//! };
//!
//! let store = VariableStore::new();
//! let count = PlainVariable::new("count", json!(1));
//! let double = DerivedVariable::new("double", [count.clone().into()]);
//! store.register_derived(&double);
//!
//! let extras = RequestExtras::default();
//! let key = CellKey::new(count.uid.clone(), &extras);
//! store.register(&key, || json!(1));
//!
//! // writing `count` invalidates everything that depends on it
//! let dirty = store.set(&key, json!(2));
//! assert_eq!(dirty, vec![double.uid.clone()]);
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod error;
pub mod extras;
pub mod graph;
pub mod path;
pub mod store;
pub mod variable;

pub use error::{CellError, VarError};

/// Reexports frequently-used types.
pub mod prelude {
    pub use crate::{
        extras::RequestExtras,
        store::{CellEvent, CellKey, CellState, VariableStore},
        variable::{
            AnyVariable, CachePolicy, DataVariable, DerivedVariable,
            PathSegment, PlainVariable, StateProperty, StateVariable,
            UrlVariable,
        },
    };
}
