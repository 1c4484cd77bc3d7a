#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! The client-side runtime of a server-driven UI: it resolves the variables a
//! page reads, keeps them in sync with browser storage and the server, and runs
//! the actions the page triggers.
//!
//! A [`Runtime`] ties together
//! - the [`VariableStore`](var_graph::store::VariableStore) and its dependency
//!   graph,
//! - the Dependency Resolver ([`Runtime::resolve`]),
//! - the Derived Variable Engine ([`engine`]), which caches server computations
//!   and coalesces identical concurrent requests,
//! - the Persistence Layer ([`persistence`]): storage-backed variables,
//!   cross-tab sync, and backend stores kept current by live channel pushes,
//! - the Action Executor ([`action`]).
//!
//! ```rust,no_run
//! # use std::sync::Arc;
//! # use var_client::reqwest::ReqwestClient;
//! use serde_json::json;
//! use var_runtime::prelude::*;
//!
//! # async fn run(api: ReqwestClient) -> var_runtime::error::Result<()> {
//! let runtime: Runtime = RuntimeConfig::builder().api(Arc::new(api)).build();
//! let extras = RequestExtras::default();
//!
//! let count = PlainVariable::new("count", json!(1));
//! let double = DerivedVariable::new("double", [count.clone().into()]);
//!
//! let value = runtime.resolve(&double.clone().into(), &extras).await?;
//! runtime.set(&count.into(), json!(2), &extras)?;
//! // `double` is dirty now, so this recomputes
//! let value = runtime.resolve(&double.into(), &extras).await?;
//! # Ok(())
//! # }
//! ```
//!
//! Background work (backend store fetches, debounced writes, channel listeners)
//! is spawned on [`any_spawner::Executor`], which must be initialized before a
//! runtime is built.

pub mod action;
pub mod engine;
pub mod error;
mod location;
pub mod notification;
pub mod persistence;
pub mod registry;
mod resolve;
mod runtime;

pub use location::Location;
pub use runtime::*;

/// Reexports frequently-used types.
pub mod prelude {
    pub use crate::{
        action::{ActionContext, ActionDef, ActionExecution, ActionPhase},
        error::RuntimeError,
        notification::{Notification, NotificationStatus},
        registry::Manifest,
        Location, Runtime, RuntimeConfig,
    };
    pub use var_graph::prelude::*;
}
