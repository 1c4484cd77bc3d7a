//! The contract between the variable runtime and the server.
//!
//! The runtime talks to the server through a handful of JSON endpoints
//! (computing derived variables, triggering actions, fetching task results, and
//! reading and writing backend stores). [`wire`] holds the request and response
//! bodies, [`ServerApi`] abstracts over how they are sent, and
//! [`reqwest::ReqwestClient`] sends them over HTTP.
//!
//! Every call carries the caller's
//! [`RequestExtras`](var_graph::extras::RequestExtras), which are merged into
//! the request headers. Two callers with different extras produce independent
//! requests.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

mod api;
pub mod error;
#[cfg(feature = "reqwest")]
pub mod reqwest;
pub mod wire;

pub use api::*;
pub use error::ClientError;
