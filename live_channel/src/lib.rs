#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! A client for the server's live channel: a persistent, reconnecting
//! connection that carries task notifications, streamed actions and backend
//! store updates.
//!
//! ```rust,no_run
//! use live_channel::{
//!     tungstenite::TungsteniteConnector, ChannelOptions, LiveChannel,
//! };
//!
//! # async fn run() -> live_channel::error::Result<()> {
//! let channel = LiveChannel::connect(
//!     ChannelOptions::new("ws://127.0.0.1:8000/api/core/ws"),
//!     TungsteniteConnector,
//! );
//! let channel_id = channel.ready().await?;
//!
//! // wait for a long-running task started by an HTTP request
//! channel.wait_for_task("task-id").await?;
//! # Ok(())
//! # }
//! ```
//!
//! The connection is supervised by a task spawned on [`any_spawner::Executor`],
//! which must be initialized first.

mod channel;
/// Opening connections.
pub mod connector;
/// Errors raised by the channel.
pub mod error;
pub mod message;

pub use channel::*;
#[cfg(feature = "tungstenite")]
pub use connector::tungstenite;
pub use error::ChannelError;
