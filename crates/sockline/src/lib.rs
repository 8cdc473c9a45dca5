//! Topic-scoped IPC over stream sockets.
//!
//! Two processes connect on a named *topic* — over TCP anywhere, or a
//! Unix domain socket when the service name is a path — and then either
//! side issues typed operations at the other:
//!
//! - **Execute**: fire a command at the peer
//! - **Request**: ask for an item's value, answered synchronously
//! - **Poke**: push a value without expecting an answer
//! - **StartAdvise / Advise / StopAdvise**: a publish/subscribe loop on
//!   an item
//! - **Disconnect**: orderly teardown
//!
//! The wire format, message codec, and endpoint types live in
//! [`sockline_wire`], re-exported here as [`wire`].
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use async_trait::async_trait;
//! use bytes::Bytes;
//! use sockline::{make_connection, ConnectionHandler, Format, IpcError};
//!
//! struct Quiet;
//!
//! #[async_trait]
//! impl ConnectionHandler for Quiet {}
//!
//! # async fn run() -> Result<(), IpcError> {
//! let conn = make_connection(Some("localhost"), "4242", "IPC TEST", Arc::new(Quiet)).await?;
//! let reply = conn.request("ping", Format::PRIVATE).await?;
//! println!("peer said {reply:?}");
//! conn.disconnect().await;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod connection;
mod dispatch;
pub mod error;
pub mod handler;
pub mod server;

pub use client::make_connection;
pub use connection::{Connection, State};
pub use error::IpcError;
pub use handler::{ConnectionHandler, ServerHandler};
pub use server::Server;

pub use sockline_wire as wire;
pub use sockline_wire::{Endpoint, Format, Message, WireError};
