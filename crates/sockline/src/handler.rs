//! Application-facing callback traits.
//!
//! The runtime consumes these capability sets instead of asking the
//! application to subclass anything: the application hands a handler
//! object to the client or server, and every inbound frame is routed to
//! the matching callback.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use sockline_wire::Format;

use crate::connection::Connection;

/// Callbacks one connection delivers its inbound traffic to.
///
/// All methods default to no-ops (or refusals, for the ones that answer),
/// so implementors override only what they serve. The runtime guarantees
/// that callbacks for one connection never run concurrently with each
/// other, and that no internal lock is held while a callback runs.
///
/// Callbacks may call back into the connection: fire-and-forget
/// operations (`execute`, `poke`, `advise`) and `disconnect` complete
/// inline. The synchronous operations (`request`, `start_advise`,
/// `stop_advise`) are answered by the same dispatch task that runs the
/// callbacks, so awaiting one *inside* a callback of the same connection
/// would starve its own reply — spawn a task for those instead.
#[async_trait]
pub trait ConnectionHandler: Send + Sync {
    /// The connection reached Open. The handle is delivered here so
    /// push-style operations (advise, in particular) can be issued later.
    async fn on_open(&self, connection: Arc<Connection>) {
        let _ = connection;
    }

    /// A peer command arrived. No reply is produced.
    async fn on_execute(&self, _topic: &str, _data: Bytes, _format: Format) {}

    /// A peer query arrived. Returning `None` refuses it, which reaches
    /// the peer as `Fail`; the connection stays open either way.
    async fn on_request(&self, _topic: &str, _item: &str, _format: Format) -> Option<Bytes> {
        None
    }

    /// A peer pushed a value without expecting an answer.
    async fn on_poke(&self, _topic: &str, _item: &str, _data: Bytes, _format: Format) {}

    /// The peer wants updates on `item`. Returning `true` accepts the
    /// subscription (echoed on the wire), `false` refuses it.
    async fn on_start_advise(&self, _topic: &str, _item: &str) -> bool {
        false
    }

    /// The peer cancels its subscription on `item`.
    async fn on_stop_advise(&self, _topic: &str, _item: &str) -> bool {
        false
    }

    /// One update for an item this side subscribed to.
    async fn on_advise(&self, _topic: &str, _item: &str, _data: Bytes, _format: Format) {}

    /// The connection left Open. Fired exactly once per connection,
    /// whether the teardown was local, peer-initiated, or an error.
    async fn on_disconnect(&self) {}
}

/// Accept-time callback a server consults for every connection attempt.
#[async_trait]
pub trait ServerHandler: Send + Sync {
    /// Accept or refuse a connection attempt on `topic`.
    ///
    /// Returning a handler accepts: the server echoes the topic and the
    /// returned handler receives the connection's traffic. Returning
    /// `None` refuses, which reaches the client as `Fail`.
    async fn on_accept_connection(&self, topic: &str) -> Option<Arc<dyn ConnectionHandler>>;
}
