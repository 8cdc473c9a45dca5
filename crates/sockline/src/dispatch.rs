//! Inbound frame dispatch.
//!
//! Every open connection is driven by one spawned task: take the read
//! gate, pull one whole frame, release the gate, route. Synchronous
//! replies owed to the peer are written from inside the routing under the
//! write gate; application callbacks run with no gate held and are never
//! invoked concurrently for the same connection.
//!
//! The task is also the single place teardown completes: whichever side
//! initiates it (local disconnect, peer disconnect, transport failure,
//! protocol violation), the loop exits, the socket is shut down, and
//! `on_disconnect` fires exactly once.

use std::sync::Arc;

use futures::StreamExt;
use tracing::{debug, warn};

use sockline_wire::{code, Message};

use crate::connection::Connection;

/// Why the dispatch loop stopped.
enum CloseReason {
    /// Local teardown request (disconnect, or a failed write).
    Cancelled,
    /// The peer sent a Disconnect frame.
    PeerDisconnect,
    /// The peer closed the stream without a Disconnect frame.
    PeerClosed,
    /// A frame arrived that the state machine does not accept.
    Protocol(&'static str),
    /// The inbound stream failed or desynchronized.
    Wire,
}

enum Flow {
    Continue,
    Close(CloseReason),
}

/// Delivers the open connection to its handler, then starts dispatch.
pub(crate) async fn activate(conn: Arc<Connection>) {
    conn.handler().on_open(conn.clone()).await;
    tokio::spawn(run(conn));
}

async fn run(conn: Arc<Connection>) {
    let reason = read_loop(&conn).await;
    finish(&conn, reason).await;
}

async fn read_loop(conn: &Arc<Connection>) -> CloseReason {
    loop {
        // The read gate is held for exactly one whole-frame read and
        // released before anything is routed.
        let frame = {
            let mut reader = conn.reader.lock().await;
            tokio::select! {
                biased;
                () = conn.cancel.cancelled() => return CloseReason::Cancelled,
                frame = reader.next() => frame,
            }
        };

        match frame {
            None => return CloseReason::PeerClosed,
            Some(Err(e)) => {
                warn!(topic = conn.topic(), error = %e, "inbound stream failed");
                send_fail(conn, "malformed frame").await;
                return CloseReason::Wire;
            }
            Some(Ok(msg)) => match route(conn, msg).await {
                Flow::Continue => {}
                Flow::Close(reason) => return reason,
            },
        }
    }
}

async fn route(conn: &Arc<Connection>, msg: Message) -> Flow {
    let topic = conn.topic();
    match msg {
        Message::Execute { format, data } => {
            conn.handler().on_execute(topic, data, format).await;
            Flow::Continue
        }

        Message::Request { format, item } => {
            let reply = match conn.handler().on_request(topic, &item, format).await {
                Some(data) => Message::RequestReply { format, item, data },
                None => Message::Fail {
                    reason: format!("no data for item {item:?}"),
                },
            };
            send_reply(conn, reply).await
        }

        Message::Poke { format, item, data } => {
            conn.handler().on_poke(topic, &item, data, format).await;
            Flow::Continue
        }

        // On a symmetric connection AdviseStart is either the echoed
        // confirmation of our own subscription or the peer subscribing to
        // us; a registered waiter claims it, otherwise it is inbound.
        Message::AdviseStart { item } => {
            if conn.expecting(code::ADVISE_START) {
                conn.deliver_reply(Message::AdviseStart { item });
                return Flow::Continue;
            }
            let reply = if conn.handler().on_start_advise(topic, &item).await {
                Message::AdviseStart { item }
            } else {
                Message::Fail {
                    reason: format!("advise on item {item:?} refused"),
                }
            };
            send_reply(conn, reply).await
        }

        Message::AdviseStop { item } => {
            if conn.expecting(code::ADVISE_STOP) {
                conn.deliver_reply(Message::AdviseStop { item });
                return Flow::Continue;
            }
            let reply = if conn.handler().on_stop_advise(topic, &item).await {
                Message::AdviseStop { item }
            } else {
                Message::Fail {
                    reason: format!("no advise loop on item {item:?}"),
                }
            };
            send_reply(conn, reply).await
        }

        Message::Advise { format, item, data } => {
            conn.handler().on_advise(topic, &item, data, format).await;
            Flow::Continue
        }

        Message::RequestReply { .. } => {
            if conn.expecting(code::REQUEST_REPLY) {
                conn.deliver_reply(msg);
                Flow::Continue
            } else {
                reject(conn, "unsolicited request reply").await
            }
        }

        Message::Fail { reason } => {
            if conn.expecting(code::FAIL) {
                conn.deliver_reply(Message::Fail { reason });
                Flow::Continue
            } else {
                warn!(topic, %reason, "unsolicited failure frame");
                reject(conn, "unsolicited failure frame").await
            }
        }

        Message::Disconnect => Flow::Close(CloseReason::PeerDisconnect),

        // Valid on the wire, but nothing in the dispatch contract
        // produces or accepts it in steady state.
        Message::AdviseRequest { .. } => reject(conn, "unsolicited advise request").await,

        Message::Connect { .. } => reject(conn, "connect frame on an open connection").await,
    }
}

/// Writes a reply owed to the peer; a failed write closes the connection.
async fn send_reply(conn: &Arc<Connection>, reply: Message) -> Flow {
    match conn.send_frame(reply).await {
        Ok(()) => Flow::Continue,
        Err(e) => {
            debug!(topic = conn.topic(), error = %e, "failed to write reply");
            Flow::Close(CloseReason::Wire)
        }
    }
}

/// Protocol violation: tell the peer best-effort, then close.
async fn reject(conn: &Arc<Connection>, context: &'static str) -> Flow {
    send_fail(conn, context).await;
    Flow::Close(CloseReason::Protocol(context))
}

async fn send_fail(conn: &Arc<Connection>, reason: &str) {
    let _ = conn
        .send_frame(Message::Fail {
            reason: reason.to_owned(),
        })
        .await;
}

/// Completes teardown: shuts the socket down, unblocks any waiter, and
/// fires `on_disconnect` exactly once before the state reaches Closed.
async fn finish(conn: &Arc<Connection>, reason: CloseReason) {
    conn.begin_close();
    conn.drop_pending();
    conn.close_writer().await;

    match reason {
        CloseReason::Cancelled => debug!(topic = conn.topic(), "connection closed locally"),
        CloseReason::PeerDisconnect => debug!(topic = conn.topic(), "peer disconnected"),
        CloseReason::PeerClosed => debug!(topic = conn.topic(), "peer closed the stream"),
        CloseReason::Protocol(context) => {
            warn!(topic = conn.topic(), context, "closing after protocol violation");
        }
        CloseReason::Wire => warn!(topic = conn.topic(), "closing after transport failure"),
    }

    conn.handler().on_disconnect().await;
    conn.mark_closed();
}
