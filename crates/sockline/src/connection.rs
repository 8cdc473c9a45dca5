//! Connection state machine and public operations.
//!
//! A [`Connection`] owns one stream exclusively from the moment the
//! handshake succeeds until teardown. Two gates serialize the transport:
//! the read gate (around the framed reader) is taken for every
//! whole-frame read, the write gate (around the framed writer) for every
//! whole-frame write, so frames from concurrent tasks never interleave
//! their bytes and the decoder never observes a partial frame left by
//! someone else. Neither gate is held while an application callback runs.
//!
//! # State machine
//!
//! ```text
//!             Handshaking
//!                │ (connect echoed)
//!                ▼
//!               Open ────── local disconnect ──────┐
//!                │                                 │
//!      (peer disconnect / i/o error / desync)      │
//!                │                                 │
//!                ▼                                 ▼
//!             Closing ───────────────────────► Closed
//! ```
//!
//! Leaving Open is monotonic and terminal; `on_disconnect` fires exactly
//! once, from the dispatch task, after the socket is shut down.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use bytes::Bytes;
use futures::SinkExt;
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::sync::{oneshot, Mutex};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use sockline_wire::{code, Format, Message, MessageCodec};

use crate::error::IpcError;
use crate::handler::ConnectionHandler;

/// Upper bound on the handshake phase, both sides.
pub(crate) const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Any bidirectional byte stream the runtime can host a connection on.
pub trait IoStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> IoStream for T {}

pub(crate) type BoxIo = Box<dyn IoStream>;
pub(crate) type WireReader = FramedRead<ReadHalf<BoxIo>, MessageCodec>;
pub(crate) type WireWriter = FramedWrite<WriteHalf<BoxIo>, MessageCodec>;

/// Splits a stream into its framed read and write halves.
pub(crate) fn frame_stream(io: BoxIo) -> (WireReader, WireWriter) {
    let (read, write) = tokio::io::split(io);
    (
        FramedRead::new(read, MessageCodec::new()),
        FramedWrite::new(write, MessageCodec::new()),
    )
}

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum State {
    /// Stream attached, Connect exchange not finished.
    Handshaking = 0,
    /// Handshake complete; operations are accepted.
    Open = 1,
    /// Teardown in progress; operations fail with `NotConnected`.
    Closing = 2,
    /// Socket shut down and `on_disconnect` delivered.
    Closed = 3,
}

impl State {
    fn from_u8(value: u8) -> State {
        match value {
            0 => State::Handshaking,
            1 => State::Open,
            2 => State::Closing,
            _ => State::Closed,
        }
    }
}

/// Which synchronous reply the registered waiter is entitled to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Expect {
    RequestReply,
    AdviseStart,
    AdviseStop,
}

impl Expect {
    /// `Fail` answers any synchronous operation; otherwise the reply code
    /// must match the operation.
    fn accepts(self, reply_code: u8) -> bool {
        if reply_code == code::FAIL {
            return true;
        }
        match self {
            Expect::RequestReply => reply_code == code::REQUEST_REPLY,
            Expect::AdviseStart => reply_code == code::ADVISE_START,
            Expect::AdviseStop => reply_code == code::ADVISE_STOP,
        }
    }
}

struct Pending {
    expect: Expect,
    tx: oneshot::Sender<Message>,
}

/// One end of an open IPC conversation, scoped to a topic for life.
///
/// All operations require the connection to be Open and fail with
/// [`IpcError::NotConnected`] otherwise. The handle is cheap to share
/// (`Arc`) and every operation takes `&self`.
pub struct Connection {
    topic: String,
    handler: Arc<dyn ConnectionHandler>,
    state: AtomicU8,
    pub(crate) reader: Mutex<WireReader>,
    writer: Mutex<WireWriter>,
    /// Serializes synchronous operations: at most one Request /
    /// StartAdvise / StopAdvise is in flight per connection, which is
    /// what makes "the reply is the very next frame" routable.
    txn: Mutex<()>,
    pending: StdMutex<Option<Pending>>,
    /// Teardown requested; the dispatch task completes it.
    pub(crate) cancel: CancellationToken,
    /// Teardown complete (`on_disconnect` delivered).
    closed: CancellationToken,
}

impl Connection {
    pub(crate) fn new(
        topic: String,
        handler: Arc<dyn ConnectionHandler>,
        reader: WireReader,
        writer: WireWriter,
    ) -> Arc<Connection> {
        Arc::new(Connection {
            topic,
            handler,
            state: AtomicU8::new(State::Handshaking as u8),
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            txn: Mutex::new(()),
            pending: StdMutex::new(None),
            cancel: CancellationToken::new(),
            closed: CancellationToken::new(),
        })
    }

    /// The topic agreed during the handshake.
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> State {
        State::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Whether operations are currently accepted.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.state() == State::Open
    }

    /// Resolves once teardown has completed and `on_disconnect` ran.
    pub async fn closed(&self) {
        self.closed.cancelled().await;
    }

    pub(crate) fn handler(&self) -> &Arc<dyn ConnectionHandler> {
        &self.handler
    }

    fn ensure_open(&self) -> Result<(), IpcError> {
        if self.is_open() {
            Ok(())
        } else {
            Err(IpcError::NotConnected)
        }
    }

    pub(crate) fn promote_open(&self) {
        let _ = self.state.compare_exchange(
            State::Handshaking as u8,
            State::Open as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// Open → Closing. Returns whether this caller won the transition and
    /// therefore owns the teardown side effects.
    pub(crate) fn begin_close(&self) -> bool {
        self.state
            .compare_exchange(
                State::Open as u8,
                State::Closing as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    pub(crate) fn mark_closed(&self) {
        self.state.store(State::Closed as u8, Ordering::Release);
        self.closed.cancel();
    }

    /// Sends one frame under the write gate.
    ///
    /// A write failure means the stream is gone: teardown is requested
    /// and the error surfaced to the caller.
    pub(crate) async fn send_frame(&self, msg: Message) -> Result<(), IpcError> {
        self.ensure_open()?;
        let mut writer = self.writer.lock().await;
        // The state may have moved while this task waited at the gate.
        self.ensure_open()?;
        if let Err(e) = writer.send(msg).await {
            drop(writer);
            self.cancel.cancel();
            return Err(IpcError::Wire(e));
        }
        Ok(())
    }

    /// Sends a synchronous operation and awaits its reply.
    ///
    /// The waiter is registered before the frame is written so the
    /// dispatch task can never see the reply first.
    async fn transact(&self, msg: Message, expect: Expect) -> Result<Message, IpcError> {
        self.ensure_open()?;
        let _txn = self.txn.lock().await;
        self.ensure_open()?;

        let (tx, rx) = oneshot::channel();
        {
            let mut slot = self.pending.lock().expect("pending slot poisoned");
            debug_assert!(slot.is_none(), "transaction gate admitted two waiters");
            *slot = Some(Pending { expect, tx });
        }

        if let Err(e) = self.send_frame(msg).await {
            self.pending.lock().expect("pending slot poisoned").take();
            return Err(e);
        }

        // A dropped sender means the connection tore down underneath us.
        rx.await.map_err(|_| IpcError::NotConnected)
    }

    /// Whether the registered waiter (if any) is entitled to a frame
    /// carrying `reply_code`.
    pub(crate) fn expecting(&self, reply_code: u8) -> bool {
        self.pending
            .lock()
            .expect("pending slot poisoned")
            .as_ref()
            .is_some_and(|p| p.expect.accepts(reply_code))
    }

    /// Hands `msg` to the registered waiter.
    pub(crate) fn deliver_reply(&self, msg: Message) {
        let taken = self.pending.lock().expect("pending slot poisoned").take();
        match taken {
            // The waiter may have given up (teardown race); nothing to do.
            Some(p) => {
                let _ = p.tx.send(msg);
            }
            None => debug!(topic = %self.topic, "reply arrived with no waiter"),
        }
    }

    /// Drops the registered waiter, if any, so its caller unblocks.
    pub(crate) fn drop_pending(&self) {
        self.pending.lock().expect("pending slot poisoned").take();
    }

    /// Closes the write half, best-effort.
    pub(crate) async fn close_writer(&self) {
        let mut writer = self.writer.lock().await;
        let _ = writer.close().await;
    }

    // ------------------------------------------------------------------
    // Public operations
    // ------------------------------------------------------------------

    /// Sends a command for the peer to carry out. Fire-and-forget.
    pub async fn execute(&self, data: impl Into<Bytes>, format: Format) -> Result<(), IpcError> {
        self.send_frame(Message::Execute {
            format,
            data: data.into(),
        })
        .await
    }

    /// Asks the peer for the value of `item`.
    ///
    /// Returns `Some(bytes)` with the peer's answer, or `None` when the
    /// peer refused the request (the connection stays open). The reply is
    /// delivered by this connection's dispatch task, so do not await this
    /// from inside one of this connection's own callbacks.
    pub async fn request(&self, item: &str, format: Format) -> Result<Option<Bytes>, IpcError> {
        let reply = self
            .transact(
                Message::Request {
                    format,
                    item: item.to_owned(),
                },
                Expect::RequestReply,
            )
            .await?;
        match reply {
            Message::RequestReply { data, .. } => Ok(Some(data)),
            Message::Fail { reason } => {
                debug!(item, %reason, "request refused by peer");
                Ok(None)
            }
            _ => Err(IpcError::Protocol("unexpected reply to request")),
        }
    }

    /// Pushes a value at the peer. Fire-and-forget.
    pub async fn poke(
        &self,
        item: &str,
        data: impl Into<Bytes>,
        format: Format,
    ) -> Result<(), IpcError> {
        self.send_frame(Message::Poke {
            format,
            item: item.to_owned(),
            data: data.into(),
        })
        .await
    }

    /// Subscribes to updates of `item`.
    ///
    /// `true` when the peer confirmed the subscription, `false` when it
    /// refused.
    pub async fn start_advise(&self, item: &str) -> Result<bool, IpcError> {
        let reply = self
            .transact(
                Message::AdviseStart {
                    item: item.to_owned(),
                },
                Expect::AdviseStart,
            )
            .await?;
        Ok(matches!(reply, Message::AdviseStart { .. }))
    }

    /// Cancels the subscription on `item`.
    pub async fn stop_advise(&self, item: &str) -> Result<bool, IpcError> {
        let reply = self
            .transact(
                Message::AdviseStop {
                    item: item.to_owned(),
                },
                Expect::AdviseStop,
            )
            .await?;
        Ok(matches!(reply, Message::AdviseStop { .. }))
    }

    /// Pushes one update for an item the peer subscribed to.
    /// Fire-and-forget.
    pub async fn advise(
        &self,
        item: &str,
        data: impl Into<Bytes>,
        format: Format,
    ) -> Result<(), IpcError> {
        self.send_frame(Message::Advise {
            format,
            item: item.to_owned(),
            data: data.into(),
        })
        .await
    }

    /// Tears the connection down. Idempotent.
    ///
    /// The first call from Open writes a Disconnect frame best-effort,
    /// closes the write half, and hands teardown to the dispatch task,
    /// which fires `on_disconnect` exactly once. Use [`Connection::closed`]
    /// to await completion.
    pub async fn disconnect(&self) {
        if !self.begin_close() {
            return;
        }
        {
            let mut writer = self.writer.lock().await;
            let _ = writer.send(Message::Disconnect).await;
            let _ = writer.close().await;
        }
        self.cancel.cancel();
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("topic", &self.topic)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
