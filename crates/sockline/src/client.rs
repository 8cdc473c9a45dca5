//! Client side: endpoint resolution, connect, handshake.

use std::io;
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use tokio::time::timeout;
use tracing::debug;

use sockline_wire::{Endpoint, Message};

use crate::connection::{frame_stream, BoxIo, Connection, HANDSHAKE_TIMEOUT};
use crate::dispatch;
use crate::error::IpcError;
use crate::handler::ConnectionHandler;

/// Connects to `service` (a decimal port, or a socket path on Unix) and
/// performs the Connect handshake on `topic`.
///
/// `host` applies to TCP endpoints only and defaults to the local host.
/// On success the returned connection is Open and `handler` already
/// received `on_open`. A refusal by the server surfaces as
/// [`IpcError::HandshakeRejected`] carrying the server's reason; any I/O
/// failure on the way drops the socket and surfaces the error.
pub async fn make_connection(
    host: Option<&str>,
    service: &str,
    topic: &str,
    handler: Arc<dyn ConnectionHandler>,
) -> Result<Arc<Connection>, IpcError> {
    let endpoint = Endpoint::resolve(host, service)?;

    let io: BoxIo = match &endpoint {
        Endpoint::Tcp { host, port } => {
            let target = (host.as_deref().unwrap_or("localhost"), *port);
            Box::new(tokio::net::TcpStream::connect(target).await?)
        }
        #[cfg(unix)]
        Endpoint::Unix(path) => Box::new(tokio::net::UnixStream::connect(path).await?),
    };

    let (mut reader, mut writer) = frame_stream(io);
    writer
        .send(Message::Connect {
            topic: topic.to_owned(),
        })
        .await
        .map_err(IpcError::Wire)?;

    let reply = timeout(HANDSHAKE_TIMEOUT, reader.next())
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "handshake timed out"))?;

    match reply {
        Some(Ok(Message::Connect { topic: confirmed })) => {
            if confirmed != topic {
                return Err(IpcError::Protocol("peer confirmed a different topic"));
            }
            debug!(topic, endpoint = %endpoint, "connection open");
            let conn = Connection::new(topic.to_owned(), handler, reader, writer);
            conn.promote_open();
            dispatch::activate(conn.clone()).await;
            Ok(conn)
        }
        Some(Ok(Message::Fail { reason })) => {
            debug!(topic, %reason, "connection refused");
            Err(IpcError::HandshakeRejected(reason))
        }
        Some(Ok(_)) => Err(IpcError::Protocol("unexpected handshake reply")),
        Some(Err(e)) => Err(e.into()),
        None => Err(io::Error::from(io::ErrorKind::UnexpectedEof).into()),
    }
}
