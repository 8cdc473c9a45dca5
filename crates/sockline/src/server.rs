//! Listener, accept loop, and the server side of the handshake.
//!
//! A [`Server`] binds one endpoint and spawns an accept loop. Every
//! accepted stream goes through the Connect handshake before the
//! application sees anything: the first frame must propose a topic, the
//! application accepts or refuses it, and only an echoed Connect promotes
//! the stream to an open [`Connection`].
//!
//! For filesystem endpoints the server owns the socket path: a stale file
//! from a previous run is removed before binding, the process creation
//! mask is tightened to owner-only while the socket file is created, and
//! the path is unlinked again on shutdown.

use std::io;
use std::net::SocketAddr;
#[cfg(unix)]
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex, Weak};

use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpSocket};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use sockline_wire::{Endpoint, Message};

use crate::connection::{frame_stream, BoxIo, Connection, HANDSHAKE_TIMEOUT};
use crate::dispatch;
use crate::error::IpcError;
use crate::handler::ServerHandler;

const ACCEPT_BACKLOG: u32 = 64;

enum Listener {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix(tokio::net::UnixListener),
}

/// A bound service endpoint producing [`Connection`]s.
///
/// Dropping the server stops the accept loop and removes the socket file;
/// [`Server::shutdown`] additionally disconnects the connections it
/// produced.
pub struct Server {
    inner: Arc<ServerInner>,
}

struct ServerInner {
    handler: Arc<dyn ServerHandler>,
    local_addr: Option<SocketAddr>,
    #[cfg(unix)]
    socket_path: Option<PathBuf>,
    cancel: CancellationToken,
    connections: StdMutex<Vec<Weak<Connection>>>,
}

impl Server {
    /// Binds `endpoint` and starts accepting.
    ///
    /// TCP listeners are bound with address reuse enabled so a restart on
    /// the same port is admitted.
    pub async fn bind(
        endpoint: Endpoint,
        handler: Arc<dyn ServerHandler>,
    ) -> Result<Server, IpcError> {
        let listener;
        let mut local_addr = None;
        #[cfg(unix)]
        let mut socket_path = None;

        match &endpoint {
            Endpoint::Tcp { host, port } => {
                let target = (host.as_deref().unwrap_or("0.0.0.0"), *port);
                let addr = tokio::net::lookup_host(target).await?.next().ok_or_else(|| {
                    io::Error::new(io::ErrorKind::AddrNotAvailable, "host resolved to nothing")
                })?;
                let socket = match addr {
                    SocketAddr::V4(_) => TcpSocket::new_v4()?,
                    SocketAddr::V6(_) => TcpSocket::new_v6()?,
                };
                socket.set_reuseaddr(true)?;
                socket.bind(addr)?;
                let tcp = socket.listen(ACCEPT_BACKLOG)?;
                let bound = tcp.local_addr()?;
                info!(addr = %bound, "listening");
                local_addr = Some(bound);
                listener = Listener::Tcp(tcp);
            }
            #[cfg(unix)]
            Endpoint::Unix(path) => {
                listener = Listener::Unix(bind_unix(path)?);
                info!(path = %path.display(), "listening");
                socket_path = Some(path.clone());
            }
        }

        let inner = Arc::new(ServerInner {
            handler,
            local_addr,
            #[cfg(unix)]
            socket_path,
            cancel: CancellationToken::new(),
            connections: StdMutex::new(Vec::new()),
        });
        tokio::spawn(accept_loop(listener, inner.clone()));
        Ok(Server { inner })
    }

    /// The actual bound address for TCP endpoints (useful when binding
    /// port 0).
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.local_addr
    }

    /// Stops accepting, removes the socket file, and disconnects the
    /// connections this server produced.
    pub async fn shutdown(&self) {
        self.inner.cancel.cancel();
        self.inner.unlink_socket();

        let live: Vec<Arc<Connection>> = {
            let mut conns = self.inner.connections.lock().expect("connection list poisoned");
            conns.drain(..).filter_map(|weak| weak.upgrade()).collect()
        };
        for conn in live {
            conn.disconnect().await;
            conn.closed().await;
        }
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        // The accept task holds its own reference to the inner state;
        // cancelling here is what lets it exit and release that.
        self.inner.cancel.cancel();
    }
}

impl ServerInner {
    fn register(&self, conn: &Arc<Connection>) {
        let mut conns = self.connections.lock().expect("connection list poisoned");
        conns.retain(|weak| weak.strong_count() > 0);
        conns.push(Arc::downgrade(conn));
    }

    fn unlink_socket(&self) {
        #[cfg(unix)]
        if let Some(path) = &self.socket_path {
            if let Err(e) = std::fs::remove_file(path) {
                if e.kind() != io::ErrorKind::NotFound {
                    debug!(path = %path.display(), error = %e, "socket file left behind");
                }
            }
        }
    }
}

impl Drop for ServerInner {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.unlink_socket();
    }
}

/// Binds a filesystem socket, owner-only.
///
/// A stale socket file would make the bind fail, so one left behind by a
/// previous run is removed first; only a removal failure other than
/// "absent" is fatal. The process creation mask is tightened while the
/// socket file comes into existence and restored right after.
#[cfg(unix)]
fn bind_unix(path: &Path) -> Result<tokio::net::UnixListener, IpcError> {
    use nix::sys::stat::{umask, Mode};

    match std::fs::remove_file(path) {
        Ok(()) => debug!(path = %path.display(), "removed stale socket file"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }

    let previous = umask(Mode::from_bits_truncate(0o077));
    let listener = tokio::net::UnixListener::bind(path);
    umask(previous);

    Ok(listener?)
}

async fn accept_loop(listener: Listener, inner: Arc<ServerInner>) {
    loop {
        let io: BoxIo = tokio::select! {
            () = inner.cancel.cancelled() => break,
            accepted = accept(&listener) => match accepted {
                Ok(io) => io,
                Err(e) => {
                    warn!(error = %e, "failed to accept connection");
                    continue;
                }
            },
        };

        let inner = inner.clone();
        tokio::spawn(async move {
            if let Err(e) = handshake(io, &inner).await {
                debug!(error = %e, "handshake failed");
            }
        });
    }
}

async fn accept(listener: &Listener) -> io::Result<BoxIo> {
    match listener {
        Listener::Tcp(l) => {
            let (stream, peer) = l.accept().await?;
            debug!(%peer, "accepted connection");
            Ok(Box::new(stream))
        }
        #[cfg(unix)]
        Listener::Unix(l) => {
            let (stream, _) = l.accept().await?;
            debug!("accepted local connection");
            Ok(Box::new(stream))
        }
    }
}

/// Server side of the Connect handshake.
///
/// The accepted stream must open with a Connect frame; the application
/// then accepts or refuses the topic. Refusals and malformed openings are
/// answered with Fail and the stream is dropped. If the echoed Connect
/// cannot be written the half-made connection is torn down rather than
/// left registered.
async fn handshake(io: BoxIo, inner: &Arc<ServerInner>) -> Result<(), IpcError> {
    let (mut reader, mut writer) = frame_stream(io);

    let first = timeout(HANDSHAKE_TIMEOUT, reader.next())
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "handshake timed out"))?;

    let topic = match first {
        Some(Ok(Message::Connect { topic })) => topic,
        Some(Ok(_)) => {
            let _ = writer
                .send(Message::Fail {
                    reason: "expected a connect frame".to_owned(),
                })
                .await;
            return Err(IpcError::Protocol("handshake did not begin with connect"));
        }
        Some(Err(e)) => {
            let _ = writer
                .send(Message::Fail {
                    reason: "malformed connect frame".to_owned(),
                })
                .await;
            return Err(e.into());
        }
        None => return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into()),
    };

    let Some(handler) = inner.handler.on_accept_connection(&topic).await else {
        debug!(%topic, "connection refused");
        let _ = writer
            .send(Message::Fail {
                reason: format!("topic {topic:?} refused"),
            })
            .await;
        return Ok(());
    };

    writer
        .send(Message::Connect {
            topic: topic.clone(),
        })
        .await
        .map_err(IpcError::Wire)?;

    debug!(%topic, "connection open");
    let conn = Connection::new(topic, handler, reader, writer);
    conn.promote_open();
    inner.register(&conn);
    dispatch::activate(conn).await;
    Ok(())
}
