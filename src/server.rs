//! WebSocket server
//!
//! [`WebSocketServer`] performs the HTTP/1.1 upgrade, keeps a registry of
//! the connections it created and runs one heartbeat for all of them.
//!
//! # Example
//!
//! ```ignore
//! use tokio::net::TcpListener;
//! use ws_wire::{Config, Event, WebSocketServer};
//!
//! let listener = TcpListener::bind("0.0.0.0:8080").await?;
//! let server = WebSocketServer::new(Config::default());
//!
//! server.serve(listener, |conn, mut events| async move {
//!     while let Some(msg) = events.next_message().await {
//!         conn.send_message(&msg).await.ok();
//!     }
//! }).await?;
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::Config;
use crate::connection::{Connection, Events};
use crate::error::{CloseReason, Error, Result};
use crate::handshake::{self, Rejection, UpgradeRequest};

struct ServerInner {
    config: Config,
    connections: Mutex<HashMap<u64, Connection>>,
    heartbeat: Mutex<Option<JoinHandle<()>>>,
    shutdown: watch::Sender<bool>,
}

impl Drop for ServerInner {
    fn drop(&mut self) {
        if let Some(heartbeat) = self.heartbeat.get_mut().take() {
            heartbeat.abort();
        }
    }
}

impl ServerInner {
    /// One heartbeat tick over every registered connection
    fn sweep(&self) {
        let mut connections = self.connections.lock();
        connections.retain(|_, conn| !conn.is_closed());

        let mut dead = Vec::new();
        for (id, conn) in connections.iter() {
            if conn.mark_awaiting_pong() {
                dead.push(*id);
            } else {
                let conn = conn.clone();
                tokio::spawn(async move {
                    let _ = conn.send_ping(&[]).await;
                });
            }
        }

        for id in dead {
            if let Some(conn) = connections.remove(&id) {
                warn!(id, "no pong since last heartbeat, terminating");
                conn.terminate();
            }
        }
    }
}

/// HTTP/1.1 WebSocket server
///
/// Cheap to clone; clones share the registry and heartbeat.
#[derive(Clone)]
pub struct WebSocketServer {
    inner: Arc<ServerInner>,
}

impl WebSocketServer {
    /// Create a server and start its heartbeat.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(config: Config) -> Self {
        let (shutdown, _) = watch::channel(false);
        let inner = Arc::new(ServerInner {
            config,
            connections: Mutex::new(HashMap::new()),
            heartbeat: Mutex::new(None),
            shutdown,
        });

        let heartbeat = spawn_heartbeat(Arc::downgrade(&inner), inner.config.heartbeat_interval);
        *inner.heartbeat.lock() = Some(heartbeat);

        Self { inner }
    }

    /// Get the server configuration
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Number of live connections owned by this server
    pub fn connection_count(&self) -> usize {
        self.inner
            .connections
            .lock()
            .values()
            .filter(|conn| !conn.is_closed())
            .count()
    }

    /// Whether [`shutdown`](Self::shutdown) has been called
    pub fn is_shutting_down(&self) -> bool {
        *self.inner.shutdown.borrow()
    }

    /// Upgrade a request that was already read by an HTTP layer.
    ///
    /// `head` holds any bytes received after the request head. On success
    /// the `101` response is written and the new connection is registered
    /// with the heartbeat. On failure the rejection response is written, the
    /// stream is shut down and [`Error::Rejected`] is returned.
    pub async fn upgrade<S>(
        &self,
        req: &UpgradeRequest,
        mut stream: S,
        head: Bytes,
    ) -> Result<(Connection, Events)>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let accepted = if self.is_shutting_down() {
            Err(Rejection::new(503, "server is shutting down"))
        } else {
            handshake::validate(req)
        };

        let accept_key = match accepted {
            Ok(key) => key,
            Err(rejection) => {
                warn!(
                    status = rejection.status,
                    reason = rejection.reason,
                    path = %req.path,
                    "rejecting upgrade"
                );
                reject(&mut stream, rejection).await;
                return Err(rejection.into());
            }
        };

        stream
            .write_all(&handshake::build_response(&accept_key))
            .await?;
        stream.flush().await?;

        let (conn, events) = Connection::server(stream, self.inner.config.clone(), head);
        debug!(id = conn.id(), path = %req.path, "upgrade complete");
        self.inner.connections.lock().insert(conn.id(), conn.clone());

        // Shutdown may have raced with the handshake
        if self.is_shutting_down() {
            let _ = conn.send_close(CloseReason::GOING_AWAY, "Server is closing").await;
        }

        Ok((conn, events))
    }

    /// Read the upgrade request from `stream` and upgrade it.
    ///
    /// Also returns the parsed request so the caller can route on its path.
    pub async fn accept<S>(&self, mut stream: S) -> Result<(Connection, Events, UpgradeRequest)>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let read = handshake::read_head(
            &mut stream,
            self.inner.config.max_handshake_size,
            UpgradeRequest::parse,
        )
        .await;

        let (req, head) = match read {
            Ok(parsed) => parsed,
            Err(e @ Error::InvalidHttp(_)) => {
                warn!(error = %e, "malformed upgrade request");
                reject(&mut stream, Rejection::new(400, "malformed request")).await;
                return Err(e);
            }
            Err(e) => return Err(e),
        };

        let (conn, events) = self.upgrade(&req, stream, head).await?;
        Ok((conn, events, req))
    }

    /// Serve WebSocket connections from a TCP listener
    ///
    /// Each accepted socket gets its own task that performs the upgrade and
    /// then runs `handler`. Returns once [`shutdown`](Self::shutdown) is
    /// called.
    pub async fn serve<F, Fut>(&self, listener: TcpListener, handler: F) -> Result<()>
    where
        F: Fn(Connection, Events) -> Fut + Clone + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut shutdown = self.inner.shutdown.subscribe();
        if let Ok(addr) = listener.local_addr() {
            info!(%addr, "websocket server listening");
        }

        loop {
            if *shutdown.borrow_and_update() {
                break;
            }

            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                accepted = listener.accept() => {
                    let (stream, addr) = accepted?;
                    let server = self.clone();
                    let handler = handler.clone();

                    tokio::spawn(async move {
                        match server.accept(stream).await {
                            Ok((conn, events, _req)) => handler(conn, events).await,
                            Err(e) => debug!(%addr, error = %e, "upgrade failed"),
                        }
                    });
                }
            }
        }

        info!("websocket server stopped");
        Ok(())
    }

    /// Stop the heartbeat and close every connection with `1001`.
    ///
    /// Also makes a running [`serve`](Self::serve) return and rejects
    /// further upgrades with `503`.
    pub async fn shutdown(&self) {
        self.inner.shutdown.send_replace(true);
        if let Some(heartbeat) = self.inner.heartbeat.lock().take() {
            heartbeat.abort();
        }

        let connections: Vec<Connection> = self
            .inner
            .connections
            .lock()
            .drain()
            .map(|(_, conn)| conn)
            .collect();
        info!(count = connections.len(), "closing connections");

        let mut closing = JoinSet::new();
        for conn in connections {
            closing.spawn(async move {
                let _ = conn
                    .send_close(CloseReason::GOING_AWAY, "Server is closing")
                    .await;
            });
        }
        while closing.join_next().await.is_some() {}
    }
}

fn spawn_heartbeat(server: Weak<ServerInner>, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            interval.tick().await;
            let Some(inner) = server.upgrade() else {
                break;
            };
            inner.sweep();
        }
    })
}

async fn reject<S>(stream: &mut S, rejection: Rejection)
where
    S: AsyncWrite + Unpin,
{
    let _ = stream.write_all(&rejection.response()).await;
    let _ = stream.shutdown().await;
}
