//! Accepting-side endpoint: channel registry, accept loop, and the
//! server half of the control-channel handshake.
//!
//! A [`Server`] is configured up front: join handlers via
//! [`Server::channel`], the connection notification via
//! [`Server::on_connection`]. It is then bound with [`Server::listen`], which
//! spawns an accept loop and one connection actor per upgraded WebSocket.
//!
//! The channel registry is shared and read-mostly: registration may race
//! active connections, so lookups take a read lock for the duration of one
//! `"channel"` control dispatch.

// Rust guideline compliant 2026-02

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, RwLock};

use anyhow::{Context, Result};
use serde_json::Value;
use tokio::net::{TcpListener, ToSocketAddrs};
use tokio::task::JoinHandle;

use crate::channel::ChannelClient;
use crate::config::ServerOptions;
use crate::connection::{ConnectionActor, ControlCtx, ControlHandler};
use crate::handshake::HandshakeState;
use crate::protocol::{normalize_channel, Envelope, CONTROL_CHANNEL, MSG_CHANNEL, MSG_CONNECT};
use crate::ws;

/// Handler invoked with a freshly constructed channel-scoped client:
/// either a join handler (named channel) or the connection notification
/// (root client).
pub type JoinHandler = Arc<dyn Fn(ChannelClient) + Send + Sync>;

/// A client being tracked for one live connection.
struct ActiveEntry {
    connection_id: u64,
    client: ChannelClient,
}

/// Accepting-side endpoint. Cheap to clone; clones share the registry and
/// the active-client set.
#[derive(Clone)]
pub struct Server {
    options: ServerOptions,
    registry: Arc<RwLock<HashMap<String, Vec<JoinHandler>>>>,
    connection_handlers: Arc<RwLock<Vec<JoinHandler>>>,
    active: Arc<Mutex<Vec<ActiveEntry>>>,
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl Default for Server {
    fn default() -> Self {
        Self::new(ServerOptions::default())
    }
}

impl Server {
    /// Create a server with the given options.
    #[must_use]
    pub fn new(options: ServerOptions) -> Self {
        Self {
            options,
            registry: Arc::new(RwLock::new(HashMap::new())),
            connection_handlers: Arc::new(RwLock::new(Vec::new())),
            active: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Append a join handler for `name`. Order is registration order and
    /// is significant: every registered handler fires, in that order, for
    /// every join, each with its **own** channel-scoped client.
    pub fn channel(
        &self,
        name: impl Into<String>,
        handler: impl Fn(ChannelClient) + Send + Sync + 'static,
    ) {
        self.registry
            .write()
            .expect("registry lock poisoned")
            .entry(name.into())
            .or_default()
            .push(Arc::new(handler));
    }

    /// Register a handler for the `connection` notification, invoked with
    /// the root-bound client of every connection that completes the
    /// handshake.
    pub fn on_connection(&self, handler: impl Fn(ChannelClient) + Send + Sync + 'static) {
        self.connection_handlers
            .write()
            .expect("connection handlers lock poisoned")
            .push(Arc::new(handler));
    }

    /// Snapshot of every channel-scoped client currently tracked.
    #[must_use]
    pub fn clients(&self) -> Vec<ChannelClient> {
        self.active
            .lock()
            .expect("active set lock poisoned")
            .iter()
            .map(|entry| entry.client.clone())
            .collect()
    }

    /// Bind `addr` and start accepting connections.
    ///
    /// # Errors
    ///
    /// Returns an error if the TCP bind fails.
    pub async fn listen(&self, addr: impl ToSocketAddrs) -> Result<ServerHandle> {
        let listener = TcpListener::bind(addr).await.context("bind chansock listener")?;
        let local_addr = listener.local_addr().context("listener local address")?;
        log::info!("chansock server listening on {local_addr}");

        let server = self.clone();
        let accept_task = tokio::spawn(Self::accept_loop(listener, server));

        Ok(ServerHandle {
            local_addr,
            accept_task,
        })
    }

    /// Accept loop, run as a tokio task.
    async fn accept_loop(listener: TcpListener, server: Server) {
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    log::debug!("TCP connection from {peer}");
                    let server = server.clone();
                    tokio::spawn(async move {
                        match ws::accept(stream).await {
                            Ok((writer, reader)) => {
                                let control = ServerControl::new(server.clone());
                                let (_handle, actor) = ConnectionActor::new(
                                    writer,
                                    reader,
                                    server.options.reply_timeout,
                                    control,
                                );
                                actor.run().await;
                            }
                            Err(e) => {
                                log::warn!("WebSocket upgrade from {peer} failed: {e:#}");
                            }
                        }
                    });
                }
                Err(e) => {
                    log::error!("accept error: {e}");
                    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                }
            }
        }
    }

    fn join_handlers(&self, name: &str) -> Vec<JoinHandler> {
        self.registry
            .read()
            .expect("registry lock poisoned")
            .get(name)
            .cloned()
            .unwrap_or_default()
    }

    fn track(&self, connection_id: u64, client: ChannelClient) {
        self.active
            .lock()
            .expect("active set lock poisoned")
            .push(ActiveEntry {
                connection_id,
                client,
            });
    }

    /// Exact-identity removal: prune every client belonging to the closing
    /// connection, leaving all others untouched.
    fn untrack_connection(&self, connection_id: u64) {
        self.active
            .lock()
            .expect("active set lock poisoned")
            .retain(|entry| entry.connection_id != connection_id);
    }
}

/// Handle to a listening server.
#[derive(Debug)]
pub struct ServerHandle {
    local_addr: SocketAddr,
    accept_task: JoinHandle<()>,
}

impl ServerHandle {
    /// The bound local address (useful with port 0).
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting new connections. Established connections keep
    /// running until their transports close.
    pub fn shutdown(self) {
        self.accept_task.abort();
    }
}

// ─── Control handling ──────────────────────────────────────────────────────

/// Server half of the control channel, one per connection.
struct ServerControl {
    server: Server,
    state: HandshakeState,
}

impl ServerControl {
    fn new(server: Server) -> Self {
        Self {
            server,
            state: HandshakeState::Connecting,
        }
    }

    fn handle_connect(&mut self, envelope: Envelope, ctx: &mut ControlCtx<'_>) {
        if self.state.is_established() {
            log::warn!(
                "conn {}: duplicate \"connect\" ignored",
                ctx.connection_id()
            );
            return;
        }
        let Some(correlation_id) = envelope.reply_with else {
            log::warn!(
                "conn {}: \"connect\" without replyWith ignored",
                ctx.connection_id()
            );
            return;
        };

        // Reply with the server configuration, then surface the root client.
        ctx.send(Envelope::reply(
            MSG_CONNECT,
            Some(CONTROL_CHANNEL.to_owned()),
            vec![self.server.options.handshake_config()],
            correlation_id,
        ));
        self.state = HandshakeState::Established;

        let root = ctx.attach_client(None);
        self.server.track(ctx.connection_id(), root.clone());

        let handlers: Vec<JoinHandler> = self
            .server
            .connection_handlers
            .read()
            .expect("connection handlers lock poisoned")
            .clone();
        for handler in handlers {
            handler(root.clone());
        }
    }

    fn handle_join(&mut self, envelope: Envelope, ctx: &mut ControlCtx<'_>) {
        if !self.state.is_established() {
            log::warn!(
                "conn {}: \"channel\" join before handshake ignored",
                ctx.connection_id()
            );
            return;
        }
        let Some(Value::String(raw_name)) = envelope.data.into_iter().next() else {
            log::warn!(
                "conn {}: \"channel\" join without a channel name ignored",
                ctx.connection_id()
            );
            return;
        };
        let Some(name) = normalize_channel(Some(raw_name)) else {
            log::warn!(
                "conn {}: \"channel\" join for the root channel ignored",
                ctx.connection_id()
            );
            return;
        };

        let handlers = self.server.join_handlers(&name);
        if handlers.is_empty() {
            log::warn!(
                "conn {}: join for unregistered channel {name:?} ignored",
                ctx.connection_id()
            );
            return;
        }
        // One fresh client per handler: independent subscribers sharing
        // one connection.
        for handler in handlers {
            let client = ctx.attach_client(Some(name.clone()));
            self.server.track(ctx.connection_id(), client.clone());
            handler(client);
        }
    }
}

impl ControlHandler for ServerControl {
    fn on_control(&mut self, envelope: Envelope, ctx: &mut ControlCtx<'_>) {
        match envelope.name.as_str() {
            MSG_CONNECT => self.handle_connect(envelope, ctx),
            MSG_CHANNEL => self.handle_join(envelope, ctx),
            other => log::warn!(
                "conn {}: unknown $control message {other:?} ignored",
                ctx.connection_id()
            ),
        }
    }

    fn on_close(&mut self, connection_id: u64) {
        self.server.untrack_connection(connection_id);
        self.state = HandshakeState::Closed;
    }
}
