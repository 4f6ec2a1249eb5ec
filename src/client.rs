//! Connecting-side endpoint.
//!
//! [`connect`] opens the WebSocket, spawns the connection actor, and runs
//! the control-channel handshake; it resolves only once the connection is
//! `Established` and the server configuration has been received. The
//! returned [`Client`] exposes the root-bound [`ChannelClient`] and joins
//! named channels with [`Client::channel`].

// Rust guideline compliant 2026-02

use anyhow::{anyhow, Result};
use serde_json::{json, Value};
use std::time::Duration;
use tokio::sync::oneshot;

use crate::channel::{ChannelClient, ClientError};
use crate::config::{ConnectOptions, TIMEOUT_KEY};
use crate::connection::{Command, ConnectionActor, ConnectionHandle, ControlCtx, ControlHandler};
use crate::handshake::{HandshakeEvent, HandshakeState};
use crate::protocol::{normalize_channel, Envelope, CONTROL_CHANNEL, MSG_CHANNEL, MSG_CONNECT};
use crate::ws;

/// Client side of the control channel. The handshake reply arrives through
/// the pending-reply table, so the only control traffic left to handle
/// here is unrecognized, a non-fatal protocol warning.
#[derive(Debug, Default)]
struct ClientControl;

impl ControlHandler for ClientControl {
    fn on_control(&mut self, envelope: Envelope, ctx: &mut ControlCtx<'_>) {
        log::warn!(
            "conn {}: unknown $control message {:?} ignored",
            ctx.connection_id(),
            envelope.name
        );
    }

    fn on_close(&mut self, _connection_id: u64) {}
}

/// An established connection, as seen by the initiating side.
pub struct Client {
    handle: ConnectionHandle,
    root: ChannelClient,
    config: Value,
    state: HandshakeState,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("state", &self.state)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Connect to a chansock server and run the handshake.
///
/// `url` may use the `ws://` or `http://` scheme (HTTP schemes are
/// rewritten). Resolves once the handshake reply has been received; the
/// server's advertised reply timeout is adopted for this connection's
/// requests.
///
/// # Errors
///
/// Returns an error if the WebSocket connect fails, the handshake times
/// out, or the connection closes before the handshake completes.
pub async fn connect(url: &str, options: ConnectOptions) -> Result<Client> {
    let ws_url = ws::http_to_ws_scheme(url);
    let (writer, reader) = ws::connect(&ws_url).await?;

    let (handle, actor) =
        ConnectionActor::new(writer, reader, options.reply_timeout, ClientControl);
    tokio::spawn(actor.run());

    let mut state = HandshakeState::Connecting;
    let root = handle.create_client(None);

    // The connect request goes through the normal pending-reply machinery;
    // if the connection dies before the reply, the callback is dropped and
    // the oneshot below errors out.
    let (cfg_tx, cfg_rx) = oneshot::channel::<Vec<Value>>();
    let issued = handle.command(Command::Request {
        client_id: root.id(),
        channel: Some(CONTROL_CHANNEL.to_owned()),
        name: MSG_CONNECT.to_owned(),
        data: vec![],
        callback: Box::new(move |data| {
            let _ = cfg_tx.send(data);
        }),
    });
    if !issued {
        return Err(anyhow!("connection closed before handshake"));
    }
    state = state.transition(HandshakeEvent::ConnectIssued)?;

    let data = match tokio::time::timeout(options.handshake_timeout, cfg_rx).await {
        Ok(Ok(data)) => data,
        Ok(Err(_)) => {
            // The callback was dropped without firing; tear the actor down
            // in case it outlived the request.
            handle.command(Command::Close);
            return Err(anyhow!("connection closed before the handshake reply"));
        }
        Err(_) => {
            // Abandoning the connection must not leak the actor task or
            // its socket.
            handle.command(Command::Close);
            return Err(anyhow!(
                "handshake timed out after {}ms",
                options.handshake_timeout.as_millis()
            ));
        }
    };
    state = state.transition(HandshakeEvent::Replied)?;

    let config = data.into_iter().next().unwrap_or(Value::Null);
    if let Some(ms) = config.get(TIMEOUT_KEY).and_then(Value::as_u64) {
        handle.command(Command::SetReplyTimeout(Duration::from_millis(ms)));
    } else {
        log::warn!(
            "conn {}: handshake payload carries no {TIMEOUT_KEY:?}, keeping {}ms",
            handle.id,
            options.reply_timeout.as_millis()
        );
    }

    log::info!("conn {}: established against {ws_url}", handle.id);
    Ok(Client {
        handle,
        root,
        config,
        state,
    })
}

/// Connect with default options.
///
/// # Errors
///
/// Same failure modes as [`connect`].
pub async fn connect_default(url: &str) -> Result<Client> {
    connect(url, ConnectOptions::default()).await
}

impl Client {
    /// The root-bound channel-scoped client.
    #[must_use]
    pub fn root(&self) -> &ChannelClient {
        &self.root
    }

    /// The configuration object the server sent in the handshake reply.
    #[must_use]
    pub fn config(&self) -> &Value {
        &self.config
    }

    /// Current handshake state.
    ///
    /// Reports `Closed` once the connection is gone, whether through
    /// [`Client::close`] or a remote close/transport error that terminated
    /// the connection actor.
    #[must_use]
    pub fn state(&self) -> HandshakeState {
        if self.state == HandshakeState::Closed || !self.handle.is_alive() {
            HandshakeState::Closed
        } else {
            self.state
        }
    }

    /// Join a named channel: sends the `"channel"` control message and
    /// returns a new [`ChannelClient`] bound to (this connection, `name`).
    ///
    /// A root alias (`""` or `"/"`) yields another root-bound view without
    /// sending a join.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Closed`] if the connection is gone.
    pub fn channel(&self, name: &str) -> Result<ChannelClient, ClientError> {
        let Some(channel) = normalize_channel(Some(name.to_owned())) else {
            return Ok(self.handle.create_client(None));
        };

        let client = self.handle.create_client(Some(channel.clone()));
        let join = Envelope::event(
            MSG_CHANNEL,
            Some(CONTROL_CHANNEL.to_owned()),
            vec![json!(channel)],
        );
        if !self.handle.command(Command::Send(join)) {
            return Err(ClientError::Closed);
        }
        Ok(client)
    }

    /// Close the connection. Pending replies are purged without invoking
    /// their callbacks; every channel-scoped client for this connection
    /// receives a local `"close"` event.
    pub fn close(&mut self) {
        if self.state != HandshakeState::Closed {
            self.handle.command(Command::Close);
            self.state = self
                .state
                .transition(HandshakeEvent::TransportClosed)
                .unwrap_or(HandshakeState::Closed);
        }
    }
}

/// Abandoning the client tears the connection down; the actor holds its
/// own command sender, so it would otherwise outlive every handle.
impl Drop for Client {
    fn drop(&mut self) {
        if self.state != HandshakeState::Closed {
            self.handle.command(Command::Close);
        }
    }
}
