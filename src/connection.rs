//! Per-connection actor: owns one WebSocket and every piece of mutable
//! state scoped to it.
//!
//! # Architecture
//!
//! ```text
//! ChannelClient handles ──commands (mpsc)──►┐
//!                                           ▼
//! WsReader ──frames──► ConnectionActor ──► WsWriter
//!                           │
//!            ┌──────────────┼─────────────────┐
//!            ▼              ▼                 ▼
//!      pending-reply   control handler   local dispatch
//!      table (replyTo) ($control)        (channel-filtered)
//! ```
//!
//! The actor processes incoming frames and handle commands one at a time,
//! so the correlation-id counter, the pending-reply table, and the attached
//! client registrations are never touched concurrently. Request timers are
//! spawned sleep tasks that message the actor back with `Expire`; mutation
//! still happens only inside the actor turn.
//!
//! Correlation ids are allocated here, connection-wide, so concurrently
//! outstanding requests issued from different channel-scoped clients on the
//! same connection cannot collide.

// Rust guideline compliant 2026-02

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;

use crate::channel::{ChannelClient, Reply};
use crate::protocol::Envelope;
use crate::ws::{WsMessage, WsReader, WsWriter};

/// Local event dispatched to the issuing client when a request expires.
/// Carries the original outgoing envelope (as JSON) for diagnostics.
pub const EVENT_TIMEOUT: &str = "timeout";

/// Local event dispatched to every attached client on a transport error.
pub const EVENT_ERROR: &str = "error";

/// Local event dispatched to every attached client when the connection
/// closes.
pub const EVENT_CLOSE: &str = "close";

/// One-shot callback fulfilled with the reply's `data`.
pub(crate) type ReplyCallback = Box<dyn FnOnce(Vec<Value>) + Send + 'static>;

/// Listener for locally dispatched events. The second argument is present
/// when the incoming envelope carried `replyWith`.
pub(crate) type EventListener = Box<dyn Fn(Vec<Value>, Option<Reply>) + Send + Sync + 'static>;

/// Commands accepted by the connection actor.
pub(crate) enum Command {
    /// Encode and write an envelope (fire-and-forget path).
    Send(Envelope),
    /// Allocate a correlation id, register a pending reply, arm its timer,
    /// and send the request envelope.
    Request {
        client_id: u64,
        channel: Option<String>,
        name: String,
        data: Vec<Value>,
        callback: ReplyCallback,
    },
    /// Attach a channel-scoped client created outside the actor.
    Attach {
        client_id: u64,
        channel: Option<String>,
    },
    /// Register a local listener on an attached client.
    Listen {
        client_id: u64,
        name: String,
        listener: EventListener,
    },
    /// Adopt a new reply timeout (server-specified value from the
    /// handshake payload).
    SetReplyTimeout(Duration),
    /// A request timer fired; expire the pending reply if still present.
    Expire(String),
    /// Close the connection.
    Close,
}

/// A request awaiting its reply.
struct PendingReply {
    /// Client that issued the request (target of the `timeout` event).
    client_id: u64,
    /// Invoked exactly once with the reply's `data`, or dropped uninvoked.
    callback: ReplyCallback,
    /// Armed timer task; aborted on fulfilment and on close.
    timer: JoinHandle<()>,
    /// When the request was sent.
    created: Instant,
    /// The outgoing envelope, kept for the `timeout` notification.
    envelope: Envelope,
}

/// A channel-scoped client attached to this connection.
struct ClientRegistration {
    client_id: u64,
    channel: Option<String>,
    listeners: HashMap<String, Vec<EventListener>>,
}

/// Hook for `$control` envelopes; the server and client sides differ only
/// here.
pub(crate) trait ControlHandler: Send + 'static {
    /// Handle a decoded control envelope. Replies and client attachment go
    /// through `ctx`; they are applied when the handler returns.
    fn on_control(&mut self, envelope: Envelope, ctx: &mut ControlCtx<'_>);

    /// The connection reached its terminal state; release any server-side
    /// tracking for it.
    fn on_close(&mut self, connection_id: u64);
}

/// Actor internals exposed to a [`ControlHandler`] for one control turn.
pub(crate) struct ControlCtx<'a> {
    handle: &'a ConnectionHandle,
    clients: &'a mut Vec<ClientRegistration>,
    outgoing: Vec<Envelope>,
}

impl ControlCtx<'_> {
    /// Id of the connection this turn belongs to.
    pub(crate) fn connection_id(&self) -> u64 {
        self.handle.id
    }

    /// Construct a new channel-scoped client bound to `channel` and attach
    /// it to this connection.
    pub(crate) fn attach_client(&mut self, channel: Option<String>) -> ChannelClient {
        let client_id = self.handle.next_client_id();
        self.clients.push(ClientRegistration {
            client_id,
            channel: channel.clone(),
            listeners: HashMap::new(),
        });
        ChannelClient::new(client_id, channel, self.handle.tx.clone())
    }

    /// Queue an envelope to be written once the handler returns.
    pub(crate) fn send(&mut self, envelope: Envelope) {
        self.outgoing.push(envelope);
    }
}

/// Cloneable handle to a connection actor.
#[derive(Clone)]
pub(crate) struct ConnectionHandle {
    /// Connection identity; unique per process, used for exact-match
    /// removal from server-side tracking.
    pub(crate) id: u64,
    tx: UnboundedSender<Command>,
    next_client_id: Arc<AtomicU64>,
}

impl ConnectionHandle {
    fn next_client_id(&self) -> u64 {
        self.next_client_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Send a command to the actor. Returns `false` when the actor is gone.
    pub(crate) fn command(&self, cmd: Command) -> bool {
        self.tx.send(cmd).is_ok()
    }

    /// Whether the actor task is still running.
    pub(crate) fn is_alive(&self) -> bool {
        !self.tx.is_closed()
    }

    /// Construct a channel-scoped client and attach it to the connection.
    pub(crate) fn create_client(&self, channel: Option<String>) -> ChannelClient {
        let client_id = self.next_client_id();
        let _ = self.tx.send(Command::Attach {
            client_id,
            channel: channel.clone(),
        });
        ChannelClient::new(client_id, channel, self.tx.clone())
    }
}

/// What one `select!` turn produced.
enum Turn {
    Command(Option<Command>),
    Frame(Option<anyhow::Result<WsMessage>>),
}

/// One physical connection's actor. Create with [`ConnectionActor::new`],
/// then drive with [`ConnectionActor::run`].
pub(crate) struct ConnectionActor<H: ControlHandler> {
    handle: ConnectionHandle,
    writer: WsWriter,
    reader: WsReader,
    cmd_rx: UnboundedReceiver<Command>,
    /// Monotonic correlation-id counter; ids are never reused within the
    /// connection's lifetime.
    seq: u64,
    pending: HashMap<String, PendingReply>,
    clients: Vec<ClientRegistration>,
    reply_timeout: Duration,
    control: H,
}

/// Process-wide connection-id allocator.
static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

impl<H: ControlHandler> ConnectionActor<H> {
    /// Wrap a transport in an actor. Returns the handle and the actor; the
    /// caller decides where the actor runs (spawned task or awaited
    /// directly from an accept task).
    pub(crate) fn new(
        writer: WsWriter,
        reader: WsReader,
        reply_timeout: Duration,
        control: H,
    ) -> (ConnectionHandle, Self) {
        let (tx, cmd_rx) = mpsc::unbounded_channel();
        let handle = ConnectionHandle {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            tx,
            next_client_id: Arc::new(AtomicU64::new(1)),
        };
        let actor = Self {
            handle: handle.clone(),
            writer,
            reader,
            cmd_rx,
            seq: 0,
            pending: HashMap::new(),
            clients: Vec::new(),
            reply_timeout,
            control,
        };
        (handle, actor)
    }

    /// Drive the connection until close. Frames and commands are handled
    /// one at a time; local dispatch never blocks on application handlers.
    pub(crate) async fn run(mut self) {
        loop {
            // Biased: queued commands drain before the next frame, so a
            // listener registered during a control turn is attached before
            // any later frame is dispatched.
            let turn = tokio::select! {
                biased;
                cmd = self.cmd_rx.recv() => Turn::Command(cmd),
                frame = self.reader.recv() => Turn::Frame(frame),
            };

            match turn {
                Turn::Command(Some(Command::Close)) | Turn::Command(None) => {
                    log::debug!("conn {}: close requested", self.handle.id);
                    self.shutdown(None).await;
                    return;
                }
                Turn::Command(Some(cmd)) => {
                    if let Err(e) = self.handle_command(cmd).await {
                        log::warn!("conn {}: write failed: {e:#}", self.handle.id);
                        self.shutdown(Some(format!("{e:#}"))).await;
                        return;
                    }
                }
                Turn::Frame(Some(Ok(WsMessage::Text(text)))) => {
                    if let Err(e) = self.handle_frame(&text).await {
                        log::warn!("conn {}: write failed: {e:#}", self.handle.id);
                        self.shutdown(Some(format!("{e:#}"))).await;
                        return;
                    }
                }
                Turn::Frame(Some(Ok(WsMessage::Ping(data)))) => {
                    if self.writer.send_pong(data).await.is_err() {
                        self.shutdown(None).await;
                        return;
                    }
                }
                Turn::Frame(Some(Ok(WsMessage::Binary(_)))) => {
                    // The protocol is JSON text frames only.
                    log::warn!("conn {}: binary frame ignored", self.handle.id);
                }
                Turn::Frame(Some(Ok(WsMessage::Close { code, reason }))) => {
                    log::info!(
                        "conn {}: peer closed (code {code}, reason {reason:?})",
                        self.handle.id
                    );
                    self.shutdown(None).await;
                    return;
                }
                Turn::Frame(Some(Err(e))) => {
                    log::warn!("conn {}: transport error: {e:#}", self.handle.id);
                    self.shutdown(Some(format!("{e:#}"))).await;
                    return;
                }
                Turn::Frame(None) => {
                    self.shutdown(None).await;
                    return;
                }
            }
        }
    }

    // ── Outbound path ───────────────────────────────────────────────────────

    async fn handle_command(&mut self, cmd: Command) -> anyhow::Result<()> {
        match cmd {
            Command::Send(envelope) => self.write(&envelope).await?,
            Command::Request {
                client_id,
                channel,
                name,
                data,
                callback,
            } => {
                let id = self.next_correlation_id();
                let envelope = Envelope::request(name, channel, data, id.clone());
                let timer = self.arm_timer(id.clone());
                self.pending.insert(
                    id,
                    PendingReply {
                        client_id,
                        callback,
                        timer,
                        created: Instant::now(),
                        envelope: envelope.clone(),
                    },
                );
                self.write(&envelope).await?;
            }
            Command::Attach { client_id, channel } => {
                self.clients.push(ClientRegistration {
                    client_id,
                    channel,
                    listeners: HashMap::new(),
                });
            }
            Command::Listen {
                client_id,
                name,
                listener,
            } => match self.clients.iter_mut().find(|c| c.client_id == client_id) {
                Some(client) => client.listeners.entry(name).or_default().push(listener),
                None => log::warn!(
                    "conn {}: listener for unattached client {client_id}",
                    self.handle.id
                ),
            },
            Command::SetReplyTimeout(timeout) => {
                log::debug!(
                    "conn {}: reply timeout set to {}ms",
                    self.handle.id,
                    timeout.as_millis()
                );
                self.reply_timeout = timeout;
            }
            Command::Expire(id) => self.expire(&id),
            Command::Close => unreachable!("Close is intercepted by the run loop"),
        }
        Ok(())
    }

    /// Increment-and-stringify the connection-wide counter.
    fn next_correlation_id(&mut self) -> String {
        self.seq += 1;
        self.seq.to_string()
    }

    fn arm_timer(&self, id: String) -> JoinHandle<()> {
        let tx = self.handle.clone();
        let timeout = self.reply_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = tx.command(Command::Expire(id));
        })
    }

    /// Timer fired: drop the callback uninvoked and notify the issuing
    /// client locally.
    fn expire(&mut self, id: &str) {
        let Some(pending) = self.pending.remove(id) else {
            // Already fulfilled; the reply won the race.
            return;
        };
        log::warn!(
            "conn {}: request {id} ({}) timed out after {}ms",
            self.handle.id,
            pending.envelope.name,
            pending.created.elapsed().as_millis()
        );
        let detail = serde_json::to_value(&pending.envelope)
            .expect("envelope serialization cannot fail");
        self.dispatch_local(pending.client_id, EVENT_TIMEOUT, vec![detail]);
    }

    async fn write(&mut self, envelope: &Envelope) -> anyhow::Result<()> {
        self.writer.send_text(&envelope.encode()).await
    }

    // ── Inbound path (event router) ─────────────────────────────────────────

    /// Decode and route one text frame. Only write failures are returned;
    /// protocol problems are logged and the frame dropped, the connection
    /// stays open.
    async fn handle_frame(&mut self, text: &str) -> anyhow::Result<()> {
        let envelope = match Envelope::decode(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                log::warn!("conn {}: dropping bad frame: {e}", self.handle.id);
                return Ok(());
            }
        };

        // Reply delivery. The pending table is connection-wide, so this
        // happens before per-client channel filtering; correlation ids are
        // unique per connection, which makes the two orders equivalent.
        if let Some(reply_to) = envelope.reply_to.clone() {
            match self.pending.remove(&reply_to) {
                Some(pending) => {
                    pending.timer.abort();
                    (pending.callback)(envelope.data);
                }
                None => log::warn!(
                    "conn {}: replyTo {reply_to} without matching pending reply",
                    self.handle.id
                ),
            }
            return Ok(());
        }

        if envelope.is_control() {
            let mut ctx = ControlCtx {
                handle: &self.handle,
                clients: &mut self.clients,
                outgoing: Vec::new(),
            };
            self.control.on_control(envelope, &mut ctx);
            let outgoing = ctx.outgoing;
            for reply in &outgoing {
                self.write(reply).await?;
            }
            return Ok(());
        }

        self.dispatch(envelope);
        Ok(())
    }

    /// Fan a regular event out to every attached client bound to the
    /// envelope's channel.
    fn dispatch(&self, envelope: Envelope) {
        let reply = envelope.reply_with.clone().map(|id| {
            Reply::new(
                envelope.name.clone(),
                envelope.channel.clone(),
                id,
                self.handle.tx.clone(),
            )
        });

        let mut delivered = false;
        for client in &self.clients {
            if client.channel != envelope.channel {
                continue;
            }
            if let Some(listeners) = client.listeners.get(&envelope.name) {
                for listener in listeners {
                    listener(envelope.data.clone(), reply.clone());
                    delivered = true;
                }
            }
        }
        if !delivered {
            log::debug!(
                "conn {}: no listener for {:?} on channel {:?}",
                self.handle.id,
                envelope.name,
                envelope.channel
            );
        }
    }

    /// Dispatch a local notification to one attached client's listeners.
    fn dispatch_local(&self, client_id: u64, name: &str, data: Vec<Value>) {
        for client in &self.clients {
            if client.client_id != client_id {
                continue;
            }
            if let Some(listeners) = client.listeners.get(name) {
                for listener in listeners {
                    listener(data.clone(), None);
                }
            }
        }
    }

    /// Dispatch a local notification to every attached client.
    fn dispatch_all(&self, name: &str, data: &[Value]) {
        for client in &self.clients {
            if let Some(listeners) = client.listeners.get(name) {
                for listener in listeners {
                    listener(data.to_vec(), None);
                }
            }
        }
    }

    // ── Teardown ────────────────────────────────────────────────────────────

    /// Terminal transition: surface `error`/`close` events, purge every
    /// pending reply without invoking its callback, and release
    /// server-side tracking.
    async fn shutdown(mut self, error: Option<String>) {
        if let Some(message) = error {
            self.dispatch_all(EVENT_ERROR, &[json!(message)]);
        }
        self.dispatch_all(EVENT_CLOSE, &[]);

        let purged = self.pending.len();
        for (_, pending) in self.pending.drain() {
            pending.timer.abort();
            // Callback dropped uninvoked.
        }
        if purged > 0 {
            log::debug!("conn {}: purged {purged} pending replies", self.handle.id);
        }

        self.control.on_close(self.handle.id);
        let _ = self.writer.close().await;
        log::info!("conn {}: closed", self.handle.id);
    }
}
