//! Channel-scoped client handles.
//!
//! A [`ChannelClient`] is the object application code interacts with: a
//! cheap, cloneable handle bound to one (connection, channel) pair. Several
//! instances may share a connection (one per join handler on the server;
//! one root plus any number of named-channel views on the client), and
//! each filters incoming traffic by its own bound channel. Correlation ids
//! are allocated by the connection, never by the handle, so requests from
//! different handles on one connection cannot collide.
//!
//! The duck-typed "trailing argument is a callback" convention of similar
//! protocols is split into two explicit operations here: [`publish`]
//! (fire-and-forget) and [`request`] (correlated, with timeout).
//!
//! [`publish`]: ChannelClient::publish
//! [`request`]: ChannelClient::request

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::mpsc::UnboundedSender;

use crate::connection::Command;
use crate::protocol::Envelope;

/// Errors surfaced by channel-scoped client operations.
#[derive(Debug)]
pub enum ClientError {
    /// The underlying connection is closed.
    Closed,
    /// This reply handle was already used.
    ReplyAlreadySent,
}

impl std::fmt::Display for ClientError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "connection closed"),
            Self::ReplyAlreadySent => write!(f, "reply already sent"),
        }
    }
}

impl std::error::Error for ClientError {}

/// Handle bound to one (connection, channel) pair.
///
/// Clones share the binding; dropping all clones does not close the
/// connection.
#[derive(Clone)]
pub struct ChannelClient {
    id: u64,
    channel: Option<String>,
    tx: UnboundedSender<Command>,
}

impl std::fmt::Debug for ChannelClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelClient")
            .field("id", &self.id)
            .field("channel", &self.channel)
            .finish_non_exhaustive()
    }
}

impl ChannelClient {
    pub(crate) fn new(id: u64, channel: Option<String>, tx: UnboundedSender<Command>) -> Self {
        Self { id, channel, tx }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    /// The bound channel name; `None` is the root channel.
    #[must_use]
    pub fn channel(&self) -> Option<&str> {
        self.channel.as_deref()
    }

    /// Send a fire-and-forget event. No reply is expected and no resource
    /// is retained.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Closed`] if the connection is gone.
    pub fn publish(&self, name: &str, data: Vec<Value>) -> Result<(), ClientError> {
        let envelope = Envelope::event(name, self.channel.clone(), data);
        self.tx
            .send(Command::Send(envelope))
            .map_err(|_| ClientError::Closed)
    }

    /// Send a correlated request. The connection allocates a fresh
    /// correlation id, arms the reply timer, and invokes `callback` exactly
    /// once with the reply's `data`, or never if the request times out
    /// first (a local `"timeout"` event fires instead, carrying the
    /// request envelope).
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Closed`] if the connection is gone.
    pub fn request(
        &self,
        name: &str,
        data: Vec<Value>,
        callback: impl FnOnce(Vec<Value>) + Send + 'static,
    ) -> Result<(), ClientError> {
        self.tx
            .send(Command::Request {
                client_id: self.id,
                channel: self.channel.clone(),
                name: name.to_owned(),
                data,
                callback: Box::new(callback),
            })
            .map_err(|_| ClientError::Closed)
    }

    /// Register a local listener for `name` on this client's channel.
    ///
    /// Listeners fire in registration order with the envelope's `data`; the
    /// second argument carries a [`Reply`] when the sender expects one. The
    /// local notification events [`EVENT_TIMEOUT`], [`EVENT_ERROR`], and
    /// [`EVENT_CLOSE`] are delivered through the same listeners.
    ///
    /// Registration on a closed connection is a no-op.
    ///
    /// [`EVENT_TIMEOUT`]: crate::EVENT_TIMEOUT
    /// [`EVENT_ERROR`]: crate::EVENT_ERROR
    /// [`EVENT_CLOSE`]: crate::EVENT_CLOSE
    pub fn on(
        &self,
        name: &str,
        listener: impl Fn(Vec<Value>, Option<Reply>) + Send + Sync + 'static,
    ) {
        if self
            .tx
            .send(Command::Listen {
                client_id: self.id,
                name: name.to_owned(),
                listener: Box::new(listener),
            })
            .is_err()
        {
            log::debug!("listener for {name} dropped: connection closed");
        }
    }
}

/// One-shot reply handle constructed for incoming envelopes that carry
/// `replyWith`.
///
/// All listeners of one dispatch share the same underlying one-shot: the
/// handle is cloneable, the first [`send`](Reply::send) wins, and later
/// calls fail with [`ClientError::ReplyAlreadySent`]. A handler may move a
/// clone into a spawned task and answer later; the connection does not wait
/// for it.
#[derive(Clone)]
pub struct Reply {
    inner: Arc<ReplyInner>,
}

struct ReplyInner {
    /// Mirrored from the request envelope.
    name: String,
    /// Mirrored from the request envelope.
    channel: Option<String>,
    /// The request's `replyWith`, echoed back as `replyTo`.
    correlation_id: String,
    sent: AtomicBool,
    tx: UnboundedSender<Command>,
}

impl std::fmt::Debug for Reply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reply")
            .field("name", &self.inner.name)
            .field("correlation_id", &self.inner.correlation_id)
            .field("sent", &self.inner.sent.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Reply {
    pub(crate) fn new(
        name: String,
        channel: Option<String>,
        correlation_id: String,
        tx: UnboundedSender<Command>,
    ) -> Self {
        Self {
            inner: Arc::new(ReplyInner {
                name,
                channel,
                correlation_id,
                sent: AtomicBool::new(false),
                tx,
            }),
        }
    }

    /// Answer the request. `data` becomes the reply's positional arguments.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::ReplyAlreadySent`] on second and later calls,
    /// [`ClientError::Closed`] if the connection is gone.
    pub fn send(&self, data: Vec<Value>) -> Result<(), ClientError> {
        if self.inner.sent.swap(true, Ordering::SeqCst) {
            log::warn!(
                "duplicate reply to {} ({}) ignored",
                self.inner.correlation_id,
                self.inner.name
            );
            return Err(ClientError::ReplyAlreadySent);
        }
        let envelope = Envelope::reply(
            self.inner.name.clone(),
            self.inner.channel.clone(),
            data,
            self.inner.correlation_id.clone(),
        );
        self.inner
            .tx
            .send(Command::Send(envelope))
            .map_err(|_| ClientError::Closed)
    }
}
