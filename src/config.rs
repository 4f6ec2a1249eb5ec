//! Endpoint configuration.
//!
//! Options are explicit per-endpoint values passed at construction; nothing
//! in the crate reads globals. The server's effective reply timeout travels
//! to clients inside the handshake payload under the `"timeout"` key
//! (milliseconds), so both sides arm request timers with the same duration.

use serde_json::{json, Map, Value};
use std::time::Duration;

/// Default duration a pending reply waits before expiring.
///
/// Applies on the server, and on the client until the handshake delivers
/// the server-specified value.
pub const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_millis(30_000);

/// Default deadline for the handshake itself (connect request → reply).
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Key under which the reply timeout is published in the handshake payload.
pub const TIMEOUT_KEY: &str = "timeout";

/// Server-side options.
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// How long pending replies wait before expiring; also advertised to
    /// clients in the handshake payload.
    pub reply_timeout: Duration,
    /// Extra entries merged into the handshake payload sent to clients.
    /// The `"timeout"` key is always set by the server and wins over any
    /// entry here.
    pub handshake_payload: Map<String, Value>,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            reply_timeout: DEFAULT_REPLY_TIMEOUT,
            handshake_payload: Map::new(),
        }
    }
}

impl ServerOptions {
    /// The configuration object sent as `data[0]` of the handshake reply.
    #[must_use]
    pub fn handshake_config(&self) -> Value {
        let mut payload = self.handshake_payload.clone();
        payload.insert(
            TIMEOUT_KEY.to_owned(),
            json!(self.reply_timeout.as_millis() as u64),
        );
        Value::Object(payload)
    }
}

/// Client-side options for [`crate::connect`].
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// Reply timeout used before (and unless) the server advertises one.
    pub reply_timeout: Duration,
    /// Deadline for the handshake round trip.
    pub handshake_timeout: Duration,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            reply_timeout: DEFAULT_REPLY_TIMEOUT,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn handshake_config_always_includes_timeout() {
        let opts = ServerOptions::default();
        let config = opts.handshake_config();
        assert_eq!(config[TIMEOUT_KEY], json!(30_000));
    }

    #[test]
    fn handshake_config_merges_extra_payload() {
        let mut opts = ServerOptions::default();
        opts.handshake_payload
            .insert("motd".to_owned(), json!("welcome"));
        let config = opts.handshake_config();
        assert_eq!(config["motd"], json!("welcome"));
        assert_eq!(config[TIMEOUT_KEY], json!(30_000));
    }

    #[test]
    fn server_timeout_key_wins_over_payload_entry() {
        let mut opts = ServerOptions {
            reply_timeout: Duration::from_millis(5_000),
            ..Default::default()
        };
        opts.handshake_payload
            .insert(TIMEOUT_KEY.to_owned(), json!(999_999));
        assert_eq!(opts.handshake_config()[TIMEOUT_KEY], json!(5_000));
    }
}
