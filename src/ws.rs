//! Shared WebSocket transport.
//!
//! Thin wrapper around `tokio-tungstenite` providing type-isolated
//! reader/writer halves for both the connecting and the accepting side.
//! All WebSocket use in the crate goes through this module rather than
//! `tokio-tungstenite` directly.
//!
//! [`connect`] handles URL → request building and TLS negotiation for
//! outbound connections; [`accept`] performs the server-side upgrade on an
//! already-accepted TCP stream. Both return a ([`WsWriter`], [`WsReader`])
//! pair ready for use in `tokio::select!` loops.

// Rust guideline compliant 2026-02

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite;

/// Concrete client-side WebSocket stream type.
type ClientStream = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

/// Concrete server-side WebSocket stream type (plain TCP, no TLS here).
type ServerStream = tokio_tungstenite::WebSocketStream<tokio::net::TcpStream>;

/// Received WebSocket message.
#[derive(Debug)]
pub enum WsMessage {
    /// UTF-8 text frame.
    Text(String),
    /// Binary frame.
    Binary(Vec<u8>),
    /// Ping frame with payload.
    Ping(Vec<u8>),
    /// Close frame with status code and reason.
    Close {
        /// WebSocket close code (1000 = normal, 1005 = no code).
        code: u16,
        /// Human-readable close reason.
        reason: String,
    },
}

/// Either half's sink side, erased over the client/server stream types.
enum Sink {
    Client(futures_util::stream::SplitSink<ClientStream, tungstenite::Message>),
    Server(futures_util::stream::SplitSink<ServerStream, tungstenite::Message>),
}

enum Stream {
    Client(futures_util::stream::SplitStream<ClientStream>),
    Server(futures_util::stream::SplitStream<ServerStream>),
}

/// Write half of a WebSocket connection.
pub struct WsWriter {
    sink: Sink,
}

impl std::fmt::Debug for WsWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsWriter").finish_non_exhaustive()
    }
}

impl WsWriter {
    async fn send_raw(&mut self, msg: tungstenite::Message) -> Result<()> {
        match &mut self.sink {
            Sink::Client(sink) => sink.send(msg).await.context("WebSocket send failed"),
            Sink::Server(sink) => sink.send(msg).await.context("WebSocket send failed"),
        }
    }

    /// Send a UTF-8 text frame.
    ///
    /// # Errors
    ///
    /// Returns an error if the send fails (connection closed, I/O error).
    pub async fn send_text(&mut self, text: &str) -> Result<()> {
        self.send_raw(tungstenite::Message::Text(text.to_string())).await
    }

    /// Send a pong frame in response to a ping.
    ///
    /// # Errors
    ///
    /// Returns an error if the send fails.
    pub async fn send_pong(&mut self, data: Vec<u8>) -> Result<()> {
        self.send_raw(tungstenite::Message::Pong(data)).await
    }

    /// Flush pending writes and close the sink, initiating the WebSocket
    /// close handshake.
    ///
    /// # Errors
    ///
    /// Returns an error if closing fails.
    pub async fn close(&mut self) -> Result<()> {
        match &mut self.sink {
            Sink::Client(sink) => sink.close().await.context("WebSocket close failed"),
            Sink::Server(sink) => sink.close().await.context("WebSocket close failed"),
        }
    }
}

/// Read half of a WebSocket connection.
pub struct WsReader {
    stream: Stream,
}

impl std::fmt::Debug for WsReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsReader").finish_non_exhaustive()
    }
}

impl WsReader {
    /// Receive the next message, returning `None` when the stream ends.
    ///
    /// Pong and raw `Frame` variants are skipped internally.
    pub async fn recv(&mut self) -> Option<Result<WsMessage>> {
        loop {
            let next = match &mut self.stream {
                Stream::Client(stream) => stream.next().await,
                Stream::Server(stream) => stream.next().await,
            };
            match next {
                Some(Ok(tungstenite::Message::Text(text))) => {
                    return Some(Ok(WsMessage::Text(text.to_string())));
                }
                Some(Ok(tungstenite::Message::Binary(data))) => {
                    return Some(Ok(WsMessage::Binary(data.to_vec())));
                }
                Some(Ok(tungstenite::Message::Ping(data))) => {
                    return Some(Ok(WsMessage::Ping(data.to_vec())));
                }
                Some(Ok(tungstenite::Message::Pong(_))) => continue,
                Some(Ok(tungstenite::Message::Close(close_frame))) => {
                    let (code, reason) = close_frame
                        .map(|cf| (cf.code.into(), cf.reason.to_string()))
                        .unwrap_or((1005, String::new()));
                    return Some(Ok(WsMessage::Close { code, reason }));
                }
                Some(Ok(tungstenite::Message::Frame(_))) => {
                    // Raw frames are skipped
                    continue;
                }
                Some(Err(e)) => {
                    return Some(Err(anyhow::anyhow!("WebSocket read error: {e}")));
                }
                None => return None,
            }
        }
    }
}

/// Connect to a WebSocket URL.
///
/// Builds an HTTP request from `url`, performs the WebSocket handshake, and
/// returns split (writer, reader) halves for independent use in
/// `tokio::select!` loops.
///
/// # Errors
///
/// Returns an error if the URL is invalid or the WebSocket handshake fails.
pub async fn connect(url: &str) -> Result<(WsWriter, WsReader)> {
    use tungstenite::client::IntoClientRequest;

    let request = url
        .into_client_request()
        .with_context(|| format!("invalid WebSocket URL: {url}"))?;

    let (ws_stream, _response) = tokio_tungstenite::connect_async(request)
        .await
        .context("WebSocket connect failed")?;

    let (sink, stream) = ws_stream.split();

    Ok((
        WsWriter { sink: Sink::Client(sink) },
        WsReader { stream: Stream::Client(stream) },
    ))
}

/// Perform the server-side WebSocket upgrade on an accepted TCP stream.
///
/// # Errors
///
/// Returns an error if the HTTP upgrade handshake fails.
pub async fn accept(stream: tokio::net::TcpStream) -> Result<(WsWriter, WsReader)> {
    let ws_stream = tokio_tungstenite::accept_async(stream)
        .await
        .context("WebSocket accept failed")?;

    let (sink, stream) = ws_stream.split();

    Ok((
        WsWriter { sink: Sink::Server(sink) },
        WsReader { stream: Stream::Server(stream) },
    ))
}

/// Convert an HTTP(S) URL to WS(S) scheme.
///
/// Passes `ws://` and `wss://` through unchanged.
#[must_use]
pub fn http_to_ws_scheme(url: &str) -> String {
    if url.starts_with("wss://") || url.starts_with("ws://") {
        url.to_string()
    } else {
        url.replace("https://", "wss://")
            .replace("http://", "ws://")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_to_ws_scheme_https() {
        assert_eq!(
            http_to_ws_scheme("https://example.com"),
            "wss://example.com"
        );
    }

    #[test]
    fn test_http_to_ws_scheme_http() {
        assert_eq!(
            http_to_ws_scheme("http://localhost:3000"),
            "ws://localhost:3000"
        );
    }

    #[test]
    fn test_http_to_ws_scheme_ws_passthrough() {
        assert_eq!(
            http_to_ws_scheme("ws://localhost:3000/sock"),
            "ws://localhost:3000/sock"
        );
    }

    #[tokio::test]
    async fn test_connect_invalid_url_returns_error() {
        let result = connect("not-a-url").await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_connect_unreachable_host_returns_error() {
        let result = connect("ws://127.0.0.1:1/invalid").await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_accept_then_text_round_trip() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (mut writer, mut reader) = accept(stream).await.unwrap();
            writer.send_text("hello").await.unwrap();
            match reader.recv().await {
                Some(Ok(WsMessage::Text(text))) => assert_eq!(text, "echo"),
                other => panic!("expected text frame, got: {other:?}"),
            }
        });

        let (mut writer, mut reader) = connect(&format!("ws://{addr}")).await.unwrap();
        match reader.recv().await {
            Some(Ok(WsMessage::Text(text))) => assert_eq!(text, "hello"),
            other => panic!("expected text frame, got: {other:?}"),
        }
        writer.send_text("echo").await.unwrap();

        tokio::time::timeout(std::time::Duration::from_secs(2), server)
            .await
            .expect("server task timed out")
            .expect("server task panicked");
    }
}
