//! End-to-end tests over real loopback WebSockets.
//!
//! Every test binds a server on an ephemeral port, connects one or more
//! clients through the public API, and observes wire behavior through
//! listener callbacks relayed into tokio channels. All waits are
//! timeout-guarded.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::mpsc;

use chansock::protocol::{CONTROL_CHANNEL, MSG_CONNECT};
use chansock::ws::{self, WsMessage};
use chansock::{
    connect, connect_default, ChannelClient, ConnectOptions, Envelope, HandshakeState, Server,
    ServerHandle, ServerOptions, EVENT_CLOSE, EVENT_ERROR, EVENT_TIMEOUT,
};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

async fn start_server(options: ServerOptions) -> (Server, ServerHandle, String) {
    let server = Server::new(options);
    let handle = server
        .listen("127.0.0.1:0")
        .await
        .expect("bind test server");
    let url = format!("ws://{}", handle.local_addr());
    (server, handle, url)
}

async fn recv_within<T>(rx: &mut mpsc::UnboundedReceiver<T>, what: &str) -> T {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {what}"))
        .unwrap_or_else(|| panic!("channel closed while waiting for {what}"))
}

async fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting until {what}"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn handshake_adopts_server_config() {
    init_logging();
    let mut options = ServerOptions::default();
    options.reply_timeout = Duration::from_millis(12_345);
    options
        .handshake_payload
        .insert("motd".to_owned(), json!("welcome"));
    let (_server, handle, url) = start_server(options).await;

    let client = connect_default(&url).await.expect("handshake");
    assert!(client.state().is_established());
    assert_eq!(client.config()["timeout"], json!(12_345));
    assert_eq!(client.config()["motd"], json!("welcome"));

    handle.shutdown();
}

#[tokio::test]
async fn root_publish_reaches_server_root_listener() {
    init_logging();
    let (server, handle, url) = start_server(ServerOptions::default()).await;

    let (tx, mut rx) = mpsc::unbounded_channel::<Vec<Value>>();
    server.on_connection(move |root| {
        let tx = tx.clone();
        root.on("ping", move |data, _reply| {
            let _ = tx.send(data);
        });
    });

    let client = connect_default(&url).await.expect("handshake");
    client.root().publish("ping", vec![]).expect("publish");

    let data = recv_within(&mut rx, "ping on the root channel").await;
    assert!(data.is_empty());

    handle.shutdown();
}

#[tokio::test]
async fn server_can_publish_to_client_root_listener() {
    init_logging();
    let (server, handle, url) = start_server(ServerOptions::default()).await;

    let (roots_tx, mut roots_rx) = mpsc::unbounded_channel::<ChannelClient>();
    server.on_connection(move |root| {
        let _ = roots_tx.send(root);
    });

    let client = connect_default(&url).await.expect("handshake");
    let (tx, mut rx) = mpsc::unbounded_channel::<Vec<Value>>();
    client.root().on("greet", move |data, _reply| {
        let _ = tx.send(data);
    });

    let server_root = recv_within(&mut roots_rx, "server-side root client").await;
    server_root
        .publish("greet", vec![json!("hello")])
        .expect("server publish");

    let data = recv_within(&mut rx, "greet on the client").await;
    assert_eq!(data, vec![json!("hello")]);

    handle.shutdown();
}

#[tokio::test]
async fn request_reply_round_trip_on_root() {
    init_logging();
    let (server, handle, url) = start_server(ServerOptions::default()).await;

    server.on_connection(|root| {
        root.on("add", |data, reply| {
            let sum: i64 = data.iter().filter_map(Value::as_i64).sum();
            reply
                .expect("request carries a reply handle")
                .send(vec![json!(sum)])
                .expect("reply send");
        });
    });

    let client = connect_default(&url).await.expect("handshake");
    let (tx, mut rx) = mpsc::unbounded_channel::<Vec<Value>>();
    let calls = Arc::new(AtomicUsize::new(0));
    let counted = Arc::clone(&calls);
    client
        .root()
        .request("add", vec![json!(2), json!(3)], move |data| {
            counted.fetch_add(1, Ordering::SeqCst);
            let _ = tx.send(data);
        })
        .expect("request");

    let data = recv_within(&mut rx, "add reply").await;
    assert_eq!(data, vec![json!(5)]);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1, "callback fired once");

    handle.shutdown();
}

#[tokio::test]
async fn root_aliases_map_to_the_root_channel() {
    init_logging();
    let (server, handle, url) = start_server(ServerOptions::default()).await;

    let (tx, mut rx) = mpsc::unbounded_channel::<Vec<Value>>();
    server.on_connection(move |root| {
        let tx = tx.clone();
        root.on("ping", move |data, _reply| {
            let _ = tx.send(data);
        });
    });

    let client = connect_default(&url).await.expect("handshake");
    for alias in ["", "/"] {
        let view = client.channel(alias).expect("root alias view");
        assert!(view.channel().is_none(), "alias {alias:?} binds the root");
        view.publish("ping", vec![json!(alias)]).expect("publish");
        let data = recv_within(&mut rx, "ping via root alias").await;
        assert_eq!(data, vec![json!(alias)]);
    }

    handle.shutdown();
}

#[tokio::test]
async fn join_dispatch_is_channel_isolated() {
    init_logging();
    let (server, handle, url) = start_server(ServerOptions::default()).await;

    let (news_tx, mut news_rx) = mpsc::unbounded_channel::<Vec<Value>>();
    let weather_hits = Arc::new(AtomicUsize::new(0));
    server.channel("/news", move |client| {
        let tx = news_tx.clone();
        client.on("post", move |data, _reply| {
            let _ = tx.send(data);
        });
    });
    let counted = Arc::clone(&weather_hits);
    server.channel("/weather", move |client| {
        let counted = Arc::clone(&counted);
        client.on("post", move |_data, _reply| {
            counted.fetch_add(1, Ordering::SeqCst);
        });
    });

    let client = connect_default(&url).await.expect("handshake");
    let news = client.channel("/news").expect("join /news");
    let _weather = client.channel("/weather").expect("join /weather");
    news.publish("post", vec![json!("scoop")]).expect("publish");

    let data = recv_within(&mut news_rx, "post on /news").await;
    assert_eq!(data, vec![json!("scoop")]);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(
        weather_hits.load(Ordering::SeqCst),
        0,
        "/weather must not see /news traffic"
    );

    handle.shutdown();
}

#[tokio::test]
async fn every_join_handler_receives_its_own_client() {
    init_logging();
    let (server, handle, url) = start_server(ServerOptions::default()).await;

    let (tx, mut rx) = mpsc::unbounded_channel::<&'static str>();
    for tag in ["first", "second"] {
        let tx = tx.clone();
        server.channel("/news", move |client| {
            assert_eq!(client.channel(), Some("/news"));
            let _ = tx.send(tag);
        });
    }

    let client = connect_default(&url).await.expect("handshake");
    let _news = client.channel("/news").expect("join /news");

    assert_eq!(recv_within(&mut rx, "first join handler").await, "first");
    assert_eq!(recv_within(&mut rx, "second join handler").await, "second");

    // One connection plus the root client and two channel clients.
    wait_until("three tracked clients", || server.clients().len() == 3).await;

    handle.shutdown();
}

#[tokio::test]
async fn request_timeout_drops_callback_and_notifies_locally() {
    init_logging();
    let mut options = ServerOptions::default();
    options.reply_timeout = Duration::from_millis(200);
    let (_server, handle, url) = start_server(options).await;

    // No listener for "slow" anywhere, so the request can never be
    // answered.
    let client = connect_default(&url).await.expect("handshake");

    let (timeout_tx, mut timeout_rx) = mpsc::unbounded_channel::<Vec<Value>>();
    client.root().on(EVENT_TIMEOUT, move |data, _reply| {
        let _ = timeout_tx.send(data);
    });

    let answered = Arc::new(AtomicUsize::new(0));
    let counted = Arc::clone(&answered);
    client
        .root()
        .request("slow", vec![json!(1)], move |_data| {
            counted.fetch_add(1, Ordering::SeqCst);
        })
        .expect("request");

    let detail = recv_within(&mut timeout_rx, "timeout notification").await;
    let envelope = &detail[0];
    assert_eq!(envelope["name"], json!("slow"));
    assert!(envelope["replyWith"].is_string());

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(
        answered.load(Ordering::SeqCst),
        0,
        "expired callback must never run"
    );
    assert!(
        timeout_rx.try_recv().is_err(),
        "exactly one timeout notification"
    );

    handle.shutdown();
}

#[tokio::test]
async fn concurrent_requests_from_different_views_get_their_own_replies() {
    init_logging();
    let (server, handle, url) = start_server(ServerOptions::default()).await;

    let echo = |client: ChannelClient| {
        client.on("echo", |data, reply| {
            reply
                .expect("echo expects a reply handle")
                .send(data)
                .expect("reply send");
        });
    };
    server.on_connection(echo);
    server.channel("/a", echo);

    let client = connect_default(&url).await.expect("handshake");
    let a = client.channel("/a").expect("join /a");

    let (tx, mut rx) = mpsc::unbounded_channel::<(&'static str, Vec<Value>)>();
    let root_tx = tx.clone();
    client
        .root()
        .request("echo", vec![json!("root")], move |data| {
            let _ = root_tx.send(("root", data));
        })
        .expect("root request");
    a.request("echo", vec![json!("a")], move |data| {
        let _ = tx.send(("a", data));
    })
    .expect("/a request");

    let mut seen = Vec::new();
    for _ in 0..2 {
        seen.push(recv_within(&mut rx, "echo reply").await);
    }
    seen.sort_by_key(|(tag, _)| *tag);
    assert_eq!(
        seen,
        vec![
            ("a", vec![json!("a")]),
            ("root", vec![json!("root")]),
        ]
    );

    handle.shutdown();
}

#[tokio::test]
async fn close_emits_close_event_and_releases_server_tracking() {
    init_logging();
    let (server, handle, url) = start_server(ServerOptions::default()).await;
    server.channel("/a", |_client| {});

    let mut first = connect_default(&url).await.expect("first handshake");
    let second = connect_default(&url).await.expect("second handshake");
    let _a = first.channel("/a").expect("join /a");

    // Root + /a for the first connection, root for the second.
    wait_until("three tracked clients", || server.clients().len() == 3).await;

    let (close_tx, mut close_rx) = mpsc::unbounded_channel::<()>();
    first.root().on(EVENT_CLOSE, move |_data, _reply| {
        let _ = close_tx.send(());
    });

    let answered = Arc::new(AtomicUsize::new(0));
    let counted = Arc::clone(&answered);
    first
        .root()
        .request("never", vec![], move |_data| {
            counted.fetch_add(1, Ordering::SeqCst);
        })
        .expect("request");

    first.close();
    recv_within(&mut close_rx, "close event").await;

    // Only the first connection's clients are pruned.
    wait_until("one tracked client", || server.clients().len() == 1).await;
    assert!(second.state().is_established());

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(
        answered.load(Ordering::SeqCst),
        0,
        "purged callback must never run"
    );

    handle.shutdown();
}

#[tokio::test]
async fn malformed_and_unknown_control_frames_are_non_fatal() {
    init_logging();
    let (_server, handle, url) = start_server(ServerOptions::default()).await;

    // Speak the wire format by hand so bad frames can be injected.
    let (mut writer, mut reader) = ws::connect(&url).await.expect("raw connect");
    writer
        .send_text("this is not json")
        .await
        .expect("send garbage");
    writer
        .send_text(
            &Envelope::event("mystery", Some(CONTROL_CHANNEL.to_owned()), vec![]).encode(),
        )
        .await
        .expect("send unknown control");
    writer
        .send_text(r#"{"name":"connect","channel":"$control","data":[],"replyWith":"h1"}"#)
        .await
        .expect("send connect");

    let reply = loop {
        match tokio::time::timeout(Duration::from_secs(2), reader.recv())
            .await
            .expect("timed out waiting for the handshake reply")
            .expect("connection closed before the handshake reply")
            .expect("transport error")
        {
            WsMessage::Text(text) => break Envelope::decode(&text).expect("decode reply"),
            _ => continue,
        }
    };
    assert_eq!(reply.name, MSG_CONNECT);
    assert_eq!(reply.reply_to.as_deref(), Some("h1"));
    assert!(reply.data[0].get("timeout").is_some());

    handle.shutdown();
}

#[tokio::test]
async fn unregistered_channel_join_leaves_the_connection_usable() {
    init_logging();
    let (server, handle, url) = start_server(ServerOptions::default()).await;
    server.on_connection(|root| {
        root.on("ping", |_data, reply| {
            reply.expect("reply handle").send(vec![]).expect("pong");
        });
    });

    let client = connect_default(&url).await.expect("handshake");
    let nowhere = client.channel("/nowhere").expect("join is fire-and-forget");
    nowhere.publish("post", vec![]).expect("publish into the void");

    // The connection survives; a root request still round-trips.
    let (tx, mut rx) = mpsc::unbounded_channel::<()>();
    client
        .root()
        .request("ping", vec![], move |_data| {
            let _ = tx.send(());
        })
        .expect("request");
    recv_within(&mut rx, "pong after bad join").await;

    handle.shutdown();
}

#[tokio::test]
async fn failed_handshake_tears_down_the_transport() {
    init_logging();
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    // A peer that accepts, reads the connect request, and never answers.
    let peer = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let (_writer, mut reader) = ws::accept(stream).await.unwrap();
        match reader.recv().await {
            Some(Ok(WsMessage::Text(text))) => {
                assert_eq!(Envelope::decode(&text).unwrap().name, MSG_CONNECT);
            }
            other => panic!("expected the connect frame, got: {other:?}"),
        }
        // The abandoned connection must close the transport.
        loop {
            match reader.recv().await {
                Some(Ok(WsMessage::Close { .. })) | Some(Err(_)) | None => break,
                Some(Ok(_)) => continue,
            }
        }
    });

    let options = ConnectOptions {
        handshake_timeout: Duration::from_millis(200),
        ..Default::default()
    };
    let err = connect(&format!("ws://{addr}"), options)
        .await
        .expect_err("handshake cannot succeed without a reply");
    assert!(err.to_string().contains("timed out"), "unexpected error: {err}");

    tokio::time::timeout(Duration::from_secs(2), peer)
        .await
        .expect("transport was not torn down after the failed handshake")
        .expect("peer panicked");
}

#[tokio::test]
async fn dropping_the_client_closes_the_connection() {
    init_logging();
    let (server, handle, url) = start_server(ServerOptions::default()).await;

    let client = connect_default(&url).await.expect("handshake");
    wait_until("the root client is tracked", || server.clients().len() == 1).await;

    drop(client);
    wait_until("the dropped connection is pruned", || {
        server.clients().is_empty()
    })
    .await;

    handle.shutdown();
}

#[tokio::test]
async fn abrupt_peer_death_raises_error_then_close() {
    init_logging();
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (die_tx, mut die_rx) = mpsc::unbounded_channel::<()>();

    // Hand-rolled acceptor: answer the handshake, then drop the socket
    // without a close frame.
    let peer = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let (mut writer, mut reader) = ws::accept(stream).await.unwrap();
        let id = match reader.recv().await {
            Some(Ok(WsMessage::Text(text))) => Envelope::decode(&text)
                .unwrap()
                .reply_with
                .expect("connect carries replyWith"),
            other => panic!("expected the connect frame, got: {other:?}"),
        };
        writer
            .send_text(
                &Envelope::reply(
                    MSG_CONNECT,
                    Some(CONTROL_CHANNEL.to_owned()),
                    vec![json!({"timeout": 30_000})],
                    id,
                )
                .encode(),
            )
            .await
            .expect("send handshake reply");
        die_rx.recv().await;
    });

    let client = connect_default(&format!("ws://{addr}"))
        .await
        .expect("handshake");
    let (error_tx, mut error_rx) = mpsc::unbounded_channel::<Vec<Value>>();
    let (close_tx, mut close_rx) = mpsc::unbounded_channel::<()>();
    client.root().on(EVENT_ERROR, move |data, _reply| {
        let _ = error_tx.send(data);
    });
    client.root().on(EVENT_CLOSE, move |_data, _reply| {
        let _ = close_tx.send(());
    });

    die_tx.send(()).expect("signal the peer to die");
    let detail = recv_within(&mut error_rx, "error event").await;
    assert!(!detail.is_empty(), "error event carries a description");
    recv_within(&mut close_rx, "close event").await;

    wait_until("the client observes the closed state", || {
        client.state() == HandshakeState::Closed
    })
    .await;

    tokio::time::timeout(Duration::from_secs(2), peer)
        .await
        .expect("peer timed out")
        .expect("peer panicked");
}

#[tokio::test]
async fn control_gating_ignores_early_join_and_duplicate_connect() {
    init_logging();
    let (server, handle, url) = start_server(ServerOptions::default()).await;

    let (joined_tx, mut joined_rx) = mpsc::unbounded_channel::<()>();
    server.channel("/news", move |_client| {
        let _ = joined_tx.send(());
    });
    server.on_connection(|root| {
        root.on("ping", |_data, reply| {
            reply.expect("reply handle").send(vec![]).expect("pong");
        });
    });

    let (mut writer, mut reader) = ws::connect(&url).await.expect("raw connect");
    // Join before the handshake: ignored.
    writer
        .send_text(r#"{"name":"channel","channel":"$control","data":["/news"]}"#)
        .await
        .expect("send early join");
    writer
        .send_text(r#"{"name":"connect","channel":"$control","data":[],"replyWith":"h1"}"#)
        .await
        .expect("send connect");
    // Duplicate handshake: ignored.
    writer
        .send_text(r#"{"name":"connect","channel":"$control","data":[],"replyWith":"h2"}"#)
        .await
        .expect("send duplicate connect");
    writer
        .send_text(r#"{"name":"ping","data":[],"replyWith":"p1"}"#)
        .await
        .expect("send ping");

    let mut replies = Vec::new();
    while replies.len() < 2 {
        match tokio::time::timeout(Duration::from_secs(2), reader.recv())
            .await
            .expect("timed out waiting for replies")
            .expect("connection closed")
            .expect("transport error")
        {
            WsMessage::Text(text) => {
                replies.push(Envelope::decode(&text).expect("decode reply"));
            }
            _ => continue,
        }
    }
    // The handshake answered once, then the ping; h2 never got a reply.
    assert_eq!(replies[0].reply_to.as_deref(), Some("h1"));
    assert_eq!(replies[1].reply_to.as_deref(), Some("p1"));
    assert!(
        joined_rx.try_recv().is_err(),
        "a join before the handshake must not reach the handler"
    );

    handle.shutdown();
}

#[tokio::test]
async fn connect_respects_explicit_options() {
    init_logging();
    let (_server, handle, url) = start_server(ServerOptions::default()).await;

    let options = ConnectOptions {
        reply_timeout: Duration::from_secs(5),
        handshake_timeout: Duration::from_secs(5),
    };
    let client = connect(&url, options).await.expect("handshake");
    assert!(client.state().is_established());

    handle.shutdown();
}
