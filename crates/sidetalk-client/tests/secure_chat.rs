//! End-to-end client scenarios against an in-process WebSocket server
//!
//! Each test binds a real `tokio-tungstenite` listener on a loopback port
//! and plays the server side of the protocol by hand, so the full path
//! (dial, authenticate, key exchange, encrypt, reconnect) is exercised
//! without any external infrastructure.

use futures::{SinkExt, StreamExt};
use sidetalk_client::{
    ClientConfig, ClientError, ConnectionState, FrameKind, ReconnectConfig, SecureChatClient,
};
use sidetalk_crypto::{decrypt, derive_shared_key, encrypt, generate_key_pair, Envelope,
    MemoryKeyStorage};
use sidetalk_types::{
    ClientFrame, ContentType, InboundMessage, KeyPair, MessagePayload, PublicKey, ServerFrame,
};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};

type ServerWs = WebSocketStream<TcpStream>;

async fn bind() -> (TcpListener, String) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}", listener.local_addr().unwrap());
    (listener, url)
}

fn test_config(url: &str) -> ClientConfig {
    let mut config = ClientConfig::new(url);
    config.connect_timeout = Duration::from_secs(2);
    config.key_request_timeout = Duration::from_millis(500);
    config.reconnect = ReconnectConfig {
        base_delay: Duration::from_millis(100),
        factor: 1.5,
        max_delay: Duration::from_millis(500),
        max_attempts: None,
    };
    config
}

fn client(url: &str) -> SecureChatClient {
    SecureChatClient::new(test_config(url), Box::new(MemoryKeyStorage::default()))
}

async fn accept(listener: &TcpListener) -> ServerWs {
    let (stream, _) = listener.accept().await.unwrap();
    tokio_tungstenite::accept_async(stream).await.unwrap()
}

async fn recv_client_frame(ws: &mut ServerWs) -> ClientFrame {
    loop {
        match ws.next().await.expect("client closed the socket").unwrap() {
            Message::Text(text) => return serde_json::from_str(&text).unwrap(),
            Message::Close(_) => panic!("client closed the socket"),
            _ => continue,
        }
    }
}

async fn send_server_frame(ws: &mut ServerWs, frame: &ServerFrame) {
    ws.send(Message::Text(serde_json::to_string(frame).unwrap()))
        .await
        .unwrap();
}

/// Server side of the handshake: confirm the token and collect the public
/// key the client shares afterwards
async fn authenticate(ws: &mut ServerWs, user_id: &str) -> PublicKey {
    match recv_client_frame(ws).await {
        ClientFrame::Authenticate { .. } => {}
        other => panic!("expected authenticate, got {other:?}"),
    }
    send_server_frame(
        ws,
        &ServerFrame::AuthenticationResult {
            success: true,
            user_id: Some(user_id.to_string()),
        },
    )
    .await;
    match recv_client_frame(ws).await {
        ClientFrame::SharePublicKey { public_key } => {
            let bytes = BASE64.decode(public_key).unwrap();
            bytes.try_into().unwrap()
        }
        other => panic!("expected share_public_key, got {other:?}"),
    }
}

async fn wait_for_state(rx: &mut watch::Receiver<ConnectionState>, want: ConnectionState) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while *rx.borrow_and_update() != want {
            rx.changed().await.unwrap();
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for state {want}"));
}

fn decrypt_payload(content: &str, peer: &KeyPair, client_key: &PublicKey) -> MessagePayload {
    let shared = derive_shared_key(&peer.secret_key, client_key).unwrap();
    let envelope = Envelope::from_base64(content).unwrap();
    let plaintext = decrypt(&envelope, &shared).unwrap();
    serde_json::from_slice(&plaintext).unwrap()
}

#[tokio::test]
async fn connect_authenticates_and_shares_public_key() {
    let (listener, url) = bind().await;
    let server = tokio::spawn(async move {
        let mut ws = accept(&listener).await;
        let key = authenticate(&mut ws, "alice").await;
        (ws, key)
    });

    let client = client(&url);
    client.connect("token-1").await.unwrap();
    assert_eq!(client.state(), ConnectionState::Authenticated);

    let (_ws, shared_key) = server.await.unwrap();
    assert_eq!(client.local_public_key(), Some(shared_key));

    client.disconnect();
    assert_eq!(client.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn rejected_token_fails_connect_and_stops_retrying() {
    let (listener, url) = bind().await;
    let server = tokio::spawn(async move {
        let mut ws = accept(&listener).await;
        match recv_client_frame(&mut ws).await {
            ClientFrame::Authenticate { .. } => {}
            other => panic!("expected authenticate, got {other:?}"),
        }
        send_server_frame(
            &mut ws,
            &ServerFrame::AuthenticationResult {
                success: false,
                user_id: None,
            },
        )
        .await;
        listener
    });

    let client = client(&url);
    let err = client.connect("bad-token").await.unwrap_err();
    assert!(matches!(err, ClientError::AuthenticationFailed(_)));
    assert_eq!(client.state(), ConnectionState::Disconnected);

    // A rejected token must not trigger the reconnect loop
    let listener = server.await.unwrap();
    let redial = tokio::time::timeout(Duration::from_millis(400), listener.accept()).await;
    assert!(redial.is_err(), "client redialed after an explicit rejection");
}

#[tokio::test]
async fn connect_times_out_when_server_never_answers() {
    let (listener, url) = bind().await;
    let server = tokio::spawn(async move {
        // Accept the socket, swallow the authenticate frame, say nothing
        let mut ws = accept(&listener).await;
        let _ = recv_client_frame(&mut ws).await;
        ws
    });

    let mut config = test_config(&url);
    config.connect_timeout = Duration::from_millis(300);
    let client = SecureChatClient::new(config, Box::new(MemoryKeyStorage::default()));

    let err = client.connect("token-1").await.unwrap_err();
    assert!(matches!(err, ClientError::ConnectTimeout));
    assert_eq!(client.state(), ConnectionState::Disconnected);

    client.disconnect();
    drop(server);
}

#[tokio::test]
async fn first_send_exchanges_keys_and_encrypts() {
    let (listener, url) = bind().await;
    let bob = generate_key_pair();
    let bob_for_server = bob.clone();

    let server = tokio::spawn(async move {
        let mut ws = accept(&listener).await;
        let alice_key = authenticate(&mut ws, "alice").await;

        // First send: key request comes before the message
        match recv_client_frame(&mut ws).await {
            ClientFrame::RequestPublicKey { recipient_id } => assert_eq!(recipient_id, "bob"),
            other => panic!("expected request_public_key, got {other:?}"),
        }
        send_server_frame(
            &mut ws,
            &ServerFrame::PublicKey {
                user_id: "bob".to_string(),
                public_key: BASE64.encode(bob_for_server.public_key),
            },
        )
        .await;

        let first = match recv_client_frame(&mut ws).await {
            ClientFrame::ChatMessage {
                thread_id,
                recipient_id,
                content,
                is_encrypted,
            } => {
                assert_eq!(thread_id, "thread-1");
                assert_eq!(recipient_id, "bob");
                assert!(is_encrypted);
                assert_ne!(content, "hello", "plaintext leaked onto the wire");
                decrypt_payload(&content, &bob_for_server, &alice_key)
            }
            other => panic!("expected chat_message, got {other:?}"),
        };

        // Second send: the shared key is cached, no key request
        let second = match recv_client_frame(&mut ws).await {
            ClientFrame::ChatMessage { content, .. } => {
                decrypt_payload(&content, &bob_for_server, &alice_key)
            }
            other => panic!("expected chat_message, got {other:?}"),
        };

        (ws, first, second)
    });

    let client = client(&url);
    client.connect("token-1").await.unwrap();
    client
        .send_message("thread-1", "bob", "hello", ContentType::Text, None)
        .await
        .unwrap();
    client
        .send_message("thread-1", "bob", "again", ContentType::Text, None)
        .await
        .unwrap();

    let (_ws, first, second) = server.await.unwrap();
    assert_eq!(first.content, "hello");
    assert_eq!(first.content_type, ContentType::Text);
    assert!(first.timestamp > 0);
    assert_eq!(second.content, "again");

    client.disconnect();
}

#[tokio::test]
async fn send_fails_when_not_connected() {
    let client = client("http://127.0.0.1:9");
    let err = client
        .send_message("t", "bob", "hi", ContentType::Text, None)
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::NotConnected));
}

#[tokio::test]
async fn inbound_encrypted_message_reaches_listeners_decrypted() {
    let (listener, url) = bind().await;
    let bob = generate_key_pair();
    let bob_for_server = bob.clone();

    let server = tokio::spawn(async move {
        let mut ws = accept(&listener).await;
        let alice_key = authenticate(&mut ws, "alice").await;

        // Bob's key arrives before his message, as the server delivers it
        // when a conversation opens
        send_server_frame(
            &mut ws,
            &ServerFrame::PublicKey {
                user_id: "bob".to_string(),
                public_key: BASE64.encode(bob_for_server.public_key),
            },
        )
        .await;

        let shared = derive_shared_key(&bob_for_server.secret_key, &alice_key).unwrap();
        let payload = MessagePayload {
            content: "hi alice".to_string(),
            content_type: ContentType::Text,
            metadata: Some(serde_json::json!({"replyTo": "m-7"})),
            timestamp: 1_700_000_000_000,
        };
        let envelope = encrypt(&serde_json::to_vec(&payload).unwrap(), &shared).unwrap();
        send_server_frame(
            &mut ws,
            &ServerFrame::NewMessage {
                message: InboundMessage {
                    sender_id: "bob".to_string(),
                    content: envelope.to_base64(),
                    is_encrypted: true,
                    content_type: None,
                    metadata: None,
                    timestamp: None,
                    extra: serde_json::Map::new(),
                },
            },
        )
        .await;
        ws
    });

    let client = client(&url);
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    client.on_frame(
        FrameKind::NewMessage,
        Box::new(move |frame| {
            if let ServerFrame::NewMessage { message } = frame {
                let _ = tx.send(message.clone());
            }
        }),
    );
    client.connect("token-1").await.unwrap();

    let delivered = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(delivered.sender_id, "bob");
    assert!(!delivered.is_encrypted);
    assert_eq!(delivered.content, "hi alice");
    assert_eq!(delivered.content_type, Some(ContentType::Text));
    assert_eq!(delivered.timestamp, Some(1_700_000_000_000));
    assert_eq!(
        delivered.metadata,
        Some(serde_json::json!({"replyTo": "m-7"}))
    );

    let _ws = server.await.unwrap();
    client.disconnect();
}

#[tokio::test]
async fn undecryptable_message_is_dropped_and_key_requested() {
    let (listener, url) = bind().await;

    let server = tokio::spawn(async move {
        let mut ws = accept(&listener).await;
        authenticate(&mut ws, "alice").await;

        // Encrypted message from a sender whose key the client has never
        // seen: must be dropped, not delivered garbled
        send_server_frame(
            &mut ws,
            &ServerFrame::NewMessage {
                message: InboundMessage {
                    sender_id: "stranger".to_string(),
                    content: BASE64.encode([0u8; 48]),
                    is_encrypted: true,
                    content_type: None,
                    metadata: None,
                    timestamp: None,
                    extra: serde_json::Map::new(),
                },
            },
        )
        .await;

        // The client asks for the missing key instead of stalling
        match recv_client_frame(&mut ws).await {
            ClientFrame::RequestPublicKey { recipient_id } => {
                assert_eq!(recipient_id, "stranger")
            }
            other => panic!("expected request_public_key, got {other:?}"),
        }

        // Plaintext sentinel proves the stream kept flowing
        send_server_frame(
            &mut ws,
            &ServerFrame::NewMessage {
                message: InboundMessage {
                    sender_id: "stranger".to_string(),
                    content: "sentinel".to_string(),
                    is_encrypted: false,
                    content_type: None,
                    metadata: None,
                    timestamp: None,
                    extra: serde_json::Map::new(),
                },
            },
        )
        .await;
        ws
    });

    let client = client(&url);
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    client.on_frame(
        FrameKind::NewMessage,
        Box::new(move |frame| {
            if let ServerFrame::NewMessage { message } = frame {
                let _ = tx.send(message.content.clone());
            }
        }),
    );
    client.connect("token-1").await.unwrap();

    let delivered = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(delivered, "sentinel");

    let _ws = server.await.unwrap();
    client.disconnect();
}

#[tokio::test]
async fn disconnect_cancels_pending_reconnect() {
    let (listener, url) = bind().await;
    let server = tokio::spawn(async move {
        let mut ws = accept(&listener).await;
        authenticate(&mut ws, "alice").await;
        // Drop the socket; the client will schedule a reconnect
        drop(ws);
        listener
    });

    let mut config = test_config(&url);
    config.reconnect.base_delay = Duration::from_millis(500);
    let client = SecureChatClient::new(config, Box::new(MemoryKeyStorage::default()));
    client.connect("token-1").await.unwrap();
    // Subscribe after connect so the watch holds Authenticated, not the
    // initial Disconnected
    let mut states = client.subscribe_state();
    let listener = server.await.unwrap();

    wait_for_state(&mut states, ConnectionState::Disconnected).await;
    client.disconnect();

    // Well past the backoff delay: no redial may happen
    tokio::time::sleep(Duration::from_millis(800)).await;
    let redial = tokio::time::timeout(Duration::from_millis(100), listener.accept()).await;
    assert!(redial.is_err(), "client redialed after disconnect()");
}

#[tokio::test]
async fn reconnects_and_reauthenticates_after_server_drop() {
    let (listener, url) = bind().await;
    let server = tokio::spawn(async move {
        let mut first = accept(&listener).await;
        let first_key = authenticate(&mut first, "alice").await;
        drop(first);

        let mut second = accept(&listener).await;
        let second_key = authenticate(&mut second, "alice").await;
        (second, first_key, second_key)
    });

    let client = client(&url);
    client.connect("token-1").await.unwrap();
    let mut states = client.subscribe_state();

    wait_for_state(&mut states, ConnectionState::Disconnected).await;
    wait_for_state(&mut states, ConnectionState::Authenticated).await;

    let (_ws, first_key, second_key) = server.await.unwrap();
    // Same stored identity key across reconnects
    assert_eq!(first_key, second_key);
    // Successful re-authentication resets the backoff counter
    assert_eq!(client.reconnect_attempts(), 0);

    client.disconnect();
}
