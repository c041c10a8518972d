/// End-to-end messaging: fake REST backend plus a loopback push server
mod common;

use common::{msg, profile, token_for, FakeBackend, ME};
use futures_util::SinkExt;
use flux_core::api::MessagingBackend;
use flux_core::composer::SubmitOutcome;
use flux_core::messenger_types::{ConversationEvent, Peer};
use flux_core::push::ChannelState;
use flux_core::{Config, Messenger, Session};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{accept_async, WebSocketStream};

async fn spawn_push_server() -> (String, mpsc::UnboundedReceiver<WebSocketStream<TcpStream>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let ws_url = format!("ws://{}", listener.local_addr().unwrap());
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            if let Ok(socket) = accept_async(stream).await {
                let _ = tx.send(socket);
            }
        }
    });
    (ws_url, rx)
}

fn start(backend: &Arc<FakeBackend>, ws_url: String) -> Messenger {
    let config = Config {
        ws_url: Some(ws_url),
        reconnect_initial_delay: Duration::from_millis(20),
        reconnect_max_delay: Duration::from_millis(100),
        ..Config::default()
    };
    let session = Session::init(token_for(ME, "me"), None).unwrap();
    let shared: Arc<dyn MessagingBackend> = backend.clone();
    Messenger::with_backend(&config, session, shared)
}

fn frame_for(id: u64, from: u64, content: &str) -> WsMessage {
    WsMessage::Text(
        serde_json::json!({
            "type": "new_message",
            "message": {
                "id": id,
                "sender_id": from,
                "receiver_id": ME,
                "content": content,
                "created_at": "2030-01-01T00:00:00Z",
                "sender": {"id": from, "username": format!("user{}", from)}
            }
        })
        .to_string(),
    )
}

#[tokio::test]
async fn test_pushed_message_lands_in_store_and_resolves_sender() {
    let backend = FakeBackend::new(ME);
    let (ws_url, mut sockets) = spawn_push_server().await;
    let messenger = start(&backend, ws_url);
    let mut events = messenger.store().subscribe(5);

    let mut server = timeout(Duration::from_secs(3), sockets.recv()).await.unwrap().unwrap();
    server.send(frame_for(40, 5, "ping from five")).await.unwrap();

    let event = timeout(Duration::from_secs(3), events.recv()).await.unwrap().unwrap();
    assert!(matches!(event, ConversationEvent::MessageAdded { ref message, .. } if message.id == Some(40)));
    assert_eq!(messenger.store().snapshot(5).await.unwrap().unread, 1);
    assert_eq!(messenger.directory().resolve(5).await.username, "user5");

    // Replay after a reconnect is absorbed
    server.send(frame_for(40, 5, "ping from five")).await.unwrap();
    server.send(frame_for(41, 5, "again")).await.unwrap();
    let event = timeout(Duration::from_secs(3), events.recv()).await.unwrap().unwrap();
    assert!(matches!(event, ConversationEvent::MessageAdded { ref message, .. } if message.id == Some(41)));
    assert_eq!(messenger.store().messages(5).await.len(), 2);

    messenger.teardown().await;
}

#[tokio::test]
async fn test_open_conversation_and_send() {
    let backend = FakeBackend::new(ME);
    backend.set_following(vec![Peer::from(profile(2, "bob"))]);
    backend.set_users(vec![profile(2, "bob"), profile(9, "ivy")]);
    backend.set_history(9, vec![msg(1, 9, ME, 10), msg(2, ME, 9, 20)]);
    let (ws_url, mut sockets) = spawn_push_server().await;
    let messenger = start(&backend, ws_url);
    let _server = timeout(Duration::from_secs(3), sockets.recv()).await.unwrap().unwrap();

    let peers = messenger.refresh_peers().await.unwrap();
    assert_eq!(peers.len(), 1);

    // Not followed: resolved through the user scan
    let (peer, history) = messenger.open_conversation(9).await.unwrap();
    assert_eq!(peer.username, "ivy");
    assert_eq!(history.len(), 2);
    assert_eq!(messenger.store().active().await, Some(9));

    let outcome = messenger.send(9, "  hi ivy  ").await.unwrap();
    let sent = match outcome {
        SubmitOutcome::Sent(message) => message,
        other => panic!("unexpected outcome {:?}", other),
    };
    assert_eq!(sent.content, "hi ivy");
    let messages = messenger.store().messages(9).await;
    assert_eq!(messages.len(), 3);
    assert_eq!(messages.last().unwrap().id, sent.id);

    messenger.teardown().await;
}

#[tokio::test]
async fn test_replay_after_reconnect_lands_once() {
    let backend = FakeBackend::new(ME);
    let (ws_url, mut sockets) = spawn_push_server().await;
    let messenger = start(&backend, ws_url);
    let mut events = messenger.store().subscribe(6);

    let mut first = timeout(Duration::from_secs(3), sockets.recv()).await.unwrap().unwrap();
    first.send(frame_for(50, 6, "before the drop")).await.unwrap();
    let event = timeout(Duration::from_secs(3), events.recv()).await.unwrap().unwrap();
    assert!(matches!(event, ConversationEvent::MessageAdded { ref message, .. } if message.id == Some(50)));
    drop(first);

    // The server replays what it already pushed, then carries on
    let mut second = timeout(Duration::from_secs(3), sockets.recv()).await.unwrap().unwrap();
    second.send(frame_for(50, 6, "before the drop")).await.unwrap();
    second.send(frame_for(51, 6, "after the drop")).await.unwrap();

    let event = timeout(Duration::from_secs(3), events.recv()).await.unwrap().unwrap();
    assert!(matches!(event, ConversationEvent::MessageAdded { ref message, .. } if message.id == Some(51)));
    assert!(timeout(Duration::from_millis(100), events.recv()).await.is_err());

    let stored: Vec<_> = messenger.store().messages(6).await.iter().filter_map(|m| m.id).collect();
    assert_eq!(stored, vec![50, 51]);
    assert_eq!(messenger.channel_state(), ChannelState::Connected);

    messenger.teardown().await;
}

#[tokio::test]
async fn test_teardown_closes_channel() {
    let backend = FakeBackend::new(ME);
    let (ws_url, mut sockets) = spawn_push_server().await;
    let messenger = start(&backend, ws_url);
    let _server = timeout(Duration::from_secs(3), sockets.recv()).await.unwrap().unwrap();

    let state = messenger.watch_channel().unwrap();
    messenger.teardown().await;
    assert_eq!(*state.borrow(), ChannelState::Closed);
}
