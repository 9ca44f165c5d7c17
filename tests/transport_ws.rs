//! ServerTransport behavior against a real WebSocket server: greeting on
//! connect, inbound dispatch, ordered outbound drain, redial after a drop.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::Map;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::{accept_async, tungstenite};
use tokio_util::sync::CancellationToken;

use shufflebox::{Command, CommandKind, ServerTransport};

type ServerWs = tokio_tungstenite::WebSocketStream<tokio::net::TcpStream>;

async fn accept_client(listener: &TcpListener) -> ServerWs {
    let (stream, _) = tokio::time::timeout(Duration::from_secs(10), listener.accept())
        .await
        .expect("timed out waiting for the client to dial")
        .expect("accept failed");
    accept_async(stream).await.expect("websocket handshake")
}

async fn recv_command(ws: &mut ServerWs) -> Command {
    loop {
        let message = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("stream ended")
            .expect("read error");
        if let tungstenite::Message::Text(text) = message {
            return Command::decode(&text).expect("decodable command");
        }
    }
}

#[tokio::test]
async fn transport_round_trip_and_reconnect() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let cancel = CancellationToken::new();

    let transport = ServerTransport::start(
        format!("http://{addr}"),
        "alice".to_string(),
        cancel.clone(),
    );
    let (intake_tx, mut intake_rx) = mpsc::channel(8);
    transport.register_handler(intake_tx);

    let mut ws = accept_client(&listener).await;

    // The greeting identifies the player before anything else
    let hello = recv_command(&mut ws).await;
    assert_eq!(hello.cmd, CommandKind::Hello);
    assert_eq!(hello.str_field("player"), Some("alice"));

    // Inbound commands reach the registered handler
    let pause = Command::new(CommandKind::Pause, Map::new());
    ws.send(tungstenite::Message::Text(pause.encode()))
        .await
        .unwrap();
    let received = tokio::time::timeout(Duration::from_secs(5), intake_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(received.cmd, CommandKind::Pause);
    assert_eq!(received.id, pause.id);

    // Outbound messages preserve enqueue order
    transport.send(Command::ack("one")).await.unwrap();
    transport.send(Command::ack("two")).await.unwrap();
    let first = recv_command(&mut ws).await;
    let second = recv_command(&mut ws).await;
    assert_eq!(first.id, "one");
    assert_eq!(second.id, "two");

    // Dropping the connection triggers a redial with a fresh greeting
    drop(ws);
    let mut ws = accept_client(&listener).await;
    let hello = recv_command(&mut ws).await;
    assert_eq!(hello.cmd, CommandKind::Hello);

    // Messages enqueued while the link flapped still go out
    transport.send(Command::ack("after-reconnect")).await.unwrap();
    let queued = recv_command(&mut ws).await;
    assert_eq!(queued.id, "after-reconnect");

    cancel.cancel();
}

#[tokio::test]
async fn transport_survives_refused_dials_until_server_appears() {
    // Reserve a port, then close the listener so the first dials are refused
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let cancel = CancellationToken::new();
    let transport = ServerTransport::start(
        format!("http://{addr}"),
        "bob".to_string(),
        cancel.clone(),
    );

    // Let at least one dial fail before the server comes up
    tokio::time::sleep(Duration::from_millis(500)).await;
    let listener = TcpListener::bind(addr).await.unwrap();

    let mut ws = accept_client(&listener).await;
    let hello = recv_command(&mut ws).await;
    assert_eq!(hello.cmd, CommandKind::Hello);
    assert_eq!(hello.str_field("player"), Some("bob"));

    let _ = transport;
    cancel.cancel();
}
