use std::net::SocketAddr;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tungstenite::protocol::Message as WsMessage;

use crate::broker::Message;
use crate::config::{RedisSettings, Settings};
use crate::resp::mock_server::MockRedis;
use crate::service::Service;
use crate::utils::error::{BroadcastError, BroadcastResult};

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

const TIMEOUT: Duration = Duration::from_secs(2);

async fn start(settings: Settings) -> (Service, SocketAddr, JoinHandle<BroadcastResult<()>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let service = Service::new(settings);

    let server = service.clone();
    let handle = tokio::spawn(async move { server.serve_on(listener).await });

    // Wait for the broker to come up.
    for _ in 0..100 {
        if service.broker().state() == crate::broker::BrokerState::Subscribed {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    (service, addr, handle)
}

async fn connect(addr: SocketAddr) -> Ws {
    let (ws, _) = connect_async(format!("ws://{addr}/ws")).await.unwrap();
    ws
}

async fn send(ws: &mut Ws, frame: &str) {
    ws.send(WsMessage::text(frame.to_string())).await.unwrap();
}

async fn next_text(ws: &mut Ws) -> String {
    loop {
        let frame = tokio::time::timeout(TIMEOUT, ws.next())
            .await
            .expect("no frame received")
            .expect("stream ended")
            .unwrap();
        if let WsMessage::Text(text) = frame {
            return text.to_string();
        }
    }
}

async fn assert_silent(ws: &mut Ws) {
    let frame = tokio::time::timeout(Duration::from_millis(200), ws.next()).await;
    assert!(frame.is_err(), "unexpected frame: {frame:?}");
}

/// Join, double join, isolation, malformed payload, leave.
async fn broadcast_scenario(service: &Service, ws: &mut Ws) {
    let broker = service.broker();

    send(ws, r#"{"cmd":"join","args":["topic"]}"#).await;
    assert_eq!(next_text(ws).await, r#"{"topic":"@join","payload":["topic"]}"#);
    send(ws, r#"{"cmd":"join","args":["topic"]}"#).await;
    assert_eq!(next_text(ws).await, r#"{"topic":"@join","payload":["topic"]}"#);

    broker
        .broadcast(Message::new("topic2", "hello").unwrap())
        .await
        .unwrap();
    broker
        .broadcast(Message::from_raw("topic", "broken"))
        .await
        .unwrap();
    broker
        .broadcast(Message::new("topic", "hello2").unwrap())
        .await
        .unwrap();
    assert_eq!(next_text(ws).await, r#"{"topic":"topic","payload":"hello2"}"#);
    assert_silent(ws).await;

    send(ws, r#"{"cmd":"leave","args":["topic"]}"#).await;
    assert_eq!(next_text(ws).await, r#"{"topic":"@leave","payload":["topic"]}"#);
    send(ws, r#"{"cmd":"leave","args":["topic"]}"#).await;
    assert_eq!(next_text(ws).await, r#"{"topic":"@leave","payload":["topic"]}"#);

    broker
        .broadcast(Message::new("topic", "after leave").unwrap())
        .await
        .unwrap();
    assert_silent(ws).await;
}

#[tokio::test]
async fn test_local_broadcast_over_websocket() {
    let (service, addr, handle) = start(Settings::default()).await;
    let mut ws = connect(addr).await;

    broadcast_scenario(&service, &mut ws).await;

    service.stop().await;
    tokio::time::timeout(TIMEOUT, handle)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_unknown_command_keeps_connection_open() {
    let (service, addr, _handle) = start(Settings::default()).await;
    let mut ws = connect(addr).await;

    send(&mut ws, r#"{"cmd":"shout","args":["topic"]}"#).await;
    send(&mut ws, "garbage").await;
    assert_silent(&mut ws).await;

    send(&mut ws, r#"{"cmd":"join","args":["topic"]}"#).await;
    assert_eq!(next_text(&mut ws).await, r#"{"topic":"@join","payload":["topic"]}"#);
    service.stop().await;
}

#[tokio::test]
async fn test_programmatic_client_reaches_websocket() {
    let (service, addr, _handle) = start(Settings::default()).await;
    let mut ws = connect(addr).await;

    send(&mut ws, r#"{"cmd":"join","args":["default"]}"#).await;
    next_text(&mut ws).await;

    let (tx, mut rx) = tokio::sync::mpsc::channel(8);
    let client = service.new_client(tx);
    client.connect("default").await.unwrap();
    client
        .publish(Message::new("default", "hello").unwrap())
        .await
        .unwrap();

    assert_eq!(next_text(&mut ws).await, r#"{"topic":"default","payload":"hello"}"#);
    let got = rx.recv().await.unwrap();
    assert_eq!(&got.payload[..], b"\"hello\"");
    service.stop().await;
}

#[tokio::test]
async fn test_wrong_path_is_rejected() {
    let (service, addr, _handle) = start(Settings::default()).await;

    let result = connect_async(format!("ws://{addr}/elsewhere")).await;
    match result {
        Err(tungstenite::Error::Http(response)) => assert_eq!(response.status(), 404),
        Err(e) => panic!("expected a 404, got {e}"),
        Ok(_) => panic!("upgrade on the wrong path succeeded"),
    }
    service.stop().await;
}

#[tokio::test]
async fn test_disconnect_leaves_topics() {
    let (service, addr, _handle) = start(Settings::default()).await;
    let mut ws = connect(addr).await;

    send(&mut ws, r#"{"cmd":"join","args":["a","b"]}"#).await;
    next_text(&mut ws).await;
    assert_eq!(service.broker().registry().topics().len(), 2);

    ws.close(None).await.unwrap();
    for _ in 0..100 {
        if service.broker().registry().topics().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(service.broker().registry().topics().is_empty());
    service.stop().await;
}

#[tokio::test]
async fn test_stop_closes_sessions_and_rejects_broadcasts() {
    let (service, addr, handle) = start(Settings::default()).await;
    let mut ws = connect(addr).await;
    send(&mut ws, r#"{"cmd":"join","args":["topic"]}"#).await;
    next_text(&mut ws).await;

    service.stop().await;
    tokio::time::timeout(TIMEOUT, handle)
        .await
        .unwrap()
        .unwrap()
        .unwrap();

    let frame = tokio::time::timeout(TIMEOUT, ws.next()).await.unwrap();
    assert!(!matches!(frame, Some(Ok(WsMessage::Text(_)))));
    assert!(matches!(
        service.broker().broadcast(Message::new("topic", "late").unwrap()).await,
        Err(BroadcastError::Closed)
    ));
    assert!(matches!(service.serve().await, Err(BroadcastError::Closed)));
}

#[tokio::test]
async fn test_unreachable_redis_fails_startup() {
    let refused = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let redis_addr = refused.local_addr().unwrap().to_string();
    drop(refused);

    let mut settings = Settings::default();
    settings.broadcast.redis = Some(RedisSettings::with_addr(redis_addr));
    let service = Service::new(settings);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let result = tokio::time::timeout(TIMEOUT * 2, service.serve_on(listener))
        .await
        .expect("startup must fail instead of serving");
    assert!(matches!(result, Err(BroadcastError::Redis(_))));
}

#[tokio::test]
async fn test_redis_broadcast_over_websocket() {
    let server = MockRedis::start().await;
    let mut settings = Settings::default();
    settings.broadcast.redis = Some(server.settings());
    let (service, addr, _handle) = start(settings).await;
    let mut ws = connect(addr).await;

    broadcast_scenario(&service, &mut ws).await;
    service.stop().await;
}
