//! In-process Redis stand-in for tests.
//!
//! Speaks just enough RESP for the broker: `PING`, `AUTH`/`SELECT` (answered
//! `OK`), `SUBSCRIBE`, `UNSUBSCRIBE` and `PUBLISH` with real pub/sub fan-out
//! between its connections. A silent server answers `PING` only, leaving
//! subscriptions and publishes unanswered.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::RedisSettings;
use crate::resp::{Connection, Frame};

const WAIT: Duration = Duration::from_secs(2);

struct Peer {
    channels: HashSet<String>,
    outbox: mpsc::UnboundedSender<Frame>,
}

#[derive(Default)]
struct Shared {
    peers: HashMap<usize, Peer>,
    tasks: Vec<JoinHandle<()>>,
    next_id: usize,
}

pub(crate) struct MockRedis {
    pub addr: String,
    shared: Arc<Mutex<Shared>>,
    commands: mpsc::UnboundedReceiver<Vec<String>>,
    acceptor: JoinHandle<()>,
}

impl MockRedis {
    pub async fn start() -> Self {
        Self::spawn(true).await
    }

    /// A server that never confirms SUBSCRIBE nor answers PUBLISH.
    pub async fn silent() -> Self {
        Self::spawn(false).await
    }

    async fn spawn(answering: bool) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let shared = Arc::new(Mutex::new(Shared::default()));
        let (log, commands) = mpsc::unbounded_channel();
        let acceptor = tokio::spawn(accept(listener, shared.clone(), log, answering));

        Self {
            addr,
            shared,
            commands,
            acceptor,
        }
    }

    /// Settings pointing at this server with short timeouts and retries.
    pub fn settings(&self) -> RedisSettings {
        let mut settings = RedisSettings::with_addr(self.addr.clone());
        settings.connect_timeout_ms = 500;
        settings.reconnect_delay_ms = 10;
        settings.max_reconnect_attempts = 2;
        settings.response_timeout_ms = 300;
        settings
    }

    /// Waits for the next SUBSCRIBE or UNSUBSCRIBE and returns it, command
    /// name first. Every other command is skipped.
    pub async fn next_subscription_command(&mut self) -> Vec<String> {
        tokio::time::timeout(WAIT, async {
            loop {
                let command = self.commands.recv().await.unwrap();
                if matches!(command[0].as_str(), "SUBSCRIBE" | "UNSUBSCRIBE") {
                    return command;
                }
            }
        })
        .await
        .expect("no subscription command received")
    }

    /// Publishes raw `payload` on `channel` as another node would. Returns how
    /// many connections received it.
    pub fn inject(&self, channel: &str, payload: &'static [u8]) -> usize {
        let shared = self.shared.lock().unwrap();
        fan_out(&shared, channel, Bytes::from_static(payload))
    }

    /// Closes every open connection; new ones are still accepted.
    pub fn drop_connections(&self) {
        let mut shared = self.shared.lock().unwrap();
        for task in shared.tasks.drain(..) {
            task.abort();
        }
        shared.peers.clear();
    }

    /// Closes every connection and stops accepting.
    pub fn kill(&self) {
        self.acceptor.abort();
        self.drop_connections();
    }
}

impl Drop for MockRedis {
    fn drop(&mut self) {
        self.kill();
    }
}

async fn accept(
    listener: TcpListener,
    shared: Arc<Mutex<Shared>>,
    log: mpsc::UnboundedSender<Vec<String>>,
    answering: bool,
) {
    while let Ok((stream, _)) = listener.accept().await {
        let (outbox, inbox) = mpsc::unbounded_channel();
        let conn = Connection::new(stream);

        let mut guard = shared.lock().unwrap();
        let id = guard.next_id;
        guard.next_id += 1;
        guard.peers.insert(
            id,
            Peer {
                channels: HashSet::new(),
                outbox,
            },
        );
        let task = tokio::spawn(serve(id, conn, inbox, shared.clone(), log.clone(), answering));
        guard.tasks.push(task);
    }
}

async fn serve(
    id: usize,
    mut conn: Connection,
    mut inbox: mpsc::UnboundedReceiver<Frame>,
    shared: Arc<Mutex<Shared>>,
    log: mpsc::UnboundedSender<Vec<String>>,
    answering: bool,
) {
    'session: loop {
        let replies = tokio::select! {
            Some(frame) = inbox.recv() => vec![frame],
            frame = conn.read_frame() => {
                let Ok(Some(Frame::Array(items))) = frame else {
                    break 'session;
                };
                let _ = log.send(items.iter().map(|f| f.as_str().unwrap_or_default().to_string()).collect());
                let mut shared = shared.lock().unwrap();
                execute(&mut shared, id, &items, answering)
            }
        };
        for reply in replies {
            if conn.write_frame(&reply).await.is_err() {
                break 'session;
            }
        }
    }
    shared.lock().unwrap().peers.remove(&id);
}

fn execute(shared: &mut Shared, id: usize, items: &[Frame], answering: bool) -> Vec<Frame> {
    let name = items
        .first()
        .and_then(Frame::as_str)
        .unwrap_or_default()
        .to_ascii_uppercase();
    let args: Vec<String> = items
        .iter()
        .skip(1)
        .map(|f| f.as_str().unwrap_or_default().to_string())
        .collect();

    match name.as_str() {
        "PING" => vec![Frame::Simple("PONG".into())],
        "SUBSCRIBE" | "UNSUBSCRIBE" => {
            let Some(peer) = shared.peers.get_mut(&id) else {
                return Vec::new();
            };
            let kind = name.to_ascii_lowercase();
            let mut replies = Vec::new();
            for channel in args {
                if name == "SUBSCRIBE" {
                    peer.channels.insert(channel.clone());
                } else {
                    peer.channels.remove(&channel);
                }
                if answering {
                    replies.push(Frame::Array(vec![
                        Frame::Bulk(Bytes::from(kind.clone())),
                        Frame::Bulk(Bytes::from(channel)),
                        Frame::Integer(peer.channels.len() as i64),
                    ]));
                }
            }
            replies
        }
        "PUBLISH" => {
            let payload = match items.get(2) {
                Some(Frame::Bulk(payload)) => payload.clone(),
                _ => Bytes::new(),
            };
            let channel = args.first().map(String::as_str).unwrap_or_default();
            let receivers = fan_out(shared, channel, payload);
            if answering {
                vec![Frame::Integer(receivers as i64)]
            } else {
                Vec::new()
            }
        }
        _ => vec![Frame::Simple("OK".into())],
    }
}

fn fan_out(shared: &Shared, channel: &str, payload: Bytes) -> usize {
    let mut receivers = 0;
    for peer in shared.peers.values() {
        if peer.channels.contains(channel) {
            let message = Frame::Array(vec![
                Frame::Bulk(Bytes::from_static(b"message")),
                Frame::Bulk(Bytes::from(channel.to_string())),
                Frame::Bulk(payload.clone()),
            ]);
            if peer.outbox.send(message).is_ok() {
                receivers += 1;
            }
        }
    }
    receivers
}
