//! WebSocket session
//!
//! One `Session` per connection, driven by two tasks:
//! - the reader parses command frames and applies them to the broker;
//! - the writer drains the acknowledgement queue, then the delivery queue,
//!   and writes text frames.
//!
//! Both queues are bounded by `queue_size`. A full delivery queue drops the
//! message; a full acknowledgement queue means the client stopped reading, so
//! the session is closed.
//!
//! Whichever side notices the connection is gone first calls
//! [`Session::close`]. It leaves every topic exactly once and signals the other
//! side through a `watch` channel.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, warn};
use tungstenite::protocol::Message as WsMessage;

use crate::broker::{Broker, Message, Subscriber, SubscriberId};
use crate::transport::message::{ClientCommand, JOIN_ACK_TOPIC, LEAVE_ACK_TOPIC};

const WRITER_STOP_TIMEOUT: Duration = Duration::from_secs(1);

/// Receiving ends of a session's queues, consumed by its writer.
#[derive(Debug)]
pub struct SessionQueues {
    pub delivery: mpsc::Receiver<Message>,
    pub control: mpsc::Receiver<Message>,
}

#[derive(Debug)]
pub struct Session {
    pub id: SubscriberId,
    broker: Broker,
    subscriber: Subscriber,
    control: mpsc::Sender<Message>,
    closed: AtomicBool,
    closing: watch::Sender<bool>,
}

impl Session {
    /// Creates a session whose queues hold `queue_size` messages each.
    pub fn new(broker: Broker, queue_size: usize) -> (Self, SessionQueues) {
        let id = format!("session-{}", uuid::Uuid::new_v4());
        let (delivery_tx, delivery) = mpsc::channel(queue_size.max(1));
        let (control_tx, control) = mpsc::channel(queue_size.max(1));
        let (closing, _) = watch::channel(false);

        let session = Self {
            subscriber: Subscriber::new(id.clone(), delivery_tx),
            id,
            broker,
            control: control_tx,
            closed: AtomicBool::new(false),
            closing,
        };
        (session, SessionQueues { delivery, control })
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn topics(&self) -> Vec<String> {
        self.broker.registry().topics_of(&self.id)
    }

    /// Leaves every topic and signals both loops to stop. Only the first call
    /// has any effect; returns whether this call was it.
    pub fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.broker.leave_all(&self.id);
        self.closing.send_replace(true);
        debug!(session = %self.id, "session closed");
        true
    }

    /// Applies one inbound frame. Anything that is not a known command is
    /// ignored.
    pub async fn handle_frame(&self, raw: &[u8]) {
        if self.is_closed() {
            return;
        }
        let Some(command) = ClientCommand::parse(raw) else {
            debug!(
                session = %self.id,
                frame = %String::from_utf8_lossy(&raw[..raw.len().min(100)]),
                "ignoring unrecognized frame"
            );
            return;
        };
        let topics = command.topics();

        match command {
            ClientCommand::Join(_) => {
                if let Err(e) = self.broker.join(&self.subscriber, &topics).await {
                    error!(session = %self.id, ?topics, error = %e, "join failed");
                    return;
                }
                if self.is_closed() {
                    // Closed while waiting for the join; undo what it added.
                    self.broker.leave(&self.id, &topics);
                    return;
                }
                debug!(session = %self.id, ?topics, "joined");
                self.acknowledge(JOIN_ACK_TOPIC, &topics);
            }
            ClientCommand::Leave(_) => {
                self.broker.leave(&self.id, &topics);
                debug!(session = %self.id, ?topics, "left");
                self.acknowledge(LEAVE_ACK_TOPIC, &topics);
            }
        }
    }

    fn acknowledge(&self, ack_topic: &str, topics: &[String]) {
        let ack = match Message::new(ack_topic, topics) {
            Ok(ack) => ack,
            Err(e) => {
                warn!(session = %self.id, error = %e, "failed to encode acknowledgement");
                return;
            }
        };
        match self.control.try_send(ack) {
            Ok(()) | Err(TrySendError::Closed(_)) => {}
            Err(TrySendError::Full(_)) => {
                warn!(session = %self.id, "acknowledgement queue full, closing session");
                self.close();
            }
        }
    }

    /// Runs a session over an upgraded connection until the client goes away,
    /// an I/O error occurs, or `shutdown` flips to true.
    pub async fn serve<S>(
        ws: WebSocketStream<S>,
        broker: Broker,
        queue_size: usize,
        mut shutdown: watch::Receiver<bool>,
    ) where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (session, queues) = Session::new(broker, queue_size);
        let session = Arc::new(session);
        debug!(session = %session.id, "session opened");

        let (sink, mut stream) = ws.split();
        let mut writer = tokio::spawn(write_loop(
            session.clone(),
            sink,
            queues,
            session.closing.subscribe(),
        ));

        let mut closing = session.closing.subscribe();
        loop {
            if *closing.borrow() || *shutdown.borrow() {
                break;
            }

            tokio::select! {
                _ = closing.changed() => break,
                _ = shutdown.changed() => break,
                frame = stream.next() => match frame {
                    Some(Ok(WsMessage::Text(text))) => session.handle_frame(text.as_bytes()).await,
                    Some(Ok(WsMessage::Binary(data))) => session.handle_frame(&data).await,
                    Some(Ok(WsMessage::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!(session = %session.id, error = %e, "read failed");
                        break;
                    }
                },
            }
        }

        session.close();
        if tokio::time::timeout(WRITER_STOP_TIMEOUT, &mut writer)
            .await
            .is_err()
        {
            warn!(session = %session.id, "writer did not stop in time, aborting");
            writer.abort();
        }
        debug!(session = %session.id, "session finished");
    }
}

async fn write_loop<S>(
    session: Arc<Session>,
    mut sink: SplitSink<WebSocketStream<S>, WsMessage>,
    mut queues: SessionQueues,
    mut closing: watch::Receiver<bool>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        if *closing.borrow() {
            break;
        }

        let msg = tokio::select! {
            biased;
            _ = closing.changed() => break,
            Some(ack) = queues.control.recv() => ack,
            Some(msg) = queues.delivery.recv() => msg,
            else => break,
        };

        let frame = match msg.to_frame() {
            Ok(frame) => frame,
            Err(e) => {
                warn!(session = %session.id, topic = %msg.topic, error = %e, "failed to encode frame");
                continue;
            }
        };
        if let Err(e) = sink.send(WsMessage::text(frame)).await {
            debug!(session = %session.id, error = %e, "write failed");
            session.close();
            break;
        }
    }

    let _ = sink.send(WsMessage::Close(None)).await;
    let _ = sink.close().await;
}
