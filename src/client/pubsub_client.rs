use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::mpsc;
use tracing::debug;

use crate::broker::{Broker, Message, Subscriber, SubscriberId};
use crate::utils::error::BroadcastResult;

/// A programmatic producer/consumer bound to a caller-owned channel.
///
/// Each client gets a unique `client-<uuid>` id. Dropping the client leaves
/// every topic it joined.
#[derive(Debug)]
pub struct Client {
    /// Unique identifier for the client.
    pub id: SubscriberId,
    broker: Broker,
    subscriber: Subscriber,
    closed: AtomicBool,
}

impl Client {
    pub fn new(broker: Broker, sender: mpsc::Sender<Message>) -> Self {
        let id = format!("client-{}", uuid::Uuid::new_v4());

        Self {
            subscriber: Subscriber::new(id.clone(), sender),
            id,
            broker,
            closed: AtomicBool::new(false),
        }
    }

    /// Joins `topic`. Once this returns, messages broadcast on `topic` are
    /// pushed onto the client's channel.
    pub async fn connect(&self, topic: &str) -> BroadcastResult<()> {
        self.broker
            .join(&self.subscriber, &[topic.to_string()])
            .await?;
        debug!(client = %self.id, %topic, "client connected to topic");
        Ok(())
    }

    pub fn disconnect(&self, topic: &str) {
        self.broker.leave(&self.id, &[topic.to_string()]);
    }

    pub fn topics(&self) -> Vec<String> {
        self.broker.registry().topics_of(&self.id)
    }

    pub async fn publish(&self, msg: Message) -> BroadcastResult<()> {
        self.broker.broadcast(msg).await
    }

    /// Leaves every topic. Safe to call more than once.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.broker.leave_all(&self.id);
        debug!(client = %self.id, "client closed");
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.close();
    }
}
