//! Broker engine
//!
//! `Broker` is the single entry point for fan-out. It owns the topic registry
//! and one of two transports:
//! - `Local`: `broadcast` enqueues directly on every subscriber of the topic.
//! - `Redis`: `broadcast` publishes to the topic's Redis channel; every node,
//!   this one included, delivers locally when the message comes back through
//!   its subscription.
//!
//! Concurrency and usage notes:
//! - `Broker` is a cheap `Arc` handle; clone it into every task that needs it.
//! - `broadcast` never waits on a subscriber. Each subscriber has a bounded
//!   queue; when it is full the message is dropped for that subscriber only.
//! - Only `join`, `leave` and `leave_all` mutate the registry.

use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::broker::message::Message;
use crate::broker::redis::RedisTransport;
use crate::broker::topic::{Registry, Subscriber, SubscriberId};
use crate::config::{BroadcastSettings, BrokerMode};
use crate::utils::error::{BroadcastError, BroadcastResult, RedisError};

/// Lifecycle of a broker.
///
/// `Subscribed` means the broker is delivering. A local broker moves straight
/// from `Disconnected` to `Subscribed` on start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BrokerState {
    #[default]
    Disconnected,
    Connecting,
    Subscribed,
    Closing,
    Closed,
    /// The Redis backend was lost and could not be recovered.
    Failed,
}

/// Broker state shared between the handle and the Redis listener.
#[derive(Debug, Clone, Default)]
pub(crate) struct StateCell(Arc<Mutex<BrokerState>>);

impl StateCell {
    pub(crate) fn get(&self) -> BrokerState {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn set(&self, next: BrokerState) {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner) = next;
    }

    /// Like `set`, but never leaves `Closing` or `Closed`.
    pub(crate) fn advance(&self, next: BrokerState) -> bool {
        let mut state = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        if matches!(*state, BrokerState::Closing | BrokerState::Closed) {
            return false;
        }
        *state = next;
        true
    }
}

#[derive(Debug)]
enum Transport {
    Local,
    Redis(RedisTransport),
}

#[derive(Debug)]
struct Inner {
    registry: Arc<Registry>,
    transport: Transport,
    state: StateCell,
}

#[derive(Debug, Clone)]
pub struct Broker {
    inner: Arc<Inner>,
}

impl Default for Broker {
    fn default() -> Self {
        Self::local()
    }
}

impl Broker {
    /// Builds a broker for the backend `settings` selects. No I/O happens
    /// until [`Broker::start`].
    pub fn new(settings: &BroadcastSettings) -> Self {
        let transport = match &settings.redis {
            Some(redis) => Transport::Redis(RedisTransport::new(redis.clone())),
            None => Transport::Local,
        };

        Self {
            inner: Arc::new(Inner {
                registry: Arc::new(Registry::new()),
                transport,
                state: StateCell::default(),
            }),
        }
    }

    pub fn local() -> Self {
        Self::new(&BroadcastSettings::default())
    }

    pub fn mode(&self) -> BrokerMode {
        match self.inner.transport {
            Transport::Local => BrokerMode::Local,
            Transport::Redis(_) => BrokerMode::Redis,
        }
    }

    pub fn state(&self) -> BrokerState {
        self.inner.state.get()
    }

    pub fn registry(&self) -> &Registry {
        &self.inner.registry
    }

    /// Brings the broker up. For Redis this connects the publisher and the
    /// subscriber; any failure is returned and the broker stays
    /// `Disconnected`.
    pub async fn start(&self) -> BroadcastResult<()> {
        match self.state() {
            BrokerState::Subscribed | BrokerState::Connecting => return Ok(()),
            BrokerState::Closing | BrokerState::Closed => return Err(BroadcastError::Closed),
            BrokerState::Failed => return Err(BroadcastError::BackendLost),
            BrokerState::Disconnected => {}
        }

        match &self.inner.transport {
            Transport::Local => {
                self.inner.state.advance(BrokerState::Subscribed);
                info!("local broker started");
                Ok(())
            }
            Transport::Redis(redis) => {
                self.inner.state.advance(BrokerState::Connecting);
                info!(addr = %redis.settings().addr, "connecting to redis");

                match redis
                    .connect(self.inner.registry.clone(), self.inner.state.clone())
                    .await
                {
                    Ok(()) => {
                        self.inner.state.advance(BrokerState::Subscribed);
                        info!(addr = %redis.settings().addr, "redis broker started");
                        Ok(())
                    }
                    Err(e) => {
                        self.inner.state.advance(BrokerState::Disconnected);
                        Err(e.into())
                    }
                }
            }
        }
    }

    /// Delivers `msg` to every subscriber of its topic.
    ///
    /// A payload that is not valid JSON is dropped and `Ok(())` returned, so
    /// one bad message never breaks the stream for later ones.
    pub async fn broadcast(&self, msg: Message) -> BroadcastResult<()> {
        match self.state() {
            BrokerState::Closing | BrokerState::Closed => return Err(BroadcastError::Closed),
            BrokerState::Failed => return Err(BroadcastError::BackendLost),
            _ => {}
        }
        if msg.topic.is_empty() {
            return Err(BroadcastError::EmptyTopic);
        }
        if !msg.is_valid() {
            warn!(topic = %msg.topic, "dropping message with malformed json payload");
            return Ok(());
        }

        match &self.inner.transport {
            Transport::Local => {
                deliver(&self.inner.registry, &msg);
                Ok(())
            }
            Transport::Redis(redis) => {
                if self.state() == BrokerState::Disconnected {
                    return Err(BroadcastError::NotStarted);
                }
                redis.publish(&msg).await?;
                Ok(())
            }
        }
    }

    /// Joins `subscriber` to each non-empty topic in `topics`. Joining twice
    /// is a no-op. With Redis, waits until the channels are subscribed so a
    /// broadcast issued after `join` returns is delivered; if that cannot be
    /// confirmed, the topics this call added are left again.
    pub async fn join(&self, subscriber: &Subscriber, topics: &[String]) -> BroadcastResult<()> {
        match self.state() {
            BrokerState::Closing | BrokerState::Closed => return Err(BroadcastError::Closed),
            BrokerState::Failed => return Err(BroadcastError::BackendLost),
            _ => {}
        }

        let already = self.inner.registry.topics_of(&subscriber.id);
        let mut added: Vec<String> = Vec::new();
        let mut confirmations = Vec::new();
        for topic in topics.iter().filter(|t| !t.is_empty()) {
            if !already.contains(topic) && !added.contains(topic) {
                added.push(topic.clone());
            }
            if self.inner.registry.join(topic, subscriber) {
                debug!(%topic, "topic activated");
            }
            if let Transport::Redis(redis) = &self.inner.transport {
                confirmations.push(redis.sync(topic));
            }
        }

        let Transport::Redis(redis) = &self.inner.transport else {
            return Ok(());
        };
        if confirmations.is_empty() || self.state() != BrokerState::Subscribed {
            return Ok(());
        }
        if let Err(e) = confirm(redis, confirmations).await {
            warn!(subscriber = %subscriber.id, topics = ?added, error = %e, "join not confirmed, rolling back");
            self.leave(&subscriber.id, &added);
            return Err(e);
        }
        Ok(())
    }

    /// Removes `id` from each topic in `topics`. Leaving a topic that was
    /// never joined is a no-op.
    pub fn leave(&self, id: &SubscriberId, topics: &[String]) {
        for topic in topics {
            if self.inner.registry.leave(topic, id) {
                self.deactivate(topic);
            }
        }
    }

    /// Removes `id` from every topic it joined.
    pub fn leave_all(&self, id: &SubscriberId) {
        for topic in self.inner.registry.leave_all(id) {
            self.deactivate(&topic);
        }
    }

    fn deactivate(&self, topic: &str) {
        debug!(%topic, "topic has no subscribers left");
        if let Transport::Redis(redis) = &self.inner.transport {
            redis.notify(topic);
        }
    }

    /// Stops the broker: Redis connections are closed and every later
    /// `broadcast` fails with [`BroadcastError::Closed`].
    pub async fn close(&self) {
        if matches!(self.state(), BrokerState::Closing | BrokerState::Closed) {
            return;
        }
        self.inner.state.set(BrokerState::Closing);

        if let Transport::Redis(redis) = &self.inner.transport {
            redis.close().await;
        }

        self.inner.state.set(BrokerState::Closed);
        info!("broker closed");
    }
}

/// Waits for every subscription confirmation within one response timeout.
async fn confirm(
    redis: &RedisTransport,
    confirmations: Vec<oneshot::Receiver<()>>,
) -> BroadcastResult<()> {
    let deadline = Instant::now() + redis.settings().response_timeout();
    for confirmation in confirmations {
        match tokio::time::timeout_at(deadline, confirmation).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => return Err(BroadcastError::BackendLost),
            Err(_) => {
                let waited_for = "subscribe confirmation".to_string();
                return Err(RedisError::ReplyTimeout(waited_for).into());
            }
        }
    }
    Ok(())
}

/// Enqueues `msg` on every subscriber of its topic without waiting. Returns
/// how many subscribers accepted it.
pub(crate) fn deliver(registry: &Registry, msg: &Message) -> usize {
    let mut delivered = 0;

    for subscriber in registry.subscribers(&msg.topic) {
        match subscriber.sender.try_send(msg.clone()) {
            Ok(()) => delivered += 1,
            Err(TrySendError::Full(_)) => warn!(
                subscriber = %subscriber.id,
                topic = %msg.topic,
                "delivery queue full, message dropped"
            ),
            Err(TrySendError::Closed(_)) => {
                debug!(subscriber = %subscriber.id, "delivery queue closed")
            }
        }
    }

    trace!(topic = %msg.topic, delivered, "message fanned out");
    delivered
}
