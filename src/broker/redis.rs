//! Redis transport
//!
//! Two connections per broker: a publisher used by `broadcast`, and a
//! subscriber owned by a background listener task. The listener keeps the set
//! of subscribed Redis channels in line with the registry: whenever a topic
//! may have gained its first subscriber or lost its last one, the broker sends
//! it a reconcile request and the listener compares the registry against what
//! it has asked Redis for. Messages arriving on a channel are fanned out to the
//! local subscribers of the matching topic, exactly like a local broadcast.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{Mutex as AsyncMutex, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::broker::engine::{BrokerState, StateCell, deliver};
use crate::broker::message::Message;
use crate::broker::topic::Registry;
use crate::config::RedisSettings;
use crate::resp::{Connection, Frame};
use crate::utils::error::RedisError;

const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(5);
const LISTENER_STOP_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug)]
struct Reconcile {
    topic: String,
    done: Option<oneshot::Sender<()>>,
}

#[derive(Debug)]
pub(crate) struct RedisTransport {
    settings: RedisSettings,
    publisher: AsyncMutex<Option<Connection>>,
    control_tx: mpsc::UnboundedSender<Reconcile>,
    control_rx: Mutex<Option<mpsc::UnboundedReceiver<Reconcile>>>,
    shutdown: watch::Sender<bool>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl RedisTransport {
    pub(crate) fn new(settings: RedisSettings) -> Self {
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (shutdown, _) = watch::channel(false);

        Self {
            settings,
            publisher: AsyncMutex::new(None),
            control_tx,
            control_rx: Mutex::new(Some(control_rx)),
            shutdown,
            listener: Mutex::new(None),
        }
    }

    pub(crate) fn settings(&self) -> &RedisSettings {
        &self.settings
    }

    /// Opens both connections and spawns the listener. Fails without side
    /// effects if either connection cannot be established.
    pub(crate) async fn connect(
        &self,
        registry: Arc<Registry>,
        state: StateCell,
    ) -> Result<(), RedisError> {
        let publisher = Connection::open(&self.settings).await?;
        let subscriber = Connection::open(&self.settings).await?;

        *self.publisher.lock().await = Some(publisher);

        let control = self
            .control_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(control) = control else {
            return Ok(());
        };

        let listener = Listener {
            settings: self.settings.clone(),
            registry,
            control,
            shutdown: self.shutdown.subscribe(),
            state,
            subscriptions: Subscriptions::default(),
            pending: HashMap::new(),
        };
        let handle = tokio::spawn(listener.run(subscriber));
        *self.listener.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);

        Ok(())
    }

    /// Publishes `msg` on its topic channel. A failed publisher connection is
    /// dropped and re-opened by the next call.
    pub(crate) async fn publish(&self, msg: &Message) -> Result<(), RedisError> {
        let mut publisher = self.publisher.lock().await;
        if publisher.is_none() {
            *publisher = Some(Connection::open(&self.settings).await?);
        }
        let Some(conn) = publisher.as_mut() else {
            return Err(RedisError::ConnectionClosed);
        };

        let command = Frame::command([
            Bytes::from_static(b"PUBLISH"),
            Bytes::from(self.settings.channel(&msg.topic)),
            msg.payload.clone(),
        ]);
        let reply = tokio::time::timeout(self.settings.response_timeout(), conn.request(&command))
            .await
            .unwrap_or_else(|_| Err(RedisError::ReplyTimeout("PUBLISH reply".to_string())));
        match reply {
            Ok(Frame::Integer(receivers)) => {
                trace!(topic = %msg.topic, receivers, "published to redis");
                Ok(())
            }
            Ok(other) => Err(RedisError::UnexpectedReply(format!("{other:?}"))),
            Err(e) => {
                *publisher = None;
                Err(e)
            }
        }
    }

    /// Asks the listener to reconcile `topic`; the receiver resolves once the
    /// channel subscription matches the registry.
    pub(crate) fn sync(&self, topic: &str) -> oneshot::Receiver<()> {
        let (done, confirmed) = oneshot::channel();
        let _ = self.control_tx.send(Reconcile {
            topic: topic.to_string(),
            done: Some(done),
        });
        confirmed
    }

    /// Fire-and-forget variant of [`RedisTransport::sync`].
    pub(crate) fn notify(&self, topic: &str) {
        let _ = self.control_tx.send(Reconcile {
            topic: topic.to_string(),
            done: None,
        });
    }

    pub(crate) async fn close(&self) {
        self.shutdown.send_replace(true);
        self.publisher.lock().await.take();

        let handle = self
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(mut handle) = handle {
            if tokio::time::timeout(LISTENER_STOP_TIMEOUT, &mut handle)
                .await
                .is_err()
            {
                warn!("redis listener did not stop in time, aborting");
                handle.abort();
            }
        }
    }
}

/// Channel bookkeeping of one subscriber connection.
#[derive(Debug, Default)]
pub(crate) struct Subscriptions {
    /// Channels we sent SUBSCRIBE for and have not unsubscribed since.
    requested: HashSet<String>,
    /// Subset of `requested` that Redis has confirmed.
    confirmed: HashSet<String>,
    /// SUBSCRIBE commands per channel still waiting for their reply.
    inflight: HashMap<String, usize>,
}

impl Subscriptions {
    pub(crate) fn reset(&mut self) {
        self.requested.clear();
        self.confirmed.clear();
        self.inflight.clear();
    }

    /// Records a SUBSCRIBE about to be sent. False when the channel is
    /// already requested and nothing needs sending.
    pub(crate) fn subscribe(&mut self, channel: &str) -> bool {
        if !self.requested.insert(channel.to_string()) {
            return false;
        }
        *self.inflight.entry(channel.to_string()).or_default() += 1;
        true
    }

    /// Records an UNSUBSCRIBE about to be sent. False when the channel was
    /// not requested.
    pub(crate) fn unsubscribe(&mut self, channel: &str) -> bool {
        self.confirmed.remove(channel);
        self.requested.remove(channel)
    }

    /// Applies a `subscribe` reply. True only when it answers the latest
    /// SUBSCRIBE sent for a channel that is still requested.
    pub(crate) fn confirm(&mut self, channel: &str) -> bool {
        if let Some(count) = self.inflight.get_mut(channel) {
            *count = count.saturating_sub(1);
            if *count > 0 {
                return false;
            }
            self.inflight.remove(channel);
        }
        if !self.requested.contains(channel) {
            return false;
        }
        self.confirmed.insert(channel.to_string());
        true
    }

    pub(crate) fn is_requested(&self, channel: &str) -> bool {
        self.requested.contains(channel)
    }

    pub(crate) fn is_confirmed(&self, channel: &str) -> bool {
        self.confirmed.contains(channel)
    }
}

/// Background task owning the subscriber connection.
struct Listener {
    settings: RedisSettings,
    registry: Arc<Registry>,
    control: mpsc::UnboundedReceiver<Reconcile>,
    shutdown: watch::Receiver<bool>,
    state: StateCell,
    subscriptions: Subscriptions,
    /// Joins waiting for a channel confirmation.
    pending: HashMap<String, Vec<oneshot::Sender<()>>>,
}

impl Listener {
    async fn run(mut self, mut conn: Connection) {
        loop {
            let result = match self.resubscribe(&mut conn).await {
                Ok(()) => self.pump(&mut conn).await,
                Err(e) => Err(e),
            };

            match result {
                Ok(()) => break,
                Err(e) => {
                    warn!(error = %e, addr = %self.settings.addr, "redis subscription connection lost");
                    match self.reconnect().await {
                        Some(fresh) => conn = fresh,
                        None => {
                            if !*self.shutdown.borrow() {
                                self.state.advance(BrokerState::Failed);
                                error!(
                                    addr = %self.settings.addr,
                                    "giving up on redis, broadcasts will fail"
                                );
                            }
                            break;
                        }
                    }
                }
            }
        }

        debug!("redis listener stopped");
    }

    /// Subscribes to the channel of every topic that currently has local
    /// subscribers. Run on every fresh connection.
    async fn resubscribe(&mut self, conn: &mut Connection) -> Result<(), RedisError> {
        self.subscriptions.reset();

        let topics = self.registry.topics();
        if !topics.is_empty() {
            let mut args = Vec::with_capacity(topics.len() + 1);
            args.push(Bytes::from_static(b"SUBSCRIBE"));
            for topic in &topics {
                let channel = self.settings.channel(topic);
                if self.subscriptions.subscribe(&channel) {
                    args.push(Bytes::from(channel));
                }
            }
            conn.write_frame(&Frame::command(args)).await?;
        }

        let stale: Vec<String> = self
            .pending
            .keys()
            .filter(|channel| !self.subscriptions.is_requested(channel))
            .cloned()
            .collect();
        for channel in stale {
            self.release(&channel);
        }

        self.state.advance(BrokerState::Subscribed);
        debug!(channels = topics.len(), "redis channels subscribed");
        Ok(())
    }

    async fn pump(&mut self, conn: &mut Connection) -> Result<(), RedisError> {
        loop {
            if *self.shutdown.borrow() {
                return Ok(());
            }

            tokio::select! {
                _ = self.shutdown.changed() => return Ok(()),
                request = self.control.recv() => match request {
                    Some(request) => self.reconcile(conn, request).await?,
                    None => return Ok(()),
                },
                frame = conn.read_frame() => match frame? {
                    Some(frame) => self.dispatch(frame),
                    None => return Err(RedisError::ConnectionClosed),
                },
            }
        }
    }

    async fn reconcile(
        &mut self,
        conn: &mut Connection,
        request: Reconcile,
    ) -> Result<(), RedisError> {
        let channel = self.settings.channel(&request.topic);

        if self.registry.has_subscribers(&request.topic) {
            if self.subscriptions.is_confirmed(&channel) {
                if let Some(done) = request.done {
                    let _ = done.send(());
                }
                return Ok(());
            }
            if let Some(done) = request.done {
                self.pending.entry(channel.clone()).or_default().push(done);
            }
            if self.subscriptions.subscribe(&channel) {
                debug!(%channel, "subscribing");
                conn.write_frame(&Frame::command([
                    Bytes::from_static(b"SUBSCRIBE"),
                    Bytes::from(channel),
                ]))
                .await?;
            }
        } else {
            if self.subscriptions.unsubscribe(&channel) {
                debug!(%channel, "unsubscribing");
                conn.write_frame(&Frame::command([
                    Bytes::from_static(b"UNSUBSCRIBE"),
                    Bytes::from(channel.clone()),
                ]))
                .await?;
            }
            self.release(&channel);
            if let Some(done) = request.done {
                let _ = done.send(());
            }
        }
        Ok(())
    }

    fn dispatch(&mut self, frame: Frame) {
        let items = match frame {
            Frame::Array(items) => items,
            other => {
                debug!(frame = ?other, "ignoring non-array frame from redis");
                return;
            }
        };

        match items.as_slice() {
            [kind, channel, Frame::Bulk(payload)] if kind.as_str() == Some("message") => {
                let Some(topic) = channel.as_str().and_then(|ch| self.settings.topic(ch)) else {
                    return;
                };
                let msg = Message::from_raw(topic, payload.clone());
                if !msg.is_valid() {
                    warn!(topic = %msg.topic, "dropping message with malformed json payload from redis");
                    return;
                }
                deliver(&self.registry, &msg);
            }
            [kind, channel, _] if kind.as_str() == Some("subscribe") => {
                if let Some(channel) = channel.as_str() {
                    if self.subscriptions.confirm(channel) {
                        self.release(channel);
                    }
                }
            }
            [kind, ..] if kind.as_str() == Some("unsubscribe") => {}
            _ => debug!(?items, "ignoring unexpected frame from redis"),
        }
    }

    /// Wakes every join waiting on `channel`.
    fn release(&mut self, channel: &str) {
        if let Some(waiters) = self.pending.remove(channel) {
            for done in waiters {
                let _ = done.send(());
            }
        }
    }

    /// Re-opens the subscriber connection with exponential backoff. `None`
    /// when reconnecting is disabled, exhausted, or the broker is closing.
    async fn reconnect(&mut self) -> Option<Connection> {
        if !self.settings.reconnect {
            return None;
        }
        self.state.advance(BrokerState::Connecting);

        let mut delay = self.settings.reconnect_delay();
        let mut attempt: u32 = 0;
        loop {
            if *self.shutdown.borrow() {
                return None;
            }
            attempt += 1;

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.shutdown.changed() => return None,
            }

            match Connection::open(&self.settings).await {
                Ok(conn) => {
                    info!(attempt, addr = %self.settings.addr, "reconnected to redis");
                    return Some(conn);
                }
                Err(e) => warn!(attempt, error = %e, "redis reconnect failed"),
            }

            let limit = self.settings.max_reconnect_attempts;
            if limit != 0 && attempt >= limit {
                return None;
            }
            delay = (delay * 2).min(MAX_RECONNECT_DELAY);
        }
    }
}
