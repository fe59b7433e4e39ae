//! Service facade
//!
//! Owns the broker for its whole lifetime: `new` builds it from settings,
//! `serve` starts it and runs the WebSocket listener, `stop` tears both down.

use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tracing::info;

use crate::broker::{Broker, Message};
use crate::client::Client;
use crate::config::Settings;
use crate::transport::websocket::start_websocket_server;
use crate::utils::error::{BroadcastError, BroadcastResult};

#[derive(Debug, Clone)]
pub struct Service {
    settings: Arc<Settings>,
    broker: Broker,
    shutdown: Arc<watch::Sender<bool>>,
}

impl Service {
    /// Builds the service and its broker. No connection is opened until
    /// [`Service::serve`].
    pub fn new(settings: Settings) -> Self {
        let broker = Broker::new(&settings.broadcast);
        let (shutdown, _) = watch::channel(false);

        Self {
            settings: Arc::new(settings),
            broker,
            shutdown: Arc::new(shutdown),
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Handle for broadcasting directly.
    pub fn broker(&self) -> Broker {
        self.broker.clone()
    }

    /// Mints a programmatic client delivering to `sender`.
    pub fn new_client(&self, sender: mpsc::Sender<Message>) -> Client {
        Client::new(self.broker.clone(), sender)
    }

    /// Binds `server.host:server.port` and serves until [`Service::stop`].
    pub async fn serve(&self) -> BroadcastResult<()> {
        if self.is_stopped() {
            return Err(BroadcastError::Closed);
        }
        let listener = TcpListener::bind(self.settings.server.addr()).await?;
        self.serve_on(listener).await
    }

    /// Starts the broker, then accepts WebSocket connections on `listener`
    /// until [`Service::stop`]. A broker that cannot start is returned as an
    /// error before any connection is accepted.
    pub async fn serve_on(&self, listener: TcpListener) -> BroadcastResult<()> {
        if self.is_stopped() {
            return Err(BroadcastError::Closed);
        }

        self.broker.start().await?;
        info!(mode = ?self.broker.mode(), "broadcast service started");

        start_websocket_server(
            listener,
            self.broker.clone(),
            self.settings.broadcast.clone(),
            self.shutdown.subscribe(),
        )
        .await?;
        Ok(())
    }

    /// Stops the listener and every session, then closes the broker.
    pub async fn stop(&self) {
        self.shutdown.send_replace(true);
        self.broker.close().await;
        info!("broadcast service stopped");
    }

    fn is_stopped(&self) -> bool {
        *self.shutdown.borrow()
    }
}
