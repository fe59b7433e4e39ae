use std::time::Duration;

use serde::Deserialize;

/// Top-level configuration settings for the application.
///
/// Includes settings for the listener and for the broadcast engine.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct Settings {
    pub server: ServerSettings,
    pub broadcast: BroadcastSettings,
}

/// Configuration settings for the server.
///
/// Defines the host and port the WebSocket listener will bind to.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
}

impl ServerSettings {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Configuration settings for the broadcast engine.
///
/// `redis` selects the backend: `None` runs the in-process broker.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct BroadcastSettings {
    pub path: String,
    pub queue_size: usize,
    pub redis: Option<RedisSettings>,
}

/// Connection settings for the Redis backend.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct RedisSettings {
    pub addr: String,
    pub password: Option<String>,
    pub db: i64,
    pub prefix: String,
    pub connect_timeout_ms: u64,
    pub reconnect: bool,
    /// `0` retries forever.
    pub max_reconnect_attempts: u32,
    pub reconnect_delay_ms: u64,
    /// Bound on waiting for a PUBLISH reply or a SUBSCRIBE confirmation.
    pub response_timeout_ms: u64,
}

impl RedisSettings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    /// Redis channel carrying messages for `topic`.
    pub fn channel(&self, topic: &str) -> String {
        format!("{}{}", self.prefix, topic)
    }

    /// Inverse of [`RedisSettings::channel`].
    pub fn topic<'a>(&self, channel: &'a str) -> Option<&'a str> {
        channel.strip_prefix(self.prefix.as_str())
    }
}

/// Which broker backend a configuration selects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerMode {
    Local,
    Redis,
}

impl BroadcastSettings {
    pub fn mode(&self) -> BrokerMode {
        match self.redis {
            Some(_) => BrokerMode::Redis,
            None => BrokerMode::Local,
        }
    }
}

/// Partial configuration settings loaded from files or environment.
///
/// Every field is optional; missing values are filled from the defaults.
#[derive(Debug, Deserialize, Default)]
pub struct PartialSettings {
    pub server: Option<PartialServerSettings>,
    pub broadcast: Option<PartialBroadcastSettings>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialServerSettings {
    pub host: Option<String>,
    pub port: Option<u16>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialBroadcastSettings {
    pub path: Option<String>,
    pub queue_size: Option<usize>,
    pub redis: Option<PartialRedisSettings>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialRedisSettings {
    pub addr: Option<String>,
    pub password: Option<String>,
    pub db: Option<i64>,
    pub prefix: Option<String>,
    pub connect_timeout_ms: Option<u64>,
    pub reconnect: Option<bool>,
    pub max_reconnect_attempts: Option<u32>,
    pub reconnect_delay_ms: Option<u64>,
    pub response_timeout_ms: Option<u64>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server: ServerSettings {
                host: "127.0.0.1".to_string(),
                port: 8080,
            },
            broadcast: BroadcastSettings::default(),
        }
    }
}

impl Default for BroadcastSettings {
    fn default() -> Self {
        Self {
            path: "/ws".to_string(),
            queue_size: 256,
            redis: None,
        }
    }
}

impl RedisSettings {
    /// Defaults for everything but the address.
    pub fn with_addr(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            password: None,
            db: 0,
            prefix: "broadcast:".to_string(),
            connect_timeout_ms: 2000,
            reconnect: true,
            max_reconnect_attempts: 10,
            reconnect_delay_ms: 100,
            response_timeout_ms: 5000,
        }
    }
}

impl PartialSettings {
    pub fn resolve(self) -> Settings {
        let default = Settings::default();
        let server = self.server.unwrap_or_default();

        Settings {
            server: ServerSettings {
                host: server.host.unwrap_or(default.server.host),
                port: server.port.unwrap_or(default.server.port),
            },
            broadcast: self.broadcast.unwrap_or_default().resolve(),
        }
    }
}

impl PartialBroadcastSettings {
    pub fn resolve(self) -> BroadcastSettings {
        let default = BroadcastSettings::default();

        BroadcastSettings {
            path: self.path.unwrap_or(default.path),
            queue_size: self
                .queue_size
                .filter(|size| *size > 0)
                .unwrap_or(default.queue_size),
            // A redis section without an address keeps the local broker.
            redis: self.redis.and_then(|redis| redis.resolve()),
        }
    }
}

impl PartialRedisSettings {
    fn resolve(self) -> Option<RedisSettings> {
        let addr = self.addr.filter(|addr| !addr.trim().is_empty())?;
        let default = RedisSettings::with_addr(addr);

        Some(RedisSettings {
            addr: default.addr,
            password: self.password.filter(|p| !p.is_empty()),
            db: self.db.unwrap_or(default.db),
            prefix: self.prefix.unwrap_or(default.prefix),
            connect_timeout_ms: self
                .connect_timeout_ms
                .unwrap_or(default.connect_timeout_ms),
            reconnect: self.reconnect.unwrap_or(default.reconnect),
            max_reconnect_attempts: self
                .max_reconnect_attempts
                .unwrap_or(default.max_reconnect_attempts),
            reconnect_delay_ms: self
                .reconnect_delay_ms
                .unwrap_or(default.reconnect_delay_ms),
            response_timeout_ms: self
                .response_timeout_ms
                .unwrap_or(default.response_timeout_ms),
        })
    }
}
