//! The `config` module loads the service settings.
//!
//! Sources, lowest priority first: built-in defaults, an optional
//! `config/default.*` file (any format the `config` crate understands), then
//! `FANOUT__<SECTION>__<KEY>` environment variables. An embedder that already
//! holds a parsed broadcast blob can use [`BroadcastSettings::from_json`].

mod settings;

use config::{Config, ConfigError, Environment, File, FileFormat};

pub use settings::{
    BroadcastSettings, BrokerMode, PartialBroadcastSettings, PartialSettings, RedisSettings,
    ServerSettings, Settings,
};

pub const DEFAULT_CONFIG_PATH: &str = "config/default";

/// Loads the configuration from the default file and environment variables.
pub fn load_config() -> Result<Settings, ConfigError> {
    load_config_from(DEFAULT_CONFIG_PATH)
}

/// Same as [`load_config`] with an explicit file path (extension optional).
pub fn load_config_from(path: &str) -> Result<Settings, ConfigError> {
    let builder = Config::builder()
        .add_source(File::with_name(path).required(false))
        .add_source(
            Environment::with_prefix("FANOUT")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

    let config = builder.build()?;

    // Try to deserialize what is available, then merge with defaults
    let partial: PartialSettings = config.try_deserialize()?;
    Ok(partial.resolve())
}

impl BroadcastSettings {
    /// Parses the broadcast section from a JSON blob such as
    /// `{"path":"/ws","redis":{"addr":"localhost:6379"}}`.
    pub fn from_json(blob: &str) -> Result<Self, ConfigError> {
        let config = Config::builder()
            .add_source(File::from_str(blob, FileFormat::Json))
            .build()?;

        let partial: PartialBroadcastSettings = config.try_deserialize()?;
        Ok(partial.resolve())
    }
}
