mod settings;

use crate::config::settings::PartialSettings;
use config::{Config, ConfigError, Environment, File};

pub use settings::{
    BrokerSettings, ClusterSettings, LogSettings, RecoverySettings, ServerSettings, Settings,
    StorageSettings,
};

/// Prefix for environment overrides, e.g. `SEQRELAY_SERVER__PORT=3001`.
pub const ENV_PREFIX: &str = "SEQRELAY";

/// Loads the configuration from the default file and environment variables
/// Merges the configuration with default values
/// Returns a `Settings` struct covering every section
pub fn load_config() -> Result<Settings, ConfigError> {
    // A missing .env file is the common case.
    let _ = dotenvy::dotenv();

    let builder = Config::builder()
        .add_source(File::with_name("config/default").required(false))
        .add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

    let config = builder.build()?;

    // Try to deserialize what is available
    let partial: PartialSettings = config.try_deserialize()?;

    Ok(partial.merge_over(Settings::default()))
}
