use serde::Deserialize;

/// Top-level configuration settings for the application.
///
/// Includes settings for the client-facing server, the message log, the
/// ingestion path, connection state recovery and the cluster link.
#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub storage: StorageSettings,
    pub broker: BrokerSettings,
    pub recovery: RecoverySettings,
    pub cluster: ClusterSettings,
    pub log: LogSettings,
}

/// Configuration settings for the server.
///
/// Defines the host and port the WebSocket gateway will bind to.
#[derive(Debug, Deserialize, Clone)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    pub max_connections: usize,
}

/// Where and how the sled message log is kept.
#[derive(Debug, Deserialize, Clone)]
pub struct StorageSettings {
    pub path: String,
    /// Flush to disk before an append is reported as committed.
    pub sync_writes: bool,
}

/// Configuration settings for the ingestion path and local fan-out.
#[derive(Debug, Deserialize, Clone)]
pub struct BrokerSettings {
    pub max_content_bytes: usize,
    pub bus_capacity: usize,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RecoverySettings {
    pub enabled: bool,
    pub window_secs: u64,
    pub max_buffered: usize,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ClusterSettings {
    pub coordinator_addr: String,
    pub request_timeout_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LogSettings {
    pub level: String,
}

/// Partial configuration settings loaded from files or environment.
///
/// Allows partial specification of settings. Missing values can be filled using defaults.
#[derive(Debug, Deserialize, Default)]
pub struct PartialSettings {
    pub server: Option<PartialServerSettings>,
    pub storage: Option<PartialStorageSettings>,
    pub broker: Option<PartialBrokerSettings>,
    pub recovery: Option<PartialRecoverySettings>,
    pub cluster: Option<PartialClusterSettings>,
    pub log: Option<PartialLogSettings>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialServerSettings {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub max_connections: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialStorageSettings {
    pub path: Option<String>,
    pub sync_writes: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialBrokerSettings {
    pub max_content_bytes: Option<usize>,
    pub bus_capacity: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialRecoverySettings {
    pub enabled: Option<bool>,
    pub window_secs: Option<u64>,
    pub max_buffered: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialClusterSettings {
    pub coordinator_addr: Option<String>,
    pub request_timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialLogSettings {
    pub level: Option<String>,
}

/// Provides default values for `Settings`.
///
/// Ensures the application has sensible defaults if no configuration is provided.
impl Default for Settings {
    fn default() -> Self {
        Self {
            server: ServerSettings {
                host: "127.0.0.1".to_string(),
                port: 3000,
                max_connections: 1000,
            },
            storage: StorageSettings {
                path: "seqrelay_db".to_string(),
                sync_writes: true,
            },
            broker: BrokerSettings {
                max_content_bytes: 64 * 1024,
                bus_capacity: 1024,
            },
            recovery: RecoverySettings {
                enabled: true,
                window_secs: 120,
                max_buffered: 1000,
            },
            cluster: ClusterSettings {
                coordinator_addr: "127.0.0.1:4000".to_string(),
                request_timeout_ms: 5000,
            },
            log: LogSettings {
                level: "info".to_string(),
            },
        }
    }
}

impl PartialSettings {
    /// Fills every missing value from `default`.
    pub fn merge_over(self, default: Settings) -> Settings {
        let server = self.server.unwrap_or_default();
        let storage = self.storage.unwrap_or_default();
        let broker = self.broker.unwrap_or_default();
        let recovery = self.recovery.unwrap_or_default();
        let cluster = self.cluster.unwrap_or_default();
        let log = self.log.unwrap_or_default();

        Settings {
            server: ServerSettings {
                host: server.host.unwrap_or(default.server.host),
                port: server.port.unwrap_or(default.server.port),
                max_connections: server
                    .max_connections
                    .unwrap_or(default.server.max_connections),
            },
            storage: StorageSettings {
                path: storage.path.unwrap_or(default.storage.path),
                sync_writes: storage.sync_writes.unwrap_or(default.storage.sync_writes),
            },
            broker: BrokerSettings {
                max_content_bytes: broker
                    .max_content_bytes
                    .unwrap_or(default.broker.max_content_bytes),
                bus_capacity: broker.bus_capacity.unwrap_or(default.broker.bus_capacity),
            },
            recovery: RecoverySettings {
                enabled: recovery.enabled.unwrap_or(default.recovery.enabled),
                window_secs: recovery.window_secs.unwrap_or(default.recovery.window_secs),
                max_buffered: recovery
                    .max_buffered
                    .unwrap_or(default.recovery.max_buffered),
            },
            cluster: ClusterSettings {
                coordinator_addr: cluster
                    .coordinator_addr
                    .unwrap_or(default.cluster.coordinator_addr),
                request_timeout_ms: cluster
                    .request_timeout_ms
                    .unwrap_or(default.cluster.request_timeout_ms),
            },
            log: LogSettings {
                level: log.level.unwrap_or(default.log.level),
            },
        }
    }
}
