use anyhow::{bail, Context, Result};
use clap::Parser;
use lib_common::core::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Deserialize, Serialize, Debug, Clone, Default, PartialEq)]
#[clap(about = "Room occupancy sessions with live room-state fanout", version)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[clap(long, env = "ROOMS_PORT", help = "Port to listen on for HTTP and WebSocket clients.")]
    pub port: Option<u16>,

    #[clap(long, env = "ROOMS_CONFIG_PATH", help = "Path to the JSON configuration file.")]
    pub config_path: Option<PathBuf>,

    #[clap(long, env = "ROOMS_LOG_DIR", help = "Directory for log files.")]
    pub log_dir: Option<PathBuf>,

    #[clap(long, env = "ROOMS_LOG_LEVEL", help = "Logging level (trace, debug, info, warn, error).")]
    pub log_level: Option<String>,

    #[clap(long, env = "ROOMS_STORE_BACKEND", help = "Session store backend: postgres or memory.")]
    pub store_backend: Option<String>,

    #[clap(long, env = "DATABASE_URL", help = "Postgres connection string.")]
    pub database_url: Option<String>,

    #[clap(long, env = "ROOMS_DB_MAX_CONNECTIONS", help = "Maximum connections in the Postgres pool.")]
    pub db_max_connections: Option<u32>,

    #[clap(long, env = "ROOMS_APPLY_SCHEMA", help = "Create the session tables on startup if missing.")]
    pub apply_schema: Option<bool>,

    #[clap(long, env = "ROOMS_SEED_PATH", help = "JSON file with rooms and devices for the memory store.")]
    pub seed_path: Option<PathBuf>,

    #[clap(long, env = "ROOMS_BROKER_BACKEND", help = "Broker backend: redis or memory.")]
    pub broker_backend: Option<String>,

    #[clap(long, env = "REDIS_URL", help = "Redis connection string.")]
    pub redis_url: Option<String>,

    #[clap(long, env = "ROOMS_BROKER_TIMEOUT_MS", help = "Timeout in milliseconds for broker dials and commands.")]
    pub broker_timeout_ms: Option<u64>,

    #[clap(long, env = "ROOMS_SWEEP_INTERVAL_SECONDS", help = "Seconds between expired-session sweeps.")]
    pub sweep_interval_seconds: Option<u64>,

    #[clap(long, env = "ROOMS_PUBLISH_TIMEOUT_MS", help = "Timeout in milliseconds for publishing one topic key.")]
    pub publish_timeout_ms: Option<u64>,

    #[clap(long, env = "ROOMS_CONSUME_BLOCK_MS", help = "Milliseconds a consumer blocks waiting for a message.")]
    pub consume_block_ms: Option<u64>,

    #[clap(long, env = "ROOMS_RECONNECT_BASE_DELAY_MS", help = "Base delay in milliseconds for broker reconnect attempts.")]
    pub reconnect_base_delay_ms: Option<u64>,

    #[clap(long, env = "ROOMS_RECONNECT_MAX_DELAY_MS", help = "Maximum delay in milliseconds for broker reconnect attempts.")]
    pub reconnect_max_delay_ms: Option<u64>,

    #[clap(long, env = "ROOMS_VIEWER_BUFFER_SIZE", help = "Pending messages allowed per viewer before it is dropped.")]
    pub viewer_buffer_size: Option<usize>,

    #[clap(long, env = "ROOMS_VIEWER_WRITE_TIMEOUT_MS", help = "Timeout in milliseconds for one socket write to a viewer.")]
    pub viewer_write_timeout_ms: Option<u64>,

    #[clap(long, env = "TLS_CERT_PATH", help = "Path to the TLS certificate file.")]
    pub tls_cert_path: Option<PathBuf>,

    #[clap(long, env = "TLS_KEY_PATH", help = "Path to the TLS private key file.")]
    pub tls_key_path: Option<PathBuf>,
}

impl Config {
    // Merge two Config structs, where 'other' overrides 'self' for Some values
    fn merge(self, other: Config) -> Config {
        Config {
            port: other.port.or(self.port),
            config_path: other.config_path.or(self.config_path),
            log_dir: other.log_dir.or(self.log_dir),
            log_level: other.log_level.or(self.log_level),
            store_backend: other.store_backend.or(self.store_backend),
            database_url: other.database_url.or(self.database_url),
            db_max_connections: other.db_max_connections.or(self.db_max_connections),
            apply_schema: other.apply_schema.or(self.apply_schema),
            seed_path: other.seed_path.or(self.seed_path),
            broker_backend: other.broker_backend.or(self.broker_backend),
            redis_url: other.redis_url.or(self.redis_url),
            broker_timeout_ms: other.broker_timeout_ms.or(self.broker_timeout_ms),
            sweep_interval_seconds: other.sweep_interval_seconds.or(self.sweep_interval_seconds),
            publish_timeout_ms: other.publish_timeout_ms.or(self.publish_timeout_ms),
            consume_block_ms: other.consume_block_ms.or(self.consume_block_ms),
            reconnect_base_delay_ms: other.reconnect_base_delay_ms.or(self.reconnect_base_delay_ms),
            reconnect_max_delay_ms: other.reconnect_max_delay_ms.or(self.reconnect_max_delay_ms),
            viewer_buffer_size: other.viewer_buffer_size.or(self.viewer_buffer_size),
            viewer_write_timeout_ms: other.viewer_write_timeout_ms.or(self.viewer_write_timeout_ms),
            tls_cert_path: other.tls_cert_path.or(self.tls_cert_path),
            tls_key_path: other.tls_key_path.or(self.tls_key_path),
        }
    }

    fn defaults() -> Config {
        Config {
            port: Some(9010),
            log_dir: Some(PathBuf::from("./logs")),
            log_level: Some("info".to_string()),
            store_backend: Some("postgres".to_string()),
            db_max_connections: Some(10),
            apply_schema: Some(false),
            broker_backend: Some("redis".to_string()),
            broker_timeout_ms: Some(3000),
            sweep_interval_seconds: Some(10),
            publish_timeout_ms: Some(2000),
            consume_block_ms: Some(5000),
            reconnect_base_delay_ms: Some(500),
            reconnect_max_delay_ms: Some(30000),
            viewer_buffer_size: Some(16),
            viewer_write_timeout_ms: Some(5000),
            ..Default::default()
        }
    }

    /// Turns the merged layers into validated settings.
    pub fn resolve(self) -> Result<Settings> {
        let store = match self.store_backend.as_deref().unwrap_or("postgres") {
            "postgres" => StoreBackend::Postgres {
                database_url: self
                    .database_url
                    .clone()
                    .context("databaseUrl is required for the postgres store")?,
                max_connections: self.db_max_connections.unwrap_or(10),
                apply_schema: self.apply_schema.unwrap_or(false),
            },
            "memory" => StoreBackend::Memory {
                seed_path: self.seed_path.clone(),
            },
            other => bail!("unknown storeBackend '{other}' (expected postgres or memory)"),
        };

        let broker_timeout = Duration::from_millis(self.broker_timeout_ms.unwrap_or(3000));
        let broker = match self.broker_backend.as_deref().unwrap_or("redis") {
            "redis" => BrokerBackend::Redis {
                url: self
                    .redis_url
                    .clone()
                    .context("redisUrl is required for the redis broker")?,
                timeout: broker_timeout,
            },
            "memory" => BrokerBackend::Memory,
            other => bail!("unknown brokerBackend '{other}' (expected redis or memory)"),
        };

        let sweep_interval_seconds = self.sweep_interval_seconds.unwrap_or(10);
        if sweep_interval_seconds == 0 {
            bail!("sweepIntervalSeconds must be at least 1");
        }

        let tls = match (self.tls_cert_path, self.tls_key_path) {
            (Some(cert), Some(key)) => Some(TlsPaths { cert, key }),
            _ => None,
        };

        Ok(Settings {
            port: self.port.unwrap_or(9010),
            log_dir: self.log_dir.unwrap_or_else(|| PathBuf::from("./logs")),
            log_level: self.log_level.unwrap_or_else(|| "info".to_string()),
            store,
            broker,
            sweep_interval: Duration::from_secs(sweep_interval_seconds),
            publish_timeout: Duration::from_millis(self.publish_timeout_ms.unwrap_or(2000)),
            consume_block: Duration::from_millis(self.consume_block_ms.unwrap_or(5000)),
            retry: RetryPolicy {
                base_delay: Duration::from_millis(self.reconnect_base_delay_ms.unwrap_or(500)),
                max_delay: Duration::from_millis(self.reconnect_max_delay_ms.unwrap_or(30000)),
            },
            viewer_buffer_size: self.viewer_buffer_size.unwrap_or(16).max(1),
            viewer_write_timeout: Duration::from_millis(self.viewer_write_timeout_ms.unwrap_or(5000)),
            tls,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StoreBackend {
    Postgres {
        database_url: String,
        max_connections: u32,
        apply_schema: bool,
    },
    Memory {
        seed_path: Option<PathBuf>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum BrokerBackend {
    Redis { url: String, timeout: Duration },
    Memory,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TlsPaths {
    pub cert: PathBuf,
    pub key: PathBuf,
}

/// Validated runtime settings.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub port: u16,
    pub log_dir: PathBuf,
    pub log_level: String,
    pub store: StoreBackend,
    pub broker: BrokerBackend,
    pub sweep_interval: Duration,
    pub publish_timeout: Duration,
    pub consume_block: Duration,
    pub retry: RetryPolicy,
    pub viewer_buffer_size: usize,
    pub viewer_write_timeout: Duration,
    pub tls: Option<TlsPaths>,
}

pub fn load_config() -> Config {
    load_config_from(Config::parse())
}

/// Layers defaults, the JSON config file and `cli` (which already carries the
/// environment), later layers winning.
pub fn load_config_from(cli: Config) -> Config {
    // 1. Load defaults
    let mut current_config = Config::defaults();

    // 2. Load from config file (server_rooms.conf) if present.
    let config_file_path = cli
        .config_path
        .clone()
        .unwrap_or_else(|| PathBuf::from("server_rooms.conf"));

    if config_file_path.exists() {
        match fs::read_to_string(&config_file_path) {
            Ok(config_str) => match serde_json::from_str::<Config>(&config_str) {
                Ok(file_config) => current_config = current_config.merge(file_config),
                Err(e) => eprintln!(
                    "Failed to parse config file {}: {e}. Falling back to other sources.",
                    config_file_path.display()
                ),
            },
            Err(e) => eprintln!(
                "Failed to read config file {}: {e}. Falling back to other sources.",
                config_file_path.display()
            ),
        }
    }

    // 3. Override with environment variables and CLI arguments
    current_config = current_config.merge(cli);

    // 4. Apply default TLS paths if not already set
    if current_config.tls_cert_path.is_none() || current_config.tls_key_path.is_none() {
        if let Some(home_dir) = dirs::home_dir() {
            let letsencrypt_dir = home_dir.join(".letsencrypt");
            if current_config.tls_cert_path.is_none() {
                current_config.tls_cert_path = Some(letsencrypt_dir.join("fullchain.pem"));
            }
            if current_config.tls_key_path.is_none() {
                current_config.tls_key_path = Some(letsencrypt_dir.join("privkey.pem"));
            }
        }
    }

    current_config
}
