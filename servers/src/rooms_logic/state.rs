use anyhow::{Context, Result};
use lib_common::connections::{Database, PgDeviceActivity, PgSessionStore, RedisBroker};
use lib_common::core::{
    BroadcastPublisher, Broker, BrokerLink, ConnectionRegistry, ConsumerSupervisor, MemoryBroker,
    RetryPolicy,
};
use lib_common::sessions::{DeviceActivity, MemorySeed, MemorySessionStore, SessionStore};
use lib_common::{RoomView, SessionEngine};
use std::fs;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::rooms_logic::config::{BrokerBackend, Settings, StoreBackend};

/// Shared handles every HTTP and WebSocket handler works with.
#[derive(Clone)]
pub struct AppState {
    pub engine: SessionEngine,
    pub publisher: Arc<BroadcastPublisher>,
    pub supervisor: Arc<ConsumerSupervisor>,
    pub registry: Arc<ConnectionRegistry>,
    pub link: Arc<BrokerLink>,
    pub viewer_buffer_size: usize,
    pub viewer_write_timeout: Duration,
    /// Cancelled at shutdown; every viewer socket closes on it.
    pub shutdown: CancellationToken,
}

/// Tuning knobs for the fanout side.
#[derive(Debug, Clone, Copy)]
pub struct FanoutTuning {
    pub publish_timeout: Duration,
    pub consume_block: Duration,
    pub retry: RetryPolicy,
    pub viewer_buffer_size: usize,
    pub viewer_write_timeout: Duration,
}

impl FanoutTuning {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            publish_timeout: settings.publish_timeout,
            consume_block: settings.consume_block,
            retry: settings.retry,
            viewer_buffer_size: settings.viewer_buffer_size,
            viewer_write_timeout: settings.viewer_write_timeout,
        }
    }
}

impl AppState {
    /// Wires the engine and the fanout around the given collaborators.
    pub fn new(
        store: Arc<dyn SessionStore>,
        devices: Arc<dyn DeviceActivity>,
        broker: Arc<dyn Broker>,
        tuning: FanoutTuning,
    ) -> Self {
        Self::with_engine(SessionEngine::new(store, devices), broker, tuning)
    }

    pub fn with_engine(engine: SessionEngine, broker: Arc<dyn Broker>, tuning: FanoutTuning) -> Self {
        let link = Arc::new(BrokerLink::new(broker, tuning.retry));
        let registry = Arc::new(ConnectionRegistry::new());
        let supervisor = Arc::new(ConsumerSupervisor::new(
            Arc::clone(&registry),
            Arc::clone(&link),
            tuning.consume_block,
        ));
        let publisher = Arc::new(BroadcastPublisher::new(Arc::clone(&link), tuning.publish_timeout));
        Self {
            engine,
            publisher,
            supervisor,
            registry,
            link,
            viewer_buffer_size: tuning.viewer_buffer_size,
            viewer_write_timeout: tuning.viewer_write_timeout,
            shutdown: CancellationToken::new(),
        }
    }

    /// Publishes `view` on a background task.
    pub fn broadcast(&self, view: &RoomView) {
        drop(self.publisher.publish(view.clone()));
    }
}

/// Connects the configured backends and builds the application state.
pub async fn build_state(settings: &Settings) -> Result<AppState> {
    let (store, devices): (Arc<dyn SessionStore>, Arc<dyn DeviceActivity>) = match &settings.store {
        StoreBackend::Postgres {
            database_url,
            max_connections,
            apply_schema,
        } => {
            let db = Database::new(database_url, *max_connections)
                .await
                .context("connecting to Postgres")?;
            db.ping().await.context("pinging Postgres")?;
            if *apply_schema {
                db.ensure_schema().await.context("applying session schema")?;
                tracing::info!("Session schema applied");
            }
            let store: Arc<dyn SessionStore> = Arc::new(PgSessionStore::new(db.clone()));
            let devices: Arc<dyn DeviceActivity> = Arc::new(PgDeviceActivity::new(db));
            (store, devices)
        }
        StoreBackend::Memory { seed_path } => {
            let seed = match seed_path {
                Some(path) => {
                    let raw = fs::read_to_string(path)
                        .with_context(|| format!("reading seed file {}", path.display()))?;
                    serde_json::from_str::<MemorySeed>(&raw)
                        .with_context(|| format!("parsing seed file {}", path.display()))?
                }
                None => MemorySeed::default(),
            };
            tracing::info!(rooms = seed.rooms.len(), devices = seed.devices.len(), "Memory store seeded");
            let memory = Arc::new(MemorySessionStore::from_seed(seed));
            let store: Arc<dyn SessionStore> = memory.clone();
            let devices: Arc<dyn DeviceActivity> = memory;
            (store, devices)
        }
    };

    let broker: Arc<dyn Broker> = match &settings.broker {
        BrokerBackend::Redis { url, timeout } => Arc::new(
            RedisBroker::new(url, *timeout, *timeout).context("opening Redis client")?,
        ),
        BrokerBackend::Memory => Arc::new(MemoryBroker::new()),
    };

    Ok(AppState::new(store, devices, broker, FanoutTuning::from_settings(settings)))
}
