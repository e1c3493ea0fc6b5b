//! # Queue Consumer Supervisor
//!
//! Keeps exactly one consumer task per topic key that has local viewers, no
//! matter how many viewers share the key. Each consumer reads its queue and
//! rewrites every message to the connections in the matching registry bucket.
//!
//! ## Core Design:
//!
//! 1.  **Get-or-start under the entry lock**: `ensure_consumer` takes the
//!     `DashMap` entry for the key, so two viewers arriving together cannot
//!     both start a consumer.
//! 2.  **Zero-copy fan-out**: a payload is wrapped in one `Arc<str>` and every
//!     viewer receives a pointer to the same buffer.
//! 3.  **Failed writes drop the viewer**: a full or closed viewer queue removes
//!     that connection only; delivery continues to the rest.
//! 4.  **Retire when idle**: a consumer whose bucket is empty removes its own
//!     slot, re-checking the bucket under the slot's shard lock so a viewer
//!     arriving concurrently always ends up with a running consumer.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::core::broker::{Broker, QueueOptions, TopicKey};
use crate::core::broker_link::BrokerLink;
use crate::core::registry::ConnectionRegistry;

/// Outcome of one fan-out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FanOutReport {
    pub delivered: usize,
    pub dropped: usize,
}

/// Delivers `payload` to every viewer under `key`. Viewers whose queue is full
/// or closed are removed from the registry and closed.
pub fn fan_out(registry: &ConnectionRegistry, key: &TopicKey, payload: &str) -> FanOutReport {
    let payload: Arc<str> = Arc::from(payload);
    let mut report = FanOutReport::default();

    for handle in registry.snapshot(key) {
        match handle.deliver(Arc::clone(&payload)) {
            Ok(()) => report.delivered += 1,
            Err(reason) => {
                registry.remove_connection(key, handle.id());
                handle.close();
                report.dropped += 1;
                debug!(%key, connection_id = handle.id(), ?reason, "Viewer dropped on write failure");
            }
        }
    }
    report
}

struct ConsumerSlot {
    generation: u64,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl ConsumerSlot {
    fn is_running(&self) -> bool {
        !self.cancel.is_cancelled() && !self.task.is_finished()
    }
}

/// Per-key consumer bookkeeping.
pub struct ConsumerSupervisor {
    broker: Arc<dyn Broker>,
    registry: Arc<ConnectionRegistry>,
    link: Arc<BrokerLink>,
    consumers: DashMap<TopicKey, ConsumerSlot>,
    next_generation: AtomicU64,
    receive_wait: Duration,
}

impl ConsumerSupervisor {
    /// `receive_wait` bounds each blocking read, and so also how long an idle
    /// consumer takes to notice its bucket emptied.
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        link: Arc<BrokerLink>,
        receive_wait: Duration,
    ) -> Self {
        Self {
            broker: Arc::clone(link.broker()),
            registry,
            link,
            consumers: DashMap::new(),
            next_generation: AtomicU64::new(1),
            receive_wait,
        }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Starts a consumer for `key` unless one is already running. Returns
    /// `true` if a task was started. Does nothing while the link is down; the
    /// link restarts consumers once it is back.
    pub fn ensure_consumer(self: &Arc<Self>, key: TopicKey) -> bool {
        if !self.link.is_up() {
            debug!(%key, "Broker link not up, consumer deferred");
            return false;
        }

        match self.consumers.entry(key) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_running() {
                    return false;
                }
                let stale = occupied.insert(self.spawn_consumer(key));
                stale.cancel.cancel();
                true
            }
            Entry::Vacant(vacant) => {
                vacant.insert(self.spawn_consumer(key));
                true
            }
        }
    }

    /// Cancels every consumer and starts one for each key that still has
    /// viewers. Returns the number started.
    pub fn restart_all(self: &Arc<Self>) -> usize {
        self.consumers.retain(|_, slot| {
            slot.cancel.cancel();
            false
        });
        self.registry
            .keys()
            .into_iter()
            .filter(|key| self.ensure_consumer(*key))
            .count()
    }

    /// Keys with a live consumer task.
    pub fn active_consumers(&self) -> Vec<TopicKey> {
        let mut keys: Vec<TopicKey> = self
            .consumers
            .iter()
            .filter(|entry| entry.value().is_running())
            .map(|entry| *entry.key())
            .collect();
        keys.sort();
        keys
    }

    /// Cancels every consumer.
    pub fn shutdown(&self) {
        self.consumers.retain(|_, slot| {
            slot.cancel.cancel();
            false
        });
    }

    fn spawn_consumer(self: &Arc<Self>, key: TopicKey) -> ConsumerSlot {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(Arc::clone(self).consume(key, generation, cancel.clone()));
        ConsumerSlot {
            generation,
            cancel,
            task,
        }
    }

    /// Removes this consumer's slot if its bucket is still empty.
    fn retire(&self, key: &TopicKey, generation: u64) -> bool {
        self.consumers
            .remove_if(key, |_, slot| {
                slot.generation == generation && self.registry.bucket_len(key) == 0
            })
            .is_some()
    }

    async fn consume(self: Arc<Self>, key: TopicKey, generation: u64, cancel: CancellationToken) {
        info!(%key, generation, "Consumer started");

        // --- Phase 1: Declare ---
        if let Err(e) = self.broker.declare(&key, QueueOptions::LATEST_VALUE).await {
            warn!(%key, error = %e, "Queue declare failed");
            self.link.report_failure(&e);
            return;
        }

        // --- Phase 2: Receive / fan-out / ack ---
        loop {
            let received = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                r = self.broker.receive(&key, self.receive_wait) => r,
            };

            match received {
                Ok(Some(delivery)) => {
                    let report = fan_out(&self.registry, &key, &delivery.payload);
                    debug!(%key, delivered = report.delivered, dropped = report.dropped, "Fan-out");
                    if let Err(e) = self.broker.ack(&key, &delivery).await {
                        warn!(%key, error = %e, "Ack failed");
                        if e.is_connection_loss() {
                            self.link.report_failure(&e);
                            break;
                        }
                    }
                }
                Ok(None) => {}
                Err(e) if e.is_connection_loss() => {
                    warn!(%key, error = %e, "Consumer lost the broker");
                    self.link.report_failure(&e);
                    break;
                }
                Err(e) => {
                    warn!(%key, error = %e, "Receive failed, redeclaring");
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = sleep(self.receive_wait.min(Duration::from_secs(1))) => {}
                    }
                    if let Err(e) = self.broker.declare(&key, QueueOptions::LATEST_VALUE).await {
                        self.link.report_failure(&e);
                        break;
                    }
                }
            }

            // --- Phase 3: Retire when nobody listens ---
            if self.registry.bucket_len(&key) == 0 && self.retire(&key, generation) {
                self.broker.release(&key).await;
                break;
            }
        }

        info!(%key, generation, "Consumer stopped");
    }
}
