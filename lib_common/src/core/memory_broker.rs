//! # In-Process Broker
//!
//! A `Broker` whose topic queues live in this process. Each queue is a bounded
//! `VecDeque` behind a mutex with a `Notify` for blocked receivers. The broker
//! can be severed and made to refuse connects, which is how the reconnect path
//! is exercised without a live Redis.
//!
//! Queues that are empty at `teardown` are dropped, so the slot map holds at
//! most the keys declared since the last reconnect plus those with an unread
//! value.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::Notify;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, warn};

use crate::core::broker::{Broker, BrokerError, Delivery, QueueOptions, TopicKey};

struct Slot {
    max_length: usize,
    queue: Mutex<VecDeque<Delivery>>,
    notify: Notify,
}

impl Slot {
    fn pop(&self) -> Option<Delivery> {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
    }
}

/// Process-local latest-value queues.
#[derive(Default)]
pub struct MemoryBroker {
    slots: DashMap<TopicKey, Arc<Slot>>,
    declared: Mutex<HashSet<TopicKey>>,
    connected: AtomicBool,
    refuse_connects: AtomicUsize,
    connects: AtomicUsize,
    next_id: AtomicU64,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulates losing the broker: every call fails with `Disconnected` and
    /// blocked receivers wake up, until the next successful `connect`.
    pub fn sever(&self) {
        self.connected.store(false, Ordering::SeqCst);
        for slot in self.slots.iter() {
            slot.notify.notify_waiters();
        }
        warn!("In-process broker severed");
    }

    /// Makes the next `count` connect attempts fail.
    pub fn refuse_connects(&self, count: usize) {
        self.refuse_connects.store(count, Ordering::SeqCst);
    }

    /// Number of successful connects so far.
    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Unread messages on `key`.
    pub fn depth(&self, key: &TopicKey) -> usize {
        self.slots
            .get(key)
            .map(|slot| {
                slot.queue
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .len()
            })
            .unwrap_or(0)
    }

    fn ensure_connected(&self) -> Result<(), BrokerError> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BrokerError::Disconnected)
        }
    }

    fn slot(&self, key: &TopicKey) -> Result<Arc<Slot>, BrokerError> {
        let declared = self
            .declared
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(key);
        match self.slots.get(key) {
            Some(slot) if declared => Ok(Arc::clone(slot.value())),
            _ => Err(BrokerError::Protocol(format!("queue {key} is not declared"))),
        }
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn connect(&self) -> Result<(), BrokerError> {
        let refused = self
            .refuse_connects
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(BrokerError::Connect("connection refused".to_string()));
        }
        if !self.connected.swap(true, Ordering::SeqCst) {
            self.connects.fetch_add(1, Ordering::SeqCst);
            debug!("In-process broker connected");
        }
        Ok(())
    }

    async fn teardown(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.declared
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        for slot in self.slots.iter() {
            slot.notify.notify_waiters();
        }
        self.slots.retain(|_, slot| {
            !slot
                .queue
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .is_empty()
        });
    }

    async fn release(&self, _key: &TopicKey) {}

    async fn declare(&self, key: &TopicKey, options: QueueOptions) -> Result<(), BrokerError> {
        self.ensure_connected()?;
        self.slots.entry(*key).or_insert_with(|| {
            Arc::new(Slot {
                max_length: options.max_length.max(1),
                queue: Mutex::new(VecDeque::new()),
                notify: Notify::new(),
            })
        });
        self.declared
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(*key);
        Ok(())
    }

    async fn publish(&self, key: &TopicKey, payload: &str) -> Result<(), BrokerError> {
        self.ensure_connected()?;
        let slot = self.slot(key)?;
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        {
            let mut queue = slot.queue.lock().unwrap_or_else(PoisonError::into_inner);
            queue.push_back(Delivery {
                id: format!("{id}-0"),
                payload: payload.to_string(),
            });
            while queue.len() > slot.max_length {
                queue.pop_front();
            }
        }
        slot.notify.notify_one();
        Ok(())
    }

    async fn receive(&self, key: &TopicKey, wait: Duration) -> Result<Option<Delivery>, BrokerError> {
        let deadline = Instant::now() + wait;
        let slot = {
            self.ensure_connected()?;
            self.slot(key)?
        };

        loop {
            let notified = slot.notify.notified();
            self.ensure_connected()?;
            if let Some(delivery) = slot.pop() {
                return Ok(Some(delivery));
            }
            if timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn ack(&self, _key: &TopicKey, _delivery: &Delivery) -> Result<(), BrokerError> {
        self.ensure_connected()
    }
}
