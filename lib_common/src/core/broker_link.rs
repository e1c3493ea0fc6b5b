//! # Broker Link
//!
//! Owns the lifecycle of the process-wide broker connection: dial, detect loss,
//! redial with exponential backoff, and restart every consumer once the link
//! is back.
//!
//! Publishers and consumers never reconnect on their own. They report a lost
//! connection through `report_failure`, which flips the link to `Down` exactly
//! once; the single `run` task does the rest.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, watch};
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::core::broker::{Broker, BrokerError};
use crate::core::publisher::BroadcastPublisher;
use crate::core::supervisor::ConsumerSupervisor;

/// Connection state of the broker link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// Not connected; the reconnect loop is (or will be) running.
    Down,
    /// A connect attempt is in flight.
    Connecting,
    /// Connected; consumers may run.
    Up,
}

/// Backoff between connect attempts: `base * 2^attempt`, capped at `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.min(16);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// Shared handle on the broker connection state.
pub struct BrokerLink {
    broker: Arc<dyn Broker>,
    state: watch::Sender<LinkState>,
    retry: RetryPolicy,
}

impl BrokerLink {
    pub fn new(broker: Arc<dyn Broker>, retry: RetryPolicy) -> Self {
        let (state, _) = watch::channel(LinkState::Down);
        Self {
            broker,
            state,
            retry,
        }
    }

    pub fn broker(&self) -> &Arc<dyn Broker> {
        &self.broker
    }

    pub fn state(&self) -> LinkState {
        *self.state.borrow()
    }

    pub fn is_up(&self) -> bool {
        self.state() == LinkState::Up
    }

    /// Observes state changes.
    pub fn subscribe(&self) -> watch::Receiver<LinkState> {
        self.state.subscribe()
    }

    /// Records a failed broker call. Only connection-loss errors bring the link
    /// down, and only the first report after `Up` does anything.
    pub fn report_failure(&self, err: &BrokerError) {
        if !err.is_connection_loss() {
            return;
        }
        let flipped = self.state.send_if_modified(|state| {
            if *state == LinkState::Up {
                *state = LinkState::Down;
                true
            } else {
                false
            }
        });
        if flipped {
            warn!(error = %err, "Broker link lost");
        }
    }

    /// Dials until connected. Returns `false` if shutdown arrived first.
    pub async fn establish(&self, shutdown: &mut broadcast::Receiver<()>) -> bool {
        let mut attempt: u32 = 0;
        loop {
            self.state.send_replace(LinkState::Connecting);
            self.broker.teardown().await;

            match self.broker.connect().await {
                Ok(()) => {
                    self.state.send_replace(LinkState::Up);
                    info!(attempt, "Broker link established");
                    return true;
                }
                Err(e) => {
                    let delay = self.retry.delay_for(attempt);
                    attempt = attempt.saturating_add(1);
                    self.state.send_replace(LinkState::Down);
                    error!(error = %e, attempt, retry_in = ?delay, "Broker connect failed");
                    tokio::select! {
                        _ = sleep(delay) => {}
                        _ = shutdown.recv() => return false,
                    }
                }
            }
        }
    }

    /// # Run
    ///
    /// The link manager task.
    ///
    /// ## Workflow:
    /// 1. Dial with backoff until the broker answers.
    /// 2. Invalidate all consumer bookkeeping and start one consumer per key
    ///    that still has local viewers.
    /// 3. Republish the views that could not be published while down.
    /// 4. Wait for a loss report or shutdown; on loss go back to 1.
    pub async fn run(
        self: Arc<Self>,
        supervisor: Arc<ConsumerSupervisor>,
        publisher: Arc<BroadcastPublisher>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        let mut state_rx = self.subscribe();
        loop {
            // --- Phase 1: Connect ---
            if !self.establish(&mut shutdown).await {
                break;
            }

            // --- Phase 2: Restart consumers ---
            let started = supervisor.restart_all();
            info!(consumers = started, "Consumers restarted");

            // --- Phase 3: Republish pending views ---
            publisher.flush_pending().await;

            // --- Phase 4: Wait for loss or shutdown ---
            tokio::select! {
                lost = async { state_rx.wait_for(|s| *s == LinkState::Down).await.is_ok() } => {
                    if !lost {
                        break;
                    }
                    warn!("Reconnecting broker link");
                }
                _ = shutdown.recv() => break,
            }
        }

        supervisor.shutdown();
        self.broker.close().await;
        self.state.send_replace(LinkState::Down);
        info!("Broker link stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::memory_broker::MemoryBroker;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
        };
        assert_eq!(policy.delay_for(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(800));
        assert_eq!(policy.delay_for(4), Duration::from_secs(1));
        assert_eq!(policy.delay_for(u32::MAX), Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_establish_retries_until_connected() {
        let broker = Arc::new(MemoryBroker::new());
        broker.refuse_connects(3);
        let link = BrokerLink::new(broker.clone(), RetryPolicy::default());
        let (_tx, mut rx) = broadcast::channel(1);

        assert!(link.establish(&mut rx).await);
        assert!(link.is_up());
        assert_eq!(broker.connect_count(), 1);
    }

    #[tokio::test]
    async fn test_report_failure_flips_once() {
        let broker = Arc::new(MemoryBroker::new());
        let link = BrokerLink::new(broker, RetryPolicy::default());
        let (_tx, mut rx) = broadcast::channel(1);
        link.establish(&mut rx).await;

        let mut watcher = link.subscribe();
        link.report_failure(&BrokerError::Protocol("odd".into()));
        assert!(link.is_up());

        link.report_failure(&BrokerError::Disconnected);
        link.report_failure(&BrokerError::Disconnected);
        assert_eq!(link.state(), LinkState::Down);
        assert!(watcher.has_changed().unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_establish_stops_on_shutdown() {
        let broker = Arc::new(MemoryBroker::new());
        broker.refuse_connects(usize::MAX);
        let link = BrokerLink::new(broker, RetryPolicy::default());
        let (tx, mut rx) = broadcast::channel(1);
        tx.send(()).unwrap();
        assert!(!link.establish(&mut rx).await);
    }
}
