//! # Connection Registry
//!
//! Concurrent map of topic key to the viewer connections attached under it.
//! A bucket exists only while it has at least one connection.
//!
//! Delivery never blocks the caller: each viewer owns a bounded queue drained
//! by its socket task, and a full or closed queue is reported back as a
//! failed write so the caller can drop that viewer.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::core::broker::TopicKey;

/// Process-unique viewer id.
pub type ConnectionId = u64;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Why a delivery was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryError {
    /// The viewer is not keeping up.
    Full,
    /// The viewer's socket task has gone away.
    Closed,
}

/// # Viewer Handle
///
/// The registry's side of one viewer connection. Cloning is cheap; all clones
/// feed the same socket task.
#[derive(Debug, Clone)]
pub struct ViewerHandle {
    id: ConnectionId,
    sender: mpsc::Sender<Arc<str>>,
    cancel: CancellationToken,
}

/// The socket task's side of a viewer connection.
#[derive(Debug)]
pub struct ViewerInbox {
    receiver: mpsc::Receiver<Arc<str>>,
    cancel: CancellationToken,
}

impl ViewerHandle {
    /// Creates a handle with a queue of `buffer` pending messages.
    pub fn new(buffer: usize) -> (Self, ViewerInbox) {
        let (sender, receiver) = mpsc::channel(buffer.max(1));
        let cancel = CancellationToken::new();
        let handle = Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            sender,
            cancel: cancel.clone(),
        };
        (handle, ViewerInbox { receiver, cancel })
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Non-blocking enqueue of one serialized view.
    pub fn deliver(&self, payload: Arc<str>) -> Result<(), DeliveryError> {
        if self.cancel.is_cancelled() {
            return Err(DeliveryError::Closed);
        }
        self.sender.try_send(payload).map_err(|e| match e {
            TrySendError::Full(_) => DeliveryError::Full,
            TrySendError::Closed(_) => DeliveryError::Closed,
        })
    }

    /// Tells the socket task to close the connection.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled() || self.sender.is_closed()
    }
}

impl ViewerInbox {
    /// Next payload to write, or `None` once the connection was closed by the
    /// registry side.
    pub async fn next(&mut self) -> Option<Arc<str>> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            msg = self.receiver.recv() => msg,
        }
    }

    /// Token cancelled when the registry side closes this viewer.
    pub fn closed_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

/// # Connection Registry
///
/// ## Workflow:
/// - The socket task calls `add_connection` on upgrade and
///   `remove_connection` when the socket ends.
/// - The key's consumer calls `snapshot` for each message and delivers outside
///   of the map lock.
/// - A bucket emptied by `remove_connection` is dropped from the map, which is
///   how the consumer supervisor learns that nobody is listening any more.
#[derive(Default)]
pub struct ConnectionRegistry {
    buckets: DashMap<TopicKey, HashMap<ConnectionId, ViewerHandle>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `handle` under `key`. Returns `true` if this created the bucket.
    pub fn add_connection(&self, key: TopicKey, handle: ViewerHandle) -> bool {
        let mut bucket = self.buckets.entry(key).or_default();
        let created = bucket.is_empty();
        bucket.insert(handle.id(), handle);
        debug!(%key, viewers = bucket.len(), "Viewer registered");
        created
    }

    /// Removes connection `id` from `key`, dropping the bucket once empty.
    /// Returns the removed handle, if it was still present.
    pub fn remove_connection(&self, key: &TopicKey, id: ConnectionId) -> Option<ViewerHandle> {
        let removed = self.buckets.get_mut(key).and_then(|mut b| b.remove(&id));
        // The get_mut guard is gone; remove_if re-checks under the shard lock.
        self.buckets.remove_if(key, |_, bucket| bucket.is_empty());
        if removed.is_some() {
            debug!(%key, connection_id = id, "Viewer removed");
        }
        removed
    }

    /// Copies the handles currently under `key`.
    pub fn snapshot(&self, key: &TopicKey) -> Vec<ViewerHandle> {
        self.buckets
            .get(key)
            .map(|bucket| bucket.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn bucket_len(&self, key: &TopicKey) -> usize {
        self.buckets.get(key).map(|b| b.len()).unwrap_or(0)
    }

    /// Keys that have at least one viewer.
    pub fn keys(&self) -> Vec<TopicKey> {
        self.buckets.iter().map(|entry| *entry.key()).collect()
    }

    pub fn total_connections(&self) -> usize {
        self.buckets.iter().map(|entry| entry.value().len()).sum()
    }
}
