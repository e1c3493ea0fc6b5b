//! # Redis Streams Broker
//!
//! `Broker` implementation on Redis Streams. Each topic key is a stream
//! trimmed to one entry on every write (`XADD key MAXLEN 1 * ...`), which is
//! the latest-value queue the fanout needs.
//!
//! Every process reads through its own consumer group, so each process sees
//! every message and fans it out to its own viewers. Groups start at id `0`:
//! a fresh process picks up the value already sitting in the stream.
//!
//! ## Connections
//! - One multiplexed connection for declare/publish/ack.
//! - One dedicated connection per consumed key, because `XREADGROUP ... BLOCK`
//!   holds the connection until it returns and would stall everything queued
//!   behind it. The connection is dropped when the key's consumer retires.
//!
//! Every dial and command is bounded by a timeout. `close` destroys this
//! process's group on every stream it declared.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::streams::{StreamReadOptions, StreamReadReply};
use redis::{AsyncCommands, Client, RedisError, RedisResult};
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::core::broker::{Broker, BrokerError, Delivery, QueueOptions, TopicKey};

const PAYLOAD_FIELD: &str = "payload";
const CONSUMER_NAME: &str = "fanout";

struct LinkBook<C = MultiplexedConnection> {
    conn: Option<C>,
    consumer_conns: HashMap<TopicKey, C>,
    declared: HashSet<TopicKey>,
}

impl<C> Default for LinkBook<C> {
    fn default() -> Self {
        Self {
            conn: None,
            consumer_conns: HashMap::new(),
            declared: HashSet::new(),
        }
    }
}

impl<C> LinkBook<C> {
    /// Forgets `key`'s dedicated connection. Returns whether one was held.
    fn release_consumer(&mut self, key: &TopicKey) -> bool {
        self.consumer_conns.remove(key).is_some()
    }

    fn clear(&mut self) {
        self.conn = None;
        self.consumer_conns.clear();
        self.declared.clear();
    }
}

/// Redis Streams backed broker.
pub struct RedisBroker {
    client: Client,
    group: String,
    dial_timeout: Duration,
    op_timeout: Duration,
    book: Mutex<LinkBook>,
}

fn ignore_exists(err: RedisError) -> RedisResult<()> {
    if err.code() == Some("BUSYGROUP") {
        Ok(())
    } else {
        Err(err)
    }
}

fn destroy_group_cmd(stream: &str, group: &str) -> redis::Cmd {
    let mut cmd = redis::cmd("XGROUP");
    cmd.arg("DESTROY").arg(stream).arg(group);
    cmd
}

fn classify(err: RedisError) -> BrokerError {
    if err.is_io_error() || err.is_connection_dropped() || err.is_connection_refusal() || err.is_timeout() {
        BrokerError::Disconnected
    } else {
        BrokerError::Protocol(err.to_string())
    }
}

impl RedisBroker {
    /// Creates a broker for `url`. No connection is made until `connect`.
    ///
    /// # Arguments
    /// * `url` - The redis URL (e.g., "redis://127.0.0.1/").
    /// * `dial_timeout` - Bound on opening a connection.
    /// * `op_timeout` - Bound on every command, added on top of the block time
    ///   for blocking reads.
    pub fn new(url: &str, dial_timeout: Duration, op_timeout: Duration) -> Result<Self, BrokerError> {
        let client = Client::open(url).map_err(|e| BrokerError::Connect(e.to_string()))?;
        Ok(Self {
            client,
            group: format!("rooms-{}", Uuid::new_v4().simple()),
            dial_timeout,
            op_timeout,
            book: Mutex::new(LinkBook::default()),
        })
    }

    /// Name of this process's consumer group.
    pub fn group(&self) -> &str {
        &self.group
    }

    async fn dial(&self) -> Result<MultiplexedConnection, BrokerError> {
        timeout(self.dial_timeout, self.client.get_multiplexed_async_connection())
            .await
            .map_err(|_| BrokerError::Timeout(self.dial_timeout))?
            .map_err(|e| BrokerError::Connect(e.to_string()))
    }

    async fn shared(&self) -> Result<MultiplexedConnection, BrokerError> {
        self.book
            .lock()
            .await
            .conn
            .clone()
            .ok_or(BrokerError::Disconnected)
    }

    async fn consumer_conn(&self, key: &TopicKey) -> Result<MultiplexedConnection, BrokerError> {
        {
            let book = self.book.lock().await;
            if book.conn.is_none() {
                return Err(BrokerError::Disconnected);
            }
            if let Some(conn) = book.consumer_conns.get(key) {
                return Ok(conn.clone());
            }
        }
        let conn = self.dial().await?;
        let mut book = self.book.lock().await;
        Ok(book.consumer_conns.entry(*key).or_insert(conn).clone())
    }

    async fn bounded<T>(
        &self,
        limit: Duration,
        op: impl Future<Output = RedisResult<T>> + Send,
    ) -> Result<T, BrokerError> {
        timeout(limit, op)
            .await
            .map_err(|_| BrokerError::Timeout(limit))?
            .map_err(classify)
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn connect(&self) -> Result<(), BrokerError> {
        if self.book.lock().await.conn.is_some() {
            return Ok(());
        }
        let conn = self.dial().await?;
        let mut probe = conn.clone();
        let _: String = self
            .bounded(self.op_timeout, redis::cmd("PING").query_async(&mut probe))
            .await?;

        self.book.lock().await.conn = Some(conn);
        info!(group = %self.group, "Redis broker connected");
        Ok(())
    }

    async fn teardown(&self) {
        self.book.lock().await.clear();
        debug!("Redis broker torn down");
    }

    async fn release(&self, key: &TopicKey) {
        if self.book.lock().await.release_consumer(key) {
            debug!(%key, "Consumer connection released");
        }
    }

    async fn close(&self) {
        let (conn, declared) = {
            let book = self.book.lock().await;
            (book.conn.clone(), book.declared.iter().copied().collect::<Vec<_>>())
        };
        if let Some(mut conn) = conn {
            for key in declared {
                let stream = key.to_string();
                let destroyed: Result<i64, BrokerError> = self
                    .bounded(
                        self.op_timeout,
                        destroy_group_cmd(&stream, &self.group).query_async(&mut conn),
                    )
                    .await;
                if let Err(e) = destroyed {
                    warn!(%key, error = %e, "Consumer group not destroyed");
                }
            }
        }
        self.teardown().await;
        info!(group = %self.group, "Redis broker closed");
    }

    async fn declare(&self, key: &TopicKey, _options: QueueOptions) -> Result<(), BrokerError> {
        if self.book.lock().await.declared.contains(key) {
            return Ok(());
        }
        let mut conn = self.shared().await?;
        let stream = key.to_string();
        self.bounded(self.op_timeout, async {
            let created: RedisResult<()> = redis::cmd("XGROUP")
                .arg("CREATE")
                .arg(&stream)
                .arg(&self.group)
                .arg("0")
                .arg("MKSTREAM")
                .query_async(&mut conn)
                .await;
            created.or_else(ignore_exists)
        })
        .await?;

        self.book.lock().await.declared.insert(*key);
        Ok(())
    }

    async fn publish(&self, key: &TopicKey, payload: &str) -> Result<(), BrokerError> {
        let mut conn = self.shared().await?;
        let stream = key.to_string();
        let _: String = self
            .bounded(
                self.op_timeout,
                redis::cmd("XADD")
                    .arg(&stream)
                    .arg("MAXLEN")
                    .arg(1)
                    .arg("*")
                    .arg(PAYLOAD_FIELD)
                    .arg(payload)
                    .query_async(&mut conn),
            )
            .await?;
        Ok(())
    }

    async fn receive(&self, key: &TopicKey, wait: Duration) -> Result<Option<Delivery>, BrokerError> {
        let mut conn = self.consumer_conn(key).await?;
        let stream = key.to_string();
        let block_ms = usize::try_from(wait.as_millis()).unwrap_or(usize::MAX).max(1);
        let opts = StreamReadOptions::default()
            .group(&self.group, CONSUMER_NAME)
            .count(1)
            .block(block_ms);

        let reply: RedisResult<Option<StreamReadReply>> = match timeout(
            wait + self.op_timeout,
            conn.xread_options(&[stream.as_str()], &[">"], &opts),
        )
        .await
        {
            Ok(reply) => reply,
            Err(_) => return Err(BrokerError::Timeout(wait + self.op_timeout)),
        };

        let reply = match reply {
            Ok(reply) => reply,
            Err(e) => {
                if e.code() == Some("NOGROUP") {
                    self.book.lock().await.declared.remove(key);
                }
                return Err(classify(e));
            }
        };

        let entry = reply
            .into_iter()
            .flat_map(|r| r.keys)
            .flat_map(|k| k.ids)
            .next();
        match entry {
            Some(entry) => {
                let payload: String = entry.get(PAYLOAD_FIELD).ok_or_else(|| {
                    BrokerError::Protocol(format!("entry {} on {stream} has no payload", entry.id))
                })?;
                Ok(Some(Delivery {
                    id: entry.id,
                    payload,
                }))
            }
            None => Ok(None),
        }
    }

    async fn ack(&self, key: &TopicKey, delivery: &Delivery) -> Result<(), BrokerError> {
        let mut conn = self.shared().await?;
        let stream = key.to_string();
        let _: i64 = self
            .bounded(
                self.op_timeout,
                redis::cmd("XACK")
                    .arg(&stream)
                    .arg(&self.group)
                    .arg(&delivery.id)
                    .query_async(&mut conn),
            )
            .await?;
        Ok(())
    }
}
