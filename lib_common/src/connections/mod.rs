//! # Connections Module
//!
//! This module handles persistent connections to external services: the
//! Postgres database behind the session store and the Redis server behind the
//! fanout broker.

/// Module for PostgreSQL connection pooling and the Postgres session store.
pub mod db_postgres;

/// Module for the Redis Streams broker.
pub mod broker_redis;

pub use broker_redis::RedisBroker;
pub use db_postgres::{Database, DbError, PgDeviceActivity, PgSessionStore};
