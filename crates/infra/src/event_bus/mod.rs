//! Infrastructure-backed dispatch channels.
//!
//! The channel abstraction and the in-memory implementation live in
//! `jobforge-events`. This module adds the durable transport.

#[cfg(feature = "redis")]
pub mod redis_streams;

#[cfg(feature = "redis")]
pub use redis_streams::{RedisStreamsDispatchChannel, RedisStreamsError};
