use thiserror::Error;

use crate::server::connection::ConnectionId;

/// Conditions that callers of the transport may want to react to individually. Everything else
///  is reported as a plain `anyhow::Error`.
#[derive(Error, Debug, Clone, Eq, PartialEq)]
pub enum TransportError {
    /// The connection (or the whole server) was closed, and its outbound queue is gone
    #[error("server closed")]
    ServerClosed,

    #[error("outbound queue is full")]
    OutboundQueueFull,

    /// The partition worker responsible for an entity has no room left in its inbox. The job was
    ///  not enqueued, and there is no retry at this level.
    #[error("inbox of partition worker {partition} is full")]
    PoolInboxFull { partition: usize },

    #[error("partition pool was shut down")]
    PoolStopped,

    #[error("no connection with id {0:?}")]
    UnknownConnection(ConnectionId),

    #[error("declared frame length {declared} exceeds the maximum of {max} bytes")]
    FrameTooLarge { declared: u32, max: u32 },

    #[error("protocol version {version} is below the minimum of {minimum}")]
    BadVersion { version: u16, minimum: u16 },

    #[error("frame was not flushed in time")]
    FlushTimeout,
}
