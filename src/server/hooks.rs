use std::sync::Arc;

#[cfg(test)] use mockall::automock;
use tracing::{debug, warn};

use crate::server::connection::Connection;
use crate::wire::message::Message;

/// Callbacks for connection lifecycle events, implemented by the layer on top of the transport.
///  They are called synchronously from connection activities and must not block.
#[cfg_attr(test, automock)]
pub trait ServerHooks: Send + Sync + 'static {
    /// Called for every new connection before it is started. Returning `false` rejects the
    ///  connection.
    fn on_connect(&self, _conn: &Arc<Connection>) -> bool {
        true
    }

    /// fallback for messages with a body whose command has no registered handler
    fn on_message(&self, message: Message, conn: &Arc<Connection>) {
        warn!("no handler for command {:?} from {:?}, discarding message", message.command(), conn.id());
    }

    /// called exactly once per connection when it is closed
    fn on_close(&self, _conn: &Connection) {
    }

    fn on_error(&self, conn: &Connection, e: &anyhow::Error) {
        debug!("error on connection {:?}: {}", conn.id(), e);
    }
}

/// hooks that only do the default logging
pub struct NoopHooks;

impl ServerHooks for NoopHooks {}
