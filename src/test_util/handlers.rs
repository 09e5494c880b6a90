use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail};
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::dispatch::correlation::RequestScope;
use crate::dispatch::registry::MessageHandler;
use crate::server::connection::{Connection, ConnectionId};
use crate::server::hooks::ServerHooks;
use crate::wire::command::CommandCode;
use crate::wire::message::Message;

#[derive(Debug, Clone)]
pub struct Received {
    pub connection_id: ConnectionId,
    pub message: Message,
    pub started: Instant,
    pub finished: Instant,
}

/// Records every message it handles, optionally taking some time per message
#[derive(Default)]
pub struct RecordingHandler {
    delay: Option<Duration>,
    received: Mutex<Vec<Received>>,
    notify: Notify,
}

impl RecordingHandler {
    pub fn new() -> Arc<RecordingHandler> {
        Arc::new(RecordingHandler::default())
    }

    pub fn with_delay(delay: Duration) -> Arc<RecordingHandler> {
        Arc::new(RecordingHandler {
            delay: Some(delay),
            ..Default::default()
        })
    }

    pub fn received(&self) -> Vec<Received> {
        self.received.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.received.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.received.lock().is_empty()
    }

    /// waits until at least `n` messages were handled
    pub async fn wait_for(&self, n: usize, timeout: Duration) -> anyhow::Result<Vec<Received>> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.notify.notified();
            {
                let received = self.received.lock();
                if received.len() >= n {
                    return Ok(received.clone());
                }
            }
            tokio::time::timeout_at(deadline, notified)
                .await
                .map_err(|_| anyhow!("only {} of {} messages received within {:?}", self.len(), n, timeout))?;
        }
    }
}

#[async_trait]
impl MessageHandler for RecordingHandler {
    async fn on_message(&self, scope: RequestScope, _conn: Arc<Connection>) -> anyhow::Result<()> {
        let started = Instant::now();
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        self.received.lock().push(Received {
            connection_id: scope.connection_id,
            message: scope.message,
            started,
            finished: Instant::now(),
        });
        self.notify.notify_waiters();
        Ok(())
    }
}

/// Sends the body of every message back under a response command
pub struct EchoHandler {
    pub response_command: CommandCode,
}

#[async_trait]
impl MessageHandler for EchoHandler {
    async fn on_message(&self, scope: RequestScope, conn: Arc<Connection>) -> anyhow::Result<()> {
        conn.write(scope.response(self.response_command, scope.message.body.clone()))?;
        Ok(())
    }
}

pub struct FailingHandler;

#[async_trait]
impl MessageHandler for FailingHandler {
    async fn on_message(&self, scope: RequestScope, _conn: Arc<Connection>) -> anyhow::Result<()> {
        bail!("refusing to handle {:?}", scope.command())
    }
}

pub struct PanickingHandler;

#[async_trait]
impl MessageHandler for PanickingHandler {
    async fn on_message(&self, scope: RequestScope, _conn: Arc<Connection>) -> anyhow::Result<()> {
        panic!("panicking while handling {:?}", scope.command())
    }
}

/// Counts lifecycle events and records messages that reached the fallback
#[derive(Default)]
pub struct RecordingHooks {
    pub reject_connections: bool,
    pub connects: AtomicUsize,
    pub closes: AtomicUsize,
    pub errors: AtomicUsize,
    unhandled: Mutex<Vec<Message>>,
}

impl RecordingHooks {
    pub fn new() -> Arc<RecordingHooks> {
        Arc::new(RecordingHooks::default())
    }

    pub fn num_connects(&self) -> usize {
        self.connects.load(Ordering::Acquire)
    }

    pub fn num_closes(&self) -> usize {
        self.closes.load(Ordering::Acquire)
    }

    pub fn num_errors(&self) -> usize {
        self.errors.load(Ordering::Acquire)
    }

    pub fn unhandled(&self) -> Vec<Message> {
        self.unhandled.lock().clone()
    }
}

impl ServerHooks for RecordingHooks {
    fn on_connect(&self, _conn: &Arc<Connection>) -> bool {
        self.connects.fetch_add(1, Ordering::AcqRel);
        !self.reject_connections
    }

    fn on_message(&self, message: Message, _conn: &Arc<Connection>) {
        self.unhandled.lock().push(message);
    }

    fn on_close(&self, _conn: &Connection) {
        self.closes.fetch_add(1, Ordering::AcqRel);
    }

    fn on_error(&self, _conn: &Connection, _e: &anyhow::Error) {
        self.errors.fetch_add(1, Ordering::AcqRel);
    }
}
