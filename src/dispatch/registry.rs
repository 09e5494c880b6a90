use std::fmt::{Debug, Formatter};
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use tracing::{debug, warn};

use crate::dispatch::correlation::RequestScope;
use crate::server::connection::Connection;
use crate::wire::command::CommandCode;

/// Application code that handles one or more commands. Handlers run on a partition worker, so
///  messages from a given connection are handled one at a time and in the order they were read.
///
/// Returning an error (or panicking) is treated as a protocol violation by the peer and closes
///  the connection.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn on_message(&self, scope: RequestScope, conn: Arc<Connection>) -> anyhow::Result<()>;
}

struct FnHandler<F, Fut> {
    f: F,
    _fut: PhantomData<fn() -> Fut>,
}

#[async_trait]
impl <F, Fut> MessageHandler for FnHandler<F, Fut>
where
    F: Fn(RequestScope, Arc<Connection>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn on_message(&self, scope: RequestScope, conn: Arc<Connection>) -> anyhow::Result<()> {
        (self.f)(scope, conn).await
    }
}

/// Wraps an async closure as a [MessageHandler]
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn MessageHandler>
where
    F: Fn(RequestScope, Arc<Connection>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(FnHandler { f, _fut: PhantomData })
}

/// Maps commands to their handlers. The registry is populated at startup and then shared by all
///  connections of a server.
#[derive(Default)]
pub struct DispatchRegistry {
    handlers: RwLock<FxHashMap<CommandCode, Arc<dyn MessageHandler>>>,
}

impl Debug for DispatchRegistry {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let mut commands = self.commands();
        commands.sort();
        write!(f, "DispatchRegistry{{{:?}}}", commands)
    }
}

impl DispatchRegistry {
    pub fn new() -> DispatchRegistry {
        DispatchRegistry::default()
    }

    /// Registers a handler for a command, replacing any handler that was registered before
    pub fn register(&self, command: CommandCode, handler: Arc<dyn MessageHandler>) {
        if self.handlers.write().insert(command, handler).is_some() {
            warn!("registering a second handler for command {:?}, replacing the first", command);
        }
        else {
            debug!("registered handler for command {:?}", command);
        }
    }

    pub fn deregister(&self, command: CommandCode) -> bool {
        self.handlers.write().remove(&command).is_some()
    }

    pub fn get(&self, command: CommandCode) -> Option<Arc<dyn MessageHandler>> {
        self.handlers.read().get(&command).cloned()
    }

    pub fn commands(&self) -> Vec<CommandCode> {
        self.handlers.read().keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.handlers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_get() {
        let registry = DispatchRegistry::new();
        assert!(registry.is_empty());
        assert!(registry.get(CommandCode(1)).is_none());

        let handler: Arc<dyn MessageHandler> = Arc::new(MockMessageHandler::new());
        registry.register(CommandCode(1), handler.clone());

        assert_eq!(registry.len(), 1);
        assert!(Arc::ptr_eq(&registry.get(CommandCode(1)).unwrap(), &handler));
        assert!(registry.get(CommandCode(2)).is_none());
    }

    #[test]
    fn test_register_replaces() {
        let registry = DispatchRegistry::new();
        let first: Arc<dyn MessageHandler> = Arc::new(MockMessageHandler::new());
        let second = handler_fn(|_, _| async { anyhow::Ok(()) });

        registry.register(CommandCode(5), first.clone());
        registry.register(CommandCode(5), second.clone());

        assert_eq!(registry.len(), 1);
        let actual = registry.get(CommandCode(5)).unwrap();
        assert!(Arc::ptr_eq(&actual, &second));
        assert!(!Arc::ptr_eq(&actual, &first));
    }

    #[test]
    fn test_deregister() {
        let registry = DispatchRegistry::new();
        registry.register(CommandCode(5), handler_fn(|_, _| async { anyhow::Ok(()) }));
        registry.register(CommandCode(6), handler_fn(|_, _| async { anyhow::Ok(()) }));

        assert!(registry.deregister(CommandCode(5)));
        assert!(!registry.deregister(CommandCode(5)));
        assert_eq!(registry.commands(), vec![CommandCode(6)]);
        assert_eq!(format!("{:?}", registry), "DispatchRegistry{[0x06]}");
    }
}
