use std::any::Any;
use std::fmt::{Debug, Formatter};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::anyhow;
use async_trait::async_trait;
use socket2::SockRef;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::dispatch::correlation::RequestIdGenerator;
use crate::dispatch::partition_pool::WorkPartitionPool;
use crate::dispatch::pending::PendingRequestTracker;
use crate::dispatch::registry::DispatchRegistry;
use crate::error::TransportError;
use crate::server::backoff::Backoff;
use crate::server::config::ServerConfig;
use crate::server::connection::{Connection, ConnectionId, Direction};
use crate::server::connection_registry::ConnectionRegistry;
use crate::server::extensions::Extensions;
use crate::server::hooks::{NoopHooks, ServerHooks};
use crate::server::rate_limit::ByteRateLimiter;
use crate::server::traffic::TrafficCounters;
use crate::wire::command::CommandNames;
use crate::wire::message::Message;
use crate::wire::preamble::Preamble;

/// State shared between a server and all of its connections
pub(crate) struct ServerContext {
    pub config: ServerConfig,
    pub hooks: Arc<dyn ServerHooks>,
    pub dispatch: Arc<DispatchRegistry>,
    pub pool: Arc<WorkPartitionPool>,
    pub pending: Arc<PendingRequestTracker>,
    pub request_ids: Arc<RequestIdGenerator>,
    pub command_names: Arc<CommandNames>,
    pub connections: ConnectionRegistry,
    pub traffic: Arc<TrafficCounters>,
    pub download_limiter: Option<ByteRateLimiter>,
    pub upload_limiter: Option<ByteRateLimiter>,
    pub extensions: Extensions,
    pub active_connections: AtomicUsize,
    pub shutdown: CancellationToken,
    pub tasks: TaskTracker,
}

pub struct ServerBuilder {
    config: ServerConfig,
    hooks: Option<Arc<dyn ServerHooks>>,
    dispatch: Option<Arc<DispatchRegistry>>,
    pool: Option<Arc<WorkPartitionPool>>,
    pending: Option<Arc<PendingRequestTracker>>,
    request_ids: Option<Arc<RequestIdGenerator>>,
    command_names: Option<Arc<CommandNames>>,
    extensions: Extensions,
}

impl ServerBuilder {
    pub fn new(config: ServerConfig) -> ServerBuilder {
        ServerBuilder {
            config,
            hooks: None,
            dispatch: None,
            pool: None,
            pending: None,
            request_ids: None,
            command_names: None,
            extensions: Extensions::new(),
        }
    }

    pub fn hooks(mut self, hooks: Arc<dyn ServerHooks>) -> ServerBuilder {
        self.hooks = Some(hooks);
        self
    }

    pub fn dispatch(mut self, dispatch: Arc<DispatchRegistry>) -> ServerBuilder {
        self.dispatch = Some(dispatch);
        self
    }

    pub fn pool(mut self, pool: Arc<WorkPartitionPool>) -> ServerBuilder {
        self.pool = Some(pool);
        self
    }

    pub fn pending(mut self, pending: Arc<PendingRequestTracker>) -> ServerBuilder {
        self.pending = Some(pending);
        self
    }

    pub fn request_ids(mut self, request_ids: Arc<RequestIdGenerator>) -> ServerBuilder {
        self.request_ids = Some(request_ids);
        self
    }

    pub fn command_names(mut self, command_names: Arc<CommandNames>) -> ServerBuilder {
        self.command_names = Some(command_names);
        self
    }

    /// Attaches an application value to the server. Handlers reach it through
    ///  [Server::extensions].
    pub fn extension<T: Any + Send + Sync>(self, value: T) -> ServerBuilder {
        self.extensions.insert(value);
        self
    }

    /// Creates the server and starts its traffic sampler. This must be called from inside a
    ///  tokio runtime.
    pub fn build(self) -> anyhow::Result<Server> {
        self.config.validate()?;

        let pool = match self.pool {
            Some(pool) => pool,
            None => Arc::new(WorkPartitionPool::with_defaults()?),
        };
        let request_ids = match self.request_ids {
            Some(ids) => ids,
            None => Arc::new(RequestIdGenerator::new(0)?),
        };
        let download_limiter = self.config.download_limit.clone()
            .map(ByteRateLimiter::new)
            .transpose()?;
        let upload_limiter = self.config.upload_limit.clone()
            .map(ByteRateLimiter::new)
            .transpose()?;

        let ctx = Arc::new(ServerContext {
            hooks: self.hooks.unwrap_or_else(|| Arc::new(NoopHooks)),
            dispatch: self.dispatch.unwrap_or_default(),
            pool,
            pending: self.pending.unwrap_or_default(),
            request_ids,
            command_names: self.command_names.unwrap_or_else(|| Arc::new(CommandNames::new())),
            connections: ConnectionRegistry::new(),
            traffic: Arc::new(TrafficCounters::new()),
            download_limiter,
            upload_limiter,
            extensions: self.extensions,
            active_connections: AtomicUsize::new(0),
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
            config: self.config,
        });

        ctx.tasks.spawn(ctx.traffic.clone().run_sampler(ctx.config.traffic_sample_interval, ctx.shutdown.child_token()));

        Ok(Server { ctx })
    }
}

/// A source of incoming connections for [Server::start]
#[async_trait]
pub trait Acceptor: Send + Sync {
    async fn accept(&self) -> io::Result<(TcpStream, SocketAddr)>;

    fn local_addr(&self) -> io::Result<SocketAddr>;
}

#[async_trait]
impl Acceptor for TcpListener {
    async fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
        TcpListener::accept(self).await
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        TcpListener::local_addr(self)
    }
}

/// Accepts and dials persistent TCP connections to peers and owns them until they are closed.
///
/// A server is a cheap handle, clones share the same state. [Server::stop] must be called to
///  release the connections.
#[derive(Clone)]
pub struct Server {
    ctx: Arc<ServerContext>,
}

impl Debug for Server {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Server{{connections:{}, stopped:{}}}", self.ctx.connections.len(), self.is_stopped())
    }
}

impl Server {
    pub fn builder(config: ServerConfig) -> ServerBuilder {
        ServerBuilder::new(config)
    }

    pub(crate) fn from_context(ctx: Arc<ServerContext>) -> Server {
        Server { ctx }
    }

    /// Runs the accept loop for a listener until the server is stopped. Transient accept errors
    ///  are retried with a backoff, other errors end the loop and are returned.
    pub async fn start(&self, listener: impl Acceptor) -> anyhow::Result<()> {
        let local_addr = listener.local_addr()?;
        let _task = self.ctx.tasks.token();
        info!("accepting connections on {}", local_addr);

        let mut backoff = Backoff::default();
        loop {
            let accepted = tokio::select! {
                _ = self.ctx.shutdown.cancelled() => break,
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer_addr)) => {
                    backoff.reset();
                    self.on_accepted(stream, peer_addr);
                }
                Err(e) if Backoff::is_transient(&e) => {
                    let delay = backoff.next_delay();
                    warn!("accept error on {}: {} - retrying in {:?}", local_addr, e, delay);
                    tokio::select! {
                        _ = self.ctx.shutdown.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(e) => {
                    error!("accept error on {}: {} - giving up", local_addr, e);
                    return Err(e.into());
                }
            }
        }

        info!("stopped accepting connections on {}", local_addr);
        Ok(())
    }

    fn on_accepted(&self, stream: TcpStream, peer_addr: SocketAddr) {
        let max_connections = self.ctx.config.max_connections;
        if max_connections != 0 && self.ctx.connections.len() >= max_connections {
            warn!("rejecting connection from {}: limit of {} connections reached", peer_addr, max_connections);
            if let Err(e) = SockRef::from(&stream).set_linger(Some(std::time::Duration::ZERO)) {
                debug!("could not set linger on rejected socket: {}", e);
            }
            return;
        }

        if let Err(e) = self.register_and_start(stream, Direction::Accepted, None) {
            warn!("could not set up connection from {}: {}", peer_addr, e);
        }
    }

    fn register_and_start(&self, stream: TcpStream, direction: Direction, redial_addr: Option<SocketAddr>) -> anyhow::Result<Arc<Connection>> {
        let (conn, queues) = Connection::new(self.ctx.clone(), stream, direction, redial_addr)?;
        self.ctx.connections.store(conn.id(), conn.clone());

        // stop() may have taken its snapshot of the registry already
        if self.ctx.shutdown.is_cancelled() {
            conn.spawn_close();
            return Err(TransportError::ServerClosed.into());
        }

        if !self.ctx.hooks.on_connect(&conn) {
            conn.spawn_close();
            return Err(anyhow!("connection {:?} with {} was rejected", conn.id(), conn.peer_addr()));
        }

        conn.start(queues);
        Ok(conn)
    }

    /// Dials a peer. The new connection is registered and started like an accepted one.
    pub async fn connect(&self, addr: SocketAddr) -> anyhow::Result<Arc<Connection>> {
        self.dial(addr, false).await
    }

    /// Dials a peer like [Server::connect], and dials it again whenever the connection is
    ///  closed while the server is running. Each redial creates a new connection with a new id.
    pub async fn connect_persistent(&self, addr: SocketAddr) -> anyhow::Result<Arc<Connection>> {
        self.dial(addr, true).await
    }

    async fn dial(&self, addr: SocketAddr, persistent: bool) -> anyhow::Result<Arc<Connection>> {
        if self.ctx.shutdown.is_cancelled() {
            return Err(TransportError::ServerClosed.into());
        }

        let config = &self.ctx.config;
        let mut stream = tokio::time::timeout(config.handshake_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| anyhow!("timed out connecting to {}", addr))??;

        if config.expect_preamble {
            let preamble = Preamble::client(config.advertised_ip, config.server_port);
            stream.write_all(&preamble.encode()).await?;
        }

        debug!("connected to {}", addr);
        self.register_and_start(stream, Direction::Dialed, persistent.then_some(addr))
    }

    /// redials a closed persistent connection in the background, with a backoff between attempts
    pub(crate) fn spawn_redial(&self, addr: SocketAddr) {
        let server = self.clone();
        self.ctx.tasks.spawn(async move {
            let mut backoff = Backoff::default();
            for attempt in 1..=server.ctx.config.reconnect_attempts {
                tokio::select! {
                    _ = server.ctx.shutdown.cancelled() => return,
                    _ = tokio::time::sleep(backoff.next_delay()) => {}
                }

                match server.dial(addr, true).await {
                    Ok(conn) => {
                        info!("reconnected to {} as {:?}", addr, conn.id());
                        return;
                    }
                    Err(e) => debug!("reconnect attempt {} to {} failed: {}", attempt, addr, e),
                }
            }
            if !server.is_stopped() {
                warn!("giving up reconnecting to {}", addr);
            }
        });
    }

    /// Stops all accept loops and the traffic sampler, and closes all connections. Returns when
    ///  all connection activities have terminated.
    pub async fn stop(&self) {
        if !self.ctx.shutdown.is_cancelled() {
            info!("stopping server");
            self.ctx.shutdown.cancel();
        }

        let connections = self.ctx.connections.snapshot();
        futures::future::join_all(connections.iter()
            .map(|conn| async move {
                conn.close().await;
                conn.closed().await;
            })
        ).await;

        self.ctx.tasks.close();
        self.ctx.tasks.wait().await;
    }

    pub fn is_stopped(&self) -> bool {
        self.ctx.shutdown.is_cancelled()
    }

    /// enqueues a message on a specific connection
    pub fn unicast(&self, id: ConnectionId, message: Message) -> anyhow::Result<()> {
        let conn = self.ctx.connections.load(id)
            .ok_or(TransportError::UnknownConnection(id))?;
        conn.write(message)?;
        Ok(())
    }

    /// Enqueues a message on every connection. This stops at the first connection that fails to
    ///  accept the message, and returns that error.
    pub fn broadcast(&self, message: &Message) -> anyhow::Result<()> {
        let mut result = Ok(());
        self.ctx.connections.range(|conn| {
            match conn.write(message.clone()) {
                Ok(()) => true,
                Err(e) => {
                    warn!("broadcast to connection {:?} failed: {}", conn.id(), e);
                    result = Err(e.into());
                    false
                }
            }
        });
        result
    }

    pub fn connection(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        self.ctx.connections.load(id)
    }

    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.ctx.connections.snapshot()
    }

    /// number of connections in the registry
    pub fn connection_count(&self) -> usize {
        self.ctx.connections.len()
    }

    /// number of connections that were created and are not completely closed yet
    pub fn active_connections(&self) -> usize {
        self.ctx.active_connections.load(Ordering::Acquire)
    }

    pub fn traffic(&self) -> &TrafficCounters {
        &self.ctx.traffic
    }

    pub fn config(&self) -> &ServerConfig {
        &self.ctx.config
    }

    pub fn dispatch(&self) -> &Arc<DispatchRegistry> {
        &self.ctx.dispatch
    }

    pub fn pending(&self) -> &Arc<PendingRequestTracker> {
        &self.ctx.pending
    }

    pub fn request_ids(&self) -> &Arc<RequestIdGenerator> {
        &self.ctx.request_ids
    }

    pub fn command_names(&self) -> &Arc<CommandNames> {
        &self.ctx.command_names
    }

    /// application values attached when the server was built
    pub fn extensions(&self) -> &Extensions {
        &self.ctx.extensions
    }
}
