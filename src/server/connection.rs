use std::cmp::min;
use std::fmt::{Debug, Formatter};
use std::future::Future;
use std::io;
use std::net::{Shutdown, SocketAddr};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail};
use bytes::{Bytes, BytesMut};
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use socket2::SockRef;
use tokio::net::TcpStream;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, debug_span, error, trace, warn, Instrument};

use crate::dispatch::correlation::{Correlation, RequestScope};
use crate::dispatch::registry::MessageHandler;
use crate::error::TransportError;
use crate::server::extensions::Extensions;
use crate::server::rate_limit::ByteRateLimiter;
use crate::server::server::{Server, ServerContext};
use crate::wire::bad_version::BadVersionNotice;
use crate::wire::command::CommandCode;
use crate::wire::header::{MessageHeader, HEADER_LEN};
use crate::wire::message::Message;
use crate::wire::preamble::{ConnectionKind, Preamble, PREAMBLE_LEN};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique id of a connection. Ids are assigned in increasing order and never reused.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ConnectionId(pub u64);

impl ConnectionId {
    fn next() -> ConnectionId {
        ConnectionId(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Direction {
    Accepted,
    Dialed,
}

/// Called after a frame of a given command was written, with the frame's request id and the
///  time it took to write it
pub type WriteHook = Arc<dyn Fn(i64, Duration) + Send + Sync>;

struct OutboundFrame {
    bytes: Bytes,
    command: CommandCode,
    request_id: i64,
    flushed: Option<oneshot::Sender<()>>,
}

struct DispatchItem {
    message: Message,
    handler: Arc<dyn MessageHandler>,
}

/// The receiving ends of a connection's queues, handed to its activities when it is started
pub(crate) struct ConnectionQueues {
    outbound: mpsc::Receiver<OutboundFrame>,
    dispatch_send: mpsc::Sender<DispatchItem>,
    dispatch_recv: mpsc::Receiver<DispatchItem>,
}

/// A persistent TCP connection to a peer.
///
/// Each connection runs three activities: a reader that decodes frames, a dispatcher that
///  hands decoded messages to the partition pool, and a writer that puts queued outbound
///  frames on the wire. When any of them ends, the connection is closed.
pub struct Connection {
    id: ConnectionId,
    direction: Direction,
    peer_addr: SocketAddr,
    local_addr: SocketAddr,
    name: RwLock<String>,
    min_version: u16,

    stream: TcpStream,
    ctx: Arc<ServerContext>,

    outbound: Mutex<Option<mpsc::Sender<OutboundFrame>>>,
    cancel: CancellationToken,
    activities: TaskTracker,

    close_started: AtomicBool,
    close_finished: CancellationToken,
    last_heartbeat: Mutex<Instant>,
    preamble: Mutex<Option<Preamble>>,

    extensions: Extensions,
    write_hooks: RwLock<FxHashMap<CommandCode, WriteHook>>,
    /// the address to redial after close, for persistent dialed connections
    redial_addr: Option<SocketAddr>,
    reconnect: AtomicBool,
}

impl Debug for Connection {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Connection{{{:?}, {:?}, peer:{}}}", self.id, self.direction, self.peer_addr)
    }
}

impl Connection {
    pub(crate) fn new(ctx: Arc<ServerContext>, stream: TcpStream, direction: Direction, redial_addr: Option<SocketAddr>) -> anyhow::Result<(Arc<Connection>, ConnectionQueues)> {
        stream.set_nodelay(true)?;
        let peer_addr = stream.peer_addr()?;
        let local_addr = stream.local_addr()?;

        let buffer_size = ctx.config.buffer_size;
        let (outbound_send, outbound_recv) = mpsc::channel(buffer_size);
        let (dispatch_send, dispatch_recv) = mpsc::channel(buffer_size);

        let conn = Arc::new(Connection {
            id: ConnectionId::next(),
            direction,
            peer_addr,
            local_addr,
            name: RwLock::new(peer_addr.to_string()),
            min_version: ctx.config.min_version,
            stream,
            cancel: ctx.shutdown.child_token(),
            ctx,
            outbound: Mutex::new(Some(outbound_send)),
            activities: TaskTracker::new(),
            close_started: AtomicBool::new(false),
            close_finished: CancellationToken::new(),
            last_heartbeat: Mutex::new(Instant::now()),
            preamble: Mutex::new(None),
            extensions: Extensions::new(),
            write_hooks: Default::default(),
            redial_addr,
            reconnect: AtomicBool::new(redial_addr.is_some()),
        });
        conn.ctx.active_connections.fetch_add(1, Ordering::AcqRel);
        debug!("new {:?} connection {:?} with {}", direction, conn.id, peer_addr);

        Ok((conn, ConnectionQueues {
            outbound: outbound_recv,
            dispatch_send,
            dispatch_recv,
        }))
    }

    pub(crate) fn start(self: &Arc<Self>, queues: ConnectionQueues) {
        let ConnectionQueues { outbound, dispatch_send, dispatch_recv } = queues;

        self.spawn_activity("reader", self.clone().run_reader(dispatch_send));
        self.spawn_activity("writer", self.clone().run_writer(outbound));
        self.spawn_activity("dispatcher", self.clone().run_dispatcher(dispatch_recv));
        self.activities.close();
    }

    fn spawn_activity(self: &Arc<Self>, name: &'static str, activity: impl Future<Output = anyhow::Result<()>> + Send + 'static) {
        let conn = self.clone();
        let span = debug_span!("conn", id = self.id.0, peer = %self.peer_addr);

        self.activities.spawn(async move {
            match activity.await {
                Ok(()) => trace!("{} finished", name),
                Err(e) => {
                    if !conn.is_closed() {
                        debug!("{} failed: {}", name, e);
                        conn.ctx.hooks.on_error(&conn, &e);
                    }
                }
            }
            conn.spawn_close();
        }.instrument(span));
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// a display name for logging, initially the peer's address
    pub fn name(&self) -> String {
        self.name.read().clone()
    }

    pub fn set_name(&self, name: impl Into<String>) {
        *self.name.write() = name.into();
    }

    pub fn min_version(&self) -> u16 {
        self.min_version
    }

    /// the time the most recent frame header was read
    pub fn last_heartbeat(&self) -> Instant {
        *self.last_heartbeat.lock()
    }

    /// the preamble the peer sent, if the connection was accepted with preambles enabled
    pub fn preamble(&self) -> Option<Preamble> {
        *self.preamble.lock()
    }

    pub fn next_request_id(&self) -> i64 {
        self.ctx.request_ids.next_id()
    }

    /// the server this connection belongs to
    pub fn server(&self) -> Server {
        Server::from_context(self.ctx.clone())
    }

    /// values the application attaches to this connection
    pub fn extensions(&self) -> &Extensions {
        &self.extensions
    }

    /// Registers a callback for every written frame with a given command, replacing a previous
    ///  one for the same command
    pub fn set_write_hook(&self, command: CommandCode, hook: impl Fn(i64, Duration) + Send + Sync + 'static) {
        self.write_hooks.write().insert(command, Arc::new(hook));
    }

    pub fn remove_write_hook(&self, command: CommandCode) -> bool {
        self.write_hooks.write().remove(&command).is_some()
    }

    /// whether the connection will be redialed when it is closed
    pub fn is_persistent(&self) -> bool {
        self.reconnect.load(Ordering::Acquire)
    }

    /// a persistent connection that is closed after this call is not redialed
    pub fn disable_reconnect(&self) {
        self.reconnect.store(false, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.close_started.load(Ordering::Acquire)
    }

    /// completes when the connection is completely closed
    pub async fn closed(&self) {
        self.close_finished.cancelled().await
    }

    /// Enqueues a message for sending. A request id is assigned if the message does not have
    ///  one yet. This does not wait for the message to be written.
    pub fn write(&self, message: Message) -> Result<(), TransportError> {
        self.enqueue(self.outbound_frame(message, None))
    }

    /// writes a message as part of the request identified by a correlation
    pub fn write_with(&self, mut message: Message, correlation: &Correlation) -> Result<(), TransportError> {
        message.header.request_id = correlation.request_id;
        self.write(message)
    }

    /// Enqueues a message and waits until the writer has put it on the wire
    pub async fn write_and_flush(&self, message: Message, timeout: Duration) -> Result<(), TransportError> {
        let (flushed_send, flushed_recv) = oneshot::channel();
        self.enqueue(self.outbound_frame(message, Some(flushed_send)))?;

        match tokio::time::timeout(timeout, flushed_recv).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(TransportError::ServerClosed),
            Err(_) => Err(TransportError::FlushTimeout),
        }
    }

    fn outbound_frame(&self, mut message: Message, flushed: Option<oneshot::Sender<()>>) -> OutboundFrame {
        if message.header.request_id == 0 {
            message.header.request_id = self.ctx.request_ids.next_id();
        }
        OutboundFrame {
            bytes: message.to_frame().freeze(),
            command: message.command(),
            request_id: message.request_id(),
            flushed,
        }
    }

    fn enqueue(&self, frame: OutboundFrame) -> Result<(), TransportError> {
        let outbound = self.outbound.lock();
        let queue = match outbound.as_ref() {
            Some(queue) => queue,
            None => return Err(TransportError::ServerClosed),
        };

        match queue.try_send(frame) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(TransportError::OutboundQueueFull),
            Err(TrySendError::Closed(_)) => Err(TransportError::ServerClosed),
        }
    }

    /// Closes the connection. Only the first call has any effect, later calls return
    ///  immediately without waiting for the first call to finish.
    ///
    /// A persistent dialed connection is redialed afterwards unless the server is stopping.
    pub async fn close(&self) {
        if self.close_started.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire).is_err() {
            return;
        }
        debug!("closing connection {:?} with {}", self.id, self.peer_addr);

        self.ctx.hooks.on_close(self);
        self.ctx.connections.delete(self.id);

        if let Err(e) = self.abort_socket() {
            trace!("error shutting down socket of connection {:?}: {}", self.id, e);
        }

        self.cancel.cancel();
        self.activities.close();
        self.activities.wait().await;

        self.outbound.lock().take();
        self.ctx.active_connections.fetch_sub(1, Ordering::AcqRel);
        self.close_finished.cancel();
        trace!("connection {:?} closed", self.id);

        if let Some(addr) = self.redial_addr {
            if self.is_persistent() && !self.ctx.shutdown.is_cancelled() {
                self.server().spawn_redial(addr);
            }
        }
    }

    /// close from a separate task, so that an activity never waits for itself
    pub(crate) fn spawn_close(self: &Arc<Self>) {
        if self.is_closed() {
            return;
        }
        let conn = self.clone();
        tokio::spawn(async move {
            conn.close().await;
        });
    }

    fn abort_socket(&self) -> io::Result<()> {
        let socket = SockRef::from(&self.stream);
        socket.set_linger(Some(Duration::ZERO))?;
        socket.shutdown(Shutdown::Both)
    }

    async fn run_reader(self: Arc<Self>, dispatch: mpsc::Sender<DispatchItem>) -> anyhow::Result<()> {
        tokio::select! {
            _ = self.cancel.cancelled() => Ok(()),
            result = self.read_loop(&dispatch) => result,
        }
    }

    async fn read_loop(self: &Arc<Self>, dispatch: &mpsc::Sender<DispatchItem>) -> anyhow::Result<()> {
        if self.direction == Direction::Accepted && self.ctx.config.expect_preamble {
            let preamble = self.read_preamble().await?;
            if preamble.kind == ConnectionKind::Handshake {
                debug!("handshake side channels are not supported, closing");
                return Ok(());
            }
            *self.preamble.lock() = Some(preamble);
        }

        let config = &self.ctx.config;
        let mut header_buf = [0u8; HEADER_LEN];
        loop {
            if !self.read_fully(&mut header_buf, true, None).await? {
                debug!("connection closed by peer");
                return Ok(());
            }
            let header = MessageHeader::decode(&header_buf);
            *self.last_heartbeat.lock() = Instant::now();
            trace!("received header {:?}", header);

            if header.version < self.min_version {
                return self.reject_version(&header).await;
            }

            let handler = self.ctx.dispatch.get(header.command);

            if header.payload_len == 0 {
                match handler {
                    Some(handler) => self.enqueue_dispatch(dispatch, Message::from_parts(header, Bytes::new()), handler).await?,
                    None => trace!("no handler for header-only command {:?}, skipping", header.command),
                }
                continue;
            }

            if header.payload_len > config.max_frame_size {
                return Err(TransportError::FrameTooLarge { declared: header.payload_len, max: config.max_frame_size }.into());
            }

            let limiter = self.ctx.download_limiter.as_ref()
                .filter(|l| l.applies_to(header.command));
            let mut body = BytesMut::zeroed(header.payload_len as usize);
            if !self.read_fully(&mut body, false, limiter).await? {
                bail!("connection closed by peer in the middle of a frame");
            }
            let message = Message::from_parts(header, body.freeze());

            match handler {
                Some(handler) => self.enqueue_dispatch(dispatch, message, handler).await?,
                None => self.ctx.hooks.on_message(message, self),
            }
        }
    }

    async fn enqueue_dispatch(&self, dispatch: &mpsc::Sender<DispatchItem>, message: Message, handler: Arc<dyn MessageHandler>) -> anyhow::Result<()> {
        if dispatch.send(DispatchItem { message, handler }).await.is_err() {
            bail!("dispatcher is gone");
        }
        Ok(())
    }

    async fn read_preamble(&self) -> anyhow::Result<Preamble> {
        let timeout = self.ctx.config.handshake_timeout;
        let mut buf = [0u8; PREAMBLE_LEN];

        let complete = tokio::time::timeout(timeout, self.read_fully(&mut buf, false, None))
            .await
            .map_err(|_| anyhow!("no preamble received within {:?}", timeout))??;
        if !complete {
            bail!("connection closed before the preamble was complete");
        }

        let preamble = Preamble::try_deser(&mut &buf[..])?;
        debug!("received preamble {:?}", preamble);
        Ok(preamble)
    }

    /// Sends a bad-version notice and keeps the connection open for a grace period so the peer
    ///  can read it. The message is not processed.
    async fn reject_version(&self, header: &MessageHeader) -> anyhow::Result<()> {
        let config = &self.ctx.config;
        warn!("rejecting command {:?} with protocol version {} (minimum is {})", header.command, header.version, self.min_version);

        let notice = BadVersionNotice {
            command: header.command,
            version: header.version,
            minimum_version: self.min_version,
            name: self.ctx.command_names.name(header.command).unwrap_or_default().to_string(),
        };
        let response = notice.to_message(config.bad_version_command, header.request_id);

        match self.write_and_flush(response, config.write_timeout).await {
            Ok(()) => {
                tokio::select! {
                    _ = self.cancel.cancelled() => {}
                    _ = tokio::time::sleep(config.bad_version_linger) => {}
                }
            }
            Err(e) => debug!("could not send bad version notice: {}", e),
        }

        Err(TransportError::BadVersion { version: header.version, minimum: self.min_version }.into())
    }

    /// Fills the buffer in chunks, each under a fresh read deadline. Returns `false` if the peer
    ///  closed the connection before the first byte, which is only allowed at a frame boundary.
    async fn read_fully(&self, buf: &mut [u8], eof_allowed: bool, limiter: Option<&ByteRateLimiter>) -> anyhow::Result<bool> {
        let chunk_size = self.ctx.config.io_chunk_size;

        let mut filled = 0;
        while filled < buf.len() {
            let end = min(buf.len(), filled + chunk_size);
            let n = self.read_chunk(&mut buf[filled..end]).await?;
            if n == 0 {
                if filled == 0 && eof_allowed {
                    return Ok(false);
                }
                bail!("unexpected EOF after {} of {} bytes", filled, buf.len());
            }
            self.ctx.traffic.add_read(n);
            filled += n;

            if let Some(limiter) = limiter {
                limiter.acquire(n).await?;
            }
        }
        Ok(true)
    }

    async fn read_chunk(&self, buf: &mut [u8]) -> anyhow::Result<usize> {
        let timeout = self.ctx.config.read_timeout;

        match tokio::time::timeout(timeout, self.try_read_when_ready(buf)).await {
            Ok(result) => Ok(result?),
            Err(_) => bail!("read timed out after {:?}", timeout),
        }
    }

    async fn try_read_when_ready(&self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            self.stream.readable().await?;
            match self.stream.try_read(buf) {
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                result => return result,
            }
        }
    }

    async fn run_writer(self: Arc<Self>, mut queue: mpsc::Receiver<OutboundFrame>) -> anyhow::Result<()> {
        loop {
            let frame = tokio::select! {
                _ = self.cancel.cancelled() => break,
                frame = queue.recv() => match frame {
                    Some(frame) => frame,
                    None => return Ok(()),
                },
            };
            self.write_frame(frame).await?;
        }

        queue.close();
        let mut num_drained = 0;
        while let Ok(frame) = queue.try_recv() {
            if self.write_frame(frame).await.is_err() {
                break;
            }
            num_drained += 1;
        }
        trace!("drained {} outbound frames", num_drained);
        Ok(())
    }

    async fn write_frame(&self, frame: OutboundFrame) -> anyhow::Result<()> {
        let chunk_size = self.ctx.config.io_chunk_size;
        let limiter = self.ctx.upload_limiter.as_ref()
            .filter(|l| l.applies_to(frame.command));
        let bytes = &frame.bytes;
        let started = Instant::now();

        let mut written = 0;
        while written < bytes.len() {
            let end = min(bytes.len(), written + chunk_size);
            if let Some(limiter) = limiter {
                limiter.acquire(end - written).await?;
            }
            let n = self.write_chunk(&bytes[written..end]).await?;
            if n == 0 {
                bail!("socket accepted no bytes");
            }
            self.ctx.traffic.add_written(n);
            written += n;
        }
        trace!("wrote frame of {} bytes", bytes.len());

        let hook = self.write_hooks.read().get(&frame.command).cloned();
        if let Some(hook) = hook {
            hook(frame.request_id, started.elapsed());
        }

        if let Some(flushed) = frame.flushed {
            flushed.send(()).ok();
        }
        Ok(())
    }

    async fn write_chunk(&self, buf: &[u8]) -> anyhow::Result<usize> {
        let timeout = self.ctx.config.write_timeout;

        match tokio::time::timeout(timeout, self.try_write_when_ready(buf)).await {
            Ok(result) => Ok(result?),
            Err(_) => bail!("write timed out after {:?}", timeout),
        }
    }

    async fn try_write_when_ready(&self, buf: &[u8]) -> io::Result<usize> {
        loop {
            self.stream.writable().await?;
            match self.stream.try_write(buf) {
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                result => return result,
            }
        }
    }

    async fn run_dispatcher(self: Arc<Self>, mut queue: mpsc::Receiver<DispatchItem>) -> anyhow::Result<()> {
        loop {
            let item = tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                item = queue.recv() => match item {
                    Some(item) => item,
                    None => return Ok(()),
                },
            };

            let command = item.message.command();
            let conn = self.clone();
            if let Err(e) = self.ctx.pool.submit(self.id.0, conn.handle(item)) {
                warn!("dropping message with command {:?}: {}", command, e);
            }
        }
    }

    /// runs on a partition worker
    async fn handle(self: Arc<Self>, item: DispatchItem) {
        if self.is_closed() {
            trace!("connection {:?} is closed, skipping message {:?}", self.id, item.message.command());
            return;
        }

        let command = item.message.command();
        let request_id = item.message.request_id();
        let scope = RequestScope::new(item.message, self.id, self.server());

        match AssertUnwindSafe(item.handler.on_message(scope, self.clone())).catch_unwind().await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!("handler for command {:?} (request {}) on connection {:?} failed, closing: {}", command, request_id, self.id, e);
                self.ctx.hooks.on_error(&self, &e);
                self.spawn_close();
            }
            Err(_) => {
                error!("handler for command {:?} (request {}) on connection {:?} panicked, closing", command, request_id, self.id);
                self.ctx.hooks.on_error(&self, &anyhow!("handler for command {:?} panicked", command));
                self.spawn_close();
            }
        }
    }
}
