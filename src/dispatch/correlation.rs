use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::bail;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tokio::time::Instant;
use tracing::trace;
use uuid::Uuid;

use crate::server::connection::ConnectionId;
use crate::server::server::Server;
use crate::wire::command::CommandCode;
use crate::wire::message::Message;

/// Ties a message to the request it belongs to and, for messages sent while handling another
///  request, to that parent request.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Default)]
pub struct Correlation {
    pub request_id: i64,
    /// 0 for requests that were not caused by another request
    pub parent_request_id: i64,
}

impl Correlation {
    pub fn root(request_id: i64) -> Correlation {
        Correlation {
            request_id,
            parent_request_id: 0,
        }
    }

    /// a fresh request id that records this correlation's request as its parent
    pub fn child(&self, ids: &RequestIdGenerator) -> Correlation {
        Correlation {
            request_id: ids.next_id(),
            parent_request_id: self.request_id,
        }
    }

    pub fn is_root(&self) -> bool {
        self.parent_request_id == 0
    }
}

/// Everything a handler needs to know about the message it handles. It is passed explicitly
///  into every handler invocation.
#[derive(Debug, Clone)]
pub struct RequestScope {
    pub message: Message,
    pub connection_id: ConnectionId,
    pub correlation: Correlation,
    pub received_at: Instant,
    /// the server that received the message, for reaching other connections, pending requests
    ///  and application extensions
    pub server: Server,
}

impl RequestScope {
    pub fn new(message: Message, connection_id: ConnectionId, server: Server) -> RequestScope {
        let correlation = Correlation::root(message.request_id());
        RequestScope {
            message,
            connection_id,
            correlation,
            received_at: Instant::now(),
            server,
        }
    }

    /// correlation for a request sent on behalf of this scope's request
    pub fn child(&self) -> Correlation {
        self.correlation.child(self.server.request_ids())
    }

    pub fn command(&self) -> CommandCode {
        self.message.command()
    }

    /// A response to the message in this scope. It carries the same request id and protocol
    ///  version so the peer can correlate it.
    pub fn response(&self, command: CommandCode, body: impl Into<bytes::Bytes>) -> Message {
        Message::new(command, self.message.version(), body)
            .with_request_id(self.correlation.request_id)
    }

    pub fn elapsed(&self) -> Duration {
        self.received_at.elapsed()
    }
}


/// Custom epoch for request ids, 2023-06-05T17:18:03Z in millis since the Unix epoch
const REQUEST_ID_EPOCH_MILLIS: u64 = 1685987883000;

const TIMESTAMP_BITS: u32 = 39;
const NODE_BITS: u32 = 8;
const SEQUENCE_BITS: u32 = 16;

const TIMESTAMP_MASK: u64 = (1 << TIMESTAMP_BITS) - 1;
const SEQUENCE_MASK: u64 = (1 << SEQUENCE_BITS) - 1;

pub const MAX_NODE_ID: u16 = (1 << NODE_BITS) - 1;

/// Generates request ids that are unique per node and strictly increasing. An id consists of a
///  39 bit millisecond timestamp since a custom epoch, an 8 bit node id and a 16 bit sequence
///  number.
///
/// When the sequence overflows inside a millisecond, or the clock goes backwards, the generator
///  keeps counting from the last timestamp it used instead of waiting for the clock.
pub struct RequestIdGenerator {
    node_id: u64,
    state: Mutex<IdState>,
}

#[derive(Default)]
struct IdState {
    last_millis: u64,
    sequence: u64,
}

impl std::fmt::Debug for RequestIdGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "RequestIdGenerator{{node:{}}}", self.node_id)
    }
}

impl RequestIdGenerator {
    pub fn new(node_id: u16) -> anyhow::Result<RequestIdGenerator> {
        if node_id > MAX_NODE_ID {
            bail!("node id {} is out of range, maximum is {}", node_id, MAX_NODE_ID);
        }
        Ok(RequestIdGenerator {
            node_id: node_id as u64,
            state: Default::default(),
        })
    }

    fn epoch_millis() -> u64 {
        let since_unix = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        since_unix.saturating_sub(REQUEST_ID_EPOCH_MILLIS)
    }

    pub fn next_id(&self) -> i64 {
        self.next_id_at(Self::epoch_millis())
    }

    fn next_id_at(&self, now_millis: u64) -> i64 {
        let mut state = self.state.lock();

        if now_millis > state.last_millis {
            state.last_millis = now_millis;
            state.sequence = 0;
        }
        else {
            state.sequence = (state.sequence + 1) & SEQUENCE_MASK;
            if state.sequence == 0 {
                state.last_millis += 1;
                trace!("request id sequence exhausted, moving on to {}", state.last_millis);
            }
        }

        let id = ((state.last_millis & TIMESTAMP_MASK) << (NODE_BITS + SEQUENCE_BITS))
            | (self.node_id << SEQUENCE_BITS)
            | state.sequence;

        if id == 0 {
            // node 0 after the timestamp bits wrapped around
            drop(state);
            return self.next_id_at(now_millis);
        }
        id as i64
    }

    pub fn node_of(id: i64) -> u8 {
        ((id as u64 >> SEQUENCE_BITS) & MAX_NODE_ID as u64) as u8
    }

    pub fn timestamp_millis_of(id: i64) -> u64 {
        (id as u64 >> (NODE_BITS + SEQUENCE_BITS)) + REQUEST_ID_EPOCH_MILLIS
    }
}


pub const DEFAULT_TRACE_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Associates request ids with the trace they belong to, so that a trace id follows a request
///  across hops. Entries expire after a TTL and are removed by [TraceIds::purge_expired].
pub struct TraceIds {
    ttl: Duration,
    entries: Mutex<FxHashMap<i64, TraceEntry>>,
}

struct TraceEntry {
    trace_id: String,
    created: Instant,
}

impl Default for TraceIds {
    fn default() -> Self {
        TraceIds::new(DEFAULT_TRACE_TTL)
    }
}

impl TraceIds {
    pub fn new(ttl: Duration) -> TraceIds {
        TraceIds {
            ttl,
            entries: Default::default(),
        }
    }

    /// Registers a request under the given trace id, or under a freshly generated one. Returns
    ///  the trace id that was stored.
    pub fn assign(&self, request_id: i64, trace_id: Option<&str>) -> String {
        let trace_id = match trace_id {
            Some(t) if !t.is_empty() => t.to_string(),
            _ => Uuid::new_v4().to_string(),
        };
        self.entries.lock().insert(request_id, TraceEntry {
            trace_id: trace_id.clone(),
            created: Instant::now(),
        });
        trace_id
    }

    /// The child request joins its parent's trace, or starts a new one if the parent is unknown
    pub fn inherit(&self, correlation: &Correlation) -> String {
        let parent_trace = self.get(correlation.parent_request_id);
        self.assign(correlation.request_id, parent_trace.as_deref())
    }

    pub fn get(&self, request_id: i64) -> Option<String> {
        let entries = self.entries.lock();
        entries.get(&request_id)
            .filter(|e| e.created.elapsed() < self.ttl)
            .map(|e| e.trace_id.clone())
    }

    pub fn remove(&self, request_id: i64) -> Option<String> {
        self.entries.lock()
            .remove(&request_id)
            .map(|e| e.trace_id)
    }

    /// removes all expired entries, returning the number of removed entries
    pub fn purge_expired(&self) -> usize {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, e| e.created.elapsed() < self.ttl);
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}
