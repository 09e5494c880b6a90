use std::fmt::{Debug, Formatter};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
#[cfg(test)] use mockall::automock;
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace};

use crate::wire::command::CommandCode;
use crate::wire::message::Message;

/// Timeout behavior for requests of a given command
#[cfg_attr(test, automock)]
#[async_trait]
pub trait TimeoutPolicy: Send + Sync + 'static {
    fn duration(&self) -> Duration;

    /// The message that stands in for the missing response
    fn timeout_message(&self, request: &Message) -> Message;

    /// Whether a response completes the request. Progress notifications that keep a request
    ///  open return `false`.
    fn is_terminal_response(&self, response: &Message) -> bool;

    /// called exactly once with the original request if no terminal response arrived in time
    async fn on_timeout(&self, request: Message);
}

struct PendingEntry {
    timeout_message: Message,
    policy: Arc<dyn TimeoutPolicy>,
    generation: u64,
    cancel: CancellationToken,
}

/// Tracks outstanding requests by request id and fires the policy's timeout callback for
///  requests whose response did not arrive in time.
///
/// Every entry has its own waiter task. Storing a request under an id that is already pending
///  replaces (and cancels) the previous entry; the replaced entry's waiter can never fire for
///  its successor.
pub struct PendingRequestTracker {
    policies: RwLock<FxHashMap<CommandCode, Arc<dyn TimeoutPolicy>>>,
    entries: Arc<Mutex<FxHashMap<i64, PendingEntry>>>,
    next_generation: AtomicU64,
}

impl Debug for PendingRequestTracker {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "PendingRequestTracker{{pending:{}}}", self.len())
    }
}

impl Default for PendingRequestTracker {
    fn default() -> Self {
        PendingRequestTracker {
            policies: Default::default(),
            entries: Default::default(),
            next_generation: AtomicU64::new(1),
        }
    }
}

impl PendingRequestTracker {
    pub fn new() -> PendingRequestTracker {
        PendingRequestTracker::default()
    }

    pub fn register_policy(&self, command: CommandCode, policy: Arc<dyn TimeoutPolicy>) {
        if self.policies.write().insert(command, policy).is_some() {
            debug!("replaced timeout policy for command {:?}", command);
        }
    }

    /// Starts tracking a request. Returns `false` if there is no timeout policy for the
    ///  request's command, in which case nothing is tracked.
    ///
    /// Must be called from inside a tokio runtime.
    pub fn store(&self, request: &Message) -> bool {
        let policy = match self.policies.read().get(&request.command()) {
            Some(policy) => policy.clone(),
            None => return false,
        };

        let request_id = request.request_id();
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        let duration = policy.duration();
        // policy callbacks run without holding the entries lock, they may use the tracker
        let timeout_message = policy.timeout_message(request);

        let previous = self.entries.lock().insert(request_id, PendingEntry {
            timeout_message,
            policy: policy.clone(),
            generation,
            cancel: cancel.clone(),
        });
        if let Some(previous) = previous {
            trace!("replacing pending request {}", request_id);
            previous.cancel.cancel();
        }

        let entries = self.entries.clone();
        let request = request.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(duration) => {
                    if Self::remove_generation(&entries, request_id, generation) {
                        debug!("request {} with command {:?} timed out after {:?}", request_id, request.command(), duration);
                        if AssertUnwindSafe(policy.on_timeout(request)).catch_unwind().await.is_err() {
                            error!("timeout handler for request {} panicked", request_id);
                        }
                    }
                }
            }
        });
        true
    }

    fn remove_generation(entries: &Mutex<FxHashMap<i64, PendingEntry>>, request_id: i64, generation: u64) -> bool {
        let mut entries = entries.lock();
        match entries.get(&request_id) {
            Some(entry) if entry.generation == generation => {
                entries.remove(&request_id);
                true
            }
            _ => false,
        }
    }

    /// Stops tracking a request without firing its timeout. Returns `false` if there was no
    ///  such request.
    pub fn cancel(&self, request_id: i64) -> bool {
        match self.entries.lock().remove(&request_id) {
            Some(entry) => {
                entry.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Stops tracking the request a response belongs to, but only if the request's policy deems
    ///  the response terminal
    pub fn cancel_by_response(&self, response: &Message) -> bool {
        let request_id = response.request_id();

        let (policy, generation) = match self.entries.lock().get(&request_id) {
            Some(entry) => (entry.policy.clone(), entry.generation),
            None => return false,
        };
        if !policy.is_terminal_response(response) {
            trace!("response {:?} does not complete request {}", response.command(), request_id);
            return false;
        }

        let mut entries = self.entries.lock();
        match entries.get(&request_id) {
            Some(entry) if entry.generation == generation => {
                if let Some(entry) = entries.remove(&request_id) {
                    entry.cancel.cancel();
                }
                true
            }
            // replaced or completed while the policy was consulted
            _ => false,
        }
    }

    /// the timeout message of a pending request
    pub fn load(&self, request_id: i64) -> Option<Message> {
        self.entries.lock()
            .get(&request_id)
            .map(|e| e.timeout_message.clone())
    }

    pub fn contains(&self, request_id: i64) -> bool {
        self.entries.lock().contains_key(&request_id)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// cancels all pending requests without firing their timeouts
    pub fn clear(&self) {
        for (_, entry) in self.entries.lock().drain() {
            entry.cancel.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;

    const REQ: CommandCode = CommandCode(20);
    const RSP: CommandCode = CommandCode(21);
    const PROGRESS_TAG: i16 = 1;

    struct RecordingPolicy {
        fired: Mutex<Vec<Message>>,
    }

    #[async_trait]
    impl TimeoutPolicy for RecordingPolicy {
        fn duration(&self) -> Duration {
            Duration::from_millis(50)
        }

        fn timeout_message(&self, request: &Message) -> Message {
            Message::header_only(RSP, request.version())
                .with_request_id(request.request_id())
        }

        fn is_terminal_response(&self, response: &Message) -> bool {
            response.header.tag != PROGRESS_TAG
        }

        async fn on_timeout(&self, request: Message) {
            self.fired.lock().push(request);
        }
    }

    fn tracker() -> (PendingRequestTracker, Arc<RecordingPolicy>) {
        let policy = Arc::new(RecordingPolicy { fired: Default::default() });
        let tracker = PendingRequestTracker::new();
        tracker.register_policy(REQ, policy.clone());
        (tracker, policy)
    }

    fn request(id: i64) -> Message {
        Message::new(REQ, 1, Bytes::from_static(b"ping")).with_request_id(id)
    }

    async fn sleep_ms(millis: u64) {
        tokio::time::sleep(Duration::from_millis(millis)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_policy() {
        let (tracker, _) = tracker();
        assert!(!tracker.store(&Message::header_only(CommandCode(99), 1).with_request_id(1)));
        assert!(tracker.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_fires_once() {
        let (tracker, policy) = tracker();
        assert!(tracker.store(&request(5)));
        assert!(tracker.contains(5));
        assert_eq!(tracker.load(5), Some(Message::header_only(RSP, 1).with_request_id(5)));

        sleep_ms(49).await;
        assert!(policy.fired.lock().is_empty());
        assert!(tracker.contains(5));

        sleep_ms(2).await;
        assert_eq!(*policy.fired.lock(), vec![request(5)]);
        assert!(!tracker.contains(5));
        assert!(!tracker.cancel(5));

        sleep_ms(1000).await;
        assert_eq!(policy.fired.lock().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_suppresses_timeout() {
        let (tracker, policy) = tracker();
        tracker.store(&request(5));

        sleep_ms(20).await;
        assert!(tracker.cancel(5));
        assert!(tracker.is_empty());

        sleep_ms(100).await;
        assert!(policy.fired.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_by_response() {
        let (tracker, policy) = tracker();
        tracker.store(&request(5));
        tracker.store(&request(6));

        let progress = Message::header_only(RSP, 1).with_request_id(5).with_tag(PROGRESS_TAG);
        assert!(!tracker.cancel_by_response(&progress));
        assert!(tracker.contains(5));

        let done = Message::header_only(RSP, 1).with_request_id(5);
        assert!(tracker.cancel_by_response(&done));
        assert!(!tracker.contains(5));
        assert!(!tracker.cancel_by_response(&done));

        sleep_ms(100).await;
        assert_eq!(*policy.fired.lock(), vec![request(6)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_store_replaces() {
        let (tracker, policy) = tracker();
        tracker.store(&request(5));

        sleep_ms(30).await;
        let replacement = request(5).with_tag(7);
        tracker.store(&replacement);
        assert_eq!(tracker.len(), 1);

        // the first entry's deadline passes without effect
        sleep_ms(30).await;
        assert!(policy.fired.lock().is_empty());
        assert!(tracker.contains(5));

        sleep_ms(30).await;
        assert_eq!(*policy.fired.lock(), vec![replacement]);
        assert!(tracker.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear() {
        let (tracker, policy) = tracker();
        for id in 1..=10 {
            tracker.store(&request(id));
        }
        assert_eq!(tracker.len(), 10);

        tracker.clear();
        sleep_ms(100).await;
        assert!(tracker.is_empty());
        assert!(policy.fired.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_policy_may_call_into_tracker() {
        let tracker = Arc::new(PendingRequestTracker::new());

        let mut policy = MockTimeoutPolicy::new();
        policy.expect_duration()
            .return_const(Duration::from_secs(1));
        {
            let tracker = tracker.clone();
            policy.expect_timeout_message()
                .returning(move |req| {
                    assert!(!tracker.contains(req.request_id()));
                    Message::header_only(RSP, req.version()).with_request_id(req.request_id())
                });
        }
        {
            let tracker = tracker.clone();
            policy.expect_is_terminal_response()
                .returning(move |rsp| tracker.contains(rsp.request_id()) && tracker.len() == 1);
        }
        policy.expect_on_timeout()
            .never();
        tracker.register_policy(REQ, Arc::new(policy));

        assert!(tracker.store(&request(3)));
        assert_eq!(tracker.len(), 1);
        assert!(tracker.cancel_by_response(&Message::header_only(RSP, 1).with_request_id(3)));
        assert!(tracker.is_empty());

        sleep_ms(2000).await;
        tracker.clear();
    }

    #[tokio::test(start_paused = true)]
    async fn test_mocked_policy() {
        let mut policy = MockTimeoutPolicy::new();
        policy.expect_duration()
            .return_const(Duration::from_secs(1));
        policy.expect_timeout_message()
            .returning(|req| Message::header_only(RSP, req.version()));
        policy.expect_on_timeout()
            .times(1)
            .returning(|_| ());

        let tracker = PendingRequestTracker::new();
        tracker.register_policy(REQ, Arc::new(policy));
        tracker.store(&request(1));

        sleep_ms(1001).await;
        assert!(tracker.is_empty());
    }
}
