//! Per-session offline message queue.
//!
//! Holds PUBLISH messages a disconnected, session-retaining client has
//! missed. Entries replay in strict enqueue order on reconnect and expire on
//! their own schedule independent of replay. The two views spec'd for this
//! container — sequence order and lookup-by-timer-identity — are kept as a
//! single arena (`slab::Slab<Entry>`) plus an intrusive doubly-linked list
//! for sequence order and a `HashMap<TimerId, usize>` for the timer view,
//! rather than pulling in a multi-index container crate.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use slab::Slab;

use crate::protocol::{Properties, PublishOptions, QoS};

use super::timer::{ExpiryTimerHandle, FireOutcome, TimerId, TimerService};

/// Failure returned by [`Endpoint::publish`].
#[derive(Debug)]
pub enum PublishError {
    /// The endpoint has exhausted its pool of outstanding packet identifiers.
    /// Recoverable: the caller should stop draining and wait for one to free
    /// up.
    PacketIdExhausted,
    /// Any other delivery failure (connection closed, encoding error, ...).
    Other(String),
}

impl fmt::Display for PublishError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PublishError::PacketIdExhausted => write!(f, "packet identifier pool exhausted"),
            PublishError::Other(msg) => write!(f, "publish failed: {}", msg),
        }
    }
}

impl std::error::Error for PublishError {}

/// Downstream send target for a drained offline message.
///
/// Implemented by the connection/writer layer; not suspending by contract
/// (see module docs), so this is a plain synchronous trait rather than
/// `async_trait`.
pub trait Endpoint {
    fn publish(
        &self,
        topic: Arc<str>,
        payload: Bytes,
        options: PublishOptions,
        properties: Properties,
    ) -> Result<(), PublishError>;
}

/// One pending PUBLISH awaiting replay.
///
/// `properties` is the stored set exactly as enqueued; `send` builds a fresh,
/// per-call copy with `message_expiry_interval` rewritten rather than
/// mutating this one.
pub struct OfflineMessage {
    pub topic: Arc<str>,
    pub payload: Bytes,
    pub options: PublishOptions,
    pub properties: Properties,
    expiry_handle: Option<ExpiryTimerHandle>,
}

impl OfflineMessage {
    fn new(
        topic: Arc<str>,
        payload: Bytes,
        options: PublishOptions,
        properties: Properties,
        expiry_handle: Option<ExpiryTimerHandle>,
    ) -> Self {
        Self {
            topic,
            payload,
            options,
            properties,
            expiry_handle,
        }
    }

    /// Send this entry to `endpoint`, rewriting `message_expiry_interval` (if
    /// present) to the time actually remaining.
    fn send(&self, endpoint: &dyn Endpoint) -> Result<(), PublishError> {
        let mut properties = self.properties.clone();
        if properties.message_expiry_interval.is_some() {
            let remaining = self
                .expiry_handle
                .as_ref()
                .map(|h| h.remaining())
                .unwrap_or(Duration::ZERO);
            properties.message_expiry_interval = Some(remaining.as_secs() as u32);
        }
        endpoint.publish(self.topic.clone(), self.payload.clone(), self.options, properties)
    }
}

struct Entry {
    message: OfflineMessage,
    prev: Option<usize>,
    next: Option<usize>,
}

struct QueueInner {
    slots: Slab<Entry>,
    head: Option<usize>,
    tail: Option<usize>,
    by_timer: HashMap<TimerId, usize>,
}

impl QueueInner {
    fn new() -> Self {
        Self {
            slots: Slab::new(),
            head: None,
            tail: None,
            by_timer: HashMap::new(),
        }
    }

    fn push_back(&mut self, message: OfflineMessage, timer_id: Option<TimerId>) {
        let prev_tail = self.tail;
        let key = self.slots.insert(Entry {
            message,
            prev: prev_tail,
            next: None,
        });
        if let Some(prev) = prev_tail {
            self.slots[prev].next = Some(key);
        } else {
            self.head = Some(key);
        }
        self.tail = Some(key);
        if let Some(id) = timer_id {
            self.by_timer.insert(id, key);
        }
    }

    fn remove(&mut self, key: usize) -> Option<OfflineMessage> {
        if !self.slots.contains(key) {
            return None;
        }
        let Entry { message, prev, next, .. } = self.slots.remove(key);
        match prev {
            Some(p) => self.slots[p].next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.slots[n].prev = prev,
            None => self.tail = prev,
        }
        if let Some(timer) = message.expiry_handle.as_ref().map(|h| h.id()) {
            self.by_timer.remove(&timer);
        }
        Some(message)
    }

    fn remove_by_timer(&mut self, id: TimerId) -> Option<OfflineMessage> {
        let key = self.by_timer.get(&id).copied()?;
        self.remove(key)
    }

    fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    fn clear(&mut self) {
        self.slots.clear();
        self.head = None;
        self.tail = None;
        self.by_timer.clear();
    }

    fn len(&self) -> usize {
        self.slots.len()
    }
}

/// Ordered, expirable, per-session store of undelivered PUBLISH messages.
///
/// Owned by exactly one session; not shared across sessions. Cheap to clone
/// (an `Arc` handle), but cloning does not duplicate the underlying store —
/// callers that need a fresh, empty queue should construct a new one.
#[derive(Clone)]
pub struct OfflineMessageQueue {
    inner: Arc<Mutex<QueueInner>>,
}

impl Default for OfflineMessageQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl OfflineMessageQueue {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(QueueInner::new())),
        }
    }

    /// Append a message to the tail. If `properties` carries a message
    /// expiry interval, schedules an expiry timer on `timer_service` whose
    /// fire callback removes this entry without needing the queue to poll.
    pub fn enqueue(
        &self,
        timer_service: &TimerService,
        topic: Arc<str>,
        payload: Bytes,
        options: PublishOptions,
        properties: Properties,
    ) {
        let expiry_handle = properties.message_expiry_interval.map(|secs| {
            let weak: Weak<Mutex<QueueInner>> = Arc::downgrade(&self.inner);
            timer_service.schedule(Duration::from_secs(secs as u64), move |id, outcome| {
                if outcome == FireOutcome::Cancelled {
                    return;
                }
                if let Some(inner) = weak.upgrade() {
                    inner.lock().remove_by_timer(id);
                }
            })
        });
        let timer_id = expiry_handle.as_ref().map(|h| h.id());
        let message = OfflineMessage::new(topic, payload, options, properties, expiry_handle);
        self.inner.lock().push_back(message, timer_id);
    }

    /// Replay every entry in order until the queue empties or the endpoint
    /// reports packet-identifier exhaustion.
    ///
    /// On exhaustion: warn and stop, leaving the unsent suffix (including the
    /// message that failed) in the queue for a later
    /// [`drain_until_one_id_consumed`](Self::drain_until_one_id_consumed).
    /// The exhaustion is swallowed here, not returned — callers observe the
    /// pause through `len()`/`is_empty()`, not through an `Err`. Any other
    /// failure propagates to the caller, also leaving the failed entry and
    /// its suffix in place.
    pub fn drain_all(&self, endpoint: &dyn Endpoint) -> Result<(), PublishError> {
        loop {
            let head_key = {
                let inner = self.inner.lock();
                match inner.head {
                    Some(key) => key,
                    None => return Ok(()),
                }
            };

            // Re-locks for the send itself: an expiry fire racing in between
            // this and the removal below is fine, it just means the removal
            // becomes a no-op on a key that's already gone.
            let result = {
                let inner = self.inner.lock();
                match inner.slots.get(head_key) {
                    Some(entry) => entry.message.send(endpoint),
                    None => continue, // expired concurrently; re-read the new head
                }
            };

            match result {
                Ok(()) => {
                    self.inner.lock().remove(head_key);
                }
                Err(PublishError::PacketIdExhausted) => {
                    tracing::warn!("offline queue drain stopped: packet identifier pool exhausted");
                    return Ok(());
                }
                Err(other) => return Err(other),
            }
        }
    }

    /// Replay entries in order, stopping immediately after the first
    /// successful send whose QoS consumed a packet identifier.
    ///
    /// Called after the session layer learns exactly one packet id has
    /// freed up. Any QoS-0 entries ahead of the next QoS>0 entry are drained
    /// along with it, since they cost nothing. Exhaustion here indicates the
    /// "freed id" invariant was violated; it is logged as fatal and swallowed
    /// rather than retried or returned to the caller.
    pub fn drain_until_one_id_consumed(&self, endpoint: &dyn Endpoint) -> Result<(), PublishError> {
        loop {
            let head_key = {
                let inner = self.inner.lock();
                match inner.head {
                    Some(key) => key,
                    None => return Ok(()),
                }
            };

            let (result, qos) = {
                let inner = self.inner.lock();
                match inner.slots.get(head_key) {
                    Some(entry) => (entry.message.send(endpoint), entry.message.options.qos),
                    None => continue, // expired concurrently; re-read the new head
                }
            };

            match result {
                Ok(()) => {
                    self.inner.lock().remove(head_key);
                    if qos.consumes_packet_id() {
                        return Ok(());
                    }
                }
                Err(PublishError::PacketIdExhausted) => {
                    tracing::error!(
                        "offline queue drain_until_one_id_consumed hit packet identifier exhaustion after a release was reported"
                    );
                    return Ok(());
                }
                Err(other) => return Err(other),
            }
        }
    }

    /// Discard every entry, cancelling its expiry timer (if any) as a side
    /// effect of dropping the handle.
    pub fn clear(&self) {
        self.inner.lock().clear();
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn publish_options(qos: QoS) -> PublishOptions {
        PublishOptions::new(qos, false, false)
    }

    #[derive(Default)]
    struct RecordingEndpoint {
        log: Mutex<Vec<(String, String, QoS)>>,
        fail_on: Mutex<Option<String>>,
    }

    impl RecordingEndpoint {
        fn fail_next(&self, topic: &str) {
            *self.fail_on.lock() = Some(topic.to_string());
        }

        fn log(&self) -> Vec<(String, String, QoS)> {
            self.log.lock().clone()
        }
    }

    impl Endpoint for RecordingEndpoint {
        fn publish(
            &self,
            topic: Arc<str>,
            payload: Bytes,
            options: PublishOptions,
            _properties: Properties,
        ) -> Result<(), PublishError> {
            if self.fail_on.lock().as_deref() == Some(&*topic) {
                *self.fail_on.lock() = None;
                return Err(PublishError::PacketIdExhausted);
            }
            self.log.lock().push((
                topic.to_string(),
                String::from_utf8(payload.to_vec()).unwrap(),
                options.qos,
            ));
            Ok(())
        }
    }

    #[test]
    fn drain_all_replays_in_order() {
        let timers = TimerService::new();
        let queue = OfflineMessageQueue::new();
        queue.enqueue(
            &timers,
            Arc::from("a"),
            Bytes::from_static(b"x"),
            publish_options(QoS::AtMostOnce),
            Properties::new(),
        );
        queue.enqueue(
            &timers,
            Arc::from("b"),
            Bytes::from_static(b"y"),
            publish_options(QoS::AtLeastOnce),
            Properties::new(),
        );

        let endpoint = RecordingEndpoint::default();
        queue.drain_all(&endpoint).unwrap();

        assert_eq!(
            endpoint.log(),
            vec![
                ("a".to_string(), "x".to_string(), QoS::AtMostOnce),
                ("b".to_string(), "y".to_string(), QoS::AtLeastOnce),
            ]
        );
        assert!(queue.is_empty());
    }

    #[test]
    fn drain_all_stops_on_exhaustion_and_resumes() {
        let timers = TimerService::new();
        let queue = OfflineMessageQueue::new();
        queue.enqueue(
            &timers,
            Arc::from("a"),
            Bytes::from_static(b"x"),
            publish_options(QoS::AtMostOnce),
            Properties::new(),
        );
        queue.enqueue(
            &timers,
            Arc::from("b"),
            Bytes::from_static(b"y"),
            publish_options(QoS::AtLeastOnce),
            Properties::new(),
        );

        let endpoint = RecordingEndpoint::default();
        endpoint.fail_next("b");

        queue.drain_all(&endpoint).unwrap();
        assert_eq!(queue.len(), 1);
        assert_eq!(endpoint.log(), vec![("a".to_string(), "x".to_string(), QoS::AtMostOnce)]);

        queue.drain_until_one_id_consumed(&endpoint).unwrap();
        assert!(queue.is_empty());
        assert_eq!(
            endpoint.log(),
            vec![
                ("a".to_string(), "x".to_string(), QoS::AtMostOnce),
                ("b".to_string(), "y".to_string(), QoS::AtLeastOnce),
            ]
        );
    }

    #[test]
    fn drain_until_one_id_consumed_takes_leading_qos0_then_stops_at_qos1() {
        let timers = TimerService::new();
        let queue = OfflineMessageQueue::new();
        for topic in ["a", "b", "c"] {
            queue.enqueue(
                &timers,
                Arc::from(topic),
                Bytes::from_static(b"p"),
                publish_options(QoS::AtMostOnce),
                Properties::new(),
            );
        }
        queue.enqueue(
            &timers,
            Arc::from("d"),
            Bytes::from_static(b"p"),
            publish_options(QoS::AtLeastOnce),
            Properties::new(),
        );

        let endpoint = RecordingEndpoint::default();
        queue.drain_until_one_id_consumed(&endpoint).unwrap();

        assert!(queue.is_empty());
        let log = endpoint.log();
        assert_eq!(log.len(), 4);
        assert_eq!(log[3].2, QoS::AtLeastOnce);
    }

    #[tokio::test(start_paused = true)]
    async fn expiry_interval_is_rewritten_to_remaining_time() {
        let timers = TimerService::new();
        let queue = OfflineMessageQueue::new();
        let mut properties = Properties::new();
        properties.message_expiry_interval = Some(10);
        queue.enqueue(
            &timers,
            Arc::from("a"),
            Bytes::from_static(b"x"),
            publish_options(QoS::AtMostOnce),
            properties,
        );

        tokio::time::advance(Duration::from_secs(3)).await;

        struct CapturingEndpoint {
            seen: AtomicUsize,
        }
        impl Endpoint for CapturingEndpoint {
            fn publish(
                &self,
                _topic: Arc<str>,
                _payload: Bytes,
                _options: PublishOptions,
                properties: Properties,
            ) -> Result<(), PublishError> {
                self.seen
                    .store(properties.message_expiry_interval.unwrap() as usize, Ordering::SeqCst);
                Ok(())
            }
        }

        let endpoint = CapturingEndpoint { seen: AtomicUsize::new(usize::MAX) };
        queue.drain_all(&endpoint).unwrap();
        assert_eq!(endpoint.seen.load(Ordering::SeqCst), 7);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_entry_is_removed_by_timer_fire() {
        let timers = TimerService::new();
        let queue = OfflineMessageQueue::new();
        let mut properties = Properties::new();
        properties.message_expiry_interval = Some(5);
        queue.enqueue(
            &timers,
            Arc::from("a"),
            Bytes::from_static(b"x"),
            publish_options(QoS::AtMostOnce),
            properties,
        );

        assert!(!queue.is_empty());
        tokio::time::advance(Duration::from_secs(6)).await;
        tokio::task::yield_now().await;

        assert!(queue.is_empty());
    }

    #[test]
    fn clear_empties_queue_and_cancels_timers() {
        let timers = TimerService::new();
        let queue = OfflineMessageQueue::new();
        let mut properties = Properties::new();
        properties.message_expiry_interval = Some(30);
        queue.enqueue(
            &timers,
            Arc::from("a"),
            Bytes::from_static(b"x"),
            publish_options(QoS::AtMostOnce),
            properties,
        );
        queue.clear();
        assert!(queue.is_empty());
    }
}
