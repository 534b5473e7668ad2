//! Per-topic subscription engine.
//!
//! A [`Subscription`] fans state changes out to every registered
//! [`SubscriptionListener`] and forwards aggregate listener-set deltas to the
//! single [`SubscriptionSource`] currently feeding the topic, if any.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::types::Variant;

// ---------------------------------------------------------------------------
// SubscriptionState
// ---------------------------------------------------------------------------

/// State reported to a subscription listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SubscriptionState {
    /// The listener has been removed. Always the last notification it gets.
    Disconnected,
    /// The listener is registered but no source is attached.
    Granted,
    /// The listener is registered and a source is attached.
    Connected,
}

impl fmt::Display for SubscriptionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => f.write_str("DISCONNECTED"),
            Self::Granted => f.write_str("GRANTED"),
            Self::Connected => f.write_str("CONNECTED"),
        }
    }
}

// ---------------------------------------------------------------------------
// Listener and source capabilities
// ---------------------------------------------------------------------------

/// Receives subscription state changes for a topic.
///
/// Called while the subscription's lock is held: implementations must not
/// call back into the same [`Subscription`].
pub trait SubscriptionListener<T>: Send + Sync {
    fn update_status(&self, topic: &T, state: SubscriptionState);
}

/// Upstream provider feeding a subscription's listeners.
///
/// Receives whole batches of listener records. Same re-entrancy rule as
/// [`SubscriptionListener`].
pub trait SubscriptionSource<T>: Send + Sync {
    fn add_listener(&self, listeners: &[SubscriptionInformation<T>]);

    fn remove_listener(&self, listeners: &[SubscriptionInformation<T>]);
}

/// Identity of a listener: the address of its `Arc` allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerKey(usize);

impl ListenerKey {
    #[must_use]
    pub fn of<T>(listener: &Arc<dyn SubscriptionListener<T>>) -> Self {
        Self(Arc::as_ptr(listener).cast::<()>() as usize)
    }
}

/// A registered listener together with the hint it subscribed with.
pub struct SubscriptionInformation<T> {
    listener: Arc<dyn SubscriptionListener<T>>,
    hint: Variant,
    key: ListenerKey,
}

impl<T> SubscriptionInformation<T> {
    #[must_use]
    pub fn new(listener: Arc<dyn SubscriptionListener<T>>, hint: Variant) -> Self {
        let key = ListenerKey::of(&listener);
        Self {
            listener,
            hint,
            key,
        }
    }

    #[must_use]
    pub fn listener(&self) -> &Arc<dyn SubscriptionListener<T>> {
        &self.listener
    }

    #[must_use]
    pub fn hint(&self) -> &Variant {
        &self.hint
    }

    #[must_use]
    pub fn key(&self) -> ListenerKey {
        self.key
    }
}

impl<T> Clone for SubscriptionInformation<T> {
    fn clone(&self) -> Self {
        Self {
            listener: Arc::clone(&self.listener),
            hint: self.hint.clone(),
            key: self.key,
        }
    }
}

impl<T> PartialEq for SubscriptionInformation<T> {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl<T> Eq for SubscriptionInformation<T> {}

impl<T> fmt::Debug for SubscriptionInformation<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionInformation")
            .field("key", &self.key)
            .field("hint", &self.hint)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Subscription
// ---------------------------------------------------------------------------

struct SubscriptionInner<T> {
    /// Registered listeners in subscription order.
    listeners: Vec<SubscriptionInformation<T>>,
    source: Option<Arc<dyn SubscriptionSource<T>>>,
}

impl<T> SubscriptionInner<T> {
    fn position(&self, key: ListenerKey) -> Option<usize> {
        self.listeners.iter().position(|info| info.key == key)
    }

    fn notify_all(&self, topic: &T, state: SubscriptionState) {
        for info in &self.listeners {
            info.listener.update_status(topic, state);
        }
    }
}

/// Many listeners sharing interest in one topic, fed by at most one source.
///
/// Every operation is a single critical section covering both the state
/// mutation and the notification fan-out, so a listener never observes a
/// state older than its own last subscribe/unsubscribe.
pub struct Subscription<T> {
    topic: T,
    inner: Mutex<SubscriptionInner<T>>,
}

impl<T: fmt::Debug> Subscription<T> {
    /// Creates an empty subscription for `topic`.
    #[must_use]
    pub fn new(topic: T) -> Self {
        Self {
            topic,
            inner: Mutex::new(SubscriptionInner {
                listeners: Vec::new(),
                source: None,
            }),
        }
    }

    #[must_use]
    pub fn topic(&self) -> &T {
        &self.topic
    }

    /// `true` if there is neither a source nor any listener. An empty
    /// subscription may be reclaimed by its owner.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        let inner = self.inner.lock();
        inner.source.is_none() && inner.listeners.is_empty()
    }

    /// `true` if listeners are waiting but no source is attached.
    #[must_use]
    pub fn is_granted(&self) -> bool {
        let inner = self.inner.lock();
        inner.source.is_none() && !inner.listeners.is_empty()
    }

    #[must_use]
    pub fn has_source(&self) -> bool {
        self.inner.lock().source.is_some()
    }

    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.inner.lock().listeners.len()
    }

    /// Registers `listener`. A listener that is already registered is left
    /// untouched, including its original hint.
    pub fn subscribe(&self, listener: Arc<dyn SubscriptionListener<T>>, hint: Variant) {
        let mut inner = self.inner.lock();
        let info = SubscriptionInformation::new(listener, hint);
        if inner.position(info.key).is_some() {
            return;
        }
        debug!(topic = ?self.topic, listeners = inner.listeners.len() + 1, "subscribe");

        match &inner.source {
            None => info.listener.update_status(&self.topic, SubscriptionState::Granted),
            Some(source) => {
                info.listener
                    .update_status(&self.topic, SubscriptionState::Connected);
                source.add_listener(std::slice::from_ref(&info));
            }
        }
        inner.listeners.push(info);
    }

    /// Removes `listener` and sends it a final `Disconnected`.
    pub fn unsubscribe(&self, listener: &Arc<dyn SubscriptionListener<T>>) {
        let mut inner = self.inner.lock();
        let Some(index) = inner.position(ListenerKey::of(listener)) else {
            return;
        };
        let info = inner.listeners.remove(index);
        debug!(topic = ?self.topic, listeners = inner.listeners.len(), "unsubscribe");

        if let Some(source) = &inner.source {
            source.remove_listener(std::slice::from_ref(&info));
        }
        info.listener
            .update_status(&self.topic, SubscriptionState::Disconnected);
    }

    /// Attaches `source` (or detaches with `None`). Setting the source that is
    /// already attached does nothing.
    pub fn set_source(&self, source: Option<Arc<dyn SubscriptionSource<T>>>) {
        let mut inner = self.inner.lock();
        let unchanged = match (&inner.source, &source) {
            (None, None) => true,
            (Some(current), Some(new)) => Arc::ptr_eq(current, new),
            _ => false,
        };
        if unchanged {
            return;
        }
        debug!(
            topic = ?self.topic,
            attached = source.is_some(),
            listeners = inner.listeners.len(),
            "set source"
        );

        if let Some(old) = &inner.source {
            old.remove_listener(&inner.listeners);
        }

        match &source {
            Some(new) => {
                inner.notify_all(&self.topic, SubscriptionState::Connected);
                if !inner.listeners.is_empty() {
                    new.add_listener(&inner.listeners);
                }
            }
            None => inner.notify_all(&self.topic, SubscriptionState::Granted),
        }

        inner.source = source;
    }
}

impl<T: fmt::Debug> fmt::Debug for Subscription<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Subscription")
            .field("topic", &self.topic)
            .field("listeners", &inner.listeners.len())
            .field("has_source", &inner.source.is_some())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use proptest::prelude::*;

    use super::*;

    /// Shared event log recording listener notifications and source calls.
    type Log = Arc<parking_lot::Mutex<Vec<String>>>;

    struct RecordingListener {
        name: &'static str,
        log: Log,
        states: parking_lot::Mutex<Vec<SubscriptionState>>,
    }

    impl RecordingListener {
        fn new(name: &'static str, log: &Log) -> Arc<Self> {
            Arc::new(Self {
                name,
                log: Arc::clone(log),
                states: parking_lot::Mutex::new(Vec::new()),
            })
        }

        fn states(&self) -> Vec<SubscriptionState> {
            self.states.lock().clone()
        }
    }

    impl SubscriptionListener<String> for RecordingListener {
        fn update_status(&self, topic: &String, state: SubscriptionState) {
            self.states.lock().push(state);
            self.log.lock().push(format!("{}:{topic}:{state}", self.name));
        }
    }

    struct RecordingSource {
        name: &'static str,
        log: Log,
        added: AtomicUsize,
        removed: AtomicUsize,
        last_hints: parking_lot::Mutex<Vec<Variant>>,
    }

    impl RecordingSource {
        fn new(name: &'static str, log: &Log) -> Arc<Self> {
            Arc::new(Self {
                name,
                log: Arc::clone(log),
                added: AtomicUsize::new(0),
                removed: AtomicUsize::new(0),
                last_hints: parking_lot::Mutex::new(Vec::new()),
            })
        }
    }

    impl SubscriptionSource<String> for RecordingSource {
        fn add_listener(&self, listeners: &[SubscriptionInformation<String>]) {
            self.added.fetch_add(listeners.len(), Ordering::SeqCst);
            self.log
                .lock()
                .push(format!("{}.add({})", self.name, listeners.len()));
        }

        fn remove_listener(&self, listeners: &[SubscriptionInformation<String>]) {
            self.removed.fetch_add(listeners.len(), Ordering::SeqCst);
            *self.last_hints.lock() = listeners.iter().map(|l| l.hint().clone()).collect();
            self.log
                .lock()
                .push(format!("{}.remove({})", self.name, listeners.len()));
        }
    }

    fn as_listener(l: &Arc<RecordingListener>) -> Arc<dyn SubscriptionListener<String>> {
        Arc::clone(l) as _
    }

    fn as_source(s: &Arc<RecordingSource>) -> Option<Arc<dyn SubscriptionSource<String>>> {
        Some(Arc::clone(s) as _)
    }

    fn new_log() -> Log {
        Arc::new(parking_lot::Mutex::new(Vec::new()))
    }

    #[test]
    fn new_subscription_is_empty() {
        let sub = Subscription::new("item".to_string());
        assert!(sub.is_empty());
        assert!(!sub.is_granted());
        assert_eq!(sub.topic(), "item");
    }

    #[test]
    fn subscribe_without_source_grants_once() {
        let log = new_log();
        let sub = Subscription::new("item".to_string());
        let l = RecordingListener::new("L", &log);

        sub.subscribe(as_listener(&l), Variant::Null);
        sub.subscribe(as_listener(&l), Variant::from("again"));

        assert_eq!(l.states(), vec![SubscriptionState::Granted]);
        assert!(sub.is_granted());
        assert!(!sub.is_empty());
        assert_eq!(sub.listener_count(), 1);
    }

    #[test]
    fn subscribe_with_source_connects_and_forwards_single_record() {
        let log = new_log();
        let sub = Subscription::new("item".to_string());
        let src = RecordingSource::new("S", &log);
        sub.set_source(as_source(&src));

        let l = RecordingListener::new("L", &log);
        sub.subscribe(as_listener(&l), Variant::Null);

        assert_eq!(l.states(), vec![SubscriptionState::Connected]);
        assert_eq!(src.added.load(Ordering::SeqCst), 1);
        assert!(!sub.is_granted());
        assert!(!sub.is_empty());
    }

    #[test]
    fn unsubscribe_without_source_still_disconnects() {
        let log = new_log();
        let sub = Subscription::new("item".to_string());
        let l = RecordingListener::new("L", &log);

        sub.subscribe(as_listener(&l), Variant::Null);
        sub.unsubscribe(&as_listener(&l));

        assert_eq!(
            l.states(),
            vec![SubscriptionState::Granted, SubscriptionState::Disconnected]
        );
        assert!(sub.is_empty());
    }

    #[test]
    fn unsubscribe_unknown_listener_is_noop() {
        let log = new_log();
        let sub = Subscription::new("item".to_string());
        let l = RecordingListener::new("L", &log);
        sub.unsubscribe(&as_listener(&l));
        assert!(l.states().is_empty());
        assert!(log.lock().is_empty());
    }

    #[test]
    fn unsubscribe_forwards_stored_hint_to_source() {
        let log = new_log();
        let sub = Subscription::new("item".to_string());
        let src = RecordingSource::new("S", &log);
        sub.set_source(as_source(&src));

        let l = RecordingListener::new("L", &log);
        sub.subscribe(as_listener(&l), Variant::from("cache"));
        sub.unsubscribe(&as_listener(&l));

        assert_eq!(src.removed.load(Ordering::SeqCst), 1);
        assert_eq!(*src.last_hints.lock(), vec![Variant::from("cache")]);
        assert_eq!(
            l.states(),
            vec![SubscriptionState::Connected, SubscriptionState::Disconnected]
        );
        assert!(!sub.is_empty(), "source is still attached");
    }

    #[test]
    fn setting_same_source_twice_is_silent() {
        let log = new_log();
        let sub = Subscription::new("item".to_string());
        let l = RecordingListener::new("L", &log);
        sub.subscribe(as_listener(&l), Variant::Null);

        let src = RecordingSource::new("S", &log);
        sub.set_source(as_source(&src));
        let before = log.lock().len();
        sub.set_source(as_source(&src));

        assert_eq!(log.lock().len(), before);
        assert_eq!(
            l.states(),
            vec![SubscriptionState::Granted, SubscriptionState::Connected]
        );
    }

    #[test]
    fn clearing_absent_source_is_silent() {
        let log = new_log();
        let sub = Subscription::new("item".to_string());
        let l = RecordingListener::new("L", &log);
        sub.subscribe(as_listener(&l), Variant::Null);
        sub.set_source(None);
        assert_eq!(l.states(), vec![SubscriptionState::Granted]);
    }

    #[test]
    fn switching_sources_orders_calls() {
        let log = new_log();
        let sub = Subscription::new("item".to_string());
        let s1 = RecordingSource::new("S1", &log);
        let s2 = RecordingSource::new("S2", &log);
        sub.set_source(as_source(&s1));

        let l = RecordingListener::new("L", &log);
        sub.subscribe(as_listener(&l), Variant::Null);
        log.lock().clear();

        sub.set_source(as_source(&s2));

        assert_eq!(
            *log.lock(),
            vec![
                "S1.remove(1)".to_string(),
                "L:item:CONNECTED".to_string(),
                "S2.add(1)".to_string(),
            ]
        );
    }

    #[test]
    fn detaching_source_grants_every_listener() {
        let log = new_log();
        let sub = Subscription::new("item".to_string());
        let src = RecordingSource::new("S", &log);
        let a = RecordingListener::new("A", &log);
        let b = RecordingListener::new("B", &log);
        sub.subscribe(as_listener(&a), Variant::Null);
        sub.subscribe(as_listener(&b), Variant::Null);
        sub.set_source(as_source(&src));
        assert_eq!(src.added.load(Ordering::SeqCst), 2);

        sub.set_source(None);

        assert_eq!(src.removed.load(Ordering::SeqCst), 2);
        assert_eq!(a.states().last(), Some(&SubscriptionState::Granted));
        assert_eq!(b.states().last(), Some(&SubscriptionState::Granted));
        assert!(sub.is_granted());
    }

    #[test]
    fn attaching_source_without_listeners_skips_add() {
        let log = new_log();
        let sub = Subscription::new("item".to_string());
        let src = RecordingSource::new("S", &log);
        sub.set_source(as_source(&src));
        assert!(log.lock().is_empty());
        assert!(!sub.is_empty());
        assert!(!sub.is_granted());
    }

    #[test]
    fn concurrent_subscribers_each_granted_once() {
        let sub = Arc::new(Subscription::new("item".to_string()));
        let log = new_log();
        let listeners: Vec<_> = (0..8)
            .map(|_| RecordingListener::new("L", &log))
            .collect();

        std::thread::scope(|scope| {
            for l in &listeners {
                let sub = Arc::clone(&sub);
                scope.spawn(move || {
                    sub.subscribe(as_listener(l), Variant::Null);
                    sub.subscribe(as_listener(l), Variant::Null);
                });
            }
        });

        assert_eq!(sub.listener_count(), 8);
        for l in &listeners {
            assert_eq!(l.states(), vec![SubscriptionState::Granted]);
        }
    }

    #[derive(Debug, Clone)]
    enum Op {
        Subscribe(usize),
        Unsubscribe(usize),
        Attach(usize),
        Detach,
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0..4_usize).prop_map(Op::Subscribe),
            (0..4_usize).prop_map(Op::Unsubscribe),
            (0..2_usize).prop_map(Op::Attach),
            Just(Op::Detach),
        ]
    }

    proptest! {
        #[test]
        fn emptiness_and_grant_track_model(ops in proptest::collection::vec(op_strategy(), 0..40)) {
            let log = new_log();
            let sub = Subscription::new("item".to_string());
            let listeners: Vec<_> = (0..4).map(|_| RecordingListener::new("L", &log)).collect();
            let sources: Vec<_> = (0..2).map(|_| RecordingSource::new("S", &log)).collect();

            let mut registered = [false; 4];
            let mut attached = false;

            for op in ops {
                match op {
                    Op::Subscribe(i) => {
                        sub.subscribe(as_listener(&listeners[i]), Variant::Null);
                        registered[i] = true;
                    }
                    Op::Unsubscribe(i) => {
                        sub.unsubscribe(&as_listener(&listeners[i]));
                        registered[i] = false;
                    }
                    Op::Attach(i) => {
                        sub.set_source(as_source(&sources[i]));
                        attached = true;
                    }
                    Op::Detach => {
                        sub.set_source(None);
                        attached = false;
                    }
                }

                let count = registered.iter().filter(|r| **r).count();
                prop_assert_eq!(sub.listener_count(), count);
                prop_assert_eq!(sub.is_empty(), !attached && count == 0);
                prop_assert_eq!(sub.is_granted(), !attached && count > 0);
                prop_assert!(!(sub.is_empty() && sub.is_granted()));
            }

            for (i, l) in listeners.iter().enumerate() {
                let states = l.states();
                if registered[i] {
                    prop_assert_ne!(states.last(), Some(&SubscriptionState::Disconnected));
                } else if let Some(last) = states.last() {
                    prop_assert_eq!(*last, SubscriptionState::Disconnected);
                }
            }

            let added: usize = sources.iter().map(|s| s.added.load(Ordering::SeqCst)).sum();
            let removed: usize = sources.iter().map(|s| s.removed.load(Ordering::SeqCst)).sum();
            let live = if attached { registered.iter().filter(|r| **r).count() } else { 0 };
            prop_assert_eq!(added - removed, live);
        }
    }
}
