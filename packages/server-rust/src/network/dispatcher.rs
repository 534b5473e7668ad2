//! Inbound message dispatch table keyed by command code.

use std::sync::Arc;

use dashmap::DashMap;
use datahive_core::Message;
use tracing::{debug, warn};

/// Handler for inbound messages of the command codes it is registered for.
pub trait MessageListener: Send + Sync {
    fn message_received(&self, message: &Message);
}

/// Routes inbound messages to the single handler owning their command code.
#[derive(Default)]
pub struct MessageDispatcher {
    handlers: DashMap<u32, Arc<dyn MessageListener>>,
}

impl MessageDispatcher {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes `handler` the owner of `command_code`, returning the handler it
    /// replaced, if any.
    pub fn set_handler(
        &self,
        command_code: u32,
        handler: Arc<dyn MessageListener>,
    ) -> Option<Arc<dyn MessageListener>> {
        let previous = self.handlers.insert(command_code, handler);
        if previous.is_some() {
            warn!(command_code, "replacing existing message handler");
        }
        previous
    }

    /// Removes the handler for `command_code`.
    pub fn unset_handler(&self, command_code: u32) -> Option<Arc<dyn MessageListener>> {
        self.handlers.remove(&command_code).map(|(_, handler)| handler)
    }

    #[must_use]
    pub fn has_handler(&self, command_code: u32) -> bool {
        self.handlers.contains_key(&command_code)
    }

    /// Delivers `message` to the owner of its command code.
    ///
    /// Returns `false` if no handler is registered. The table guard is
    /// released before the handler runs, so handlers may (un)register.
    pub fn dispatch(&self, message: &Message) -> bool {
        let handler = self
            .handlers
            .get(&message.command_code)
            .map(|entry| Arc::clone(entry.value()));
        match handler {
            Some(handler) => {
                handler.message_received(message);
                true
            }
            None => {
                debug!(
                    command_code = message.command_code,
                    "no handler for inbound message"
                );
                false
            }
        }
    }
}

impl std::fmt::Debug for MessageDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut codes: Vec<u32> = self.handlers.iter().map(|entry| *entry.key()).collect();
        codes.sort_unstable();
        f.debug_struct("MessageDispatcher")
            .field("codes", &codes)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[derive(Default)]
    struct CountingListener {
        received: AtomicUsize,
    }

    impl MessageListener for CountingListener {
        fn message_received(&self, _message: &Message) {
            self.received.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn dispatch_routes_by_code() {
        let dispatcher = MessageDispatcher::new();
        let a = Arc::new(CountingListener::default());
        let b = Arc::new(CountingListener::default());
        dispatcher.set_handler(10, Arc::clone(&a) as _);
        dispatcher.set_handler(20, Arc::clone(&b) as _);

        assert!(dispatcher.dispatch(&Message::new(10)));
        assert!(dispatcher.dispatch(&Message::new(10)));
        assert!(dispatcher.dispatch(&Message::new(20)));

        assert_eq!(a.received.load(Ordering::SeqCst), 2);
        assert_eq!(b.received.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unknown_code_is_reported() {
        let dispatcher = MessageDispatcher::new();
        assert!(!dispatcher.dispatch(&Message::new(99)));
    }

    #[test]
    fn set_handler_replaces_owner() {
        let dispatcher = MessageDispatcher::new();
        let first = Arc::new(CountingListener::default());
        let second = Arc::new(CountingListener::default());

        assert!(dispatcher.set_handler(5, Arc::clone(&first) as _).is_none());
        assert!(dispatcher.set_handler(5, Arc::clone(&second) as _).is_some());
        dispatcher.dispatch(&Message::new(5));

        assert_eq!(first.received.load(Ordering::SeqCst), 0);
        assert_eq!(second.received.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unset_handler_stops_delivery() {
        let dispatcher = MessageDispatcher::new();
        let listener = Arc::new(CountingListener::default());
        dispatcher.set_handler(5, Arc::clone(&listener) as _);
        assert!(dispatcher.has_handler(5));

        assert!(dispatcher.unset_handler(5).is_some());
        assert!(!dispatcher.has_handler(5));
        assert!(!dispatcher.dispatch(&Message::new(5)));
        assert!(dispatcher.unset_handler(5).is_none());
    }
}
