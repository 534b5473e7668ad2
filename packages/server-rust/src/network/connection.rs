//! Connection capability and an in-memory channel implementation.
//!
//! [`Connection`] is all the core needs from a transport: one-way sends and
//! sends whose reply (or timeout) arrives later through a callback.
//! [`ChannelConnection`] provides that over a bounded mpsc channel, with a
//! `DashMap` of pending replies keyed by request sequence.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use datahive_core::Message;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::dispatcher::MessageDispatcher;
use crate::config::ConnectionConfig;

// ---------------------------------------------------------------------------
// Capability
// ---------------------------------------------------------------------------

/// How a request sent with [`Connection::send_with_reply`] ended.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplyOutcome {
    /// The peer answered.
    Reply(Message),
    /// No answer arrived within the reply timeout.
    TimedOut,
    /// The request could not be delivered or the connection went away.
    Failed(SendError),
}

/// Continuation invoked exactly once with the outcome of a request.
pub type ReplyCallback = Box<dyn FnOnce(ReplyOutcome) + Send + Sync + 'static>;

/// Error returned when sending a message fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    /// The outbound channel is full.
    #[error("outbound channel is full")]
    Full,
    /// The connection has been closed; the receiver was dropped.
    #[error("connection closed")]
    Disconnected,
}

/// Transport capability consumed by the long-running controller.
pub trait Connection: Send + Sync {
    /// Sends a message that expects no reply.
    ///
    /// # Errors
    ///
    /// Returns a `SendError` if the message could not be enqueued.
    fn send(&self, message: Message) -> Result<(), SendError>;

    /// Sends a request. `on_reply` runs exactly once, on whatever task
    /// completes the request; delivery failures are reported through it too.
    fn send_with_reply(&self, message: Message, on_reply: ReplyCallback);
}

// ---------------------------------------------------------------------------
// ChannelConnection
// ---------------------------------------------------------------------------

struct PendingReply {
    callback: ReplyCallback,
    timer: Option<JoinHandle<()>>,
}

impl PendingReply {
    fn complete(self, outcome: ReplyOutcome) {
        if let Some(timer) = self.timer {
            timer.abort();
        }
        (self.callback)(outcome);
    }
}

/// In-memory connection: outbound messages land on a bounded channel, inbound
/// messages are fed through [`ChannelConnection::handle_incoming`].
pub struct ChannelConnection {
    tx: mpsc::Sender<Message>,
    pending: DashMap<u64, PendingReply>,
    /// Sequence numbers start at 1; 0 means "unassigned".
    next_sequence: AtomicU64,
    closed: AtomicBool,
    reply_timeout: Duration,
    dispatcher: Arc<MessageDispatcher>,
    weak_self: Weak<ChannelConnection>,
}

impl ChannelConnection {
    /// Creates a connection and returns the receiver of its outbound messages.
    #[must_use]
    pub fn new(
        settings: &ConnectionConfig,
        dispatcher: Arc<MessageDispatcher>,
    ) -> (Arc<Self>, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(settings.outbound_channel_capacity);
        let reply_timeout = settings.reply_timeout;
        let connection = Arc::new_cyclic(|weak_self| Self {
            tx,
            pending: DashMap::new(),
            next_sequence: AtomicU64::new(1),
            closed: AtomicBool::new(false),
            reply_timeout,
            dispatcher,
            weak_self: weak_self.clone(),
        });
        (connection, rx)
    }

    #[must_use]
    pub fn dispatcher(&self) -> &Arc<MessageDispatcher> {
        &self.dispatcher
    }

    /// Number of requests still waiting for a reply.
    #[must_use]
    pub fn pending_replies(&self) -> usize {
        self.pending.len()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire) || self.tx.is_closed()
    }

    /// Feeds a message received from the peer into the connection.
    ///
    /// A reply to a pending request completes that request; anything else
    /// goes through the dispatcher.
    pub fn handle_incoming(&self, message: Message) {
        if let Some(sequence) = message.reply_sequence {
            if let Some((_, pending)) = self.pending.remove(&sequence) {
                pending.complete(ReplyOutcome::Reply(message));
                return;
            }
        }
        self.dispatcher.dispatch(&message);
    }

    /// Closes the connection and fails every pending request.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let sequences: Vec<u64> = self.pending.iter().map(|entry| *entry.key()).collect();
        debug!(pending = sequences.len(), "closing channel connection");
        for sequence in sequences {
            if let Some((_, pending)) = self.pending.remove(&sequence) {
                pending.complete(ReplyOutcome::Failed(SendError::Disconnected));
            }
        }
    }

    fn enqueue(&self, mut message: Message) -> Result<u64, SendError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SendError::Disconnected);
        }
        let sequence = self.next_sequence.fetch_add(1, Ordering::Relaxed);
        message.sequence = sequence;
        self.tx.try_send(message).map_err(send_error)?;
        Ok(sequence)
    }

    fn spawn_timeout(&self, sequence: u64) -> Option<JoinHandle<()>> {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(sequence, "no tokio runtime, reply timeout disabled");
            return None;
        };
        let weak = self.weak_self.clone();
        let timeout = self.reply_timeout;
        Some(runtime.spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(connection) = weak.upgrade() {
                if let Some((_, pending)) = connection.pending.remove(&sequence) {
                    debug!(sequence, "request timed out");
                    (pending.callback)(ReplyOutcome::TimedOut);
                }
            }
        }))
    }
}

fn send_error<T>(err: mpsc::error::TrySendError<T>) -> SendError {
    match err {
        mpsc::error::TrySendError::Full(_) => SendError::Full,
        mpsc::error::TrySendError::Closed(_) => SendError::Disconnected,
    }
}

impl Connection for ChannelConnection {
    fn send(&self, message: Message) -> Result<(), SendError> {
        self.enqueue(message).map(|_| ())
    }

    fn send_with_reply(&self, mut message: Message, on_reply: ReplyCallback) {
        // Register before enqueueing so a fast reply always finds its entry.
        let sequence = self.next_sequence.fetch_add(1, Ordering::Relaxed);
        message.sequence = sequence;
        self.pending.insert(
            sequence,
            PendingReply {
                callback: on_reply,
                timer: None,
            },
        );

        // Checked after the insert: a concurrent close() either sees the
        // entry or we see the flag.
        if self.closed.load(Ordering::SeqCst) {
            if let Some((_, pending)) = self.pending.remove(&sequence) {
                pending.complete(ReplyOutcome::Failed(SendError::Disconnected));
            }
            return;
        }

        if let Err(err) = self.tx.try_send(message).map_err(send_error) {
            if let Some((_, pending)) = self.pending.remove(&sequence) {
                pending.complete(ReplyOutcome::Failed(err));
            }
            return;
        }

        if let Some(timer) = self.spawn_timeout(sequence) {
            match self.pending.get_mut(&sequence) {
                Some(mut entry) => entry.timer = Some(timer),
                // Already answered.
                None => timer.abort(),
            }
        }
    }
}

impl std::fmt::Debug for ChannelConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelConnection")
            .field("pending", &self.pending.len())
            .field("closed", &self.is_closed())
            .field("reply_timeout", &self.reply_timeout)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use datahive_core::codes;
    use tokio::sync::oneshot;

    use super::*;
    use crate::network::dispatcher::MessageListener;

    fn settings(capacity: usize, timeout_ms: u64) -> ConnectionConfig {
        ConnectionConfig {
            outbound_channel_capacity: capacity,
            reply_timeout: Duration::from_millis(timeout_ms),
        }
    }

    fn capture() -> (ReplyCallback, oneshot::Receiver<ReplyOutcome>) {
        let (tx, rx) = oneshot::channel();
        let callback: ReplyCallback = Box::new(move |outcome| {
            let _ = tx.send(outcome);
        });
        (callback, rx)
    }

    #[derive(Default)]
    struct CountingListener {
        received: AtomicUsize,
    }

    impl MessageListener for CountingListener {
        fn message_received(&self, _message: &Message) {
            self.received.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn send_assigns_increasing_sequences() {
        let (conn, mut rx) = ChannelConnection::new(&settings(8, 1000), Arc::default());
        conn.send(Message::new(codes::CC_ACK)).unwrap();
        conn.send(Message::new(codes::CC_ACK)).unwrap();

        assert_eq!(rx.recv().await.unwrap().sequence, 1);
        assert_eq!(rx.recv().await.unwrap().sequence, 2);
    }

    #[tokio::test]
    async fn reply_completes_request_once() {
        let dispatcher = Arc::new(MessageDispatcher::new());
        let fallback = Arc::new(CountingListener::default());
        dispatcher.set_handler(codes::CC_ACK, Arc::clone(&fallback) as _);
        let (conn, mut rx) = ChannelConnection::new(&settings(8, 1000), dispatcher);

        let (callback, outcome) = capture();
        conn.send_with_reply(Message::new(codes::CC_WRITE_OPERATION), callback);
        let request = rx.recv().await.unwrap();
        assert_eq!(conn.pending_replies(), 1);

        let reply = Message::reply_to(&request, codes::CC_ACK).with_value("id", 5_i64);
        conn.handle_incoming(reply.clone());
        assert_eq!(outcome.await.unwrap(), ReplyOutcome::Reply(reply.clone()));
        assert_eq!(conn.pending_replies(), 0);

        // A duplicate reply no longer matches and falls through to dispatch.
        conn.handle_incoming(reply);
        assert_eq!(fallback.received.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_reply_times_out() {
        let (conn, _rx) = ChannelConnection::new(&settings(8, 50), Arc::default());
        let (callback, outcome) = capture();
        conn.send_with_reply(Message::new(codes::CC_WRITE_OPERATION), callback);

        assert_eq!(outcome.await.unwrap(), ReplyOutcome::TimedOut);
        assert_eq!(conn.pending_replies(), 0);
    }

    #[tokio::test]
    async fn full_channel_fails_request() {
        let (conn, _rx) = ChannelConnection::new(&settings(1, 1000), Arc::default());
        conn.send(Message::new(codes::CC_ACK)).unwrap();
        assert_eq!(conn.send(Message::new(codes::CC_ACK)), Err(SendError::Full));

        let (callback, outcome) = capture();
        conn.send_with_reply(Message::new(codes::CC_WRITE_OPERATION), callback);
        assert_eq!(outcome.await.unwrap(), ReplyOutcome::Failed(SendError::Full));
        assert_eq!(conn.pending_replies(), 0);
    }

    #[tokio::test]
    async fn dropped_receiver_reports_disconnected() {
        let (conn, rx) = ChannelConnection::new(&settings(8, 1000), Arc::default());
        drop(rx);
        assert!(conn.is_closed());
        assert_eq!(
            conn.send(Message::new(codes::CC_ACK)),
            Err(SendError::Disconnected)
        );
    }

    #[tokio::test]
    async fn close_fails_pending_requests() {
        let (conn, _rx) = ChannelConnection::new(&settings(8, 60_000), Arc::default());
        let (first, first_outcome) = capture();
        let (second, second_outcome) = capture();
        conn.send_with_reply(Message::new(codes::CC_WRITE_OPERATION), first);
        conn.send_with_reply(Message::new(codes::CC_WRITE_OPERATION), second);

        conn.close();

        let disconnected = ReplyOutcome::Failed(SendError::Disconnected);
        assert_eq!(first_outcome.await.unwrap(), disconnected);
        assert_eq!(second_outcome.await.unwrap(), disconnected);

        let (late, late_outcome) = capture();
        conn.send_with_reply(Message::new(codes::CC_WRITE_OPERATION), late);
        assert_eq!(late_outcome.await.unwrap(), disconnected);
        assert_eq!(conn.pending_replies(), 0);
    }

    #[test]
    fn request_after_close_leaves_nothing_pending_without_runtime() {
        let (conn, mut rx) = ChannelConnection::new(&settings(8, 10), Arc::default());
        conn.close();

        let (callback, mut outcome) = capture();
        conn.send_with_reply(Message::new(codes::CC_WRITE_OPERATION), callback);

        assert_eq!(
            outcome.try_recv().unwrap(),
            ReplyOutcome::Failed(SendError::Disconnected)
        );
        assert_eq!(conn.pending_replies(), 0);
        assert!(rx.try_recv().is_err(), "nothing reaches the wire");
    }

    #[test]
    fn connection_is_shareable_across_threads() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<ChannelConnection>();

        let (conn, mut rx) = ChannelConnection::new(&settings(64, 1000), Arc::default());
        std::thread::scope(|scope| {
            for _ in 0..4 {
                let conn = &conn;
                scope.spawn(move || {
                    for _ in 0..8 {
                        conn.send(Message::new(codes::CC_ACK)).unwrap();
                    }
                });
            }
        });

        let mut sequences = Vec::new();
        while let Ok(message) = rx.try_recv() {
            sequences.push(message.sequence);
        }
        sequences.sort_unstable();
        assert_eq!(sequences, (1..=32).collect::<Vec<u64>>());
    }

    #[test]
    fn works_without_runtime() {
        let (conn, mut rx) = ChannelConnection::new(&settings(8, 10), Arc::default());
        let (callback, mut outcome) = capture();
        conn.send_with_reply(Message::new(codes::CC_WRITE_OPERATION), callback);

        let request = rx.try_recv().unwrap();
        conn.handle_incoming(Message::reply_to(&request, codes::CC_ACK));
        assert!(matches!(outcome.try_recv(), Ok(ReplyOutcome::Reply(_))));
    }
}
