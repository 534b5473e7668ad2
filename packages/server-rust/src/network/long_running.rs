//! Long-running operation controller.
//!
//! Bridges "send a command now, learn its outcome from a separate reply
//! later" into an observable [`LongRunningOperation`]:
//!
//! 1. `start()` sends the request; the direct reply must grant an `"id"`.
//! 2. The granted operation waits in the pending table under that id.
//! 3. A later message carrying the id (routed here by the dispatcher)
//!    resolves it exactly once.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::{Arc, Weak};

use datahive_core::messages::{FIELD_ID, FIELD_MESSAGE};
use datahive_core::{codes, Message};
use parking_lot::{Mutex, ReentrantMutex};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::connection::{Connection, ReplyOutcome, SendError};
use super::dispatcher::{MessageDispatcher, MessageListener};
use crate::config::LongRunningConfig;

// ---------------------------------------------------------------------------
// State, errors, listener
// ---------------------------------------------------------------------------

/// Lifecycle of a long-running operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LongRunningState {
    /// Request sent, no grant yet.
    Requested,
    /// Granted with an id, waiting for the final result.
    Running,
    Failure,
    Success,
}

impl LongRunningState {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Failure | Self::Success)
    }

    fn can_move_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Requested, Self::Running)
                | (Self::Requested | Self::Running, Self::Failure)
                | (Self::Running, Self::Success)
        )
    }
}

impl fmt::Display for LongRunningState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Requested => f.write_str("REQUESTED"),
            Self::Running => f.write_str("RUNNING"),
            Self::Failure => f.write_str("FAILURE"),
            Self::Success => f.write_str("SUCCESS"),
        }
    }
}

/// Why an operation ended in `Failure`. Only ever observed through the
/// listener or the operation handle.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LongRunningError {
    #[error("reply did not grant an operation id")]
    NotGranted,
    #[error("request timed out")]
    TimedOut,
    #[error("transport failure: {0}")]
    Transport(#[from] SendError),
    #[error("operation failed remotely: {message}")]
    Remote { message: String },
}

/// Observer of a single operation's state changes.
///
/// Invoked once per transition, in transition order. Implementations may
/// query the operation or stop it from inside the callback. A transition
/// triggered from inside the callback on the same thread (for example a
/// synchronous transport delivering the final reply) is notified before the
/// outer callback returns.
pub trait LongRunningListener: Send + Sync {
    fn state_changed(
        &self,
        state: LongRunningState,
        reply: Option<&Message>,
        error: Option<&LongRunningError>,
    );
}

// ---------------------------------------------------------------------------
// LongRunningOperation
// ---------------------------------------------------------------------------

type PendingTable = Mutex<HashMap<i64, Arc<LongRunningOperation>>>;

struct OperationInner {
    id: Option<i64>,
    state: LongRunningState,
    reply: Option<Message>,
    error: Option<LongRunningError>,
    stopped: bool,
}

/// Handle to one outstanding asynchronous request.
pub struct LongRunningOperation {
    listener: Option<Arc<dyn LongRunningListener>>,
    stop_command_code: u32,
    /// Serializes transition + notification so listeners see states in order.
    /// Reentrant so a listener can drive the next transition synchronously.
    notify_lock: ReentrantMutex<()>,
    inner: Mutex<OperationInner>,
    state_tx: watch::Sender<LongRunningState>,
}

impl LongRunningOperation {
    fn new(listener: Option<Arc<dyn LongRunningListener>>, stop_command_code: u32) -> Self {
        let (state_tx, _) = watch::channel(LongRunningState::Requested);
        Self {
            listener,
            stop_command_code,
            notify_lock: ReentrantMutex::new(()),
            inner: Mutex::new(OperationInner {
                id: None,
                state: LongRunningState::Requested,
                reply: None,
                error: None,
                stopped: false,
            }),
            state_tx,
        }
    }

    /// Server-assigned id, present once granted.
    #[must_use]
    pub fn id(&self) -> Option<i64> {
        self.inner.lock().id
    }

    #[must_use]
    pub fn state(&self) -> LongRunningState {
        self.inner.lock().state
    }

    /// The message that resolved the operation, if any.
    #[must_use]
    pub fn reply(&self) -> Option<Message> {
        self.inner.lock().reply.clone()
    }

    #[must_use]
    pub fn error(&self) -> Option<LongRunningError> {
        self.inner.lock().error.clone()
    }

    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.state().is_terminal()
    }

    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.inner.lock().stopped
    }

    #[must_use]
    pub fn stop_command_code(&self) -> u32 {
        self.stop_command_code
    }

    /// Subscribes to state changes.
    #[must_use]
    pub fn watch(&self) -> watch::Receiver<LongRunningState> {
        self.state_tx.subscribe()
    }

    /// Resolves once the operation reaches `Success` or `Failure`.
    ///
    /// A stopped operation may never get there; wrap the call in a timeout
    /// when that matters.
    pub async fn wait_for_completion(&self) -> LongRunningState {
        let mut rx = self.state_tx.subscribe();
        let state = match rx.wait_for(|state| state.is_terminal()).await {
            Ok(state) => *state,
            Err(_) => self.state(),
        };
        state
    }

    fn notify(
        &self,
        state: LongRunningState,
        reply: Option<&Message>,
        error: Option<&LongRunningError>,
    ) {
        self.state_tx.send_replace(state);
        if let Some(listener) = &self.listener {
            listener.state_changed(state, reply, error);
        }
    }

    fn notify_requested(&self) {
        let _order = self.notify_lock.lock();
        self.notify(LongRunningState::Requested, None, None);
    }

    /// Moves to `Running` under `id` and registers in `pending` unless the
    /// operation was stopped meanwhile. Returns `false` if it was stopped.
    fn grant(self: &Arc<Self>, id: i64, pending: &PendingTable) -> bool {
        let _order = self.notify_lock.lock();
        let registered = {
            let mut table = pending.lock();
            let mut inner = self.inner.lock();
            if !inner.state.can_move_to(LongRunningState::Running) {
                return true;
            }
            inner.id = Some(id);
            inner.state = LongRunningState::Running;
            if !inner.stopped {
                table.insert(id, Arc::clone(self));
            }
            !inner.stopped
        };
        self.notify(LongRunningState::Running, None, None);
        registered
    }

    fn finish(&self, result: Result<Message, (Option<Message>, LongRunningError)>) {
        let _order = self.notify_lock.lock();
        let (state, reply, error) = match result {
            Ok(reply) => (LongRunningState::Success, Some(reply), None),
            Err((reply, error)) => (LongRunningState::Failure, reply, Some(error)),
        };
        {
            let mut inner = self.inner.lock();
            if !inner.state.can_move_to(state) {
                debug!(current = %inner.state, next = %state, "ignoring late transition");
                return;
            }
            inner.state = state;
            inner.reply.clone_from(&reply);
            inner.error.clone_from(&error);
        }
        self.notify(state, reply.as_ref(), error.as_ref());
    }

    fn fail(&self, error: LongRunningError) {
        self.finish(Err((None, error)));
    }

    /// Marks the operation stopped. Returns the id to cancel, or `None` if it
    /// was already stopped or never granted.
    fn mark_stopped(&self) -> Option<i64> {
        let mut inner = self.inner.lock();
        if inner.stopped {
            return None;
        }
        inner.stopped = true;
        inner.id
    }
}

impl fmt::Debug for LongRunningOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("LongRunningOperation")
            .field("id", &inner.id)
            .field("state", &inner.state)
            .field("stopped", &inner.stopped)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// LongRunningController
// ---------------------------------------------------------------------------

/// Tracks long-running operations started over one connection.
pub struct LongRunningController {
    connection: Arc<dyn Connection>,
    stop_command_code: u32,
    command_codes: BTreeSet<u32>,
    pending: Arc<PendingTable>,
}

impl LongRunningController {
    /// Creates a controller that cancels with `stop_command_code` and expects
    /// final results on `command_codes`.
    pub fn new(
        connection: Arc<dyn Connection>,
        stop_command_code: u32,
        command_codes: impl IntoIterator<Item = u32>,
    ) -> Self {
        Self {
            connection,
            stop_command_code,
            command_codes: command_codes.into_iter().collect(),
            pending: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    #[must_use]
    pub fn from_config(connection: Arc<dyn Connection>, config: &LongRunningConfig) -> Self {
        Self::new(
            connection,
            config.stop_command_code,
            config.reply_command_codes.iter().copied(),
        )
    }

    #[must_use]
    pub fn command_codes(&self) -> &BTreeSet<u32> {
        &self.command_codes
    }

    /// Number of granted operations still awaiting their result.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Binds this controller to each of its reply codes.
    ///
    /// The dispatcher only keeps a weak reference; dropping the controller
    /// turns its codes into no-ops until they are unregistered.
    pub fn register(self: &Arc<Self>, dispatcher: &MessageDispatcher) {
        let handler: Arc<dyn MessageListener> = Arc::new(WeakHandler(Arc::downgrade(self)));
        for code in &self.command_codes {
            dispatcher.set_handler(*code, Arc::clone(&handler));
        }
    }

    pub fn unregister(&self, dispatcher: &MessageDispatcher) {
        for code in &self.command_codes {
            dispatcher.unset_handler(*code);
        }
    }

    /// Sends `message` and returns the operation tracking it.
    ///
    /// The listener sees `Requested` before the message is handed to the
    /// connection. Failures arrive through the listener, never as a return
    /// value.
    pub fn start(
        &self,
        message: Message,
        listener: Option<Arc<dyn LongRunningListener>>,
    ) -> Arc<LongRunningOperation> {
        let op = Arc::new(LongRunningOperation::new(listener, self.stop_command_code));
        op.notify_requested();

        let pending = Arc::clone(&self.pending);
        let connection = Arc::clone(&self.connection);
        let stop_code = self.stop_command_code;
        let tracked = Arc::clone(&op);
        self.connection.send_with_reply(
            message,
            Box::new(move |outcome| {
                on_start_outcome(&tracked, outcome, &pending, connection.as_ref(), stop_code);
            }),
        );
        op
    }

    /// Releases controller-side bookkeeping for `op` and asks the peer to
    /// cancel it. The operation's state is left as it is.
    pub fn stop(&self, op: &Arc<LongRunningOperation>) {
        let id = {
            let mut pending = self.pending.lock();
            let id = op.mark_stopped();
            if let Some(id) = id {
                pending.remove(&id);
            }
            id
        };
        if let Some(id) = id {
            send_stop(self.connection.as_ref(), self.stop_command_code, id);
        }
    }

    /// Resolves the pending operation whose id `message` carries.
    pub fn message_received(&self, message: &Message) {
        let id = message.get_long(FIELD_ID).unwrap_or(0);
        info!(id, command_code = message.command_code, "received long-op reply");
        if id == 0 {
            return;
        }

        let op = self.pending.lock().remove(&id);
        match op {
            Some(op) => resolve(&op, message),
            None => warn!(id, "received long-op message for unregistered operation"),
        }
    }
}

impl fmt::Debug for LongRunningController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LongRunningController")
            .field("stop_command_code", &self.stop_command_code)
            .field("command_codes", &self.command_codes)
            .field("pending", &self.pending_count())
            .finish_non_exhaustive()
    }
}

struct WeakHandler(Weak<LongRunningController>);

impl MessageListener for WeakHandler {
    fn message_received(&self, message: &Message) {
        if let Some(controller) = self.0.upgrade() {
            controller.message_received(message);
        }
    }
}

fn on_start_outcome(
    op: &Arc<LongRunningOperation>,
    outcome: ReplyOutcome,
    pending: &PendingTable,
    connection: &dyn Connection,
    stop_code: u32,
) {
    match outcome {
        ReplyOutcome::Reply(reply) => match reply.get_long(FIELD_ID) {
            Some(id) => {
                debug!(id, "long-running operation granted");
                if !op.grant(id, pending) {
                    debug!(id, "operation stopped before grant, cancelling");
                    send_stop(connection, stop_code, id);
                }
            }
            None => op.fail(LongRunningError::NotGranted),
        },
        ReplyOutcome::TimedOut => op.fail(LongRunningError::TimedOut),
        ReplyOutcome::Failed(err) => op.fail(LongRunningError::Transport(err)),
    }
}

fn resolve(op: &LongRunningOperation, message: &Message) {
    if message.command_code == codes::CC_FAILED {
        let text = message
            .get_string(FIELD_MESSAGE)
            .unwrap_or("operation failed")
            .to_string();
        op.finish(Err((
            Some(message.clone()),
            LongRunningError::Remote { message: text },
        )));
    } else {
        op.finish(Ok(message.clone()));
    }
}

fn send_stop(connection: &dyn Connection, stop_code: u32, id: i64) {
    if let Err(err) = connection.send(Message::new(stop_code).with_value(FIELD_ID, id)) {
        warn!(id, error = %err, "failed to send stop command");
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
