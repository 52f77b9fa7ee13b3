//! Session records: identity, permission scope, deadline, state machine, step log

use std::time::Duration;

use parking_lot::RwLock;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::protocol::{
    CapabilitySet, Category, Event, SessionId, SessionState, StepKind, ThinkingStep,
};

/// A bounded unit of orchestrated work
///
/// A session owns its step log and its child set. All mutation of a
/// session's own fields happens on that session's worker; the tree's
/// registration bookkeeping is the only state touched from outside.
pub struct Session {
    /// Unique identifier, immutable
    pub id: SessionId,
    /// Owning session, none for the root; back-reference only
    pub parent_id: Option<SessionId>,
    /// Nesting level, 0 for the root
    pub depth: usize,
    /// Permission tier
    pub category: Category,
    /// Capability allow-list, fixed at creation
    allowed: CapabilitySet,
    /// Absolute deadline; inherited or tightened from the parent, never loosened
    deadline: Instant,
    /// Reasoning-step budget
    max_steps: usize,
    /// Capability invocation budget
    max_capability_calls: usize,
    /// Lifecycle state
    state: RwLock<SessionState>,
    /// Ordered step log
    steps: RwLock<Vec<ThinkingStep>>,
    /// Owned child session ids, in spawn order
    children: RwLock<Vec<SessionId>>,
    /// Final result, populated only on `Completed`
    result: RwLock<Option<Value>>,
    /// Capability calls dispatched so far
    calls_used: RwLock<usize>,
    /// Cancellation signal; derived from the parent's token so ancestor
    /// cancellation reaches the whole subtree
    cancel: CancellationToken,
    /// Audit event sender
    event_tx: mpsc::UnboundedSender<Event>,
}

impl Session {
    /// Create a new session record
    pub(crate) fn new(
        parent: Option<&Session>,
        category: Category,
        allowed: CapabilitySet,
        deadline: Instant,
        max_steps: usize,
        max_capability_calls: usize,
        event_tx: mpsc::UnboundedSender<Event>,
    ) -> Self {
        let id = SessionId::new();
        let (parent_id, depth, cancel) = match parent {
            Some(p) => (Some(p.id), p.depth + 1, p.cancel.child_token()),
            None => (None, 0, CancellationToken::new()),
        };

        debug!(
            session_id = %id,
            parent = ?parent_id,
            depth = depth,
            category = ?category,
            "Creating session"
        );

        Self {
            id,
            parent_id,
            depth,
            category,
            allowed,
            deadline,
            max_steps,
            max_capability_calls,
            state: RwLock::new(SessionState::Created),
            steps: RwLock::new(Vec::new()),
            children: RwLock::new(Vec::new()),
            result: RwLock::new(None),
            calls_used: RwLock::new(0),
            cancel,
            event_tx,
        }
    }

    /// Current lifecycle state
    pub fn state(&self) -> SessionState {
        *self.state.read()
    }

    pub fn is_terminal(&self) -> bool {
        self.state().is_terminal()
    }

    /// Attempt a state transition
    ///
    /// Returns `true` and emits exactly one `StateChanged` event if the
    /// transition is valid from the current state. Once a terminal state is
    /// reached every further attempt is a silent no-op, so repeated
    /// termination never produces duplicate audit events.
    pub fn try_transition(&self, to: SessionState) -> bool {
        let from = {
            let mut guard = self.state.write();
            let from = *guard;
            let valid = matches!(
                (from, to),
                (SessionState::Created, SessionState::Running)
                    | (SessionState::Created, SessionState::Cancelled)
                    | (SessionState::Running, SessionState::Completed)
                    | (SessionState::Running, SessionState::Failed)
                    | (SessionState::Running, SessionState::Cancelled)
                    | (SessionState::Running, SessionState::TimedOut)
            );
            if !valid {
                return false;
            }
            *guard = to;
            from
        };

        if to.is_terminal() {
            // In-flight calls and stragglers must observe termination
            self.cancel.cancel();
        }

        info!(
            session_id = %self.id,
            from = ?from,
            to = ?to,
            "Session state changed"
        );

        let _ = self.event_tx.send(Event::StateChanged {
            session_id: self.id,
            parent_id: self.parent_id,
            depth: self.depth,
            from,
            to,
            at: chrono::Utc::now(),
        });

        true
    }

    /// Append a step to the log, returning its index
    ///
    /// Indices are strictly ordered within the session.
    pub fn record_step(&self, kind: StepKind, payload: Value) -> usize {
        let mut guard = self.steps.write();
        let index = guard.len();
        guard.push(ThinkingStep {
            index,
            kind,
            payload,
        });
        index
    }

    /// Snapshot of the full step history
    pub fn steps(&self) -> Vec<ThinkingStep> {
        self.steps.read().clone()
    }

    pub fn step_count(&self) -> usize {
        self.steps.read().len()
    }

    /// Time left until the deadline
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn is_allowed(&self, capability: &str) -> bool {
        self.allowed.contains(capability)
    }

    pub fn allowed(&self) -> &CapabilitySet {
        &self.allowed
    }

    pub fn max_steps(&self) -> usize {
        self.max_steps
    }

    pub fn max_capability_calls(&self) -> usize {
        self.max_capability_calls
    }

    pub fn calls_used(&self) -> usize {
        *self.calls_used.read()
    }

    pub(crate) fn note_capability_call(&self) -> usize {
        let mut guard = self.calls_used.write();
        *guard += 1;
        *guard
    }

    pub fn add_child(&self, child_id: SessionId) {
        self.children.write().push(child_id);
    }

    pub fn remove_child(&self, child_id: &SessionId) -> bool {
        let mut guard = self.children.write();
        if let Some(pos) = guard.iter().position(|id| id == child_id) {
            guard.remove(pos);
            true
        } else {
            false
        }
    }

    pub fn children(&self) -> Vec<SessionId> {
        self.children.read().clone()
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Request cooperative cancellation of this session and its subtree
    pub fn request_cancel(&self) {
        self.cancel.cancel();
    }

    /// Final result, present only once `Completed`
    pub fn result(&self) -> Option<Value> {
        self.result.read().clone()
    }

    /// Transition to `Completed` and store the final result
    pub fn complete(&self, result: Value) -> bool {
        if self.try_transition(SessionState::Completed) {
            *self.result.write() = Some(result);
            true
        } else {
            false
        }
    }
}

/// Handle to a session for shared access
#[derive(Clone)]
pub struct SessionHandle {
    inner: std::sync::Arc<Session>,
}

impl SessionHandle {
    pub fn new(session: Session) -> Self {
        Self {
            inner: std::sync::Arc::new(session),
        }
    }

    pub fn id(&self) -> SessionId {
        self.inner.id
    }
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("id", &self.inner.id)
            .finish()
    }
}

impl std::ops::Deref for SessionHandle {
    type Target = Session;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}
