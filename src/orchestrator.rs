//! Main orchestrator - creates sessions, enforces spawn constraints,
//! schedules child workers, and joins their outcomes
//!
//! Each child session's thinking loop runs on its own worker task; the
//! parent suspends only at `await_children` and capability invocations.
//! Cancellation propagates strictly downward.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{info, instrument, warn};

use crate::capability::{CapabilityInvoker, CapabilityRegistry};
use crate::channel::AuditChannel;
use crate::error::{ConclaveError, SpawnError};
use crate::permissions::PermissionRegistry;
use crate::protocol::{
    Category, Event, FailureReason, OrchestratorConfig, Outcome, SessionId, SessionOutcome,
    SessionState, SessionTreeView, SpawnSpec,
};
use crate::session::{Session, SessionHandle};
use crate::thinking::{ReasoningStrategy, ThinkingLoop};
use crate::tree::SessionTree;

/// Creates and schedules the session tree
pub struct Orchestrator {
    config: OrchestratorConfig,
    permissions: PermissionRegistry,
    tree: SessionTree,
    thinking: ThinkingLoop,
    /// Worker tasks for launched child sessions
    tasks: Mutex<HashMap<SessionId, JoinHandle<SessionOutcome>>>,
    event_tx: mpsc::UnboundedSender<Event>,
    /// Back-reference handed to spawned workers
    self_ref: Weak<Orchestrator>,
}

impl Orchestrator {
    /// Create an orchestrator and the audit channel its events flow to
    pub fn new(
        config: OrchestratorConfig,
        permissions: PermissionRegistry,
        capabilities: CapabilityRegistry,
        strategy: Arc<dyn ReasoningStrategy>,
    ) -> (Arc<Self>, AuditChannel) {
        let (channel, event_tx) = AuditChannel::new();
        let invoker = Arc::new(CapabilityInvoker::new(
            Arc::new(capabilities),
            event_tx.clone(),
        ));
        let thinking = ThinkingLoop::new(strategy, invoker);

        let orchestrator = Arc::new_cyclic(|self_ref| Self {
            config,
            permissions,
            tree: SessionTree::new(),
            thinking,
            tasks: Mutex::new(HashMap::new()),
            event_tx,
            self_ref: self_ref.clone(),
        });

        (orchestrator, channel)
    }

    /// Create the root session with the `Root` category's full grant
    pub fn create_root(
        &self,
        category: Category,
        budget: Duration,
    ) -> Result<SessionHandle, SpawnError> {
        if category != Category::Root {
            return Err(SpawnError::InvalidRootCategory(category));
        }
        let allowed = self.permissions.capabilities_for(category)?.clone();
        let deadline = Instant::now() + budget;

        let session = Session::new(
            None,
            category,
            allowed,
            deadline,
            self.config.max_steps,
            self.config.max_capability_calls,
            self.event_tx.clone(),
        );
        let handle = SessionHandle::new(session);
        self.tree.insert(handle.clone());

        info!(session_id = %handle.id, "Created root session");
        self.emit_created(&handle);
        Ok(handle)
    }

    /// Drive the root session to a terminal state
    ///
    /// Child-scope failures are synthesized into observations along the
    /// way; only the root's own terminal outcome surfaces here.
    #[instrument(skip(self, root, problem), fields(session_id = %root.id))]
    pub async fn run(&self, root: &SessionHandle, problem: &str) -> Result<Value, ConclaveError> {
        let orchestrator = self
            .self_ref
            .upgrade()
            .expect("caller holds the orchestrator");

        info!("Starting orchestration run");
        let outcome = self.thinking.run(&orchestrator, root, problem).await;

        let _ = self.event_tx.send(Event::RunCompleted {
            session_id: root.id,
            state: root.state(),
            steps: root.step_count(),
            capability_calls: root.calls_used(),
            at: Utc::now(),
        });
        self.tree.remove_subtree(&root.id);

        info!(outcome = ?outcome.state(), "Orchestration run finished");
        match outcome {
            Outcome::Completed { result } => Ok(result),
            Outcome::Failed { reason } => Err(ConclaveError::RootFailed(reason)),
            Outcome::TimedOut => Err(ConclaveError::RootTimedOut),
            Outcome::Cancelled => Err(ConclaveError::RootCancelled),
        }
    }

    /// Create a child session under `parent`
    ///
    /// Rejected synchronously if the depth ceiling would be exceeded or the
    /// requested capabilities are not a subset of the parent's grant. No
    /// session is created on rejection.
    pub fn spawn_child(
        &self,
        parent: &SessionHandle,
        spec: &SpawnSpec,
    ) -> Result<SessionHandle, SpawnError> {
        let spawned = self.try_spawn(parent, spec);
        if let Err(err) = &spawned {
            warn!(
                session_id = %parent.id,
                error = %err,
                "Rejected child spawn"
            );
            let _ = self.event_tx.send(Event::SpawnRejected {
                session_id: parent.id,
                reason: err.to_string(),
                at: Utc::now(),
            });
        }
        spawned
    }

    fn try_spawn(
        &self,
        parent: &SessionHandle,
        spec: &SpawnSpec,
    ) -> Result<SessionHandle, SpawnError> {
        if self.tree.get(&parent.id).is_none() {
            return Err(SpawnError::ParentNotFound(parent.id));
        }
        if parent.is_terminal() {
            return Err(SpawnError::ParentNotActive(parent.id));
        }

        let depth = parent.depth + 1;
        if depth > self.config.max_depth {
            return Err(SpawnError::DepthExceeded {
                requested: depth,
                max: self.config.max_depth,
            });
        }

        // Monotonic permission narrowing: child set must fit both the
        // category's registered set and the parent's own grant
        let category_set = self.permissions.capabilities_for(spec.category)?;
        if !spec.capabilities.is_subset(category_set)
            || !spec.capabilities.is_subset(parent.allowed())
        {
            return Err(SpawnError::PermissionNotSubset);
        }

        // Inherited or tightened, never loosened
        let deadline = match spec.budget {
            Some(budget) => parent.deadline().min(Instant::now() + budget),
            None => parent.deadline(),
        };

        let session = Session::new(
            Some(&**parent),
            spec.category,
            spec.capabilities.clone(),
            deadline,
            spec.max_steps.unwrap_or(self.config.max_steps),
            self.config.max_capability_calls,
            self.event_tx.clone(),
        );
        let handle = SessionHandle::new(session);
        self.tree.insert(handle.clone());
        parent.add_child(handle.id);

        info!(
            session_id = %handle.id,
            parent = %parent.id,
            depth = depth,
            "Spawned child session"
        );
        self.emit_created(&handle);
        Ok(handle)
    }

    /// Start a child session's thinking loop on its own worker task
    pub(crate) fn launch(&self, child: &SessionHandle, problem: String) {
        let Some(orchestrator) = self.self_ref.upgrade() else {
            return;
        };
        let session = child.clone();
        let task = tokio::spawn(async move {
            let outcome = orchestrator
                .thinking
                .run(&orchestrator, &session, &problem)
                .await;
            SessionOutcome {
                session_id: session.id,
                outcome,
            }
        });
        self.tasks.lock().insert(child.id, task);
    }

    /// Wait for every direct child of `parent` to reach a terminal state
    ///
    /// Bounded by the parent's own deadline; children not terminal by then
    /// are cancelled, given a bounded grace period to unwind, and
    /// force-marked `Cancelled` if they still have not. Consumed child
    /// records are removed from the tree.
    pub async fn await_children(&self, parent: &SessionHandle) -> Vec<SessionOutcome> {
        let child_ids = parent.children();
        let mut outcomes = Vec::with_capacity(child_ids.len());

        for child_id in child_ids {
            let task = self.tasks.lock().remove(&child_id);
            let outcome = match task {
                Some(mut task) => {
                    match tokio::time::timeout_at(parent.deadline(), &mut task).await {
                        Ok(Ok(outcome)) => outcome,
                        Ok(Err(join_err)) => {
                            warn!(
                                session_id = %child_id,
                                error = %join_err,
                                "Child worker lost"
                            );
                            if let Some(child) = self.tree.get(&child_id) {
                                child.try_transition(SessionState::Failed);
                            }
                            SessionOutcome {
                                session_id: child_id,
                                outcome: Outcome::Failed {
                                    reason: FailureReason::WorkerLost(join_err.to_string()),
                                },
                            }
                        }
                        Err(_elapsed) => self.reap_straggler(parent, child_id, &mut task).await,
                    }
                }
                None => {
                    // Registered but never launched
                    if let Some(child) = self.tree.get(&child_id) {
                        child.request_cancel();
                        child.try_transition(SessionState::Cancelled);
                    }
                    SessionOutcome {
                        session_id: child_id,
                        outcome: Outcome::Cancelled,
                    }
                }
            };
            // A force-aborted child never reaped its own children; drop any
            // worker handles left behind before the records go
            for orphan_id in self.tree.descendants(&child_id) {
                if let Some(orphan_task) = self.tasks.lock().remove(&orphan_id) {
                    orphan_task.abort();
                }
            }
            self.tree.remove_subtree(&child_id);
            outcomes.push(outcome);
        }
        outcomes
    }

    /// Cancel a child that outlived the parent's deadline, give it a grace
    /// period to unwind, then force-mark it
    async fn reap_straggler(
        &self,
        parent: &SessionHandle,
        child_id: SessionId,
        task: &mut JoinHandle<SessionOutcome>,
    ) -> SessionOutcome {
        self.tree.cancel_subtree(&child_id);
        let grace = self.grace_period(parent);

        match tokio::time::timeout(grace, &mut *task).await {
            Ok(Ok(outcome)) => outcome,
            _ => {
                warn!(session_id = %child_id, "Force-cancelling child session");
                task.abort();
                if let Some(child) = self.tree.get(&child_id) {
                    child.try_transition(SessionState::Cancelled);
                }
                SessionOutcome {
                    session_id: child_id,
                    outcome: Outcome::Cancelled,
                }
            }
        }
    }

    /// Cancel still-running children before `session` itself finalizes
    pub(crate) async fn shutdown_children(&self, session: &SessionHandle) {
        let children = session.children();
        if children.is_empty() {
            return;
        }
        for child_id in &children {
            self.tree.cancel_subtree(child_id);
        }
        let _ = self.await_children(session).await;
    }

    /// Mark a session and all descendants cancelled, best-effort, idempotent
    pub fn cancel_subtree(&self, id: &SessionId) {
        self.tree.cancel_subtree(id);
    }

    pub fn get_session(&self, id: &SessionId) -> Option<SessionHandle> {
        self.tree.get(id)
    }

    pub fn session_ids(&self) -> Vec<SessionId> {
        self.tree.session_ids()
    }

    /// Serializable snapshot of the live session tree
    pub fn snapshot(&self) -> Option<SessionTreeView> {
        self.tree.snapshot()
    }

    fn grace_period(&self, parent: &SessionHandle) -> Duration {
        parent
            .remaining()
            .mul_f64(self.config.grace_fraction)
            .max(self.config.min_grace)
    }

    fn emit_created(&self, session: &SessionHandle) {
        let _ = self.event_tx.send(Event::SessionCreated {
            session_id: session.id,
            parent_id: session.parent_id,
            category: session.category,
            depth: session.depth,
            at: Utc::now(),
        });
    }
}
