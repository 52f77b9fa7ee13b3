//! Shared protocol types: ids, categories, step log, outcomes, audit events

use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Unique identifier for a session
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Permission tier of a session
///
/// `Root` gets the full capability set registered for it; `Scoped` sessions
/// are created with an explicit allow-list narrowed from their parent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Category {
    Root,
    Scoped,
}

/// Set of capability names a session may invoke
pub type CapabilitySet = BTreeSet<String>;

/// Lifecycle state of a session
///
/// `Created` and `Running` are the only non-terminal states. A session
/// enters a terminal state exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionState {
    Created,
    Running,
    Completed,
    Failed,
    Cancelled,
    TimedOut,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, SessionState::Created | SessionState::Running)
    }
}

/// Kind of entry in a session's step log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepKind {
    Thought,
    Action,
    Observation,
}

/// One entry in a session's step log
///
/// Indices are strictly ordered within a session; payloads are opaque to
/// the core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThinkingStep {
    pub index: usize,
    pub kind: StepKind,
    pub payload: Value,
}

/// Why a session ended in `Failed`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureReason {
    /// The step budget ran out before the strategy produced a final answer
    StepBudgetExhausted,
    /// The reasoning strategy itself returned an error
    StrategyFailed(String),
    /// The session's worker task died without reporting an outcome
    WorkerLost(String),
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::StepBudgetExhausted => write!(f, "step budget exhausted"),
            FailureReason::StrategyFailed(msg) => write!(f, "reasoning strategy failed: {msg}"),
            FailureReason::WorkerLost(msg) => write!(f, "worker task lost: {msg}"),
        }
    }
}

/// Terminal outcome of a session's thinking loop
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Outcome {
    Completed { result: Value },
    Failed { reason: FailureReason },
    Cancelled,
    TimedOut,
}

impl Outcome {
    /// The session state this outcome corresponds to
    pub fn state(&self) -> SessionState {
        match self {
            Outcome::Completed { .. } => SessionState::Completed,
            Outcome::Failed { .. } => SessionState::Failed,
            Outcome::Cancelled => SessionState::Cancelled,
            Outcome::TimedOut => SessionState::TimedOut,
        }
    }
}

/// Outcome of a child session, keyed by its id
///
/// Sibling outcomes carry no ordering guarantee; consumers treat them as an
/// unordered set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionOutcome {
    pub session_id: SessionId,
    pub outcome: Outcome,
}

/// Request to create one child session for a sub-problem
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpawnSpec {
    /// Sub-problem handed to the child's thinking loop
    pub problem: String,
    /// Permission tier of the child
    pub category: Category,
    /// Allow-list for the child; must be a subset of the parent's grant
    pub capabilities: CapabilitySet,
    /// Optional time budget; the child's deadline is clamped to the parent's
    pub budget: Option<Duration>,
    /// Optional step budget override
    pub max_steps: Option<usize>,
}

impl SpawnSpec {
    pub fn new(problem: impl Into<String>, category: Category) -> Self {
        Self {
            problem: problem.into(),
            category,
            capabilities: CapabilitySet::new(),
            budget: None,
            max_steps: None,
        }
    }

    pub fn with_capabilities(
        mut self,
        capabilities: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        self.capabilities = capabilities.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_budget(mut self, budget: Duration) -> Self {
        self.budget = Some(budget);
        self
    }

    pub fn with_max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = Some(max_steps);
        self
    }
}

/// Orchestrator tuning knobs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Maximum nesting level of child sessions beneath the root
    pub max_depth: usize,
    /// Default reasoning-step budget per session
    pub max_steps: usize,
    /// Per-session cap on capability invocations
    pub max_capability_calls: usize,
    /// Fraction of the remaining parent budget granted to children for
    /// cooperative unwind on cancellation
    pub grace_fraction: f64,
    /// Floor for the unwind grace period
    pub min_grace: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_depth: 3,
            max_steps: 10,
            max_capability_calls: 20,
            grace_fraction: 0.1,
            min_grace: Duration::from_millis(100),
        }
    }
}

/// Serializable snapshot of one session and its subtree
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionTreeView {
    pub session_id: SessionId,
    pub category: Category,
    pub depth: usize,
    pub state: SessionState,
    pub children: Vec<SessionTreeView>,
}

/// Audit events emitted by the core
///
/// Delivery is fire-and-forget over an unbounded channel; a dropped
/// receiver never blocks orchestration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Event {
    SessionCreated {
        session_id: SessionId,
        parent_id: Option<SessionId>,
        category: Category,
        depth: usize,
        at: DateTime<Utc>,
    },
    StateChanged {
        session_id: SessionId,
        parent_id: Option<SessionId>,
        depth: usize,
        from: SessionState,
        to: SessionState,
        at: DateTime<Utc>,
    },
    CapabilityInvoked {
        session_id: SessionId,
        parent_id: Option<SessionId>,
        depth: usize,
        capability: String,
        success: bool,
        error: Option<String>,
        elapsed_ms: u64,
        at: DateTime<Utc>,
    },
    SpawnRejected {
        session_id: SessionId,
        reason: String,
        at: DateTime<Utc>,
    },
    RunCompleted {
        session_id: SessionId,
        state: SessionState,
        steps: usize,
        capability_calls: usize,
        at: DateTime<Utc>,
    },
}
