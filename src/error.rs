//! Conclave error types

use thiserror::Error;

use crate::protocol::{Category, FailureReason, SessionId};

/// Errors rejecting a session creation request
///
/// All of these are returned synchronously at spawn time; no session is
/// created when one occurs.
#[derive(Debug, Error)]
pub enum SpawnError {
    /// Root sessions must use the `Root` category
    #[error("invalid root category: {0:?}")]
    InvalidRootCategory(Category),

    /// Category has no entry in the permission registry
    #[error("unknown category: {0:?}")]
    UnknownCategory(Category),

    /// Child would exceed the depth ceiling
    #[error("depth {requested} exceeds ceiling {max}")]
    DepthExceeded { requested: usize, max: usize },

    /// Requested capabilities are wider than the parent's grant or the
    /// category's registered set
    #[error("requested capabilities are not a subset of the parent grant")]
    PermissionNotSubset,

    /// Parent session is not registered in the tree
    #[error("parent session not found: {0}")]
    ParentNotFound(SessionId),

    /// Parent session already reached a terminal state
    #[error("parent session is not active: {0}")]
    ParentNotActive(SessionId),
}

/// Errors from a capability invocation
#[derive(Debug, Error)]
pub enum InvokeError {
    /// Capability is not in the session's allow-list; no call was made
    #[error("permission denied for capability '{0}'")]
    PermissionDenied(String),

    /// Capability is allowed but no provider is registered under that name
    #[error("no provider registered for capability '{0}'")]
    UnknownCapability(String),

    /// The session already used up its capability-call budget
    #[error("capability call budget exhausted ({used}/{max})")]
    CallBudgetExhausted { used: usize, max: usize },

    /// The session's remaining time budget elapsed during the call
    #[error("deadline exceeded while invoking '{0}'")]
    Timeout(String),

    /// The session was cancelled before or during the call
    #[error("session cancelled")]
    Cancelled,

    /// The provider itself failed; the underlying cause is preserved
    #[error("capability '{name}' failed: {source}")]
    Capability {
        name: String,
        #[source]
        source: anyhow::Error,
    },
}

/// Top-level errors surfaced to the orchestrating caller
///
/// Child-scope failures are converted to synthesis data and never appear
/// here; only root-level outcomes do.
#[derive(Debug, Error)]
pub enum ConclaveError {
    #[error(transparent)]
    Spawn(#[from] SpawnError),

    #[error(transparent)]
    Invoke(#[from] InvokeError),

    #[error("session not found: {0}")]
    SessionNotFound(SessionId),

    #[error("root session failed: {0}")]
    RootFailed(FailureReason),

    #[error("root session timed out")]
    RootTimedOut,

    #[error("root session cancelled")]
    RootCancelled,
}
