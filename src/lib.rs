//! # Conclave
//!
//! Hierarchical session orchestration core - the deliberating assembly.
//!
//! This crate implements the recursive scheduler behind a tree of bounded
//! "sessions": units of work that reason in steps, invoke external
//! capabilities through a permission-checked boundary, and decompose
//! problems by spawning child sessions.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                        ORCHESTRATOR                                  │
//! │  ┌──────────────┐  ┌───────────────────┐  ┌───────────────────┐    │
//! │  │ Session Tree │  │ Capability Invoker│  │ Result Synthesizer│    │
//! │  └──────────────┘  └───────────────────┘  └───────────────────┘    │
//! └────────────────────────────┬────────────────────────────────────────┘
//!                              │
//!                     ┌────────┴────────┐
//!                     │  Root Session   │  depth 0, full grant
//!                     └────────┬────────┘
//!          ┌──────────────────┼──────────────────┐
//!          ▼                  ▼                  ▼
//!   ┌─────────────┐    ┌─────────────┐    ┌─────────────┐
//!   │Child Session│    │Child Session│    │Child Session│  depth 1,
//!   └──────┬──────┘    └─────────────┘    └─────────────┘  narrowed grants
//!     ┌────┴────┐
//!     ▼         ▼
//!   ┌───┐     ┌───┐
//!   │GC1│     │GC2│   depth 2 ... up to the depth ceiling
//!   └───┘     └───┘
//! ```
//!
//! Each session runs a bounded reason -> act -> observe loop on its own
//! worker task. Deadlines and permissions only tighten down the tree;
//! cancellation only propagates down; child outcomes - including partial
//! failures - are synthesized back up into observations the parent's loop
//! consumes.
//!
//! ## Key Concepts
//!
//! - **Session**: a bounded unit of work with its own permission scope,
//!   deadline, and lifecycle state
//! - **Category**: a named permission tier (`Root` or `Scoped`) determining
//!   the capability set a session may draw from
//! - **Capability**: a named external operation invocable only through the
//!   permission-checked [`CapabilityInvoker`]
//! - **ThinkingLoop**: the bounded reason/act/observe cycle driving one
//!   session toward a final answer or failure
//! - **Synthesis**: the merging of child outcomes, successes and failures
//!   alike, into one observation for the parent

pub mod capability;
pub mod channel;
pub mod error;
pub mod orchestrator;
pub mod permissions;
pub mod protocol;
pub mod session;
pub mod synthesis;
pub mod thinking;
pub mod tree;

pub use capability::{CapabilityInvoker, CapabilityProvider, CapabilityRegistry};
pub use channel::AuditChannel;
pub use error::{ConclaveError, InvokeError, SpawnError};
pub use orchestrator::Orchestrator;
pub use permissions::PermissionRegistry;
pub use session::{Session, SessionHandle};
pub use synthesis::{ChildReport, ResultSynthesizer, Synthesis};
pub use thinking::{Directive, ReasoningStrategy, ThinkingLoop};
pub use tree::SessionTree;

// Re-export commonly used protocol types
pub use protocol::{
    CapabilitySet, Category, Event, FailureReason, OrchestratorConfig, Outcome, SessionId,
    SessionOutcome, SessionState, SessionTreeView, SpawnSpec, StepKind, ThinkingStep,
};
