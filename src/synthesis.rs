//! Merging child outcomes into one parent-consumable observation
//!
//! Partial success is always representable: a parent may legitimately
//! proceed with N-1 successful children and one failed one. Failure is
//! encoded as data, never raised.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::protocol::{Outcome, SessionId, SessionOutcome, SessionState};

/// One child's contribution to a synthesis
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChildReport {
    pub state: SessionState,
    /// Present only for `Completed` children
    pub result: Option<Value>,
    /// Present for every non-completed child
    pub reason: Option<String>,
}

/// Structured observation produced from a set of child outcomes
///
/// Children are keyed by session id; sibling ordering carries no meaning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Synthesis {
    pub problem: String,
    pub children: BTreeMap<SessionId, ChildReport>,
    pub completed: usize,
    pub unsuccessful: usize,
}

impl Synthesis {
    /// Results of all completed children, in id order
    pub fn results(&self) -> Vec<&Value> {
        self.children
            .values()
            .filter_map(|report| report.result.as_ref())
            .collect()
    }

    pub fn all_completed(&self) -> bool {
        self.unsuccessful == 0
    }
}

/// Merges heterogeneous child outcomes into a single observation
#[derive(Debug, Clone, Copy, Default)]
pub struct ResultSynthesizer;

impl ResultSynthesizer {
    pub fn new() -> Self {
        Self
    }

    pub fn synthesize(&self, problem: &str, outcomes: Vec<SessionOutcome>) -> Synthesis {
        let mut children = BTreeMap::new();
        let mut completed = 0;
        let mut unsuccessful = 0;

        for SessionOutcome {
            session_id,
            outcome,
        } in outcomes
        {
            let state = outcome.state();
            let report = match outcome {
                Outcome::Completed { result } => {
                    completed += 1;
                    ChildReport {
                        state,
                        result: Some(result),
                        reason: None,
                    }
                }
                Outcome::Failed { reason } => {
                    unsuccessful += 1;
                    ChildReport {
                        state,
                        result: None,
                        reason: Some(reason.to_string()),
                    }
                }
                Outcome::Cancelled => {
                    unsuccessful += 1;
                    ChildReport {
                        state,
                        result: None,
                        reason: Some("cancelled".to_string()),
                    }
                }
                Outcome::TimedOut => {
                    unsuccessful += 1;
                    ChildReport {
                        state,
                        result: None,
                        reason: Some("timed out".to_string()),
                    }
                }
            };
            children.insert(session_id, report);
        }

        Synthesis {
            problem: problem.to_string(),
            children,
            completed,
            unsuccessful,
        }
    }
}
