//! The bounded reason -> act -> observe loop driving one session
//!
//! Each round the pluggable reasoning strategy proposes a final answer, a
//! capability call, or a batch of child sessions for sub-problems. The loop
//! executes the proposal, appends what happened to the step log, and hands
//! the full history back to the strategy on the next round. What step comes
//! next is the strategy's decision; how it is executed is the core's.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::capability::CapabilityInvoker;
use crate::error::InvokeError;
use crate::orchestrator::Orchestrator;
use crate::protocol::{FailureReason, Outcome, SessionState, SpawnSpec, StepKind, ThinkingStep};
use crate::session::SessionHandle;
use crate::synthesis::ResultSynthesizer;

/// The pluggable reasoning procedure
///
/// Opaque to the core: potentially slow, potentially failing, and subject
/// to the same timeout discipline as any capability.
#[async_trait]
pub trait ReasoningStrategy: Send + Sync {
    async fn propose(&self, problem: &str, steps: &[ThinkingStep]) -> anyhow::Result<Directive>;
}

/// What the strategy wants to happen next
#[derive(Debug, Clone)]
pub enum Directive {
    /// Terminate the session successfully with this result
    FinalAnswer(Value),
    /// Invoke a capability through the permission-checked boundary
    Action { capability: String, request: Value },
    /// Decompose into child sessions, one per sub-problem
    Spawn(Vec<SpawnSpec>),
}

impl Directive {
    /// Compact summary recorded as the `Thought` step for this round
    fn thought(&self) -> Value {
        match self {
            Directive::FinalAnswer(_) => json!({ "decision": "final_answer" }),
            Directive::Action { capability, .. } => {
                json!({ "decision": "action", "capability": capability })
            }
            Directive::Spawn(specs) => {
                json!({ "decision": "spawn", "children": specs.len() })
            }
        }
    }
}

/// Drives one session through up to `max_steps` reasoning rounds
pub struct ThinkingLoop {
    strategy: Arc<dyn ReasoningStrategy>,
    invoker: Arc<CapabilityInvoker>,
    synthesizer: ResultSynthesizer,
}

impl ThinkingLoop {
    pub fn new(strategy: Arc<dyn ReasoningStrategy>, invoker: Arc<CapabilityInvoker>) -> Self {
        Self {
            strategy,
            invoker,
            synthesizer: ResultSynthesizer::new(),
        }
    }

    /// Run the session to a terminal state and return its outcome
    pub(crate) async fn run(
        &self,
        orchestrator: &Arc<Orchestrator>,
        session: &SessionHandle,
        problem: &str,
    ) -> Outcome {
        if !session.try_transition(SessionState::Running) {
            // Force-cancelled before the first step ran
            return Self::outcome_for(session);
        }

        info!(
            session_id = %session.id,
            depth = session.depth,
            "Session running"
        );

        for _round in 0..session.max_steps() {
            if session.cancel_token().is_cancelled() {
                return self.finish_cancelled(orchestrator, session).await;
            }
            if session.remaining().is_zero() {
                return self.finish_timed_out(orchestrator, session).await;
            }

            let history = session.steps();
            let proposed = tokio::select! {
                _ = session.cancel_token().cancelled() => {
                    return self.finish_cancelled(orchestrator, session).await;
                }
                proposed = tokio::time::timeout(
                    session.remaining(),
                    self.strategy.propose(problem, &history),
                ) => proposed,
            };

            let directive = match proposed {
                Err(_elapsed) => return self.finish_timed_out(orchestrator, session).await,
                Ok(Err(err)) => {
                    warn!(
                        session_id = %session.id,
                        error = %err,
                        "Reasoning strategy failed"
                    );
                    let reason = FailureReason::StrategyFailed(err.to_string());
                    return self.finish_failed(orchestrator, session, reason).await;
                }
                Ok(Ok(directive)) => directive,
            };

            session.record_step(StepKind::Thought, directive.thought());

            match directive {
                Directive::FinalAnswer(result) => {
                    if session.complete(result.clone()) {
                        return Outcome::Completed { result };
                    }
                    return Self::outcome_for(session);
                }
                Directive::Action {
                    capability,
                    request,
                } => {
                    session.record_step(
                        StepKind::Action,
                        json!({ "capability": capability.as_str(), "request": request.clone() }),
                    );
                    match self.invoker.invoke(session, &capability, request).await {
                        Ok(_) => {}
                        Err(InvokeError::Cancelled) => {
                            return self.finish_cancelled(orchestrator, session).await;
                        }
                        Err(InvokeError::Timeout(_)) => {
                            return self.finish_timed_out(orchestrator, session).await;
                        }
                        // Already in the step log as an error observation;
                        // the strategy decides how to proceed
                        Err(_) => {}
                    }
                }
                Directive::Spawn(specs) => {
                    let problems: Vec<&str> = specs.iter().map(|s| s.problem.as_str()).collect();
                    session.record_step(StepKind::Action, json!({ "spawn": problems }));

                    let mut launched = false;
                    for spec in &specs {
                        match orchestrator.spawn_child(session, spec) {
                            Ok(child) => {
                                orchestrator.launch(&child, spec.problem.clone());
                                launched = true;
                            }
                            Err(err) => {
                                // Recoverable at the reasoning level: the
                                // strategy sees the rejection and may choose
                                // a different action
                                session.record_step(
                                    StepKind::Observation,
                                    json!({ "ok": false, "error": err.to_string() }),
                                );
                            }
                        }
                    }

                    if launched {
                        let outcomes = orchestrator.await_children(session).await;
                        let synthesis = self.synthesizer.synthesize(problem, outcomes);
                        session.record_step(
                            StepKind::Observation,
                            serde_json::to_value(&synthesis).unwrap_or_default(),
                        );
                    }
                }
            }
        }

        self.finish_failed(orchestrator, session, FailureReason::StepBudgetExhausted)
            .await
    }

    async fn finish_cancelled(
        &self,
        orchestrator: &Arc<Orchestrator>,
        session: &SessionHandle,
    ) -> Outcome {
        orchestrator.shutdown_children(session).await;
        session.try_transition(SessionState::Cancelled);
        Outcome::Cancelled
    }

    async fn finish_timed_out(
        &self,
        orchestrator: &Arc<Orchestrator>,
        session: &SessionHandle,
    ) -> Outcome {
        info!(session_id = %session.id, "Session deadline elapsed");
        orchestrator.shutdown_children(session).await;
        session.try_transition(SessionState::TimedOut);
        Outcome::TimedOut
    }

    async fn finish_failed(
        &self,
        orchestrator: &Arc<Orchestrator>,
        session: &SessionHandle,
        reason: FailureReason,
    ) -> Outcome {
        orchestrator.shutdown_children(session).await;
        session.try_transition(SessionState::Failed);
        Outcome::Failed { reason }
    }

    /// Outcome matching a state set by someone else (force-cancel races)
    fn outcome_for(session: &SessionHandle) -> Outcome {
        match session.state() {
            SessionState::Completed => Outcome::Completed {
                result: session.result().unwrap_or(Value::Null),
            },
            SessionState::TimedOut => Outcome::TimedOut,
            _ => Outcome::Cancelled,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{HashMap, VecDeque};
    use std::time::Duration;

    use parking_lot::Mutex;

    use crate::capability::{CapabilityProvider, CapabilityRegistry};
    use crate::channel::AuditChannel;
    use crate::permissions::PermissionRegistry;
    use crate::protocol::{Category, OrchestratorConfig};

    struct Echo;

    #[async_trait]
    impl CapabilityProvider for Echo {
        async fn call(&self, request: Value) -> anyhow::Result<Value> {
            Ok(json!({ "echo": request }))
        }
    }

    /// Scripted strategy: pops the next directive for the given problem
    struct Script {
        routes: Mutex<HashMap<String, VecDeque<Directive>>>,
    }

    impl Script {
        fn new(routes: Vec<(&str, Vec<Directive>)>) -> Arc<Self> {
            Arc::new(Self {
                routes: Mutex::new(
                    routes
                        .into_iter()
                        .map(|(problem, directives)| (problem.to_string(), directives.into()))
                        .collect(),
                ),
            })
        }
    }

    #[async_trait]
    impl ReasoningStrategy for Script {
        async fn propose(&self, problem: &str, _steps: &[ThinkingStep]) -> anyhow::Result<Directive> {
            let mut routes = self.routes.lock();
            routes
                .get_mut(problem)
                .and_then(|queue| queue.pop_front())
                .ok_or_else(|| anyhow::anyhow!("script exhausted for '{problem}'"))
        }
    }

    /// Strategy that proposes the same directive forever
    struct Always(Directive);

    #[async_trait]
    impl ReasoningStrategy for Always {
        async fn propose(&self, _problem: &str, _steps: &[ThinkingStep]) -> anyhow::Result<Directive> {
            Ok(self.0.clone())
        }
    }

    fn orchestrator_with(
        strategy: Arc<dyn ReasoningStrategy>,
        config: OrchestratorConfig,
    ) -> (Arc<Orchestrator>, AuditChannel) {
        let permissions = PermissionRegistry::new()
            .grant(Category::Root, ["echo"])
            .grant(Category::Scoped, ["echo"]);
        let mut capabilities = CapabilityRegistry::new();
        capabilities.register("echo", Arc::new(Echo));
        Orchestrator::new(config, permissions, capabilities, strategy)
    }

    #[tokio::test]
    async fn test_final_answer_completes_session() {
        let strategy = Script::new(vec![(
            "p",
            vec![Directive::FinalAnswer(json!({"answer": 42}))],
        )]);
        let (orchestrator, _events) = orchestrator_with(strategy, OrchestratorConfig::default());

        let root = orchestrator
            .create_root(Category::Root, Duration::from_secs(10))
            .unwrap();
        let result = orchestrator.run(&root, "p").await.unwrap();

        assert_eq!(result, json!({"answer": 42}));
        assert_eq!(root.state(), SessionState::Completed);
        assert_eq!(root.result(), Some(json!({"answer": 42})));
    }

    #[tokio::test]
    async fn test_action_then_final_answer() {
        let strategy = Script::new(vec![(
            "p",
            vec![
                Directive::Action {
                    capability: "echo".into(),
                    request: json!({"q": 1}),
                },
                Directive::FinalAnswer(json!("done")),
            ],
        )]);
        let (orchestrator, _events) = orchestrator_with(strategy, OrchestratorConfig::default());

        let root = orchestrator
            .create_root(Category::Root, Duration::from_secs(10))
            .unwrap();
        let result = orchestrator.run(&root, "p").await.unwrap();
        assert_eq!(result, json!("done"));

        // Thought, Action, Observation, Thought
        let steps = root.steps();
        let kinds: Vec<StepKind> = steps.iter().map(|s| s.kind).collect();
        assert_eq!(
            kinds,
            vec![
                StepKind::Thought,
                StepKind::Action,
                StepKind::Observation,
                StepKind::Thought,
            ]
        );
        assert_eq!(steps[2].payload["ok"], json!(true));
    }

    #[tokio::test]
    async fn test_step_budget_exhaustion_fails_the_session() {
        let strategy = Arc::new(Always(Directive::Action {
            capability: "echo".into(),
            request: Value::Null,
        }));
        let config = OrchestratorConfig {
            max_steps: 3,
            ..Default::default()
        };
        let (orchestrator, _events) = orchestrator_with(strategy, config);

        let root = orchestrator
            .create_root(Category::Root, Duration::from_secs(10))
            .unwrap();
        let err = orchestrator.run(&root, "p").await.unwrap_err();

        assert!(matches!(
            err,
            crate::error::ConclaveError::RootFailed(FailureReason::StepBudgetExhausted)
        ));
        assert_eq!(root.state(), SessionState::Failed);
    }

    #[tokio::test]
    async fn test_strategy_failure_is_terminal() {
        let strategy = Script::new(vec![]);
        let (orchestrator, _events) = orchestrator_with(strategy, OrchestratorConfig::default());

        let root = orchestrator
            .create_root(Category::Root, Duration::from_secs(10))
            .unwrap();
        let err = orchestrator.run(&root, "p").await.unwrap_err();

        assert!(matches!(
            err,
            crate::error::ConclaveError::RootFailed(FailureReason::StrategyFailed(_))
        ));
        assert_eq!(root.state(), SessionState::Failed);
    }

    #[tokio::test]
    async fn test_capability_failure_is_recoverable() {
        // "denied" is not in the allow-list, so the invocation is rejected,
        // but the strategy recovers by finishing on the next round
        let strategy = Script::new(vec![(
            "p",
            vec![
                Directive::Action {
                    capability: "denied".into(),
                    request: Value::Null,
                },
                Directive::FinalAnswer(json!("recovered")),
            ],
        )]);
        let (orchestrator, _events) = orchestrator_with(strategy, OrchestratorConfig::default());

        let root = orchestrator
            .create_root(Category::Root, Duration::from_secs(10))
            .unwrap();
        let result = orchestrator.run(&root, "p").await.unwrap();
        assert_eq!(result, json!("recovered"));

        let error_observation = root
            .steps()
            .into_iter()
            .find(|s| s.kind == StepKind::Observation && s.payload["ok"] == json!(false))
            .unwrap();
        assert!(error_observation.payload["error"]
            .as_str()
            .unwrap()
            .contains("permission denied"));
    }

    #[tokio::test]
    async fn test_depth_rejection_is_an_observation_not_a_crash() {
        let spec = SpawnSpec::new("sub", Category::Scoped).with_capabilities(["echo"]);
        let strategy = Script::new(vec![(
            "p",
            vec![
                Directive::Spawn(vec![spec]),
                Directive::FinalAnswer(json!("made do without children")),
            ],
        )]);
        let config = OrchestratorConfig {
            max_depth: 0,
            ..Default::default()
        };
        let (orchestrator, _events) = orchestrator_with(strategy, config);

        let root = orchestrator
            .create_root(Category::Root, Duration::from_secs(10))
            .unwrap();
        let result = orchestrator.run(&root, "p").await.unwrap();

        assert_eq!(result, json!("made do without children"));
        assert_eq!(root.state(), SessionState::Completed);
        let rejection = root
            .steps()
            .into_iter()
            .find(|s| s.kind == StepKind::Observation)
            .unwrap();
        assert!(rejection.payload["error"]
            .as_str()
            .unwrap()
            .contains("exceeds ceiling"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_elapse_times_the_session_out() {
        struct Stall;
        #[async_trait]
        impl CapabilityProvider for Stall {
            async fn call(&self, _request: Value) -> anyhow::Result<Value> {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(Value::Null)
            }
        }
        let permissions = PermissionRegistry::new().grant(Category::Root, ["stall"]);
        let mut capabilities = CapabilityRegistry::new();
        capabilities.register("stall", Arc::new(Stall));
        let strategy = Arc::new(Always(Directive::Action {
            capability: "stall".into(),
            request: Value::Null,
        }));
        let (orchestrator, _events) = Orchestrator::new(
            OrchestratorConfig::default(),
            permissions,
            capabilities,
            strategy,
        );

        let root = orchestrator
            .create_root(Category::Root, Duration::from_secs(2))
            .unwrap();
        let err = orchestrator.run(&root, "p").await.unwrap_err();

        assert!(matches!(err, crate::error::ConclaveError::RootTimedOut));
        assert_eq!(root.state(), SessionState::TimedOut);
    }
}
