//! Capability providers and the permission-checked invocation boundary
//!
//! Every external call a session makes goes through [`CapabilityInvoker`]:
//! allow-list check, call budget, remaining-deadline enforcement, and an
//! observation appended to the session's step log on success and failure
//! alike. Failures are observable inputs to further reasoning, never
//! silently swallowed.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::InvokeError;
use crate::protocol::{Event, StepKind};
use crate::session::SessionHandle;

/// An external collaborator invocable by name
///
/// Providers are opaque to the core: requests and responses are arbitrary
/// JSON, and provider-specific failures are carried as `anyhow::Error`.
#[async_trait]
pub trait CapabilityProvider: Send + Sync {
    async fn call(&self, request: Value) -> anyhow::Result<Value>;
}

/// Registry of capability providers, shared read-only across sessions
#[derive(Default)]
pub struct CapabilityRegistry {
    providers: HashMap<String, Arc<dyn CapabilityProvider>>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self {
            providers: HashMap::new(),
        }
    }

    /// Register a provider under a capability name
    pub fn register(&mut self, name: impl Into<String>, provider: Arc<dyn CapabilityProvider>) {
        self.providers.insert(name.into(), provider);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn CapabilityProvider>> {
        self.providers.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.providers.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

/// Uniform call boundary between sessions and capability providers
pub struct CapabilityInvoker {
    registry: Arc<CapabilityRegistry>,
    event_tx: mpsc::UnboundedSender<Event>,
}

impl CapabilityInvoker {
    pub fn new(registry: Arc<CapabilityRegistry>, event_tx: mpsc::UnboundedSender<Event>) -> Self {
        Self { registry, event_tx }
    }

    /// Invoke a capability on behalf of a session
    ///
    /// The session's remaining time budget is a hard upper bound on the
    /// call. Exactly one observation step is appended per invocation
    /// attempt, whether or not the call was dispatched.
    pub async fn invoke(
        &self,
        session: &SessionHandle,
        capability: &str,
        request: Value,
    ) -> Result<Value, InvokeError> {
        let started = Instant::now();

        if let Err(err) = self.preflight(session, capability) {
            self.record(session, capability, started, Err(&err));
            return Err(err);
        }

        let Some(provider) = self.registry.get(capability) else {
            let err = InvokeError::UnknownCapability(capability.to_string());
            self.record(session, capability, started, Err(&err));
            return Err(err);
        };

        session.note_capability_call();

        let remaining = session.remaining();
        let result = if remaining.is_zero() {
            Err(InvokeError::Timeout(capability.to_string()))
        } else {
            tokio::select! {
                _ = session.cancel_token().cancelled() => Err(InvokeError::Cancelled),
                called = tokio::time::timeout(remaining, provider.call(request)) => {
                    match called {
                        Err(_) => Err(InvokeError::Timeout(capability.to_string())),
                        Ok(Err(cause)) => Err(InvokeError::Capability {
                            name: capability.to_string(),
                            source: cause,
                        }),
                        Ok(Ok(response)) => Ok(response),
                    }
                }
            }
        };

        match result {
            Ok(response) => {
                self.record(session, capability, started, Ok(&response));
                Ok(response)
            }
            Err(err) => {
                self.record(session, capability, started, Err(&err));
                Err(err)
            }
        }
    }

    /// Checks that must pass before the provider is even resolved
    fn preflight(&self, session: &SessionHandle, capability: &str) -> Result<(), InvokeError> {
        if session.cancel_token().is_cancelled() {
            return Err(InvokeError::Cancelled);
        }
        if !session.is_allowed(capability) {
            return Err(InvokeError::PermissionDenied(capability.to_string()));
        }
        let used = session.calls_used();
        let max = session.max_capability_calls();
        if used >= max {
            return Err(InvokeError::CallBudgetExhausted { used, max });
        }
        Ok(())
    }

    /// Append the observation step and emit the audit event
    fn record(
        &self,
        session: &SessionHandle,
        capability: &str,
        started: Instant,
        result: Result<&Value, &InvokeError>,
    ) {
        let elapsed_ms = started.elapsed().as_millis() as u64;
        let (success, error, payload) = match result {
            Ok(response) => (
                true,
                None,
                json!({
                    "ok": true,
                    "capability": capability,
                    "elapsed_ms": elapsed_ms,
                    "response": response,
                }),
            ),
            Err(err) => (
                false,
                Some(err.to_string()),
                json!({
                    "ok": false,
                    "capability": capability,
                    "elapsed_ms": elapsed_ms,
                    "error": err.to_string(),
                }),
            ),
        };

        session.record_step(StepKind::Observation, payload);

        if success {
            debug!(
                session_id = %session.id,
                capability = capability,
                elapsed_ms = elapsed_ms,
                "Capability call succeeded"
            );
        } else {
            warn!(
                session_id = %session.id,
                capability = capability,
                error = error.as_deref().unwrap_or(""),
                "Capability call failed"
            );
        }

        let _ = self.event_tx.send(Event::CapabilityInvoked {
            session_id: session.id,
            parent_id: session.parent_id,
            depth: session.depth,
            capability: capability.to_string(),
            success,
            error,
            elapsed_ms,
            at: Utc::now(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use crate::protocol::Category;
    use crate::session::Session;

    struct Echo;

    #[async_trait]
    impl CapabilityProvider for Echo {
        async fn call(&self, request: Value) -> anyhow::Result<Value> {
            Ok(json!({ "echo": request }))
        }
    }

    struct Failing;

    #[async_trait]
    impl CapabilityProvider for Failing {
        async fn call(&self, _request: Value) -> anyhow::Result<Value> {
            Err(anyhow::anyhow!("upstream unavailable"))
        }
    }

    struct Slow;

    #[async_trait]
    impl CapabilityProvider for Slow {
        async fn call(&self, _request: Value) -> anyhow::Result<Value> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(Value::Null)
        }
    }

    struct Counting(AtomicUsize);

    #[async_trait]
    impl CapabilityProvider for Counting {
        async fn call(&self, _request: Value) -> anyhow::Result<Value> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(Value::Null)
        }
    }

    fn invoker_with(
        entries: Vec<(&str, Arc<dyn CapabilityProvider>)>,
    ) -> (CapabilityInvoker, mpsc::UnboundedReceiver<Event>) {
        let mut registry = CapabilityRegistry::new();
        for (name, provider) in entries {
            registry.register(name, provider);
        }
        let (tx, rx) = mpsc::unbounded_channel();
        (CapabilityInvoker::new(Arc::new(registry), tx), rx)
    }

    fn session_allowing(
        capabilities: &[&str],
        budget: Duration,
        tx: mpsc::UnboundedSender<Event>,
    ) -> SessionHandle {
        let session = Session::new(
            None,
            Category::Scoped,
            capabilities.iter().map(|s| s.to_string()).collect(),
            Instant::now() + budget,
            10,
            20,
            tx,
        );
        SessionHandle::new(session)
    }

    #[tokio::test]
    async fn test_invoke_success_appends_observation() {
        let (invoker, _rx) = invoker_with(vec![("echo", Arc::new(Echo))]);
        let (tx, _srx) = mpsc::unbounded_channel();
        let session = session_allowing(&["echo"], Duration::from_secs(5), tx);

        let response = invoker
            .invoke(&session, "echo", json!({"q": 1}))
            .await
            .unwrap();
        assert_eq!(response, json!({"echo": {"q": 1}}));

        let steps = session.steps();
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].kind, StepKind::Observation);
        assert_eq!(steps[0].payload["ok"], json!(true));
        assert_eq!(session.calls_used(), 1);
    }

    #[tokio::test]
    async fn test_permission_denied_makes_no_call() {
        let counter = Arc::new(Counting(AtomicUsize::new(0)));
        let (invoker, mut rx) = invoker_with(vec![("restricted", counter.clone())]);
        let (tx, _srx) = mpsc::unbounded_channel();
        let session = session_allowing(&["other"], Duration::from_secs(5), tx);

        let err = invoker
            .invoke(&session, "restricted", Value::Null)
            .await
            .unwrap_err();
        assert!(matches!(err, InvokeError::PermissionDenied(_)));

        // No external call was issued, exactly one error observation appended
        assert_eq!(counter.0.load(Ordering::SeqCst), 0);
        let steps = session.steps();
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].payload["ok"], json!(false));
        assert_eq!(session.calls_used(), 0);

        let event = rx.try_recv().unwrap();
        assert!(matches!(
            event,
            Event::CapabilityInvoked { success: false, .. }
        ));
    }

    #[tokio::test]
    async fn test_unknown_capability() {
        let (invoker, _rx) = invoker_with(vec![]);
        let (tx, _srx) = mpsc::unbounded_channel();
        let session = session_allowing(&["missing"], Duration::from_secs(5), tx);

        let err = invoker
            .invoke(&session, "missing", Value::Null)
            .await
            .unwrap_err();
        assert!(matches!(err, InvokeError::UnknownCapability(_)));
        assert_eq!(session.steps().len(), 1);
    }

    #[tokio::test]
    async fn test_provider_error_is_wrapped_and_observed() {
        let (invoker, _rx) = invoker_with(vec![("flaky", Arc::new(Failing))]);
        let (tx, _srx) = mpsc::unbounded_channel();
        let session = session_allowing(&["flaky"], Duration::from_secs(5), tx);

        let err = invoker
            .invoke(&session, "flaky", Value::Null)
            .await
            .unwrap_err();
        assert!(matches!(err, InvokeError::Capability { .. }));
        assert!(err.to_string().contains("upstream unavailable"));

        let steps = session.steps();
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].payload["ok"], json!(false));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_bounds_the_call() {
        let (invoker, _rx) = invoker_with(vec![("slow", Arc::new(Slow))]);
        let (tx, _srx) = mpsc::unbounded_channel();
        let session = session_allowing(&["slow"], Duration::from_secs(1), tx);

        let err = invoker
            .invoke(&session, "slow", Value::Null)
            .await
            .unwrap_err();
        assert!(matches!(err, InvokeError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_call_budget_exhaustion() {
        let (invoker, _rx) = invoker_with(vec![("echo", Arc::new(Echo))]);
        let (tx, _srx) = mpsc::unbounded_channel();
        let session = Session::new(
            None,
            Category::Scoped,
            ["echo".to_string()].into_iter().collect(),
            Instant::now() + Duration::from_secs(5),
            10,
            2,
            tx,
        );
        let session = SessionHandle::new(session);

        assert!(invoker.invoke(&session, "echo", Value::Null).await.is_ok());
        assert!(invoker.invoke(&session, "echo", Value::Null).await.is_ok());
        let err = invoker
            .invoke(&session, "echo", Value::Null)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            InvokeError::CallBudgetExhausted { used: 2, max: 2 }
        ));
    }

    #[tokio::test]
    async fn test_cancelled_session_refuses_calls() {
        let counter = Arc::new(Counting(AtomicUsize::new(0)));
        let (invoker, _rx) = invoker_with(vec![("count", counter.clone())]);
        let (tx, _srx) = mpsc::unbounded_channel();
        let session = session_allowing(&["count"], Duration::from_secs(5), tx);

        session.request_cancel();
        let err = invoker
            .invoke(&session, "count", Value::Null)
            .await
            .unwrap_err();
        assert!(matches!(err, InvokeError::Cancelled));
        assert_eq!(counter.0.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_registry_lookup() {
        let mut registry = CapabilityRegistry::new();
        assert!(registry.is_empty());
        registry.register("echo", Arc::new(Echo));
        assert_eq!(registry.len(), 1);
        assert!(registry.get("echo").is_some());
        assert!(registry.get("other").is_none());
    }
}
