use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{instrument, warn};

use usher_core::protocol::{Decision, DenyReason, Idempotency, ToolCallRequest, ToolDescriptor};
use usher_core::session::Session;
use usher_core::tools::{Tool, ToolContext, ToolError, ToolOutput};

use crate::guard::ProtocolGuard;

const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(30);

/// Registry of available tools. Invocation re-validates through the Protocol
/// Guard - never trust a single gate - runs under the tool timeout, and
/// applies the bounded retry policy. The registry returns the effect delta;
/// it never mutates the Session Store.
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
    tool_timeout: Duration,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
            tool_timeout: DEFAULT_TOOL_TIMEOUT,
        }
    }

    pub fn with_tool_timeout(mut self, timeout: Duration) -> Self {
        self.tool_timeout = timeout;
        self
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.descriptor().name;
        self.tools.insert(name, tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).map(Arc::clone)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn count(&self) -> usize {
        self.tools.len()
    }

    /// Descriptors of all registered tools, sorted by name.
    pub fn descriptors(&self) -> Vec<ToolDescriptor> {
        let mut defs: Vec<ToolDescriptor> =
            self.tools.values().map(|t| t.descriptor()).collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    /// Build a guard over this registry's descriptors.
    pub fn guard(&self) -> ProtocolGuard {
        ProtocolGuard::new(self.descriptors())
    }

    /// Execute a validated tool call. Retryable failures get one transparent
    /// re-attempt; non-idempotent tools rely on the context's dedup token to
    /// make that re-attempt safe.
    #[instrument(skip(self, guard, session, ctx), fields(session_id = %ctx.session_id, tool = %call.name))]
    pub async fn invoke(
        &self,
        guard: &ProtocolGuard,
        call: &ToolCallRequest,
        session: &Session,
        ctx: &ToolContext,
    ) -> Result<ToolOutput, ToolError> {
        match guard.evaluate(session, call) {
            Decision::Allow => {}
            Decision::Deny(DenyReason::UnknownTool { name }) => {
                return Err(ToolError::InvalidArguments(format!("unknown tool: {name}")));
            }
            Decision::Deny(DenyReason::PreconditionFailed { name }) => {
                return Err(ToolError::PreconditionFailed(name));
            }
            Decision::Deny(DenyReason::IdentifierConflict { name }) => {
                return Err(ToolError::IdentifierConflict(name));
            }
            Decision::RequiresConfirmation { .. } => {
                return Err(ToolError::PreconditionFailed("consent not granted".into()));
            }
        }

        let tool = self
            .get(&call.name)
            .ok_or_else(|| ToolError::InvalidArguments(format!("unknown tool: {}", call.name)))?;
        let idempotency = tool.descriptor().idempotency;

        let mut attempt = 0u32;
        loop {
            let result = self.execute_once(&tool, call, ctx).await;
            match result {
                Ok(output) => return Ok(output),
                Err(e) if e.is_retryable() && attempt == 0 => {
                    match idempotency {
                        Idempotency::Idempotent => {
                            warn!(tool = %call.name, error = %e, "retrying idempotent tool");
                        }
                        Idempotency::NonIdempotent => {
                            warn!(
                                tool = %call.name,
                                error = %e,
                                dedup_token = %ctx.dedup_token,
                                "retrying non-idempotent tool under dedup token"
                            );
                        }
                    }
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn execute_once(
        &self,
        tool: &Arc<dyn Tool>,
        call: &ToolCallRequest,
        ctx: &ToolContext,
    ) -> Result<ToolOutput, ToolError> {
        tokio::select! {
            _ = ctx.abort.cancelled() => Err(ToolError::Cancelled),
            result = tokio::time::timeout(self.tool_timeout, tool.execute(call.arguments.clone(), ctx)) => {
                match result {
                    Ok(inner) => inner,
                    Err(_) => Err(ToolError::Timeout(self.tool_timeout)),
                }
            }
        }
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio_util::sync::CancellationToken;
    use usher_core::ids::SessionId;
    use usher_core::protocol::{EffectDelta, FlagMap, IdentifierMap};

    struct StubTool {
        descriptor: ToolDescriptor,
        failures_before_success: AtomicUsize,
        calls: AtomicUsize,
    }

    impl StubTool {
        fn new(descriptor: ToolDescriptor) -> Self {
            Self {
                descriptor,
                failures_before_success: AtomicUsize::new(0),
                calls: AtomicUsize::new(0),
            }
        }

        fn failing_first(descriptor: ToolDescriptor, failures: usize) -> Self {
            let tool = Self::new(descriptor);
            tool.failures_before_success.store(failures, Ordering::Relaxed);
            tool
        }
    }

    #[async_trait]
    impl Tool for StubTool {
        fn descriptor(&self) -> ToolDescriptor {
            self.descriptor.clone()
        }

        async fn execute(
            &self,
            _args: serde_json::Value,
            _ctx: &ToolContext,
        ) -> Result<ToolOutput, ToolError> {
            let call = self.calls.fetch_add(1, Ordering::Relaxed);
            if call < self.failures_before_success.load(Ordering::Relaxed) {
                return Err(ToolError::ExternalService("transient outage".into()));
            }
            Ok(ToolOutput {
                content: serde_json::json!({"ok": true}),
                delta: EffectDelta::new().with_flag("stub_ran", true),
            })
        }
    }

    struct SlowTool;

    #[async_trait]
    impl Tool for SlowTool {
        fn descriptor(&self) -> ToolDescriptor {
            ToolDescriptor::new("slow_tool", "sleeps forever")
        }

        async fn execute(
            &self,
            _args: serde_json::Value,
            _ctx: &ToolContext,
        ) -> Result<ToolOutput, ToolError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(ToolOutput::content_only(serde_json::json!({})))
        }
    }

    fn ctx(session: &Session) -> ToolContext {
        ToolContext::new(
            session.id.clone(),
            session.next_turn_index(),
            session.flags.clone(),
            session.identifiers.clone(),
            CancellationToken::new(),
        )
    }

    fn session() -> Session {
        Session::new(SessionId::new())
    }

    #[test]
    fn register_and_query() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(StubTool::new(ToolDescriptor::new("alpha", "a"))));
        registry.register(Arc::new(StubTool::new(ToolDescriptor::new("beta", "b"))));

        assert!(registry.contains("alpha"));
        assert!(!registry.contains("gamma"));
        assert_eq!(registry.count(), 2);
        assert_eq!(registry.names(), vec!["alpha", "beta"]);
        assert_eq!(registry.descriptors()[0].name, "alpha");
    }

    #[tokio::test]
    async fn invoke_happy_path() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(StubTool::new(ToolDescriptor::new("stub", "test"))));
        let guard = registry.guard();
        let s = session();

        let call = ToolCallRequest::new("stub", serde_json::json!({}));
        let output = registry.invoke(&guard, &call, &s, &ctx(&s)).await.unwrap();
        assert_eq!(output.content["ok"], true);
        assert_eq!(output.delta.flags.len(), 1);
    }

    #[tokio::test]
    async fn invoke_revalidates_preconditions() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(StubTool::new(
            ToolDescriptor::new("gated", "test").with_precondition("customer_id"),
        )));
        let guard = registry.guard();
        let s = session();

        let call = ToolCallRequest::new("gated", serde_json::json!({}));
        let err = registry.invoke(&guard, &call, &s, &ctx(&s)).await.unwrap_err();
        assert!(matches!(err, ToolError::PreconditionFailed(name) if name == "customer_id"));
    }

    #[tokio::test]
    async fn invoke_rejects_unknown_tool() {
        let registry = ToolRegistry::new();
        let guard = registry.guard();
        let s = session();

        let call = ToolCallRequest::new("nope", serde_json::json!({}));
        let err = registry.invoke(&guard, &call, &s, &ctx(&s)).await.unwrap_err();
        assert!(matches!(err, ToolError::InvalidArguments(_)));
    }

    #[tokio::test]
    async fn transient_failure_retried_once() {
        let mut registry = ToolRegistry::new();
        let tool = Arc::new(StubTool::failing_first(ToolDescriptor::new("flaky", "test"), 1));
        registry.register(Arc::clone(&tool) as Arc<dyn Tool>);
        let guard = registry.guard();
        let s = session();

        let call = ToolCallRequest::new("flaky", serde_json::json!({}));
        let output = registry.invoke(&guard, &call, &s, &ctx(&s)).await.unwrap();
        assert_eq!(output.content["ok"], true);
        assert_eq!(tool.calls.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn two_transient_failures_surface() {
        let mut registry = ToolRegistry::new();
        let tool = Arc::new(StubTool::failing_first(ToolDescriptor::new("down", "test"), 2));
        registry.register(Arc::clone(&tool) as Arc<dyn Tool>);
        let guard = registry.guard();
        let s = session();

        let call = ToolCallRequest::new("down", serde_json::json!({}));
        let err = registry.invoke(&guard, &call, &s, &ctx(&s)).await.unwrap_err();
        assert!(matches!(err, ToolError::ExternalService(_)));
        assert_eq!(tool.calls.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn timeout_maps_to_tool_error() {
        let mut registry = ToolRegistry::new().with_tool_timeout(Duration::from_millis(20));
        registry.register(Arc::new(SlowTool));
        let guard = registry.guard();
        let s = session();

        let call = ToolCallRequest::new("slow_tool", serde_json::json!({}));
        let err = registry.invoke(&guard, &call, &s, &ctx(&s)).await.unwrap_err();
        assert!(matches!(err, ToolError::Timeout(_)));
    }

    #[tokio::test]
    async fn cancellation_stops_execution() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(SlowTool));
        let guard = registry.guard();
        let s = session();

        let mut tctx = ctx(&s);
        tctx.abort = CancellationToken::new();
        tctx.abort.cancel();

        let call = ToolCallRequest::new("slow_tool", serde_json::json!({}));
        let err = registry.invoke(&guard, &call, &s, &tctx).await.unwrap_err();
        assert!(matches!(err, ToolError::Cancelled));
    }

    #[tokio::test]
    async fn consent_gate_blocks_at_registry_too() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(StubTool::new(
            ToolDescriptor::new("gated", "test").with_consent("consent_given", "May I?"),
        )));
        let guard = registry.guard();
        let s = session();

        let call = ToolCallRequest::new("gated", serde_json::json!({}));
        let err = registry.invoke(&guard, &call, &s, &ctx(&s)).await.unwrap_err();
        assert!(matches!(err, ToolError::PreconditionFailed(_)));
    }
}
