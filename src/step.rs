//! The step orchestrator: wires the streaming merge's finalized tool calls
//! into a [`Toolset`] and returns futures for their results without
//! mutating the caller's context.

use crate::error::{ChatProviderError, ToolError};
use crate::merge::{self, Callbacks};
use crate::model::{GenerateResult, Message, TokenUsage, Tool, ToolCall};
use crate::provider::ChatProvider;
use crate::tooling::{ToolResult, ToolResultFuture, Toolset};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

/// Everything a step needs to know about the conversation so far. `step`
/// reads from this but never writes to it; appending the assistant's message
/// and the tool results is the caller's responsibility.
pub trait Context {
    fn system_prompt(&self) -> &str;
    fn tools(&self) -> Vec<Tool>;
    fn history(&self) -> Vec<Message>;
}

/// The outcome of one `step` call.
pub struct StepResult {
    pub message: Message,
    pub id: Option<String>,
    pub usage: Option<TokenUsage>,
    pub tool_calls: Vec<ToolCall>,
    tool_result_futures: HashMap<String, ToolResultFuture>,
}

fn cancelled_result(tool_call_id: &str) -> ToolResult {
    ToolResult {
        tool_call_id: tool_call_id.to_string(),
        result: Err(ToolError::cancelled()),
    }
}

impl StepResult {
    /// Await every tool result, in `tool_calls` order (first-seen during the
    /// merge). A call whose future never delivers a result — because
    /// cancellation aborted its task before it could send one — resolves to
    /// a cancelled `ToolResult` rather than being silently dropped, so this
    /// always returns exactly `tool_calls.len()` entries.
    pub async fn tool_results(mut self) -> Vec<ToolResult> {
        let mut out = Vec::with_capacity(self.tool_calls.len());
        for call in &self.tool_calls {
            let result = match self.tool_result_futures.remove(&call.id) {
                Some(rx) => rx.await.unwrap_or_else(|_| cancelled_result(&call.id)),
                None => cancelled_result(&call.id),
            };
            out.push(result);
        }
        out
    }
}

/// Run one generation step: call the provider, merge its stream into a
/// canonical message, and dispatch every finalized tool call to `toolset`.
///
/// Dispatch happens inline as each tool call is finalized during the merge,
/// in `on_tool_call` order, concurrently with the rest of the stream still
/// being consumed. `step` returns as soon as the merge completes and every
/// call has been dispatched — it never waits for a tool to finish running.
///
/// `on_message_part` fires for every raw part as it streams in.
/// `on_tool_result`, if supplied, fires once per call as its task resolves
/// (not in any particular order, and possibly after `step` has already
/// returned); `tool_results()` on the returned `StepResult` is how a caller
/// actually waits for every result.
///
/// `cancel` is checked by the merge loop (aborting the HTTP stream) and
/// forwarded to each dispatched tool call (aborting its task); either way,
/// `tool_results()` still resolves every entry, as a cancelled result.
pub async fn step<'a>(
    provider: &dyn ChatProvider,
    context: &dyn Context,
    toolset: &dyn Toolset,
    cancel: CancellationToken,
    on_message_part: Option<Box<dyn FnMut(&crate::model::StreamedPart) + Send + 'a>>,
    on_tool_result: Option<Box<dyn Fn(&ToolResult) + Send + Sync + 'static>>,
) -> Result<StepResult, ChatProviderError> {
    let tools = context.tools();
    let system_prompt = context.system_prompt().to_string();
    let history = context.history();
    let on_tool_result: Option<Arc<dyn Fn(&ToolResult) + Send + Sync>> =
        on_tool_result.map(Arc::from);

    let finalized: Mutex<Vec<ToolCall>> = Mutex::new(Vec::new());
    let tool_result_futures: Mutex<HashMap<String, ToolResultFuture>> = Mutex::new(HashMap::new());

    let callbacks = Callbacks {
        on_part: on_message_part,
        on_tool_call: Some(Box::new(|call: &ToolCall| {
            finalized.lock().unwrap().push(call.clone());

            // `Toolset::handle` is non-blocking (the work runs on its own
            // spawned task), so dispatching here overlaps it with the rest
            // of the stream instead of waiting for the merge to finish.
            let raw_rx = toolset.handle(call.clone(), cancel.clone());

            // Re-wrap into a fresh channel: a watcher task drains `raw_rx`
            // (so it can fire `on_tool_result` without blocking this
            // closure or `step` itself) and forwards the result here, which
            // is what `tool_results()` later awaits.
            let (tx, rx) = oneshot::channel();
            let tool_call_id = call.id.clone();
            let cb = on_tool_result.clone();
            tokio::spawn(async move {
                let result = raw_rx.await.unwrap_or_else(|_| cancelled_result(&tool_call_id));
                if let Some(cb) = &cb {
                    cb(&result);
                }
                let _ = tx.send(result);
            });

            tool_result_futures.lock().unwrap().insert(call.id.clone(), rx);
        })),
    };

    let GenerateResult { id, message, usage } =
        merge::generate(provider, &system_prompt, &tools, &history, callbacks, &cancel).await?;

    let tool_calls = finalized.into_inner().unwrap();
    let tool_result_futures = tool_result_futures.into_inner().unwrap();

    Ok(StepResult {
        message,
        id,
        usage,
        tool_calls,
        tool_result_futures,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ContentPart, FunctionBody, Role, StreamedPart};
    use crate::provider::mock::MockChatProvider;
    use crate::tooling::{CallableTool, SimpleToolset, ToolOk, ToolOutcome};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct Echo;

    #[async_trait::async_trait]
    impl CallableTool for Echo {
        fn name(&self) -> &str {
            "echo"
        }
        fn description(&self) -> &str {
            "echoes its input"
        }
        fn parameters(&self) -> serde_json::Value {
            serde_json::json!({"type": "object", "properties": {"text": {"type": "string"}}})
        }
        async fn call(&self, arguments: serde_json::Value) -> ToolOutcome {
            Ok(ToolOk::new(arguments["text"].as_str().unwrap_or("").to_string()))
        }
    }

    struct FixedContext {
        system_prompt: String,
        tools: Vec<Tool>,
        history: Vec<Message>,
    }

    impl Context for FixedContext {
        fn system_prompt(&self) -> &str {
            &self.system_prompt
        }
        fn tools(&self) -> Vec<Tool> {
            self.tools.clone()
        }
        fn history(&self) -> Vec<Message> {
            self.history.clone()
        }
    }

    #[tokio::test]
    async fn dispatches_finalized_tool_calls_and_collects_results() {
        let provider = MockChatProvider::new(vec![StreamedPart::ToolCall(ToolCall {
            id: "1".to_string(),
            function: FunctionBody {
                name: "echo".to_string(),
                arguments: Some(r#"{"text":"hi"}"#.to_string()),
            },
            extras: Default::default(),
        })]);
        let toolset = SimpleToolset::new().register(Echo).unwrap();
        let ctx = FixedContext {
            system_prompt: String::new(),
            tools: vec![],
            history: vec![],
        };

        let result = step(&provider, &ctx, &toolset, CancellationToken::new(), None, None)
            .await
            .unwrap();
        assert_eq!(result.tool_calls.len(), 1);
        let outcomes = result.tool_results().await;
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].result.as_ref().unwrap().output, "hi");
    }

    #[tokio::test]
    async fn on_tool_result_callback_observes_every_dispatch() {
        let provider = MockChatProvider::new(vec![StreamedPart::ToolCall(ToolCall {
            id: "1".to_string(),
            function: FunctionBody {
                name: "echo".to_string(),
                arguments: Some(r#"{"text":"hi"}"#.to_string()),
            },
            extras: Default::default(),
        })]);
        let toolset = SimpleToolset::new().register(Echo).unwrap();
        let ctx = FixedContext {
            system_prompt: String::new(),
            tools: vec![],
            history: vec![],
        };

        let seen = Arc::new(AtomicUsize::new(0));
        let seen_cb = seen.clone();
        let on_tool_result: Box<dyn Fn(&ToolResult) + Send + Sync> =
            Box::new(move |_| { seen_cb.fetch_add(1, Ordering::SeqCst); });
        let result = step(
            &provider,
            &ctx,
            &toolset,
            CancellationToken::new(),
            None,
            Some(on_tool_result),
        )
        .await
        .unwrap();
        assert_eq!(result.message.role, Role::Assistant);
        // `on_tool_result` fires from a spawned watcher, not before `step`
        // returns; `tool_results()` is what actually waits for it.
        let outcomes = result.tool_results().await;
        assert_eq!(outcomes.len(), 1);
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn step_does_not_mutate_context() {
        let provider = MockChatProvider::new(vec![StreamedPart::Content(ContentPart::text("ok"))]);
        let toolset = SimpleToolset::new();
        let ctx = FixedContext {
            system_prompt: "be nice".to_string(),
            tools: vec![],
            history: vec![Message::user("hello")],
        };
        let _ = step(&provider, &ctx, &toolset, CancellationToken::new(), None, None)
            .await
            .unwrap();
        assert_eq!(ctx.system_prompt(), "be nice");
        assert_eq!(ctx.history().len(), 1);
    }

    struct SlowTool;

    #[async_trait::async_trait]
    impl CallableTool for SlowTool {
        fn name(&self) -> &str {
            "slow"
        }
        fn description(&self) -> &str {
            "sleeps past any reasonable test timeout"
        }
        fn parameters(&self) -> serde_json::Value {
            serde_json::json!({"type": "object"})
        }
        async fn call(&self, _arguments: serde_json::Value) -> ToolOutcome {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            unreachable!()
        }
    }

    #[tokio::test]
    async fn cancelling_mid_flight_synthesizes_a_cancelled_result() {
        let provider = MockChatProvider::new(vec![StreamedPart::ToolCall(ToolCall {
            id: "1".to_string(),
            function: FunctionBody {
                name: "slow".to_string(),
                arguments: Some("{}".to_string()),
            },
            extras: Default::default(),
        })]);
        let toolset = SimpleToolset::new().register(SlowTool).unwrap();
        let ctx = FixedContext {
            system_prompt: String::new(),
            tools: vec![],
            history: vec![],
        };

        let cancel = CancellationToken::new();
        let result = step(&provider, &ctx, &toolset, cancel.clone(), None, None)
            .await
            .unwrap();
        cancel.cancel();
        let outcomes = result.tool_results().await;
        assert_eq!(outcomes.len(), 1);
        let err = outcomes[0].result.as_ref().unwrap_err();
        assert_eq!(err.kind, crate::error::ToolErrorKind::Runtime);
        assert_eq!(err.message, "cancelled");
    }
}
