//! [`SimpleToolset`]: the concurrent-dispatch `Toolset` most callers use.
//!
//! Registration validates that a tool's `parameters` is itself a well-formed
//! JSON Schema (Draft 2020-12); dispatch validates that a call's arguments
//! satisfy that schema before the callable ever sees them.

use super::{CallableTool, ToolOutcome, ToolResult, ToolResultFuture, Toolset};
use crate::error::ToolError;
use crate::model::{Tool, ToolCall};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

/// A tool whose `parameters` failed JSON-Schema meta-validation at
/// registration time.
#[derive(Debug, thiserror::Error)]
#[error("tool `{name}` has an invalid parameters schema: {detail}")]
pub struct ToolRegistrationError {
    pub name: String,
    pub detail: String,
}

/// A toolset backed by a name → [`CallableTool`] map, dispatching each call
/// concurrently as an independent task.
#[derive(Clone, Default)]
pub struct SimpleToolset {
    tools: HashMap<String, Arc<dyn CallableTool>>,
}

impl SimpleToolset {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool, rejecting it if `parameters` is not a valid
    /// Draft 2020-12 schema. Duplicate names replace the prior entry.
    pub fn register<T: CallableTool + 'static>(
        mut self,
        tool: T,
    ) -> Result<Self, ToolRegistrationError> {
        let params = tool.parameters();
        if let Err(e) = jsonschema::meta::validate(&params) {
            return Err(ToolRegistrationError {
                name: tool.name().to_string(),
                detail: e.to_string(),
            });
        }
        self.tools.insert(tool.name().to_string(), Arc::new(tool));
        Ok(self)
    }

    pub fn has_tool(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn tool_names(&self) -> Vec<&str> {
        self.tools.keys().map(|s| s.as_str()).collect()
    }
}

/// Compose two toolsets, the right-hand side's entries winning on name
/// collision (mirrors the registration-time "last write wins" rule).
impl std::ops::Add for SimpleToolset {
    type Output = SimpleToolset;

    fn add(mut self, rhs: SimpleToolset) -> SimpleToolset {
        self.tools.extend(rhs.tools);
        self
    }
}

impl std::ops::AddAssign for SimpleToolset {
    fn add_assign(&mut self, rhs: SimpleToolset) {
        self.tools.extend(rhs.tools);
    }
}

#[async_trait::async_trait]
impl Toolset for SimpleToolset {
    fn tools(&self) -> Vec<Tool> {
        self.tools.values().map(|t| t.as_tool()).collect()
    }

    fn handle(&self, call: ToolCall, cancel: CancellationToken) -> ToolResultFuture {
        let (tx, rx) = oneshot::channel();

        let tool = match self.tools.get(&call.function.name) {
            Some(t) => t.clone(),
            None => {
                let _ = tx.send(ToolResult {
                    tool_call_id: call.id,
                    result: Err(ToolError::not_found(&call.function.name)),
                });
                return rx;
            }
        };

        let arguments = match call.parsed_arguments() {
            Ok(v) => v,
            Err(e) => {
                let _ = tx.send(ToolResult {
                    tool_call_id: call.id,
                    result: Err(ToolError::parse(e)),
                });
                return rx;
            }
        };

        let schema = tool.parameters();
        let validator = match jsonschema::validator_for(&schema) {
            Ok(v) => v,
            Err(e) => {
                let _ = tx.send(ToolResult {
                    tool_call_id: call.id,
                    result: Err(ToolError::validate(e)),
                });
                return rx;
            }
        };
        if let Err(e) = validator.validate(&arguments) {
            let _ = tx.send(ToolResult {
                tool_call_id: call.id,
                result: Err(ToolError::validate(e)),
            });
            return rx;
        }

        let tool_call_id = call.id;
        let task = tokio::spawn(async move {
            let outcome: ToolOutcome = std::panic::AssertUnwindSafe(tool.call(arguments))
                .catch_unwind()
                .await
                .unwrap_or_else(|_| Err(ToolError::runtime("tool panicked")));
            let _ = tx.send(ToolResult {
                tool_call_id,
                result: outcome,
            });
        });

        // Retain the spawned task's abort handle and kill it if `cancel`
        // fires before it finishes. Dropping `tx` unsent lets the receiver's
        // `.await` fail, which the caller turns into a cancelled result.
        let abort = task.abort_handle();
        tokio::spawn(async move {
            cancel.cancelled().await;
            abort.abort();
        });

        rx
    }
}

/// Small adapter so a plain `async fn` future can be driven through
/// `catch_unwind` without pulling in `futures::FutureExt` at every call site.
trait CatchUnwindExt: std::future::Future + Sized {
    fn catch_unwind(self) -> futures::future::CatchUnwind<futures::future::AssertUnwindSafe<Self>>
    where
        Self: std::panic::UnwindSafe,
    {
        futures::FutureExt::catch_unwind(self)
    }
}

impl<F: std::future::Future + std::panic::UnwindSafe> CatchUnwindExt for F {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ToolErrorKind;

    struct Plus;

    #[async_trait::async_trait]
    impl CallableTool for Plus {
        fn name(&self) -> &str {
            "plus"
        }

        fn description(&self) -> &str {
            "Add two integers"
        }

        fn parameters(&self) -> serde_json::Value {
            serde_json::json!({
                "type": "object",
                "properties": {
                    "a": {"type": "integer"},
                    "b": {"type": "integer"}
                },
                "required": ["a", "b"]
            })
        }

        async fn call(&self, arguments: serde_json::Value) -> ToolOutcome {
            let a = arguments["a"].as_i64().unwrap_or(0);
            let b = arguments["b"].as_i64().unwrap_or(0);
            Ok(super::super::ToolOk::new((a + b).to_string()))
        }
    }

    struct BoomTool;

    #[async_trait::async_trait]
    impl CallableTool for BoomTool {
        fn name(&self) -> &str {
            "boom"
        }
        fn description(&self) -> &str {
            "Always fails"
        }
        fn parameters(&self) -> serde_json::Value {
            serde_json::json!({"type": "object"})
        }
        async fn call(&self, _arguments: serde_json::Value) -> ToolOutcome {
            panic!("kaboom")
        }
    }

    fn registry() -> SimpleToolset {
        SimpleToolset::new().register(Plus).unwrap()
    }

    #[tokio::test]
    async fn dispatches_a_registered_tool() {
        let ts = registry();
        let call = ToolCall::new("1", "plus", Some(r#"{"a":1,"b":2}"#.to_string()));
        let rx = ts.handle(call, CancellationToken::new());
        let result = rx.await.unwrap();
        assert_eq!(result.tool_call_id, "1");
        assert_eq!(result.result.unwrap().output, "3");
    }

    #[tokio::test]
    async fn unknown_tool_is_not_found() {
        let ts = registry();
        let call = ToolCall::new("2", "nope", None);
        let result = ts.handle(call, CancellationToken::new()).await.unwrap();
        assert_eq!(result.result.unwrap_err().kind, ToolErrorKind::NotFound);
    }

    #[tokio::test]
    async fn malformed_json_is_parse_error() {
        let ts = registry();
        let call = ToolCall::new("3", "plus", Some(r#"{"a":1, b:2}"#.to_string()));
        let result = ts.handle(call, CancellationToken::new()).await.unwrap();
        assert_eq!(result.result.unwrap_err().kind, ToolErrorKind::Parse);
    }

    #[tokio::test]
    async fn missing_required_argument_is_validate_error() {
        let ts = registry();
        let call = ToolCall::new("4", "plus", Some(r#"{"a":1}"#.to_string()));
        let result = ts.handle(call, CancellationToken::new()).await.unwrap();
        assert_eq!(result.result.unwrap_err().kind, ToolErrorKind::Validate);
    }

    #[tokio::test]
    async fn panicking_tool_is_runtime_error() {
        let ts = SimpleToolset::new().register(BoomTool).unwrap();
        let call = ToolCall::new("5", "boom", Some("{}".to_string()));
        let result = ts.handle(call, CancellationToken::new()).await.unwrap();
        assert_eq!(result.result.unwrap_err().kind, ToolErrorKind::Runtime);
    }

    struct SlowTool;

    #[async_trait::async_trait]
    impl CallableTool for SlowTool {
        fn name(&self) -> &str {
            "slow"
        }
        fn description(&self) -> &str {
            "Never finishes on its own"
        }
        fn parameters(&self) -> serde_json::Value {
            serde_json::json!({"type": "object"})
        }
        async fn call(&self, _arguments: serde_json::Value) -> ToolOutcome {
            std::future::pending::<()>().await;
            unreachable!()
        }
    }

    #[tokio::test]
    async fn cancelling_the_token_aborts_the_outstanding_task() {
        let ts = SimpleToolset::new().register(SlowTool).unwrap();
        let call = ToolCall::new("6", "slow", Some("{}".to_string()));
        let cancel = CancellationToken::new();
        let rx = ts.handle(call, cancel.clone());
        cancel.cancel();
        assert!(rx.await.is_err());
    }

    #[test]
    fn registration_rejects_invalid_schema() {
        struct BadTool;
        #[async_trait::async_trait]
        impl CallableTool for BadTool {
            fn name(&self) -> &str {
                "bad"
            }
            fn description(&self) -> &str {
                "bad schema"
            }
            fn parameters(&self) -> serde_json::Value {
                serde_json::json!({"type": "not-a-real-type"})
            }
            async fn call(&self, _arguments: serde_json::Value) -> ToolOutcome {
                unreachable!()
            }
        }
        let err = SimpleToolset::new().register(BadTool).unwrap_err();
        assert_eq!(err.name, "bad");
    }
}
