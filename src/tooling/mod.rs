//! Tool registration and dispatch.
//!
//! A [`CallableTool`] is the author-facing trait: implement `call` and the
//! registry handles JSON-Schema validation and concurrent dispatch. A
//! [`Toolset`] is the consumer-facing trait the step orchestrator drives;
//! [`SimpleToolset`] is the only non-trivial implementation most callers need.

pub mod registry;

use crate::error::{ToolError, ToolErrorKind};
use crate::model::{Tool, ToolCall};
use std::fmt;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

pub use registry::SimpleToolset;

/// Successful tool output.
#[derive(Debug, Clone)]
pub struct ToolOk {
    pub output: String,
    pub message: Option<String>,
    pub brief: Option<String>,
}

impl ToolOk {
    pub fn new(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            message: None,
            brief: None,
        }
    }
}

/// The settled outcome of one tool invocation: either a value or a typed
/// error, never an exception.
pub type ToolOutcome = Result<ToolOk, ToolError>;

/// The result handed back to the step orchestrator for one tool call.
#[derive(Debug, Clone)]
pub struct ToolResult {
    pub tool_call_id: String,
    pub result: ToolOutcome,
}

/// A handle resolved exactly once with a tool's outcome. Cancellation still
/// resolves it (with a `Runtime` error) so `tool_results()` never hangs.
pub type ToolResultFuture = oneshot::Receiver<ToolResult>;

/// Author-facing trait for a tool the registry can dispatch to.
///
/// `call` receives already-validated, already-parsed arguments — the
/// registry has confirmed they satisfy `parameters`'s JSON Schema before this
/// is invoked. Implementations should return a `ToolError` rather than panic
/// or propagate: the dispatcher will convert any panic that does escape into
/// a `Runtime` error, but returning one directly carries a clearer message.
#[async_trait::async_trait]
pub trait CallableTool: Send + Sync {
    fn name(&self) -> &str;

    /// Short description sent to the model.
    fn description(&self) -> &str;

    /// JSON Schema (Draft 2020-12) describing the call's arguments.
    fn parameters(&self) -> serde_json::Value;

    async fn call(&self, arguments: serde_json::Value) -> ToolOutcome;

    /// The wire-facing `Tool` the registry sends to providers.
    fn as_tool(&self) -> Tool {
        Tool {
            name: self.name().to_string(),
            description: self.description().to_string(),
            parameters: self.parameters(),
        }
    }
}

impl fmt::Debug for dyn CallableTool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallableTool").field("name", &self.name()).finish()
    }
}

/// Consumer-facing interface the step orchestrator drives: the tools to
/// advertise to the provider, and a non-blocking `handle` that never raises.
#[async_trait::async_trait]
pub trait Toolset: Send + Sync {
    fn tools(&self) -> Vec<Tool>;

    /// Dispatch `call`. Must return immediately (the work, if any, runs on a
    /// spawned task) and must never panic across the call boundary. `cancel`
    /// is observed by the spawned task, not by this call: cancelling it after
    /// `handle` returns aborts the outstanding work and the returned future
    /// resolves with a `Runtime` "cancelled" error instead of hanging.
    fn handle(&self, call: ToolCall, cancel: CancellationToken) -> ToolResultFuture;
}

/// A toolset that never dispatches. Used when a step has no tools to offer.
#[derive(Debug, Default, Clone, Copy)]
pub struct EmptyToolset;

impl Toolset for EmptyToolset {
    fn tools(&self) -> Vec<Tool> {
        Vec::new()
    }

    fn handle(&self, call: ToolCall, _cancel: CancellationToken) -> ToolResultFuture {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(ToolResult {
            tool_call_id: call.id,
            result: Err(ToolError {
                kind: ToolErrorKind::NotFound,
                message: format!("Tool `{}` not found", call.function.name),
            }),
        });
        rx
    }
}
