pub mod context;
pub mod error;
pub mod merge;
pub mod model;
pub mod provider;
pub mod step;
pub mod tooling;
pub mod tools;

pub use error::{ChatProviderError, ToolError, ToolErrorKind};
pub use model::{ContentPart, GenerateResult, Message, Role, Tool, ToolCall, TokenUsage};
pub use provider::ChatProvider;
pub use step::{step, Context, StepResult};
pub use tooling::{CallableTool, Toolset};
