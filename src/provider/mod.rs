//! The provider adapter interface: a uniform `generate` contract each
//! per-provider module implements, plus the shared reasoning-effort mapping.

#[cfg(feature = "openai")]
pub mod openai_legacy;
#[cfg(feature = "openai-responses")]
pub mod openai_responses;
#[cfg(feature = "anthropic")]
pub mod anthropic;
#[cfg(feature = "gemini")]
pub mod gemini;
#[cfg(feature = "kimi")]
pub mod kimi;
pub mod mock;

use crate::error::ChatProviderError;
use crate::model::{Message, StreamedPart, TokenUsage, Tool};
use futures::Stream;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

/// A uniform, provider-neutral chat generation contract.
///
/// `generate` never blocks on the full response: it returns a
/// [`StreamedMessage`] immediately and the caller drives it (directly, or
/// through `crate::merge::generate`, which is how `crate::step::step` uses it).
#[async_trait::async_trait]
pub trait ChatProvider: Send + Sync {
    /// Stable identifier for this adapter, e.g. `"openai"`, `"anthropic"`.
    fn name(&self) -> &str;

    fn model_name(&self) -> &str;

    async fn generate(
        &self,
        system_prompt: &str,
        tools: &[Tool],
        history: &[Message],
    ) -> Result<StreamedMessage, ChatProviderError>;
}

/// The parts yielded by one `generate` call, in wire order, plus the
/// out-of-band id/usage an adapter fills in as it streams.
///
/// `id` and `usage` are shared cells the adapter's decode loop writes into as
/// it observes them (typically on the first and terminal chunk respectively);
/// read them after the stream has been fully consumed.
pub struct StreamedMessage {
    id: Arc<Mutex<Option<String>>>,
    usage: Arc<Mutex<Option<TokenUsage>>>,
    pub stream: Pin<Box<dyn Stream<Item = Result<StreamedPart, ChatProviderError>> + Send>>,
}

impl StreamedMessage {
    pub fn new(
        stream: Pin<Box<dyn Stream<Item = Result<StreamedPart, ChatProviderError>> + Send>>,
    ) -> (Self, Arc<Mutex<Option<String>>>, Arc<Mutex<Option<TokenUsage>>>) {
        let id = Arc::new(Mutex::new(None));
        let usage = Arc::new(Mutex::new(None));
        (
            Self {
                id: id.clone(),
                usage: usage.clone(),
                stream,
            },
            id,
            usage,
        )
    }

    pub fn id(&self) -> Option<String> {
        self.id.lock().unwrap().clone()
    }

    pub fn usage(&self) -> Option<TokenUsage> {
        *self.usage.lock().unwrap()
    }
}

/// Reasoning/thinking effort, mapped per provider per the table in
/// the adapter interface section of the design document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReasoningEffort {
    Off,
    Low,
    Medium,
    High,
}

impl ReasoningEffort {
    /// Token budget Anthropic and Gemini use for this effort level.
    pub fn thinking_budget(self) -> u32 {
        match self {
            ReasoningEffort::Off => 0,
            ReasoningEffort::Low => 1024,
            ReasoningEffort::Medium => 4096,
            ReasoningEffort::High => 32_000,
        }
    }

    /// Whether thought summaries should be included at all (Gemini).
    pub fn include_thoughts(self) -> bool {
        !matches!(self, ReasoningEffort::Off)
    }

    /// The `reasoning_effort`/`effort` string OpenAI Responses and Kimi use.
    /// `None` at the `Off` level, which omits the field entirely.
    pub fn effort_str(self) -> Option<&'static str> {
        match self {
            ReasoningEffort::Off => None,
            ReasoningEffort::Low => Some("low"),
            ReasoningEffort::Medium => Some("medium"),
            ReasoningEffort::High => Some("high"),
        }
    }
}

/// Per-provider generation defaults shared by the adapters below:
/// temperature/top_p/top_k/max tokens plus provider-specific extras, supplied
/// through each adapter's own `with_generation_kwargs`. Adapters copy this
/// struct (copy-on-write) rather than mutate it in place, matching the
/// "returns a new adapter" contract in §4.3.
#[derive(Debug, Clone, Default)]
pub struct GenerationKwargs {
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub top_k: Option<u32>,
    pub max_tokens: Option<u32>,
    pub reasoning_effort: Option<ReasoningEffort>,
    pub extra_headers: Vec<(String, String)>,
    pub beta_features: Vec<String>,
}
