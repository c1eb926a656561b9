//! Anthropic Messages adapter.
//!
//! System prompt becomes the top-level `system` field (one ephemeral-cached
//! text block); tool-role messages batch into a single `user` message per
//! consecutive run; `ThinkPart`s without a signature are dropped on encode
//! (Anthropic has no notion of "reasoning in progress" on the wire).

use super::{ChatProvider, GenerationKwargs, StreamedMessage};
use crate::error::ChatProviderError;
use crate::model::{ContentPart, FunctionBody, Message, Role, StreamedPart, TokenUsage, Tool, ToolCall};
use eventsource_stream::Eventsource;
use futures::StreamExt;
use serde::{Deserialize, Serialize};

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com/v1";
const ANTHROPIC_VERSION: &str = "2023-06-01";

#[derive(Clone)]
pub struct AnthropicProvider {
    client: reqwest::Client,
    api_key: String,
    model: String,
    base_url: String,
    kwargs: GenerationKwargs,
}

impl AnthropicProvider {
    pub fn new(model: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.into(),
            model: model.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
            kwargs: GenerationKwargs::default(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Swap the underlying HTTP transport, e.g. for a capturing or mock
    /// client in tests.
    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }

    /// Copy-on-write: return a new adapter with updated generation defaults.
    pub fn with_generation_kwargs(&self, kwargs: GenerationKwargs) -> Self {
        let mut next = self.clone();
        next.kwargs = kwargs;
        next
    }

    pub fn with_thinking(&self, effort: super::ReasoningEffort) -> Self {
        let mut kwargs = self.kwargs.clone();
        kwargs.reasoning_effort = Some(effort);
        self.with_generation_kwargs(kwargs)
    }

    fn thinking_block(&self) -> Option<WireThinking> {
        let effort = self.kwargs.reasoning_effort?;
        let budget = effort.thinking_budget();
        if budget == 0 {
            return None;
        }
        Some(WireThinking {
            thinking_type: "enabled".to_string(),
            budget_tokens: budget,
        })
    }

    /// Translate history into Anthropic's `system` + `messages` shape.
    /// `system`-role messages in history are demoted into the first user
    /// message as `<system>...</system>` text, since Anthropic only accepts
    /// one top-level system field (already carried separately here).
    fn encode_messages(history: &[Message]) -> Result<Vec<WireMessage>, ChatProviderError> {
        let mut out: Vec<WireMessage> = Vec::new();
        let mut i = 0;
        while i < history.len() {
            let msg = &history[i];
            match msg.role {
                Role::System => {
                    let text = format!("<system>{}</system>", msg.text_content());
                    out.push(WireMessage {
                        role: "user".to_string(),
                        content: vec![WireBlock::Text {
                            text,
                            cache_control: None,
                        }],
                    });
                    i += 1;
                }
                Role::User => {
                    let blocks = encode_content_blocks(&msg.content);
                    if !blocks.is_empty() {
                        out.push(WireMessage {
                            role: "user".to_string(),
                            content: blocks,
                        });
                    }
                    i += 1;
                }
                Role::Assistant => {
                    let mut blocks = encode_content_blocks(&msg.content);
                    if let Some(calls) = &msg.tool_calls {
                        for call in calls {
                            let input = call
                                .parsed_arguments()
                                .map_err(|e| ChatProviderError::Other(format!(
                                    "tool call `{}` arguments are not valid JSON: {e}",
                                    call.function.name
                                )))?;
                            if !input.is_object() {
                                return Err(ChatProviderError::Other(format!(
                                    "tool call `{}` arguments must be a JSON object",
                                    call.function.name
                                )));
                            }
                            blocks.push(WireBlock::ToolUse {
                                id: call.id.clone(),
                                name: call.function.name.clone(),
                                input,
                                cache_control: None,
                            });
                        }
                    }
                    if !blocks.is_empty() {
                        out.push(WireMessage {
                            role: "assistant".to_string(),
                            content: blocks,
                        });
                    }
                    i += 1;
                }
                Role::Tool => {
                    // Batch consecutive tool-role messages into one user
                    // message, preserving order.
                    let mut blocks = Vec::new();
                    while i < history.len() && history[i].role == Role::Tool {
                        let m = &history[i];
                        if let Some(id) = &m.tool_call_id {
                            blocks.push(WireBlock::ToolResult {
                                tool_use_id: id.clone(),
                                content: m.text_content(),
                                cache_control: None,
                            });
                        }
                        i += 1;
                    }
                    out.push(WireMessage {
                        role: "user".to_string(),
                        content: blocks,
                    });
                }
            }
        }
        // Ephemeral cache_control on the last block of the last message.
        if let Some(last) = out.last_mut() {
            if let Some(block) = last.content.last_mut() {
                block.set_cache_control(CacheControl::ephemeral());
            }
        }
        Ok(out)
    }

    fn encode_tools(tools: &[Tool]) -> Vec<WireTool> {
        let mut wire: Vec<WireTool> = tools
            .iter()
            .map(|t| WireTool {
                name: t.name.clone(),
                description: Some(t.description.clone()),
                input_schema: t.parameters.clone(),
                cache_control: None,
            })
            .collect();
        if let Some(last) = wire.last_mut() {
            last.cache_control = Some(CacheControl::ephemeral());
        }
        wire
    }

    fn build_request(&self, system: WireSystem, messages: Vec<WireMessage>, tools: Vec<WireTool>) -> WireRequest {
        WireRequest {
            model: self.model.clone(),
            max_tokens: self.kwargs.max_tokens.unwrap_or(4096),
            messages,
            system: Some(system),
            temperature: self.kwargs.temperature,
            top_p: self.kwargs.top_p,
            top_k: self.kwargs.top_k,
            stream: true,
            tools: if tools.is_empty() { None } else { Some(tools) },
            thinking: self.thinking_block(),
        }
    }
}

fn encode_content_blocks(parts: &[ContentPart]) -> Vec<WireBlock> {
    parts
        .iter()
        .filter_map(|part| match part {
            ContentPart::Text(t) => Some(WireBlock::Text {
                text: t.text.clone(),
                cache_control: None,
            }),
            ContentPart::ImageUrl(img) => {
                if let Some(rest) = img.url.strip_prefix("data:") {
                    let (mime, data) = rest.split_once(";base64,")?;
                    if !matches!(mime, "image/png" | "image/jpeg" | "image/gif" | "image/webp") {
                        return None;
                    }
                    Some(WireBlock::Image {
                        source: WireImageSource::Base64 {
                            media_type: mime.to_string(),
                            data: data.to_string(),
                        },
                        cache_control: None,
                    })
                } else {
                    Some(WireBlock::Image {
                        source: WireImageSource::Url {
                            url: img.url.clone(),
                        },
                        cache_control: None,
                    })
                }
            }
            ContentPart::Think(think) => think.encrypted.as_ref().map(|sig| WireBlock::Thinking {
                thinking: think.think.clone(),
                signature: sig.clone(),
                cache_control: None,
            }),
            ContentPart::AudioUrl(_) | ContentPart::Unknown(_) => None,
        })
        .collect()
}

#[async_trait::async_trait]
impl ChatProvider for AnthropicProvider {
    fn name(&self) -> &str {
        "anthropic"
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    async fn generate(
        &self,
        system_prompt: &str,
        tools: &[Tool],
        history: &[Message],
    ) -> Result<StreamedMessage, ChatProviderError> {
        let messages = Self::encode_messages(history)?;
        let system = WireSystem::Blocks(vec![WireBlock::Text {
            text: system_prompt.to_string(),
            cache_control: Some(CacheControl::ephemeral()),
        }]);
        let wire_tools = Self::encode_tools(tools);
        let request = self.build_request(system, messages, wire_tools);

        let response = self
            .client
            .post(format!("{}/messages", self.base_url))
            .header("content-type", "application/json")
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ChatProviderError::ApiTimeout(e.to_string())
                } else if e.is_connect() {
                    ChatProviderError::ApiConnection(e.to_string())
                } else {
                    ChatProviderError::Network(e)
                }
            })?;

        if !response.status().is_success() {
            let code = response.status().as_u16();
            let text = response.text().await.unwrap_or_default();
            return Err(ChatProviderError::from_status(code, text));
        }

        let event_stream = response.bytes_stream().eventsource();
        let (msg, id_cell, usage_cell) = StreamedMessage::new(Box::pin(async_stream::stream! {
            futures::pin_mut!(event_stream);
            // (id, name) -> whether the block is a tool_use, tracked so
            // input_json_delta knows to emit ToolCallPart not a text delta.
            while let Some(event) = event_stream.next().await {
                let event = match event {
                    Ok(e) => e,
                    Err(err) => {
                        yield Err(ChatProviderError::Other(format!("anthropic stream error: {err}")));
                        break;
                    }
                };
                if event.data.trim().is_empty() {
                    continue;
                }
                match event.event.as_str() {
                    "message_start" => {
                        if let Ok(start) = serde_json::from_str::<WireMessageStart>(&event.data) {
                            *id_cell.lock().unwrap() = Some(start.message.id);
                            let mut usage = usage_cell.lock().unwrap();
                            *usage = Some(TokenUsage {
                                input: start.message.usage.input_tokens,
                                output: start.message.usage.output_tokens,
                            });
                        }
                    }
                    "content_block_start" => {
                        if let Ok(start) = serde_json::from_str::<WireBlockStart>(&event.data) {
                            match start.content_block {
                                WireBlockStartContent::ToolUse { id, name } => {
                                    yield Ok(StreamedPart::ToolCall(ToolCall::new(id, name, None)));
                                }
                                WireBlockStartContent::Thinking => {
                                    yield Ok(StreamedPart::Content(ContentPart::think("")));
                                }
                                WireBlockStartContent::Text => {}
                            }
                        }
                    }
                    "content_block_delta" => {
                        if let Ok(delta) = serde_json::from_str::<WireBlockDelta>(&event.data) {
                            match delta.delta {
                                WireDelta::TextDelta { text } => {
                                    yield Ok(StreamedPart::Content(ContentPart::text(text)));
                                }
                                WireDelta::ThinkingDelta { thinking } => {
                                    yield Ok(StreamedPart::Content(ContentPart::think(thinking)));
                                }
                                WireDelta::SignatureDelta { signature } => {
                                    yield Ok(StreamedPart::Content(ContentPart::Think(crate::model::ThinkPart {
                                        think: String::new(),
                                        encrypted: Some(signature),
                                    })));
                                }
                                WireDelta::InputJsonDelta { partial_json } => {
                                    yield Ok(StreamedPart::ToolCallPart(crate::model::ToolCallPart {
                                        arguments_part: partial_json,
                                    }));
                                }
                            }
                        }
                    }
                    "message_delta" => {
                        if let Ok(delta) = serde_json::from_str::<WireMessageDelta>(&event.data) {
                            if let Some(usage) = delta.usage {
                                let mut cell = usage_cell.lock().unwrap();
                                let input = cell.map(|u| u.input).unwrap_or(0);
                                *cell = Some(TokenUsage { input, output: usage.output_tokens });
                            }
                        }
                    }
                    "message_stop" => break,
                    _ => {}
                }
            }
        }));
        Ok(msg)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CacheControl {
    #[serde(rename = "type")]
    kind: String,
}

impl CacheControl {
    fn ephemeral() -> Self {
        Self {
            kind: "ephemeral".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
enum WireSystem {
    Blocks(Vec<WireBlock>),
}

#[derive(Debug, Clone, Serialize)]
struct WireMessage {
    role: String,
    content: Vec<WireBlock>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireBlock {
    Text {
        text: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        cache_control: Option<CacheControl>,
    },
    Image {
        source: WireImageSource,
        #[serde(skip_serializing_if = "Option::is_none")]
        cache_control: Option<CacheControl>,
    },
    Thinking {
        thinking: String,
        signature: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        cache_control: Option<CacheControl>,
    },
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
        #[serde(skip_serializing_if = "Option::is_none")]
        cache_control: Option<CacheControl>,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        cache_control: Option<CacheControl>,
    },
}

impl WireBlock {
    /// Every block variant carries a `cache_control` field on the wire; this
    /// sets it regardless of which variant `self` is.
    fn set_cache_control(&mut self, cc: CacheControl) {
        let slot = match self {
            WireBlock::Text { cache_control, .. }
            | WireBlock::Image { cache_control, .. }
            | WireBlock::Thinking { cache_control, .. }
            | WireBlock::ToolUse { cache_control, .. }
            | WireBlock::ToolResult { cache_control, .. } => cache_control,
        };
        *slot = Some(cc);
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireImageSource {
    Url { url: String },
    Base64 { media_type: String, data: String },
}

#[derive(Debug, Clone, Serialize)]
struct WireTool {
    name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<String>,
    input_schema: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    cache_control: Option<CacheControl>,
}

#[derive(Debug, Clone, Serialize)]
struct WireThinking {
    #[serde(rename = "type")]
    thinking_type: String,
    budget_tokens: u32,
}

#[derive(Debug, Clone, Serialize)]
struct WireRequest {
    model: String,
    max_tokens: u32,
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<WireSystem>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_k: Option<u32>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<WireTool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    thinking: Option<WireThinking>,
}

#[derive(Debug, Deserialize)]
struct WireMessageStart {
    message: WireMessageStartInner,
}

#[derive(Debug, Deserialize)]
struct WireMessageStartInner {
    id: String,
    usage: WireUsage,
}

#[derive(Debug, Deserialize)]
struct WireUsage {
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

#[derive(Debug, Deserialize)]
struct WireBlockStart {
    content_block: WireBlockStartContent,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireBlockStartContent {
    Text,
    Thinking,
    ToolUse { id: String, name: String },
}

#[derive(Debug, Deserialize)]
struct WireBlockDelta {
    delta: WireDelta,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireDelta {
    TextDelta { text: String },
    ThinkingDelta { thinking: String },
    SignatureDelta { signature: String },
    InputJsonDelta { partial_json: String },
}

#[derive(Debug, Deserialize)]
struct WireMessageDelta {
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ContentPart;

    #[test]
    fn consecutive_tool_messages_batch_into_one_user_message() {
        let history = vec![
            Message::user("Tell me the weather"),
            {
                let mut m = Message::new(Role::Assistant, vec![]);
                m.tool_calls = Some(vec![
                    ToolCall::new("weather", "get_weather", Some("{}".to_string())),
                    ToolCall::new("time", "get_time", Some("{}".to_string())),
                ]);
                m
            },
            Message::tool_result("weather", "68F"),
            Message::tool_result("time", "2:30 PM"),
        ];
        let wire = AnthropicProvider::encode_messages(&history).unwrap();
        assert_eq!(wire.len(), 3);
        assert_eq!(wire[0].role, "user");
        assert_eq!(wire[1].role, "assistant");
        assert_eq!(wire[2].role, "user");
        assert_eq!(wire[2].content.len(), 2);
        match &wire[2].content[0] {
            WireBlock::ToolResult { tool_use_id, content, .. } => {
                assert_eq!(tool_use_id, "weather");
                assert_eq!(content, "68F");
            }
            _ => panic!("expected tool_result"),
        }
    }

    #[test]
    fn cache_control_lands_on_the_last_block_even_when_it_is_a_tool_result() {
        let history = vec![
            Message::user("hi"),
            {
                let mut m = Message::new(Role::Assistant, vec![]);
                m.tool_calls = Some(vec![ToolCall::new("w", "get_weather", Some("{}".to_string()))]);
                m
            },
            Message::tool_result("w", "68F"),
        ];
        let wire = AnthropicProvider::encode_messages(&history).unwrap();
        let last_message = wire.last().unwrap();
        match last_message.content.last().unwrap() {
            WireBlock::ToolResult { cache_control, .. } => {
                assert!(cache_control.is_some());
            }
            _ => panic!("expected tool_result"),
        }
    }

    #[tokio::test]
    async fn generate_posts_to_the_injected_client_s_transport() {
        use wiremock::matchers::{header, method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/messages"))
            .and(header("x-api-key", "test-key"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(
                "event: message_start\ndata: {\"message\":{\"id\":\"msg_1\",\"usage\":{\"input_tokens\":1,\"output_tokens\":0}}}\n\n\
                 event: content_block_delta\ndata: {\"delta\":{\"type\":\"text_delta\",\"text\":\"hi\"}}\n\n\
                 event: message_stop\ndata: {}\n\n",
                "text/event-stream",
            ))
            .expect(1)
            .mount(&server)
            .await;

        let provider = AnthropicProvider::new("claude-3-5-sonnet", "test-key")
            .with_base_url(server.uri())
            .with_client(reqwest::Client::new());

        let mut streamed = provider.generate("be nice", &[], &[Message::user("hi")]).await.unwrap();
        while streamed.stream.next().await.is_some() {}
        assert_eq!(streamed.id(), Some("msg_1".to_string()));
    }

    #[test]
    fn unsigned_think_part_is_dropped_on_encode() {
        let msg = Message::new(
            Role::Assistant,
            vec![ContentPart::think("still thinking"), ContentPart::text("done")],
        );
        let blocks = encode_content_blocks(&msg.content);
        assert_eq!(blocks.len(), 1);
        matches!(blocks[0], WireBlock::Text { .. });
    }

    #[test]
    fn signed_think_part_is_kept_on_encode() {
        let msg = Message::new(
            Role::Assistant,
            vec![ContentPart::Think(crate::model::ThinkPart {
                think: "reasoning".to_string(),
                encrypted: Some("sig".to_string()),
            })],
        );
        let blocks = encode_content_blocks(&msg.content);
        assert_eq!(blocks.len(), 1);
        match &blocks[0] {
            WireBlock::Thinking { thinking, signature, .. } => {
                assert_eq!(thinking, "reasoning");
                assert_eq!(signature, "sig");
            }
            _ => panic!("expected thinking block"),
        }
    }
}
