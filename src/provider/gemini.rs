//! Google Gemini (`generateContent`/`streamGenerateContent`) adapter.
//!
//! Tool calls carry a synthesized id (`call_{n}`) since Gemini's wire format
//! doesn't assign one; the synthesized id is what the merger and dispatcher
//! key off for the lifetime of the step.

use super::{ChatProvider, GenerationKwargs, StreamedMessage};
use crate::error::ChatProviderError;
use crate::model::{ContentPart, Message, Role, StreamedPart, TokenUsage, Tool, ToolCall};
use eventsource_stream::Eventsource;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

#[derive(Clone)]
pub struct GeminiProvider {
    client: reqwest::Client,
    api_key: String,
    model: String,
    base_url: String,
    kwargs: GenerationKwargs,
    /// Whether the target model natively supports thinking blocks; when
    /// false, `ThinkPart`s are wrapped as `<thinking>...</thinking>` text on
    /// encode instead of being dropped.
    native_thinking: bool,
    call_counter: Arc<AtomicU64>,
}

impl GeminiProvider {
    pub fn new(model: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.into(),
            model: model.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
            kwargs: GenerationKwargs::default(),
            native_thinking: true,
            call_counter: Arc::new(AtomicU64::new(1)),
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

    pub fn with_native_thinking(mut self, native: bool) -> Self {
        self.native_thinking = native;
        self
    }

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

    fn thinking_config(&self) -> Option<WireThinkingConfig> {
        let effort = self.kwargs.reasoning_effort?;
        Some(WireThinkingConfig {
            thinking_budget: effort.thinking_budget(),
            include_thoughts: effort.include_thoughts(),
        })
    }

    fn encode_image(&self, url: &str) -> Result<WirePart, ChatProviderError> {
        if let Some(rest) = url.strip_prefix("data:") {
            let (mime, data) = rest
                .split_once(";base64,")
                .ok_or_else(|| ChatProviderError::Other("malformed data: URL".to_string()))?;
            if !matches!(mime, "image/png" | "image/jpeg" | "image/gif" | "image/webp") {
                return Err(ChatProviderError::Other(format!("unsupported image mime type: {mime}")));
            }
            Ok(WirePart {
                inline_data: Some(WireInlineData {
                    mime_type: mime.to_string(),
                    data: data.to_string(),
                }),
                ..Default::default()
            })
        } else {
            let mime = guess_mime_from_extension(url);
            Ok(WirePart {
                file_data: Some(WireFileData {
                    mime_type: mime.to_string(),
                    file_uri: url.to_string(),
                }),
                ..Default::default()
            })
        }
    }

    fn encode_content_parts(&self, parts: &[ContentPart]) -> Result<Vec<WirePart>, ChatProviderError> {
        let mut out = Vec::new();
        for part in parts {
            match part {
                ContentPart::Text(t) => out.push(WirePart {
                    text: Some(t.text.clone()),
                    ..Default::default()
                }),
                ContentPart::ImageUrl(img) => out.push(self.encode_image(&img.url)?),
                ContentPart::Think(think) => {
                    if self.native_thinking {
                        out.push(WirePart {
                            text: Some(think.think.clone()),
                            thought: Some(true),
                            thought_signature: think.encrypted.clone(),
                            ..Default::default()
                        });
                    } else {
                        out.push(WirePart {
                            text: Some(format!("<thinking>{}</thinking>", think.think)),
                            ..Default::default()
                        });
                    }
                }
                ContentPart::AudioUrl(_) | ContentPart::Unknown(_) => {}
            }
        }
        Ok(out)
    }

    fn encode_history(&self, history: &[Message]) -> Result<(Vec<WireContent>, Option<WireContent>), ChatProviderError> {
        let mut contents = Vec::new();
        let mut system_instruction = None;

        // Gemini's function_response needs the original call's function name,
        // which a `Role::Tool` message doesn't carry itself (only its
        // `tool_call_id`); recover it from the assistant message that made the call.
        let mut call_names: std::collections::HashMap<&str, &str> = std::collections::HashMap::new();
        for msg in history {
            for call in msg.tool_calls.iter().flatten() {
                call_names.insert(call.id.as_str(), call.function.name.as_str());
            }
        }

        for msg in history {
            match msg.role {
                Role::System => {
                    if system_instruction.is_none() {
                        system_instruction = Some(WireContent {
                            role: None,
                            parts: self.encode_content_parts(&msg.content)?,
                        });
                    }
                }
                Role::User => contents.push(WireContent {
                    role: Some("user".to_string()),
                    parts: self.encode_content_parts(&msg.content)?,
                }),
                Role::Assistant => {
                    let mut parts = self.encode_content_parts(&msg.content)?;
                    if let Some(calls) = &msg.tool_calls {
                        for call in calls {
                            let args = call.parsed_arguments().map_err(|e| {
                                ChatProviderError::Other(format!(
                                    "tool call `{}` arguments are not valid JSON: {e}",
                                    call.function.name
                                ))
                            })?;
                            if !args.is_object() {
                                return Err(ChatProviderError::Other(format!(
                                    "tool call `{}` arguments must be a JSON object",
                                    call.function.name
                                )));
                            }
                            parts.push(WirePart {
                                function_call: Some(WireFunctionCall {
                                    name: call.function.name.clone(),
                                    args,
                                }),
                                ..Default::default()
                            });
                        }
                    }
                    contents.push(WireContent {
                        role: Some("model".to_string()),
                        parts,
                    });
                }
                Role::Tool => {
                    let name = msg
                        .tool_call_id
                        .as_deref()
                        .and_then(|id| call_names.get(id))
                        .map(|s| s.to_string())
                        .unwrap_or_default();
                    contents.push(WireContent {
                        role: Some("user".to_string()),
                        parts: vec![WirePart {
                            function_response: Some(WireFunctionResponse {
                                name,
                                response: serde_json::json!({"result": msg.text_content()}),
                            }),
                            ..Default::default()
                        }],
                    });
                }
            }
        }
        Ok((contents, system_instruction))
    }

    fn encode_tools(tools: &[Tool]) -> Option<Vec<WireTool>> {
        if tools.is_empty() {
            return None;
        }
        Some(vec![WireTool {
            function_declarations: tools
                .iter()
                .map(|t| WireFunctionDeclaration {
                    name: t.name.clone(),
                    description: t.description.clone(),
                    parameters: t.parameters.clone(),
                })
                .collect(),
        }])
    }
}

fn guess_mime_from_extension(url: &str) -> &'static str {
    let lower = url.to_ascii_lowercase();
    if lower.ends_with(".jpg") || lower.ends_with(".jpeg") {
        "image/jpeg"
    } else if lower.ends_with(".gif") {
        "image/gif"
    } else if lower.ends_with(".webp") {
        "image/webp"
    } else {
        "image/png"
    }
}

#[async_trait::async_trait]
impl ChatProvider for GeminiProvider {
    fn name(&self) -> &str {
        "gemini"
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
        let (contents, mut system_instruction) = self.encode_history(history)?;
        if !system_prompt.is_empty() {
            system_instruction = Some(WireContent {
                role: None,
                parts: vec![WirePart {
                    text: Some(system_prompt.to_string()),
                    ..Default::default()
                }],
            });
        }

        let request = WireRequest {
            contents,
            system_instruction,
            tools: Self::encode_tools(tools),
            generation_config: WireGenerationConfig {
                temperature: self.kwargs.temperature,
                top_p: self.kwargs.top_p,
                top_k: self.kwargs.top_k,
                max_output_tokens: self.kwargs.max_tokens,
                thinking_config: self.thinking_config(),
            },
        };

        let url = format!(
            "{}/models/{}:streamGenerateContent?alt=sse&key={}",
            self.base_url, self.model, self.api_key
        );
        let response = self
            .client
            .post(url)
            .header("content-type", "application/json")
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
        let call_counter = self.call_counter.clone();
        let (msg, id_cell, usage_cell) = StreamedMessage::new(Box::pin(async_stream::stream! {
            futures::pin_mut!(event_stream);
            while let Some(event) = event_stream.next().await {
                let event = match event {
                    Ok(e) => e,
                    Err(err) => {
                        yield Err(ChatProviderError::Other(format!("gemini stream error: {err}")));
                        break;
                    }
                };
                if event.data.trim().is_empty() {
                    continue;
                }
                let chunk: WireStreamChunk = match serde_json::from_str(&event.data) {
                    Ok(c) => c,
                    Err(_) => continue,
                };
                if let Some(id) = chunk.response_id {
                    *id_cell.lock().unwrap() = Some(id);
                }
                if let Some(usage) = chunk.usage_metadata {
                    *usage_cell.lock().unwrap() = Some(TokenUsage {
                        input: usage.prompt_token_count,
                        output: usage.candidates_token_count,
                    });
                }
                for candidate in chunk.candidates {
                    for part in candidate.content.parts {
                        if part.thought == Some(true) {
                            yield Ok(StreamedPart::Content(ContentPart::Think(crate::model::ThinkPart {
                                think: part.text.unwrap_or_default(),
                                encrypted: part.thought_signature,
                            })));
                        } else if let Some(text) = part.text {
                            yield Ok(StreamedPart::Content(ContentPart::text(text)));
                        } else if let Some(call) = part.function_call {
                            let id = call_counter.fetch_add(1, Ordering::SeqCst);
                            let args = serde_json::to_string(&call.args).unwrap_or_else(|_| "{}".to_string());
                            yield Ok(StreamedPart::ToolCall(ToolCall::new(
                                format!("call_{id}"),
                                call.name,
                                Some(args),
                            )));
                        }
                    }
                }
            }
        }));
        Ok(msg)
    }
}

#[derive(Debug, Clone, Serialize)]
struct WireRequest {
    contents: Vec<WireContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<WireContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<WireTool>>,
    generation_config: WireGenerationConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct WireContent {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    parts: Vec<WirePart>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct WirePart {
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    thought: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    thought_signature: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    inline_data: Option<WireInlineData>,
    #[serde(skip_serializing_if = "Option::is_none")]
    file_data: Option<WireFileData>,
    #[serde(skip_serializing_if = "Option::is_none")]
    function_call: Option<WireFunctionCall>,
    #[serde(skip_serializing_if = "Option::is_none")]
    function_response: Option<WireFunctionResponse>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireInlineData {
    mime_type: String,
    data: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireFileData {
    mime_type: String,
    file_uri: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireFunctionCall {
    name: String,
    args: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireFunctionResponse {
    name: String,
    response: serde_json::Value,
}

#[derive(Debug, Clone, Serialize)]
struct WireTool {
    function_declarations: Vec<WireFunctionDeclaration>,
}

#[derive(Debug, Clone, Serialize)]
struct WireFunctionDeclaration {
    name: String,
    description: String,
    parameters: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Default)]
struct WireGenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_k: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_output_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    thinking_config: Option<WireThinkingConfig>,
}

#[derive(Debug, Clone, Serialize)]
struct WireThinkingConfig {
    thinking_budget: u32,
    include_thoughts: bool,
}

#[derive(Debug, Deserialize)]
struct WireStreamChunk {
    #[serde(default)]
    candidates: Vec<WireCandidate>,
    #[serde(default)]
    response_id: Option<String>,
    #[serde(default)]
    usage_metadata: Option<WireUsageMetadata>,
}

#[derive(Debug, Deserialize)]
struct WireCandidate {
    content: WireContent,
}

#[derive(Debug, Deserialize)]
struct WireUsageMetadata {
    #[serde(default)]
    prompt_token_count: u64,
    #[serde(default)]
    candidates_token_count: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ContentPart;

    fn provider() -> GeminiProvider {
        GeminiProvider::new("gemini-2.5-pro", "key")
    }

    #[test]
    fn data_url_images_restricted_to_known_mime_types() {
        let p = provider();
        let ok = p.encode_image("data:image/png;base64,AAAA").unwrap();
        assert!(ok.inline_data.is_some());
        let err = p.encode_image("data:image/tiff;base64,AAAA");
        assert!(err.is_err());
    }

    #[test]
    fn http_url_guesses_mime_from_extension() {
        let p = provider();
        let part = p.encode_image("https://example.com/pic.jpeg").unwrap();
        assert_eq!(part.file_data.unwrap().mime_type, "image/jpeg");
    }

    #[test]
    fn think_part_wraps_as_tagged_text_for_non_native_models() {
        let p = provider().with_native_thinking(false);
        let parts = p
            .encode_content_parts(&[ContentPart::think("because X")])
            .unwrap();
        assert_eq!(parts[0].text.as_deref(), Some("<thinking>because X</thinking>"));
    }

    #[test]
    fn assistant_role_renamed_to_model() {
        let p = provider();
        let history = vec![Message::new(Role::Assistant, vec![ContentPart::text("hi")])];
        let (contents, _) = p.encode_history(&history).unwrap();
        assert_eq!(contents[0].role.as_deref(), Some("model"));
    }

    #[tokio::test]
    async fn generate_posts_to_the_injected_client_s_transport() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/models/gemini-2.5-pro:streamGenerateContent"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(
                "data: {\"responseId\":\"resp-1\",\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"hi\"}]}}]}\n\n",
                "text/event-stream",
            ))
            .expect(1)
            .mount(&server)
            .await;

        let p = provider().with_base_url(server.uri()).with_client(reqwest::Client::new());
        let mut streamed = p.generate("", &[], &[Message::user("hi")]).await.unwrap();
        while streamed.stream.next().await.is_some() {}
        assert_eq!(streamed.id(), Some("resp-1".to_string()));
    }
}
