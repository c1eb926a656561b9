//! OpenAI Responses API adapter. Similar wire shape to the legacy Chat
//! Completions adapter, but with its own input-item and event vocabulary.

use super::{ChatProvider, GenerationKwargs, StreamedMessage};
use crate::error::ChatProviderError;
use crate::model::{ContentPart, Message, Role, StreamedPart, TokenUsage, Tool, ToolCall};
use eventsource_stream::Eventsource;
use futures::StreamExt;
use serde::Deserialize;
use serde_json::{json, Value};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

#[derive(Clone)]
pub struct OpenAIResponsesProvider {
    client: reqwest::Client,
    api_key: String,
    model: String,
    base_url: String,
    kwargs: GenerationKwargs,
}

impl OpenAIResponsesProvider {
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

    pub fn with_generation_kwargs(&self, kwargs: GenerationKwargs) -> Self {
        let mut next = self.clone();
        next.kwargs = kwargs;
        next
    }

    fn role_str(role: Role) -> &'static str {
        match role {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }

    fn encode_tools(tools: &[Tool]) -> Vec<Value> {
        tools
            .iter()
            .map(|t| {
                json!({
                    "type": "function",
                    "name": t.name,
                    "description": t.description,
                    "parameters": t.parameters,
                    "strict": false,
                })
            })
            .collect()
    }

    /// One content part → one input-content item, for non-assistant roles.
    fn content_part_to_input_item(part: &ContentPart) -> Option<Value> {
        match part {
            ContentPart::Text(t) if !t.text.is_empty() => {
                Some(json!({"type": "input_text", "text": t.text}))
            }
            ContentPart::ImageUrl(i) => Some(json!({
                "type": "input_image",
                "detail": "auto",
                "image_url": i.url,
            })),
            ContentPart::AudioUrl(a) => map_audio_url_to_input_item(&a.url),
            _ => None,
        }
    }

    /// One content part → one output-content item, for assistant messages.
    fn content_part_to_output_item(part: &ContentPart) -> Option<Value> {
        match part {
            ContentPart::Text(t) if !t.text.is_empty() => {
                Some(json!({"type": "output_text", "text": t.text, "annotations": []}))
            }
            _ => None,
        }
    }

    fn message_to_input_items(message: &Message) -> Vec<Value> {
        if message.role == Role::Tool {
            return vec![json!({
                "type": "function_call_output",
                "call_id": message.tool_call_id.clone().unwrap_or_default(),
                "output": message.text_content(),
            })];
        }

        let mut result = Vec::new();
        let role = Self::role_str(message.role);
        let is_assistant = message.role == Role::Assistant;

        let mut pending: Vec<&ContentPart> = Vec::new();
        let flush = |pending: &mut Vec<&ContentPart>, result: &mut Vec<Value>| {
            if pending.is_empty() {
                return;
            }
            let items: Vec<Value> = if is_assistant {
                pending.iter().filter_map(|p| Self::content_part_to_output_item(p)).collect()
            } else {
                pending.iter().filter_map(|p| Self::content_part_to_input_item(p)).collect()
            };
            result.push(json!({"role": role, "type": "message", "content": items}));
            pending.clear();
        };

        let mut i = 0;
        let content = &message.content;
        while i < content.len() {
            match &content[i] {
                ContentPart::Think(think) => {
                    flush(&mut pending, &mut result);
                    let encrypted = think.encrypted.clone();
                    let mut summaries = vec![json!({"type": "summary_text", "text": think.think})];
                    i += 1;
                    while i < content.len() {
                        if let ContentPart::Think(next) = &content[i] {
                            if next.encrypted == encrypted {
                                summaries.push(json!({"type": "summary_text", "text": next.think}));
                                i += 1;
                                continue;
                            }
                        }
                        break;
                    }
                    result.push(json!({
                        "type": "reasoning",
                        "summary": summaries,
                        "encrypted_content": encrypted,
                    }));
                }
                other => {
                    pending.push(other);
                    i += 1;
                }
            }
        }
        flush(&mut pending, &mut result);

        for call in message.tool_calls.iter().flatten() {
            result.push(json!({
                "type": "function_call",
                "call_id": call.id,
                "name": call.function.name,
                "arguments": call.function.arguments.clone().unwrap_or_else(|| "{}".to_string()),
            }));
        }

        result
    }
}

fn map_audio_url_to_input_item(url: &str) -> Option<Value> {
    if let Some(rest) = url.strip_prefix("data:audio/") {
        let (header, b64) = rest.split_once(',')?;
        let subtype = header.split(|c| c == ';' || c == ',').next()?.to_lowercase();
        let format = match subtype.as_str() {
            "mp3" | "mpeg" => "mp3",
            "wav" => "wav",
            _ => return None,
        };
        return Some(json!({"type": "input_audio", "input_audio": {"data": b64, "format": format}}));
    }
    if url.starts_with("http://") || url.starts_with("https://") {
        return Some(json!({"type": "input_file", "file_url": url}));
    }
    None
}

#[async_trait::async_trait]
impl ChatProvider for OpenAIResponsesProvider {
    fn name(&self) -> &str {
        "openai-responses"
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
        let mut inputs = Vec::new();
        if !system_prompt.is_empty() {
            inputs.push(json!({"role": "system", "content": system_prompt}));
        }
        for msg in history {
            inputs.extend(Self::message_to_input_items(msg));
        }

        let mut body = json!({
            "model": self.model,
            "input": inputs,
            "tools": Self::encode_tools(tools),
            "stream": true,
            "store": false,
        });
        if let Some(t) = self.kwargs.temperature {
            body["temperature"] = json!(t);
        }
        if let Some(p) = self.kwargs.top_p {
            body["top_p"] = json!(p);
        }
        if let Some(max) = self.kwargs.max_tokens {
            body["max_output_tokens"] = json!(max);
        }
        if let Some(effort) = self.kwargs.reasoning_effort.and_then(|e| e.effort_str()) {
            body["reasoning"] = json!({"effort": effort, "summary": "auto"});
            body["include"] = json!(["reasoning.encrypted_content"]);
        }

        let mut req = self
            .client
            .post(format!("{}/responses", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body);
        for (k, v) in &self.kwargs.extra_headers {
            req = req.header(k, v);
        }

        let response = req.send().await.map_err(|e| {
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
            while let Some(event) = event_stream.next().await {
                let event = match event {
                    Ok(e) => e,
                    Err(err) => {
                        yield Err(ChatProviderError::Other(format!("openai-responses stream error: {err}")));
                        break;
                    }
                };
                let chunk: WireEvent = match serde_json::from_str(&event.data) {
                    Ok(c) => c,
                    Err(_) => continue,
                };
                match chunk.event_type.as_str() {
                    "response.output_text.delta" => {
                        if let Some(delta) = chunk.delta {
                            yield Ok(StreamedPart::Content(ContentPart::text(delta)));
                        }
                    }
                    "response.output_item.added" => {
                        if let Some(item) = chunk.item {
                            if item.item_type == "function_call" {
                                let id = item.call_id.unwrap_or_else(|| format!("call_{}", uuid_like()));
                                let name = item.name.unwrap_or_default();
                                yield Ok(StreamedPart::ToolCall(ToolCall::new(id, name, item.arguments)));
                            }
                        }
                    }
                    "response.output_item.done" => {
                        if let Some(item) = chunk.item {
                            if item.item_type == "reasoning" {
                                yield Ok(StreamedPart::Content(ContentPart::Think(crate::model::ThinkPart {
                                    think: String::new(),
                                    encrypted: item.encrypted_content,
                                })));
                            }
                        }
                    }
                    "response.function_call_arguments.delta" => {
                        if let Some(delta) = chunk.delta {
                            yield Ok(StreamedPart::ToolCallPart(crate::model::ToolCallPart { arguments_part: delta }));
                        }
                    }
                    "response.reasoning_summary_part.added" => {
                        yield Ok(StreamedPart::Content(ContentPart::think("")));
                    }
                    "response.reasoning_summary_text.delta" => {
                        if let Some(delta) = chunk.delta {
                            yield Ok(StreamedPart::Content(ContentPart::think(delta)));
                        }
                    }
                    "response.completed" => {
                        if let Some(response) = chunk.response {
                            if let Some(id) = response.id {
                                *id_cell.lock().unwrap() = Some(id);
                            }
                            if let Some(usage) = response.usage {
                                *usage_cell.lock().unwrap() = Some(TokenUsage {
                                    input: usage.input_tokens,
                                    output: usage.output_tokens,
                                });
                            }
                        }
                    }
                    _ => {}
                }
            }
        }));
        Ok(msg)
    }
}

/// A process-local counter standing in for a UUID when the wire omits a
/// call id on `function_call` items added mid-stream.
fn uuid_like() -> u64 {
    use std::sync::atomic::{AtomicU64, Ordering};
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    COUNTER.fetch_add(1, Ordering::Relaxed)
}

#[derive(Debug, Deserialize)]
pub(crate) struct WireEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub delta: Option<String>,
    #[serde(default)]
    pub item: Option<WireItem>,
    #[serde(default)]
    pub response: Option<WireResponse>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct WireItem {
    #[serde(rename = "type")]
    pub item_type: String,
    #[serde(default)]
    pub call_id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub arguments: Option<String>,
    #[serde(default)]
    pub encrypted_content: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct WireResponse {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct WireUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ThinkPart;

    #[test]
    fn tool_message_becomes_function_call_output() {
        let msg = Message::tool_result("call_1", "42");
        let items = OpenAIResponsesProvider::message_to_input_items(&msg);
        assert_eq!(items.len(), 1);
        assert_eq!(items[0]["type"], "function_call_output");
        assert_eq!(items[0]["call_id"], "call_1");
        assert_eq!(items[0]["output"], "42");
    }

    #[test]
    fn consecutive_think_parts_with_same_signature_group_into_one_reasoning_item() {
        let msg = Message::new(
            Role::Assistant,
            vec![
                ContentPart::Think(ThinkPart { think: "step one".to_string(), encrypted: Some("sig".to_string()) }),
                ContentPart::Think(ThinkPart { think: "step two".to_string(), encrypted: Some("sig".to_string()) }),
                ContentPart::text("answer"),
            ],
        );
        let items = OpenAIResponsesProvider::message_to_input_items(&msg);
        assert_eq!(items[0]["type"], "reasoning");
        assert_eq!(items[0]["summary"].as_array().unwrap().len(), 2);
        assert_eq!(items[1]["type"], "message");
    }

    #[test]
    fn assistant_tool_calls_become_function_call_items() {
        let mut msg = Message::new(Role::Assistant, vec![]);
        msg.tool_calls = Some(vec![ToolCall::new("c1", "lookup", Some("{}".to_string()))]);
        let items = OpenAIResponsesProvider::message_to_input_items(&msg);
        assert_eq!(items[0]["type"], "function_call");
        assert_eq!(items[0]["name"], "lookup");
    }

    #[tokio::test]
    async fn generate_posts_to_the_injected_client_s_transport() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/responses"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(
                "data: {\"type\":\"response.completed\",\"response\":{\"id\":\"resp_1\"}}\n\n",
                "text/event-stream",
            ))
            .expect(1)
            .mount(&server)
            .await;

        let provider = OpenAIResponsesProvider::new("gpt-4o", "key")
            .with_base_url(server.uri())
            .with_client(reqwest::Client::new());

        let mut streamed = provider.generate("", &[], &[Message::user("hi")]).await.unwrap();
        while streamed.stream.next().await.is_some() {}
        assert_eq!(streamed.id(), Some("resp_1".to_string()));
    }
}
