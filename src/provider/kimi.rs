//! Moonshot Kimi adapter: OpenAI Chat Completions-compatible wire format
//! plus builtin-tool and reasoning extensions.

use super::openai_legacy::{WireChunk, WireFunction, WireFunctionCall, WireMessage, WireToolCall};
use super::{ChatProvider, GenerationKwargs, StreamedMessage};
use crate::error::ChatProviderError;
use crate::model::{ContentPart, Message, Role, StreamedPart, TokenUsage, Tool, ToolCall};
use eventsource_stream::Eventsource;
use futures::StreamExt;
use serde::Serialize;
use serde_json::json;

const DEFAULT_BASE_URL: &str = "https://api.moonshot.cn/v1";

#[derive(Clone)]
pub struct KimiProvider {
    client: reqwest::Client,
    api_key: String,
    model: String,
    base_url: String,
    kwargs: GenerationKwargs,
}

impl KimiProvider {
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

    /// `kimi-k2*` models default to 0.6; `-thinking` models (and an explicit
    /// `reasoning_effort`) default to 1.0.
    fn default_temperature(&self) -> f32 {
        if self.model.contains("-thinking") {
            1.0
        } else if self.model.starts_with("kimi-k2") {
            0.6
        } else {
            1.0
        }
    }

    fn encode_tools(tools: &[Tool]) -> Vec<serde_json::Value> {
        tools
            .iter()
            .map(|t| {
                if let Some(builtin) = t.name.strip_prefix('$') {
                    json!({"type": "builtin_function", "function": {"name": format!("${builtin}")}})
                } else {
                    serde_json::to_value(WireToolFull {
                        tool_type: "function".to_string(),
                        function: WireFunction {
                            name: t.name.clone(),
                            description: t.description.clone(),
                            parameters: t.parameters.clone(),
                        },
                    })
                    .expect("tool always serializes")
                }
            })
            .collect()
    }

    fn encode_message(&self, msg: &Message) -> Option<WireMessage> {
        match msg.role {
            Role::System => Some(WireMessage {
                role: "system".to_string(),
                content: Some(msg.text_content()),
                tool_calls: None,
                tool_call_id: None,
            }),
            Role::User => Some(WireMessage {
                role: "user".to_string(),
                content: Some(msg.text_content()),
                tool_calls: None,
                tool_call_id: None,
            }),
            Role::Tool => Some(WireMessage {
                role: "tool".to_string(),
                content: Some(msg.text_content()),
                tool_calls: None,
                tool_call_id: msg.tool_call_id.clone(),
            }),
            Role::Assistant => {
                let content = msg.text_content();
                let tool_calls = msg.tool_calls.as_ref().map(|calls| {
                    calls
                        .iter()
                        .map(|c| WireToolCall {
                            id: c.id.clone(),
                            tool_type: "function".to_string(),
                            function: WireFunctionCall {
                                name: c.function.name.clone(),
                                arguments: c.function.arguments.clone().unwrap_or_default(),
                            },
                        })
                        .collect()
                });
                Some(WireMessage {
                    role: "assistant".to_string(),
                    content: if content.is_empty() { None } else { Some(content) },
                    tool_calls,
                    tool_call_id: None,
                })
            }
        }
    }

    /// Concatenated `ThinkPart` text for an assistant message, to ride under
    /// the `reasoning_content` wire key.
    fn reasoning_content(msg: &Message) -> Option<String> {
        if msg.role != Role::Assistant {
            return None;
        }
        let reasoning: String = msg
            .content
            .iter()
            .filter_map(|p| match p {
                ContentPart::Think(t) => Some(t.think.as_str()),
                _ => None,
            })
            .collect();
        if reasoning.is_empty() {
            None
        } else {
            Some(reasoning)
        }
    }
}

#[derive(Serialize)]
struct WireToolFull {
    #[serde(rename = "type")]
    tool_type: String,
    function: WireFunction,
}

#[async_trait::async_trait]
impl ChatProvider for KimiProvider {
    fn name(&self) -> &str {
        "kimi"
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
        let mut messages = Vec::with_capacity(history.len() + 1);
        if !system_prompt.is_empty() {
            messages.push(json!({"role": "system", "content": system_prompt}));
        }
        for msg in history {
            if let Some(wire) = self.encode_message(msg) {
                let mut value = serde_json::to_value(&wire).expect("message always serializes");
                if let Some(reasoning) = Self::reasoning_content(msg) {
                    value["reasoning_content"] = json!(reasoning);
                }
                messages.push(value);
            }
        }

        let mut body = json!({
            "model": self.model,
            "messages": messages,
            "temperature": self.kwargs.temperature.unwrap_or_else(|| self.default_temperature()),
            "stream": true,
            "stream_options": {"include_usage": true},
            "max_tokens": self.kwargs.max_tokens.unwrap_or(32_000),
        });
        let tools_value = Self::encode_tools(tools);
        if !tools_value.is_empty() {
            body["tools"] = json!(tools_value);
        }
        if let Some(effort) = self.kwargs.reasoning_effort.and_then(|e| e.effort_str()) {
            body["reasoning_effort"] = json!(effort);
            body["temperature"] = json!(1.0);
        }

        let mut req = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
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
                        yield Err(ChatProviderError::Other(format!("kimi stream error: {err}")));
                        break;
                    }
                };
                if event.data == "[DONE]" {
                    break;
                }
                let chunk: WireChunk = match serde_json::from_str(&event.data) {
                    Ok(c) => c,
                    Err(_) => continue,
                };
                *id_cell.lock().unwrap() = Some(chunk.id.clone());
                if let Some(usage) = chunk.usage {
                    *usage_cell.lock().unwrap() = Some(TokenUsage {
                        input: usage.prompt_tokens,
                        output: usage.completion_tokens,
                    });
                }
                for choice in chunk.choices {
                    if let Some(content) = choice.delta.content {
                        if !content.is_empty() {
                            yield Ok(StreamedPart::Content(ContentPart::text(content)));
                        }
                    }
                    if let Some(deltas) = choice.delta.tool_calls {
                        for delta in deltas {
                            let name = delta.function.as_ref().and_then(|f| f.name.clone());
                            if let Some(name) = name {
                                let id = delta.id.clone().unwrap_or_else(|| format!("call_{}", delta.index));
                                let args = delta.function.as_ref().and_then(|f| f.arguments.clone());
                                yield Ok(StreamedPart::ToolCall(ToolCall::new(id, name, args)));
                            } else if let Some(args) = delta.function.and_then(|f| f.arguments) {
                                yield Ok(StreamedPart::ToolCallPart(crate::model::ToolCallPart {
                                    arguments_part: args,
                                }));
                            }
                        }
                    }
                }
            }
        }));
        Ok(msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_tool_name_serializes_without_schema() {
        let tool = Tool {
            name: "$web_search".to_string(),
            description: "search the web".to_string(),
            parameters: json!({"type": "object"}),
        };
        let encoded = KimiProvider::encode_tools(&[tool]);
        assert_eq!(encoded[0], json!({"type": "builtin_function", "function": {"name": "$web_search"}}));
    }

    #[test]
    fn regular_tool_name_serializes_with_schema() {
        let tool = Tool {
            name: "lookup".to_string(),
            description: "look things up".to_string(),
            parameters: json!({"type": "object"}),
        };
        let encoded = KimiProvider::encode_tools(&[tool]);
        assert_eq!(encoded[0]["type"], "function");
        assert_eq!(encoded[0]["function"]["name"], "lookup");
    }

    #[test]
    fn kimi_k2_defaults_to_point_six_temperature() {
        let provider = KimiProvider::new("kimi-k2-0711-preview", "key");
        assert_eq!(provider.default_temperature(), 0.6);
    }

    #[test]
    fn thinking_model_defaults_to_one_temperature() {
        let provider = KimiProvider::new("kimi-k2-thinking", "key");
        assert_eq!(provider.default_temperature(), 1.0);
    }

    #[tokio::test]
    async fn generate_posts_to_the_injected_client_s_transport() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(
                "data: {\"id\":\"chatcmpl-1\",\"choices\":[{\"delta\":{\"content\":\"hi\"}}]}\n\n\
                 data: [DONE]\n\n",
                "text/event-stream",
            ))
            .expect(1)
            .mount(&server)
            .await;

        let provider = KimiProvider::new("kimi-k2-0711-preview", "key")
            .with_base_url(server.uri())
            .with_client(reqwest::Client::new());

        let result = provider.generate("", &[], &[Message::user("hi")]).await;
        assert!(result.is_ok());
    }
}
