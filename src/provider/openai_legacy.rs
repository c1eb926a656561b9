//! OpenAI Chat Completions ("legacy") adapter. Also the base the Kimi
//! adapter reuses, since Kimi is OpenAI-compatible plus extensions.

use super::{ChatProvider, GenerationKwargs, StreamedMessage};
use crate::error::ChatProviderError;
use crate::model::{ContentPart, Message, Role, StreamedPart, TokenUsage, Tool, ToolCall};
use eventsource_stream::Eventsource;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

#[derive(Clone)]
pub struct OpenAILegacyProvider {
    client: reqwest::Client,
    api_key: String,
    model: String,
    base_url: String,
    kwargs: GenerationKwargs,
    /// System/user/assistant messages are sent under `"developer"` instead
    /// of `"system"` for models that require it (o1 and later reasoning
    /// models).
    use_developer_role: bool,
    /// When set, assistant messages carry concatenated `ThinkPart` text
    /// under this wire key (e.g. `reasoning_content` for DeepSeek-compatible
    /// endpoints). Absent means ThinkParts are dropped on encode.
    reasoning_key: Option<String>,
}

impl OpenAILegacyProvider {
    pub fn new(model: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.into(),
            model: model.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
            kwargs: GenerationKwargs::default(),
            use_developer_role: false,
            reasoning_key: None,
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

    pub fn with_developer_role(mut self, use_developer_role: bool) -> Self {
        self.use_developer_role = use_developer_role;
        self
    }

    pub fn with_reasoning_key(mut self, key: impl Into<String>) -> Self {
        self.reasoning_key = Some(key.into());
        self
    }

    pub fn with_generation_kwargs(&self, kwargs: GenerationKwargs) -> Self {
        let mut next = self.clone();
        next.kwargs = kwargs;
        next
    }

    fn system_role(&self) -> &'static str {
        if self.use_developer_role {
            "developer"
        } else {
            "system"
        }
    }

    fn encode_tools(tools: &[Tool]) -> Option<Vec<WireTool>> {
        if tools.is_empty() {
            return None;
        }
        Some(
            tools
                .iter()
                .map(|t| WireTool {
                    tool_type: "function".to_string(),
                    function: WireFunction {
                        name: t.name.clone(),
                        description: t.description.clone(),
                        parameters: t.parameters.clone(),
                    },
                })
                .collect(),
        )
    }

    fn encode_message(&self, msg: &Message) -> Option<WireMessage> {
        match msg.role {
            Role::System => Some(WireMessage {
                role: self.system_role().to_string(),
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
    /// `self.reasoning_key` when one is configured.
    fn reasoning_text(msg: &Message) -> Option<String> {
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

    /// Drop the oldest complete tool-call turns beyond `max_turns`, keeping
    /// history bounded. A "turn" is one assistant-with-tool_calls message
    /// plus its following run of tool-result messages.
    pub fn prune_tool_turns(history: &mut Vec<Message>, max_turns: usize) {
        let mut turns: Vec<(usize, usize)> = Vec::new();
        let mut i = 0;
        while i < history.len() {
            if history[i].role == Role::Assistant && history[i].tool_calls.is_some() {
                let start = i;
                let mut end = i + 1;
                while end < history.len() && history[end].role == Role::Tool {
                    end += 1;
                }
                turns.push((start, end));
                i = end;
            } else {
                i += 1;
            }
        }
        if turns.len() <= max_turns {
            return;
        }
        let drop_count = turns.len() - max_turns;
        for &(start, end) in turns[..drop_count].iter().rev() {
            history.drain(start..end);
        }
    }
}

#[async_trait::async_trait]
impl ChatProvider for OpenAILegacyProvider {
    fn name(&self) -> &str {
        "openai"
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
            messages.push(json!(WireMessage {
                role: self.system_role().to_string(),
                content: Some(system_prompt.to_string()),
                tool_calls: None,
                tool_call_id: None,
            }));
        }
        for msg in history {
            if let Some(wire) = self.encode_message(msg) {
                let mut value = serde_json::to_value(&wire).expect("message always serializes");
                if let Some(key) = &self.reasoning_key {
                    if let Some(reasoning) = Self::reasoning_text(msg) {
                        value[key] = json!(reasoning);
                    }
                }
                messages.push(value);
            }
        }

        let request = WireRequest {
            model: self.model.clone(),
            messages,
            temperature: self.kwargs.temperature,
            max_completion_tokens: self.kwargs.max_tokens,
            stream: true,
            stream_options: Some(WireStreamOptions { include_usage: true }),
            tools: Self::encode_tools(tools),
        };

        let mut req = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&request);
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
            // OpenAI only sends a tool call's `id` on the first chunk for
            // that array index; later deltas omit it, so we remember it here.
            let mut index_to_id: HashMap<usize, String> = HashMap::new();

            while let Some(event) = event_stream.next().await {
                let event = match event {
                    Ok(e) => e,
                    Err(err) => {
                        yield Err(ChatProviderError::Other(format!("openai stream error: {err}")));
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
                                index_to_id.insert(delta.index, id.clone());
                                let args = delta.function.as_ref().and_then(|f| f.arguments.clone());
                                yield Ok(StreamedPart::ToolCall(ToolCall::new(id, name, args)));
                            } else if let Some(args) = delta.function.and_then(|f| f.arguments) {
                                let _ = index_to_id.get(&delta.index);
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

#[derive(Debug, Clone, Serialize)]
pub(crate) struct WireRequest {
    pub model: String,
    pub messages: Vec<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_completion_tokens: Option<u32>,
    pub stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream_options: Option<WireStreamOptions>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<WireTool>>,
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct WireStreamOptions {
    pub include_usage: bool,
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct WireTool {
    #[serde(rename = "type")]
    pub tool_type: String,
    pub function: WireFunction,
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct WireFunction {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct WireMessage {
    pub role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<WireToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct WireToolCall {
    pub id: String,
    #[serde(rename = "type")]
    pub tool_type: String,
    pub function: WireFunctionCall,
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct WireFunctionCall {
    pub name: String,
    pub arguments: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct WireChunk {
    pub id: String,
    pub choices: Vec<WireChoice>,
    #[serde(default)]
    pub usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct WireChoice {
    pub delta: WireDelta,
}

#[derive(Debug, Deserialize, Default)]
pub(crate) struct WireDelta {
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub tool_calls: Option<Vec<WireToolCallDelta>>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct WireToolCallDelta {
    pub index: usize,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub function: Option<WireFunctionDelta>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct WireFunctionDelta {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub arguments: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct WireUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assistant_with_tool_turn(id: &str) -> Vec<Message> {
        let mut assistant = Message::new(Role::Assistant, vec![]);
        assistant.tool_calls = Some(vec![ToolCall::new(id, "t", Some("{}".to_string()))]);
        vec![assistant, Message::tool_result(id, "ok")]
    }

    #[test]
    fn prunes_oldest_tool_turns_beyond_max() {
        let mut history = Vec::new();
        history.push(Message::user("start"));
        for i in 0..5 {
            history.extend(assistant_with_tool_turn(&format!("t{i}")));
        }
        OpenAILegacyProvider::prune_tool_turns(&mut history, 2);
        let remaining_tool_calls: usize = history
            .iter()
            .filter(|m| m.role == Role::Assistant && m.tool_calls.is_some())
            .count();
        assert_eq!(remaining_tool_calls, 2);
        // the surviving turns are the most recent ones
        let last_assistant = history
            .iter()
            .rev()
            .find(|m| m.tool_calls.is_some())
            .unwrap();
        assert_eq!(last_assistant.tool_calls.as_ref().unwrap()[0].id, "t4");
    }

    #[test]
    fn developer_role_used_when_configured() {
        let provider = OpenAILegacyProvider::new("o1-preview", "key").with_developer_role(true);
        assert_eq!(provider.system_role(), "developer");
    }

    #[test]
    fn tool_call_with_no_name_encodes_as_assistant_message() {
        let provider = OpenAILegacyProvider::new("gpt-4o", "key");
        let mut msg = Message::new(Role::Assistant, vec![ContentPart::text("done")]);
        msg.tool_calls = Some(vec![ToolCall::new("1", "lookup", Some(r#"{"q":1}"#.to_string()))]);
        let wire = provider.encode_message(&msg).unwrap();
        assert_eq!(wire.role, "assistant");
        assert_eq!(wire.content.as_deref(), Some("done"));
        assert_eq!(wire.tool_calls.unwrap()[0].function.name, "lookup");
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

        let provider = OpenAILegacyProvider::new("gpt-4o", "key")
            .with_base_url(server.uri())
            .with_client(reqwest::Client::new());

        let mut streamed = provider.generate("", &[], &[Message::user("hi")]).await.unwrap();
        while streamed.stream.next().await.is_some() {}
        assert_eq!(streamed.id(), Some("chatcmpl-1".to_string()));
    }
}
