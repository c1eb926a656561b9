//! The streaming merge pipeline: consumes a provider's part stream, merges
//! mergeable parts in place, and assembles the final message and tool calls.
//!
//! A single `pending` slot holds the part currently being assembled. When a
//! new part arrives that cannot merge into `pending` (or `pending` is empty),
//! the old `pending` is flushed into the output and the new part becomes the
//! next `pending`. At end of stream, whatever is left in `pending` is flushed
//! too. `ToolCallPart` fragments merge their `arguments_part` into the
//! trailing `ToolCall`'s `function.arguments`; a fragment with nothing to
//! merge into is dropped.

use crate::error::ChatProviderError;
use crate::model::{ContentPart, GenerateResult, Message, Role, StreamedPart, ToolCall};
use crate::provider::{ChatProvider, StreamedMessage};
use futures::StreamExt;
use tokio_util::sync::CancellationToken;

enum Pending {
    Content(ContentPart),
    ToolCall(ToolCall),
}

#[derive(Default)]
struct MessageBuilder {
    content: Vec<ContentPart>,
    tool_calls: Vec<ToolCall>,
}

impl MessageBuilder {
    fn push(&mut self, pending: Pending) {
        match pending {
            Pending::Content(c) => self.content.push(c),
            Pending::ToolCall(tc) => self.tool_calls.push(tc),
        }
    }

    fn is_empty(&self) -> bool {
        self.content.is_empty() && self.tool_calls.is_empty()
    }

    fn build(self) -> Message {
        Message {
            role: Role::Assistant,
            name: None,
            content: self.content,
            tool_calls: if self.tool_calls.is_empty() {
                None
            } else {
                Some(self.tool_calls)
            },
            tool_call_id: None,
            partial: None,
        }
    }
}

/// Callbacks invoked as the merge progresses: `on_part` for every raw part as
/// it arrives off the wire, `on_tool_call` once per tool call as soon as it is
/// fully assembled (flushed from `pending`). Either may be omitted.
pub struct Callbacks<'a> {
    pub on_part: Option<Box<dyn FnMut(&StreamedPart) + Send + 'a>>,
    pub on_tool_call: Option<Box<dyn FnMut(&ToolCall) + Send + 'a>>,
}

impl<'a> Default for Callbacks<'a> {
    fn default() -> Self {
        Self {
            on_part: None,
            on_tool_call: None,
        }
    }
}

/// Drive a provider's generation through the merge algorithm, producing the
/// final assembled message, its id, and its token usage.
///
/// Returns [`ChatProviderError::ApiEmptyResponse`] if the stream yields no
/// parts at all (a provider returning a response with nothing in it), or
/// [`ChatProviderError::Cancelled`] if `cancel` fires before the stream ends.
pub async fn generate(
    provider: &dyn ChatProvider,
    system_prompt: &str,
    tools: &[crate::model::Tool],
    history: &[Message],
    mut callbacks: Callbacks<'_>,
    cancel: &CancellationToken,
) -> Result<GenerateResult, ChatProviderError> {
    let streamed = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(ChatProviderError::Cancelled),
        result = provider.generate(system_prompt, tools, history) => result?,
    };
    let result = merge_stream(streamed, &mut callbacks, cancel).await?;
    Ok(result)
}

async fn merge_stream(
    mut streamed: StreamedMessage,
    callbacks: &mut Callbacks<'_>,
    cancel: &CancellationToken,
) -> Result<GenerateResult, ChatProviderError> {
    let mut builder = MessageBuilder::default();
    let mut pending: Option<Pending> = None;

    loop {
        let item = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ChatProviderError::Cancelled),
            item = streamed.stream.next() => item,
        };
        let Some(item) = item else { break };
        let part = item?;
        if let Some(cb) = callbacks.on_part.as_mut() {
            cb(&part);
        }

        match part {
            StreamedPart::Content(c) => {
                match &mut pending {
                    Some(Pending::Content(existing)) if existing.merge_in_place(&c) => {}
                    _ => {
                        flush(&mut pending, &mut builder, callbacks);
                        pending = Some(Pending::Content(c));
                    }
                }
            }
            StreamedPart::ToolCall(tc) => {
                flush(&mut pending, &mut builder, callbacks);
                pending = Some(Pending::ToolCall(tc));
            }
            StreamedPart::ToolCallPart(frag) => match &mut pending {
                Some(Pending::ToolCall(call)) => {
                    let existing = call.function.arguments.get_or_insert_with(String::new);
                    existing.push_str(&frag.arguments_part);
                }
                _ => {
                    // Orphaned fragment: no tool call to attach to. Discard.
                }
            },
        }
    }
    flush(&mut pending, &mut builder, callbacks);

    if builder.is_empty() {
        return Err(ChatProviderError::ApiEmptyResponse);
    }

    Ok(GenerateResult {
        id: streamed.id(),
        message: builder.build(),
        usage: streamed.usage(),
    })
}

fn flush(pending: &mut Option<Pending>, builder: &mut MessageBuilder, callbacks: &mut Callbacks<'_>) {
    if let Some(p) = pending.take() {
        if let Pending::ToolCall(tc) = &p {
            if let Some(cb) = callbacks.on_tool_call.as_mut() {
                cb(tc);
            }
        }
        builder.push(p);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::FunctionBody;
    use crate::provider::mock::MockChatProvider;

    fn call(id: &str, name: &str, args: Option<&str>) -> ToolCall {
        ToolCall {
            id: id.to_string(),
            function: FunctionBody {
                name: name.to_string(),
                arguments: args.map(|s| s.to_string()),
            },
            extras: Default::default(),
        }
    }

    #[tokio::test]
    async fn merges_consecutive_text_parts() {
        let provider = MockChatProvider::new(vec![
            StreamedPart::Content(ContentPart::text("Hello, ")),
            StreamedPart::Content(ContentPart::text("world!")),
        ]);
        let result = generate(&provider, "", &[], &[], Callbacks::default(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.message.text_content(), "Hello, world!");
    }

    #[tokio::test]
    async fn text_then_tool_call_flushes_text_first() {
        let provider = MockChatProvider::new(vec![
            StreamedPart::Content(ContentPart::text("checking weather")),
            StreamedPart::ToolCall(call("1", "get_weather", Some(r#"{"city":"#))),
            StreamedPart::ToolCallPart(crate::model::ToolCallPart {
                arguments_part: r#""SF"}"#.to_string(),
            }),
        ]);
        let result = generate(&provider, "", &[], &[], Callbacks::default(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.message.text_content(), "checking weather");
        let calls = result.message.tool_calls.unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].function.arguments.as_deref(), Some(r#"{"city":"SF"}"#));
    }

    #[tokio::test]
    async fn orphaned_tool_call_fragment_is_discarded() {
        let provider = MockChatProvider::new(vec![StreamedPart::ToolCallPart(
            crate::model::ToolCallPart {
                arguments_part: "garbage".to_string(),
            },
        )]);
        let err = generate(&provider, "", &[], &[], Callbacks::default(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ChatProviderError::ApiEmptyResponse));
    }

    #[tokio::test]
    async fn empty_stream_is_empty_response_error() {
        let provider = MockChatProvider::new(vec![]);
        let err = generate(&provider, "", &[], &[], Callbacks::default(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ChatProviderError::ApiEmptyResponse));
    }

    #[tokio::test]
    async fn cancelled_token_aborts_before_any_part_is_merged() {
        let provider = MockChatProvider::new(vec![StreamedPart::Content(ContentPart::text("hi"))]);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = generate(&provider, "", &[], &[], Callbacks::default(), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, ChatProviderError::Cancelled));
    }

    #[tokio::test]
    async fn on_tool_call_callback_fires_once_per_call() {
        let provider = MockChatProvider::new(vec![
            StreamedPart::ToolCall(call("1", "a", Some("{}"))),
            StreamedPart::ToolCall(call("2", "b", Some("{}"))),
        ]);
        let mut seen = Vec::new();
        let callbacks = Callbacks {
            on_part: None,
            on_tool_call: Some(Box::new(|tc: &ToolCall| seen.push(tc.id.clone()))),
        };
        let _ = generate(&provider, "", &[], &[], callbacks, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(seen, vec!["1".to_string(), "2".to_string()]);
    }
}
