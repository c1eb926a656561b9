//! A chat provider with no network I/O, yielding a fixed sequence of parts.
//! Used to exercise the merge and step logic deterministically in tests.

use super::{ChatProvider, StreamedMessage};
use crate::error::ChatProviderError;
use crate::model::{Message, StreamedPart, Tool};
use futures::stream;

pub struct MockChatProvider {
    parts: Vec<StreamedPart>,
}

impl MockChatProvider {
    pub fn new(parts: Vec<StreamedPart>) -> Self {
        Self { parts }
    }
}

#[async_trait::async_trait]
impl ChatProvider for MockChatProvider {
    fn name(&self) -> &str {
        "mock"
    }

    fn model_name(&self) -> &str {
        "mock"
    }

    async fn generate(
        &self,
        _system_prompt: &str,
        _tools: &[Tool],
        _history: &[Message],
    ) -> Result<StreamedMessage, ChatProviderError> {
        let items: Vec<Result<StreamedPart, ChatProviderError>> =
            self.parts.iter().cloned().map(Ok).collect();
        let (msg, _id, _usage) = StreamedMessage::new(Box::pin(stream::iter(items)));
        Ok(msg)
    }
}
