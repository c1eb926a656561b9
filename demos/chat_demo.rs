//! Minimal end-to-end exercise of the step pipeline: a mock provider replies
//! with a tool call, the shell tool runs it, and the result is appended to
//! an in-memory context.

use kosong_rs::context::{LinearContext, MemoryLinearStorage};
use kosong_rs::model::{ContentPart, FunctionBody, Message, StreamedPart, ToolCall};
use kosong_rs::provider::mock::MockChatProvider;
use kosong_rs::tooling::SimpleToolset;
use kosong_rs::tools::ShellTool;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() {
    env_logger::init();

    let toolset = SimpleToolset::new()
        .register(ShellTool::new())
        .expect("shell tool schema is valid");
    let context = LinearContext::new(
        "You are a helpful assistant with shell access.",
        Arc::new(toolset) as Arc<dyn kosong_rs::tooling::Toolset>,
        MemoryLinearStorage::new(),
    );
    context.add_message(Message::user("What files are in the current directory?"));

    let provider = MockChatProvider::new(vec![
        StreamedPart::Content(ContentPart::text("Let me check.")),
        StreamedPart::ToolCall(ToolCall {
            id: "call_1".to_string(),
            function: FunctionBody {
                name: "shell".to_string(),
                arguments: Some(r#"{"command": "ls"}"#.to_string()),
            },
            extras: Default::default(),
        }),
    ]);

    let result = kosong_rs::step::step(
        &provider,
        &context,
        context.toolset().as_ref(),
        CancellationToken::new(),
        Some(Box::new(|part: &StreamedPart| {
            log::info!("part: {:?}", part);
        })),
        Some(Box::new(|result| {
            log::info!("tool result: {:?}", result);
        })),
    )
    .await
    .expect("step succeeds");

    context.add_message(result.message.clone());
    println!("assistant said: {}", result.message.text_content());

    for tool_result in result.tool_results().await {
        match tool_result.result {
            Ok(ok) => {
                context.add_message(Message::tool_result(tool_result.tool_call_id, ok.output));
            }
            Err(e) => eprintln!("tool error: {e}"),
        }
    }
}
