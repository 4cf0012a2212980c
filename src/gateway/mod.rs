//! Model gateway contract: the boundary between the loop and the model service.
//!
//! The loop never talks to a transport directly. It hands a [`GatewayRequest`]
//! to a [`ModelGateway`] and gets back either a whole [`GatewayResponse`] or a
//! stream of [`GatewayDelta`]s that aggregate to the same response.

pub mod scripted;

pub use scripted::{ScriptedGateway, ScriptedReply};

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use strum::Display;

use crate::config::ModelConfig;
use crate::conversation::ConversationSnapshot;
use crate::error::ConductorError;
use crate::tools::ToolDescriptor;
use crate::types::{ContentBlock, ToolCall, Usage};

/// Everything the model service needs for one invocation.
#[derive(Debug, Clone)]
pub struct GatewayRequest {
    pub model: ModelConfig,
    pub conversation: ConversationSnapshot,
    pub tools: Vec<ToolDescriptor>,
    pub streaming: bool,
    /// Delegation depth of the requesting loop.
    pub depth: usize,
}

/// How the model ended its response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Termination {
    /// The task is finished.
    Final,
    /// The response carries tool calls to dispatch.
    ToolRequested,
    /// Not finished, nothing to dispatch; invoke again.
    Paused,
}

/// A classified model response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayResponse {
    pub blocks: Vec<ContentBlock>,
    pub termination: Termination,
    #[serde(default)]
    pub usage: Usage,
}

impl GatewayResponse {
    pub fn final_text(text: impl Into<String>) -> Self {
        Self {
            blocks: vec![ContentBlock::text(text)],
            termination: Termination::Final,
            usage: Usage::default(),
        }
    }

    pub fn tool_calls(calls: Vec<ToolCall>) -> Self {
        Self {
            blocks: calls.into_iter().map(ContentBlock::ToolCall).collect(),
            termination: Termination::ToolRequested,
            usage: Usage::default(),
        }
    }

    pub fn paused(text: impl Into<String>) -> Self {
        Self {
            blocks: vec![ContentBlock::text(text)],
            termination: Termination::Paused,
            usage: Usage::default(),
        }
    }

    pub fn with_text_prefix(mut self, text: impl Into<String>) -> Self {
        self.blocks.insert(0, ContentBlock::text(text));
        self
    }

    pub fn with_usage(mut self, usage: Usage) -> Self {
        self.usage = usage;
        self
    }

    /// Fold each run of adjacent text blocks into one block, the layout a
    /// streamed response accumulates to.
    pub fn merge_adjacent_text(mut self) -> Self {
        let mut merged: Vec<ContentBlock> = Vec::with_capacity(self.blocks.len());
        for block in std::mem::take(&mut self.blocks) {
            if let (Some(ContentBlock::Text { text: current }), ContentBlock::Text { text }) =
                (merged.last_mut(), &block)
            {
                current.push_str(text);
                continue;
            }
            merged.push(block);
        }
        self.blocks = merged;
        self
    }

    /// Concatenated text of all text blocks.
    pub fn text(&self) -> String {
        self.blocks
            .iter()
            .filter_map(|block| match block {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }

    pub fn calls(&self) -> Vec<&ToolCall> {
        self.blocks
            .iter()
            .filter_map(|block| match block {
                ContentBlock::ToolCall(call) => Some(call),
                _ => None,
            })
            .collect()
    }
}

/// One increment of a streamed response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GatewayDelta {
    /// Text fragment, appended to the current text block.
    Text { text: String },
    /// A complete tool call.
    ToolCall(ToolCall),
    Usage(Usage),
    /// Last delta of a well-formed stream.
    Done { termination: Termination },
}

pub type DeltaStream = BoxStream<'static, Result<GatewayDelta, ConductorError>>;

/// Client for the model service.
#[async_trait]
pub trait ModelGateway: Send + Sync {
    /// Produce a complete response.
    async fn invoke(&self, request: &GatewayRequest) -> Result<GatewayResponse, ConductorError>;

    /// Produce the response as deltas.
    ///
    /// The default replays [`invoke`](Self::invoke) as one delta per block.
    async fn stream(&self, request: &GatewayRequest) -> Result<DeltaStream, ConductorError> {
        let response = self.invoke(request).await?;
        Ok(response_into_deltas(response, None))
    }
}

/// Turn a whole response into a delta stream.
///
/// With `fragment_chars`, text blocks are cut into fragments of at most that
/// many characters.
pub fn response_into_deltas(response: GatewayResponse, fragment_chars: Option<usize>) -> DeltaStream {
    Box::pin(async_stream::stream! {
        for block in response.blocks {
            match block {
                ContentBlock::Text { text } => {
                    for fragment in split_fragments(&text, fragment_chars) {
                        yield Ok(GatewayDelta::Text { text: fragment });
                    }
                }
                ContentBlock::ToolCall(call) => yield Ok(GatewayDelta::ToolCall(call)),
                other => {
                    yield Err(ConductorError::gateway_fatal(format!(
                        "gateway produced a non-agent block: {other:?}"
                    )));
                    return;
                }
            }
        }
        if response.usage != Usage::default() {
            yield Ok(GatewayDelta::Usage(response.usage));
        }
        yield Ok(GatewayDelta::Done { termination: response.termination });
    })
}

fn split_fragments(text: &str, fragment_chars: Option<usize>) -> Vec<String> {
    match fragment_chars {
        Some(size) if size > 0 => {
            let chars: Vec<char> = text.chars().collect();
            chars.chunks(size).map(|chunk| chunk.iter().collect()).collect()
        }
        _ => vec![text.to_string()],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn adjacent_text_blocks_merge_around_tool_calls() {
        let call = ToolCall::new("c1", "search", json!({}));
        let response = GatewayResponse {
            blocks: vec![
                ContentBlock::text("Let me "),
                ContentBlock::text("check."),
                ContentBlock::ToolCall(call.clone()),
                ContentBlock::text("Done"),
            ],
            termination: Termination::ToolRequested,
            usage: Usage::default(),
        };

        assert_eq!(
            response.merge_adjacent_text().blocks,
            vec![
                ContentBlock::text("Let me check."),
                ContentBlock::ToolCall(call),
                ContentBlock::text("Done"),
            ]
        );
    }

    #[tokio::test]
    async fn deltas_split_text_and_end_with_done() {
        let response = GatewayResponse::tool_calls(vec![ToolCall::new("c1", "search", json!({}))])
            .with_text_prefix("héllo")
            .with_usage(Usage::new(3, 4));
        let deltas: Vec<_> = response_into_deltas(response, Some(2))
            .map(|d| d.unwrap())
            .collect()
            .await;

        assert_eq!(
            deltas,
            vec![
                GatewayDelta::Text { text: "hé".into() },
                GatewayDelta::Text { text: "ll".into() },
                GatewayDelta::Text { text: "o".into() },
                GatewayDelta::ToolCall(ToolCall::new("c1", "search", json!({}))),
                GatewayDelta::Usage(Usage::new(3, 4)),
                GatewayDelta::Done { termination: Termination::ToolRequested },
            ]
        );
    }

    #[test]
    fn response_helpers_read_blocks() {
        let response = GatewayResponse::tool_calls(vec![
            ToolCall::new("a", "x", json!({})),
            ToolCall::new("b", "y", json!({})),
        ])
        .with_text_prefix("calling");
        assert_eq!(response.text(), "calling");
        assert_eq!(response.calls().len(), 2);
    }
}
