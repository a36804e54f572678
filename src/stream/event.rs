//! Low-level stream events emitted by agent backends.

use serde::{Deserialize, Serialize};

use crate::task::{BlockType, ContentBlock, Role, Usage};

/// Kind of a low-level stream event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamEventKind {
    MessageStart,
    ContentStart,
    ContentDelta,
    ContentEnd,
    MessageEnd,
}

/// One signal in the incremental construction of a message.
///
/// This is also the JSON-lines wire format read from subprocess backends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamEvent {
    #[serde(rename = "type")]
    pub kind: StreamEventKind,
    #[serde(default)]
    pub message_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<Role>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_type: Option<BlockType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delta: Option<String>,
    /// A pre-built block (seed on `content_start`, complete on `content_end`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block: Option<ContentBlock>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    /// Backend-native session id, announced on any event.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

impl StreamEvent {
    fn bare(kind: StreamEventKind, message_id: impl Into<String>) -> Self {
        Self {
            kind,
            message_id: message_id.into(),
            role: None,
            block_type: None,
            delta: None,
            block: None,
            tool_call_id: None,
            content: None,
            session_id: None,
            usage: None,
        }
    }

    pub fn message_start(message_id: impl Into<String>, role: Role) -> Self {
        Self {
            role: Some(role),
            ..Self::bare(StreamEventKind::MessageStart, message_id)
        }
    }

    pub fn content_start(message_id: impl Into<String>, block_type: BlockType) -> Self {
        Self {
            block_type: Some(block_type),
            ..Self::bare(StreamEventKind::ContentStart, message_id)
        }
    }

    /// Open a tool_use block with its call id and tool name.
    pub fn tool_use_start(
        message_id: impl Into<String>,
        tool_call_id: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            block_type: Some(BlockType::ToolUse),
            tool_call_id: Some(tool_call_id.into()),
            content: Some(name.into()),
            ..Self::bare(StreamEventKind::ContentStart, message_id)
        }
    }

    pub fn content_delta(
        message_id: impl Into<String>,
        block_type: BlockType,
        delta: impl Into<String>,
    ) -> Self {
        Self {
            block_type: Some(block_type),
            delta: Some(delta.into()),
            ..Self::bare(StreamEventKind::ContentDelta, message_id)
        }
    }

    pub fn content_end(message_id: impl Into<String>) -> Self {
        Self::bare(StreamEventKind::ContentEnd, message_id)
    }

    pub fn message_end(message_id: impl Into<String>) -> Self {
        Self::bare(StreamEventKind::MessageEnd, message_id)
    }

    pub fn with_block(mut self, block: ContentBlock) -> Self {
        self.block_type = Some(block.block_type());
        self.block = Some(block);
        self
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_usage(mut self, usage: Usage) -> Self {
        self.usage = Some(usage);
        self
    }
}
