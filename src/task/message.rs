//! Transcript messages and their content blocks.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Author of a transcript turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    #[default]
    Assistant,
    Tool,
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::Tool => "tool",
            Self::System => "system",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(Self::User),
            "assistant" => Some(Self::Assistant),
            "tool" => Some(Self::Tool),
            "system" => Some(Self::System),
            _ => None,
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of a content block, mirroring the `ContentBlock` tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockType {
    Text,
    Thinking,
    ToolUse,
    ToolResult,
}

/// A tagged unit of message content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    Thinking {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: serde_json::Value,
    },
    ToolResult {
        tool_use_id: String,
        #[serde(default)]
        content: String,
        #[serde(default)]
        is_error: bool,
    },
}

impl ContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    /// An empty block of the given type.
    pub fn empty(block_type: BlockType) -> Self {
        match block_type {
            BlockType::Text => Self::Text { text: String::new() },
            BlockType::Thinking => Self::Thinking { text: String::new() },
            BlockType::ToolUse => Self::ToolUse {
                id: String::new(),
                name: String::new(),
                input: serde_json::Value::Null,
            },
            BlockType::ToolResult => Self::ToolResult {
                tool_use_id: String::new(),
                content: String::new(),
                is_error: false,
            },
        }
    }

    pub fn block_type(&self) -> BlockType {
        match self {
            Self::Text { .. } => BlockType::Text,
            Self::Thinking { .. } => BlockType::Thinking,
            Self::ToolUse { .. } => BlockType::ToolUse,
            Self::ToolResult { .. } => BlockType::ToolResult,
        }
    }
}

/// One immutable turn of a task transcript.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub task_id: Uuid,
    pub run_id: Option<Uuid>,
    pub role: Role,
    pub blocks: Vec<ContentBlock>,
    /// Flat text summary (concatenated text blocks).
    pub text: String,
    pub created_at: DateTime<Utc>,
}

impl Message {
    /// Build a message from its blocks, deriving the flat text.
    pub fn new(task_id: Uuid, run_id: Option<Uuid>, role: Role, blocks: Vec<ContentBlock>) -> Self {
        let text = flatten_text(&blocks);
        Self {
            id: Uuid::new_v4(),
            task_id,
            run_id,
            role,
            blocks,
            text,
            created_at: Utc::now(),
        }
    }

    /// A single-block text message.
    pub fn text(task_id: Uuid, run_id: Option<Uuid>, role: Role, text: impl Into<String>) -> Self {
        Self::new(task_id, run_id, role, vec![ContentBlock::text(text)])
    }
}

/// Concatenate the text blocks of a message, one per line.
pub fn flatten_text(blocks: &[ContentBlock]) -> String {
    blocks
        .iter()
        .filter_map(|b| match b {
            ContentBlock::Text { text } if !text.is_empty() => Some(text.as_str()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("\n")
}
