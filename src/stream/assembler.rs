//! Stream assembler: rebuilds finalized messages from flat stream events.
//!
//! Working state is kept per message id and removed on `message_end`.
//! Tool-call arguments arrive as JSON fragments that are not valid on their
//! own, so they are accumulated as a string and parsed once when the block
//! closes.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::stream::event::{StreamEvent, StreamEventKind};
use crate::task::{ContentBlock, Role, Usage};

/// Key holding unparseable tool arguments verbatim.
pub const RAW_INPUT_KEY: &str = "raw_input";

/// A message whose closing event has arrived. Never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssembledMessage {
    pub id: String,
    pub role: Role,
    pub blocks: Vec<ContentBlock>,
    pub usage: Usage,
}

#[derive(Debug, Default)]
struct WorkingMessage {
    role: Role,
    blocks: Vec<ContentBlock>,
    open: Option<ContentBlock>,
    /// Accumulated tool_use argument fragments for the open block.
    tool_args: String,
    usage: Usage,
}

impl WorkingMessage {
    fn close_open_block(&mut self) {
        if let Some(block) = self.open.take() {
            let args = std::mem::take(&mut self.tool_args);
            self.blocks.push(finalize_block(block, &args));
        }
    }
}

/// Single-threaded state machine keyed by message id.
#[derive(Debug, Default)]
pub struct StreamAssembler {
    messages: HashMap<String, WorkingMessage>,
}

impl StreamAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one event. Returns the finalized message on `message_end`.
    pub fn apply(&mut self, event: &StreamEvent) -> Option<AssembledMessage> {
        if event.message_id.is_empty() {
            debug!(kind = ?event.kind, "Ignoring stream event without message id");
            return None;
        }

        if event.kind == StreamEventKind::MessageStart {
            let working = WorkingMessage {
                role: event.role.unwrap_or_default(),
                ..Default::default()
            };
            self.messages.insert(event.message_id.clone(), working);
            return None;
        }

        let Some(working) = self.messages.get_mut(&event.message_id) else {
            debug!(
                message_id = %event.message_id,
                kind = ?event.kind,
                "Ignoring stream event for unknown message"
            );
            return None;
        };

        match event.kind {
            StreamEventKind::MessageStart => None,
            StreamEventKind::ContentStart => {
                working.close_open_block();
                working.open = seed_block(event);
                working.tool_args.clear();
                None
            }
            StreamEventKind::ContentDelta => {
                let delta = event.delta.as_deref().unwrap_or_default();
                match working.open.as_mut() {
                    Some(ContentBlock::Text { text }) | Some(ContentBlock::Thinking { text }) => {
                        text.push_str(delta);
                    }
                    Some(ContentBlock::ToolUse { .. }) => working.tool_args.push_str(delta),
                    Some(ContentBlock::ToolResult { content, .. }) => content.push_str(delta),
                    None => {
                        debug!(message_id = %event.message_id, "Delta without an open block");
                    }
                }
                None
            }
            StreamEventKind::ContentEnd => {
                if working.open.is_some() {
                    working.close_open_block();
                } else if let Some(block) = &event.block {
                    working.blocks.push(finalize_block(block.clone(), ""));
                }
                None
            }
            StreamEventKind::MessageEnd => {
                let mut working = self.messages.remove(&event.message_id)?;
                working.close_open_block();
                if let Some(usage) = event.usage {
                    working.usage.add(usage);
                }
                Some(AssembledMessage {
                    id: event.message_id.clone(),
                    role: working.role,
                    blocks: working.blocks,
                    usage: working.usage,
                })
            }
        }
    }

    /// Drop the working state of one message.
    pub fn discard(&mut self, message_id: &str) -> bool {
        self.messages.remove(message_id).is_some()
    }

    /// Drop all working state (interrupted stream). Returns how many
    /// unfinished messages were discarded.
    pub fn abort(&mut self) -> usize {
        let count = self.messages.len();
        self.messages.clear();
        count
    }

    /// Number of messages still being assembled.
    pub fn pending(&self) -> usize {
        self.messages.len()
    }
}

fn seed_block(event: &StreamEvent) -> Option<ContentBlock> {
    let mut block = match (&event.block, event.block_type) {
        (Some(block), _) => block.clone(),
        (None, Some(block_type)) => ContentBlock::empty(block_type),
        (None, None) => {
            debug!(message_id = %event.message_id, "content_start without a block type");
            return None;
        }
    };

    match &mut block {
        ContentBlock::ToolUse { id, name, .. } => {
            if id.is_empty()
                && let Some(call_id) = &event.tool_call_id
            {
                *id = call_id.clone();
            }
            if name.is_empty()
                && let Some(tool_name) = &event.content
            {
                *name = tool_name.clone();
            }
        }
        ContentBlock::ToolResult {
            tool_use_id,
            content,
            ..
        } => {
            if tool_use_id.is_empty()
                && let Some(call_id) = &event.tool_call_id
            {
                *tool_use_id = call_id.clone();
            }
            if content.is_empty()
                && let Some(output) = &event.content
            {
                *content = output.clone();
            }
        }
        ContentBlock::Text { .. } | ContentBlock::Thinking { .. } => {}
    }

    Some(block)
}

fn finalize_block(block: ContentBlock, tool_args: &str) -> ContentBlock {
    match block {
        ContentBlock::ToolUse { id, name, input } if input.is_null() => ContentBlock::ToolUse {
            id,
            name,
            input: parse_tool_input(tool_args),
        },
        other => other,
    }
}

fn parse_tool_input(raw: &str) -> serde_json::Value {
    if raw.trim().is_empty() {
        return serde_json::Value::Object(serde_json::Map::new());
    }
    match serde_json::from_str(raw) {
        Ok(value) => value,
        Err(e) => {
            debug!(error = %e, "Tool arguments are not valid JSON, keeping raw string");
            serde_json::json!({ RAW_INPUT_KEY: raw })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::BlockType;

    fn feed(assembler: &mut StreamAssembler, events: &[StreamEvent]) -> Vec<AssembledMessage> {
        events.iter().filter_map(|e| assembler.apply(e)).collect()
    }

    #[test]
    fn tool_use_arguments_parsed_on_close() {
        let mut asm = StreamAssembler::new();
        let done = feed(
            &mut asm,
            &[
                StreamEvent::message_start("msg-1", Role::Assistant),
                StreamEvent::tool_use_start("msg-1", "call_1", "list_dir"),
                StreamEvent::content_delta("msg-1", BlockType::ToolUse, r#"{"path":"."}"#),
                StreamEvent::content_end("msg-1"),
                StreamEvent::message_end("msg-1"),
            ],
        );

        assert_eq!(done.len(), 1);
        let msg = &done[0];
        assert_eq!(msg.id, "msg-1");
        assert_eq!(msg.blocks.len(), 1);
        match &msg.blocks[0] {
            ContentBlock::ToolUse { id, name, input } => {
                assert_eq!(id, "call_1");
                assert_eq!(name, "list_dir");
                assert_eq!(input["path"], ".");
            }
            other => panic!("expected tool_use, got {other:?}"),
        }
        assert_eq!(asm.pending(), 0);
    }

    #[test]
    fn fragmented_arguments_are_joined_before_parsing() {
        let mut asm = StreamAssembler::new();
        let done = feed(
            &mut asm,
            &[
                StreamEvent::message_start("m", Role::Assistant),
                StreamEvent::content_start("m", BlockType::ToolUse),
                StreamEvent::content_delta("m", BlockType::ToolUse, r#"{"pa"#),
                StreamEvent::content_delta("m", BlockType::ToolUse, r#"th":"src/"#),
                StreamEvent::content_delta("m", BlockType::ToolUse, r#"main.rs"}"#),
                StreamEvent::content_end("m"),
                StreamEvent::message_end("m"),
            ],
        );
        match &done[0].blocks[0] {
            ContentBlock::ToolUse { input, .. } => assert_eq!(input["path"], "src/main.rs"),
            other => panic!("expected tool_use, got {other:?}"),
        }
    }

    #[test]
    fn malformed_arguments_kept_under_fallback_key() {
        let mut asm = StreamAssembler::new();
        let done = feed(
            &mut asm,
            &[
                StreamEvent::message_start("m", Role::Assistant),
                StreamEvent::content_start("m", BlockType::ToolUse),
                StreamEvent::content_delta("m", BlockType::ToolUse, r#"{"path": "#),
                StreamEvent::content_end("m"),
                StreamEvent::message_end("m"),
            ],
        );
        match &done[0].blocks[0] {
            ContentBlock::ToolUse { input, .. } => {
                assert_eq!(input[RAW_INPUT_KEY], r#"{"path": "#);
            }
            other => panic!("expected tool_use, got {other:?}"),
        }
    }

    #[test]
    fn pre_attached_input_is_not_overwritten() {
        let mut asm = StreamAssembler::new();
        let seeded = ContentBlock::ToolUse {
            id: "call_9".to_string(),
            name: "shell".to_string(),
            input: serde_json::json!({"command": "ls"}),
        };
        let done = feed(
            &mut asm,
            &[
                StreamEvent::message_start("m", Role::Assistant),
                StreamEvent::content_start("m", BlockType::ToolUse).with_block(seeded.clone()),
                StreamEvent::content_delta("m", BlockType::ToolUse, "garbage"),
                StreamEvent::content_end("m"),
                StreamEvent::message_end("m"),
            ],
        );
        assert_eq!(done[0].blocks, vec![seeded]);
    }

    #[test]
    fn thinking_then_text_keeps_arrival_order() {
        let mut asm = StreamAssembler::new();
        let done = feed(
            &mut asm,
            &[
                StreamEvent::message_start("m", Role::Assistant),
                StreamEvent::content_start("m", BlockType::Thinking),
                StreamEvent::content_delta("m", BlockType::Thinking, "let me "),
                StreamEvent::content_delta("m", BlockType::Thinking, "think"),
                StreamEvent::content_end("m"),
                StreamEvent::content_start("m", BlockType::Text),
                StreamEvent::content_delta("m", BlockType::Text, "Done."),
                StreamEvent::content_end("m"),
                StreamEvent::message_end("m"),
            ],
        );
        assert_eq!(
            done[0].blocks,
            vec![
                ContentBlock::Thinking { text: "let me think".to_string() },
                ContentBlock::text("Done."),
            ]
        );
    }

    #[test]
    fn complete_block_on_content_end_is_appended() {
        let mut asm = StreamAssembler::new();
        let result = ContentBlock::ToolResult {
            tool_use_id: "call_1".to_string(),
            content: "file.txt".to_string(),
            is_error: false,
        };
        let done = feed(
            &mut asm,
            &[
                StreamEvent::message_start("t", Role::Tool),
                StreamEvent::content_end("t").with_block(result.clone()),
                StreamEvent::message_end("t"),
            ],
        );
        assert_eq!(done[0].role, Role::Tool);
        assert_eq!(done[0].blocks, vec![result]);
    }

    #[test]
    fn unknown_and_empty_ids_are_rejected() {
        let mut asm = StreamAssembler::new();
        assert!(asm.apply(&StreamEvent::message_end("nope")).is_none());
        assert!(asm.apply(&StreamEvent::content_delta("nope", BlockType::Text, "x")).is_none());
        assert!(asm.apply(&StreamEvent::message_start("", Role::Assistant)).is_none());
        assert_eq!(asm.pending(), 0);
    }

    #[test]
    fn interleaved_messages_assemble_independently() {
        let mut asm = StreamAssembler::new();
        let done = feed(
            &mut asm,
            &[
                StreamEvent::message_start("a", Role::Assistant),
                StreamEvent::message_start("b", Role::Assistant),
                StreamEvent::content_start("a", BlockType::Text),
                StreamEvent::content_start("b", BlockType::Text),
                StreamEvent::content_delta("b", BlockType::Text, "bee"),
                StreamEvent::content_delta("a", BlockType::Text, "ay"),
                StreamEvent::message_end("b"),
                StreamEvent::message_end("a"),
            ],
        );
        assert_eq!(done.len(), 2);
        assert_eq!(done[0].id, "b");
        assert_eq!(done[0].blocks, vec![ContentBlock::text("bee")]);
        assert_eq!(done[1].blocks, vec![ContentBlock::text("ay")]);
    }

    #[test]
    fn abort_clears_unfinished_messages() {
        let mut asm = StreamAssembler::new();
        asm.apply(&StreamEvent::message_start("x", Role::Assistant));
        asm.apply(&StreamEvent::message_start("y", Role::Assistant));
        assert_eq!(asm.pending(), 2);
        assert!(asm.discard("x"));
        assert_eq!(asm.abort(), 1);
        assert_eq!(asm.pending(), 0);
        assert!(asm.apply(&StreamEvent::message_end("y")).is_none());
    }

    #[test]
    fn usage_is_carried_on_message_end() {
        let mut asm = StreamAssembler::new();
        asm.apply(&StreamEvent::message_start("u", Role::Assistant));
        let usage = Usage { input_tokens: 12, output_tokens: 3 };
        let msg = asm.apply(&StreamEvent::message_end("u").with_usage(usage)).unwrap();
        assert_eq!(msg.usage, usage);
        assert!(msg.blocks.is_empty());
    }
}
