//! Context compaction -- keep multi-turn tool use from resending stale
//! binary data.
//!
//! A single multimodal tool result can be tens of kilobytes.  Once the model
//! has seen it, every later iteration would resend it unchanged.  Before the
//! orchestrator appends a new turn, [`compact_history`] rewrites every inline
//! media part already in the history into a short text placeholder of the
//! form `[previously loaded <mime>, <n> bytes]`.  Text, tool calls, and tool
//! results are left untouched, and part positions do not change.

use tracing::debug;

use crate::llm::types::{Message, Part};

/// Summary of one compaction pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompactionStats {
    /// Media parts replaced.
    pub replaced: usize,
    /// Payload bytes no longer resent.
    pub bytes_saved: usize,
}

/// Replace every media part in `history` with its placeholder.
///
/// Callers pass only the history that was already sent; messages produced by
/// the current turn are appended afterwards.
pub fn compact_history(history: &mut [Message]) -> CompactionStats {
    let mut stats = CompactionStats::default();

    for message in history.iter_mut() {
        for part in message.parts.iter_mut() {
            let Part::Media(media) = part else {
                continue;
            };
            if media.data.is_empty() {
                continue;
            }
            stats.replaced += 1;
            stats.bytes_saved += media.data.len();
            *part = Part::Text(media.placeholder());
        }
    }

    if stats.replaced > 0 {
        debug!(
            replaced = stats.replaced,
            bytes_saved = stats.bytes_saved,
            "compacted prior media"
        );
    }
    stats
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::types::{Media, Role, ToolArguments, ToolCall, ToolResult};

    fn media_message() -> Message {
        Message::new(
            Role::User,
            vec![
                Part::Text("Image retrieved from a.png".into()),
                Part::Media(Media::new("image/png", vec![7; 2048])),
            ],
        )
    }

    #[test]
    fn media_becomes_placeholder_in_place() {
        let mut history = vec![Message::user("hi"), media_message()];
        let stats = compact_history(&mut history);

        assert_eq!(stats.replaced, 1);
        assert_eq!(stats.bytes_saved, 2048);
        assert_eq!(history[1].parts.len(), 2);
        assert_eq!(
            history[1].parts[1],
            Part::Text("[previously loaded image/png, 2048 bytes]".into())
        );
    }

    #[test]
    fn other_parts_are_untouched() {
        let call = ToolCall::new("c1", "ls", ToolArguments::Json("{}".into()));
        let result = ToolResult {
            id: "c1".into(),
            name: "ls".into(),
            response: Default::default(),
        };
        let mut history = vec![
            Message::user("hi"),
            Message::new(Role::Model, vec![Part::Thinking("t".into()), Part::ToolCall(call)]),
            Message::tool_results(vec![result]),
        ];
        let before = history.clone();

        let stats = compact_history(&mut history);
        assert_eq!(stats, CompactionStats::default());
        assert_eq!(history, before);
    }

    #[test]
    fn compaction_is_idempotent() {
        let mut history = vec![media_message()];
        compact_history(&mut history);
        let once = history.clone();
        let stats = compact_history(&mut history);
        assert_eq!(stats.replaced, 0);
        assert_eq!(history, once);
    }

    #[test]
    fn empty_history_is_fine() {
        let mut history: Vec<Message> = Vec::new();
        assert_eq!(compact_history(&mut history).replaced, 0);
    }
}
