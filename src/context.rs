//! History windowing and token estimation
//!
//! Prior turns come from an external store and can be arbitrarily long. The
//! orchestration loop only ever sends a trailing window of them; these helpers
//! pick that window and give a rough size estimate for callers that want to
//! budget further.

use crate::types::{ContentBlock, HistoryTurn, Message};

/// Per-message allowance for role markers and separators, in characters.
const MESSAGE_OVERHEAD: usize = 8;
/// Allowance for the request envelope, in characters.
const REQUEST_OVERHEAD: usize = 16;

/// Rough token count for a message list, at four characters per token.
///
/// Tokenizers differ, so keep a margin of 10-20% when comparing against a
/// model's context size.
pub fn estimate_tokens(messages: &[Message]) -> usize {
    if messages.is_empty() {
        return 0;
    }
    let chars: usize = messages
        .iter()
        .map(|m| MESSAGE_OVERHEAD + m.content.iter().map(block_chars).sum::<usize>())
        .sum();
    (chars + REQUEST_OVERHEAD).div_ceil(4)
}

fn block_chars(block: &ContentBlock) -> usize {
    match block {
        ContentBlock::Text(text) => text.text.len(),
        ContentBlock::ToolUse(call) => call.id.len() + call.name.len() + call.input.to_string().len(),
        ContentBlock::ToolResult(result) => result.tool_use_id.len() + result.content.len(),
    }
}

/// The last `keep` history turns, converted to messages, oldest first.
pub fn history_window(history: &[HistoryTurn], keep: usize) -> Vec<Message> {
    let start = history.len().saturating_sub(keep);
    history[start..]
        .iter()
        .cloned()
        .map(Message::from)
        .collect()
}
