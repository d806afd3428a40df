//! Log chunks: bounded slices of a task's output.

use serde::{Deserialize, Serialize};

use crate::TaskId;

/// Upper bound on a chunk's content, in bytes.
pub const MAX_CHUNK_BYTES: usize = 8 * 1024;

/// A persisted slice of a task's log output.
///
/// `sequence` starts at 0 per task and increases by one for every chunk the
/// forwarder produced, in write order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogChunk {
    pub task_id: TaskId,
    pub sequence: u64,
    pub content: String,
}

impl LogChunk {
    pub fn new(task_id: TaskId, sequence: u64, content: impl Into<String>) -> Self {
        Self {
            task_id,
            sequence,
            content: content.into(),
        }
    }
}

/// Split `content` into pieces of at most `max_bytes` bytes, in order.
///
/// Each piece ends at the last newline inside its window when there is one,
/// otherwise at the byte bound (moved back to a char boundary).
pub fn split_into_chunks(content: &str, max_bytes: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut rest = content;

    while !rest.is_empty() {
        if rest.len() <= max_bytes {
            chunks.push(rest.to_string());
            break;
        }

        let bound = floor_char_boundary(rest, max_bytes);
        let cut = match rest[..bound].rfind('\n') {
            Some(pos) if pos > 0 => pos + 1,
            // A single char wider than the bound cannot happen for sane bounds,
            // but never loop forever on it.
            _ if bound == 0 => next_char_boundary(rest),
            _ => bound,
        };

        let (head, tail) = rest.split_at(cut);
        chunks.push(head.to_string());
        rest = tail;
    }

    chunks
}

fn floor_char_boundary(s: &str, index: usize) -> usize {
    if index >= s.len() {
        return s.len();
    }
    let mut i = index;
    while !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}

fn next_char_boundary(s: &str) -> usize {
    s.char_indices().nth(1).map(|(i, _)| i).unwrap_or(s.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_small_content_is_one_chunk() {
        assert_eq!(split_into_chunks("hello\n", MAX_CHUNK_BYTES), vec!["hello\n"]);
        assert!(split_into_chunks("", MAX_CHUNK_BYTES).is_empty());
    }

    #[test]
    fn test_no_break_points_splits_at_bound() {
        let content = "x".repeat(10 * 1024);
        let chunks = split_into_chunks(&content, MAX_CHUNK_BYTES);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].len(), MAX_CHUNK_BYTES);
        assert_eq!(chunks[1].len(), 2 * 1024);
        assert_eq!(chunks.concat(), content);
    }

    #[test]
    fn test_prefers_newline_break() {
        let content = format!("{}\n{}", "a".repeat(10), "b".repeat(10));
        let chunks = split_into_chunks(&content, 16);
        assert_eq!(chunks[0], format!("{}\n", "a".repeat(10)));
        assert_eq!(chunks[1], "b".repeat(10));
    }

    #[test]
    fn test_respects_char_boundaries() {
        // 'é' is two bytes; an odd bound must not split it.
        let content = "é".repeat(10);
        let chunks = split_into_chunks(&content, 5);
        assert!(chunks.iter().all(|c| c.len() <= 5));
        assert_eq!(chunks.concat(), content);
    }

    #[test]
    fn test_chunk_wire_format() {
        let chunk = LogChunk::new(TaskId::new("t-1"), 3, "out");
        let json = serde_json::to_value(&chunk).unwrap();
        assert_eq!(json["taskId"], "t-1");
        assert_eq!(json["sequence"], 3);
        assert_eq!(json["content"], "out");
    }
}
