//! Response formatting
//!
//! Wraps a generation in the completion envelope clients expect. Streaming
//! is emulated: the finished content is cut into fixed-width character
//! slices and written as server-sent event lines in one body.

use lockstep_common::config::ChatConfig;
use lockstep_proto::{ChatMessage, Choice, CompletionEnvelope, GenerationResult, Usage};
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

pub const COMPLETION_OBJECT: &str = "chat.completion";
pub const CHUNK_OBJECT: &str = "chat.completion.chunk";
pub const STOP_REASON: &str = "stop";
pub const DONE_LINE: &str = "data: [DONE]";

#[derive(Debug, Clone)]
pub struct ResponseFormatter {
    chunk_chars: usize,
}

impl ResponseFormatter {
    pub fn new(chunk_chars: usize) -> Self {
        Self {
            chunk_chars: chunk_chars.max(1),
        }
    }

    pub fn from_config(chat: &ChatConfig) -> Self {
        Self::new(chat.stream_chunk_chars)
    }

    pub fn chunk_chars(&self) -> usize {
        self.chunk_chars
    }

    /// Full response with the whole message in one choice
    pub fn complete(&self, result: &GenerationResult) -> CompletionEnvelope {
        envelope(
            completion_id(),
            COMPLETION_OBJECT,
            Choice {
                index: 0,
                message: Some(result.clone()),
                delta: None,
                finish_reason: Some(STOP_REASON.to_string()),
            },
        )
    }

    /// Event-stream body: one `data:` line per chunk, then `data: [DONE]`
    pub fn stream(&self, result: &GenerationResult) -> String {
        let id = completion_id();
        let chunks = self.chunk_content(&result.content);
        let last = chunks.len().saturating_sub(1);

        let mut lines: Vec<String> = chunks
            .iter()
            .enumerate()
            .map(|(i, slice)| {
                let chunk = envelope(
                    id.clone(),
                    CHUNK_OBJECT,
                    Choice {
                        index: 0,
                        message: None,
                        delta: Some(ChatMessage::new(result.role.clone(), *slice)),
                        finish_reason: (i == last).then(|| STOP_REASON.to_string()),
                    },
                );
                // Serializing plain strings and integers cannot fail.
                format!("data: {}", serde_json::to_string(&chunk).unwrap_or_default())
            })
            .collect();
        lines.push(DONE_LINE.to_string());
        lines.join("\n")
    }

    /// Split `content` into slices of at most `chunk_chars` characters
    pub fn chunk_content<'a>(&self, content: &'a str) -> Vec<&'a str> {
        let mut chunks = Vec::with_capacity(content.len() / self.chunk_chars + 1);
        let mut start = 0;
        let mut count = 0;

        for (offset, _) in content.char_indices() {
            if count == self.chunk_chars {
                chunks.push(&content[start..offset]);
                start = offset;
                count = 0;
            }
            count += 1;
        }
        if count > 0 {
            chunks.push(&content[start..]);
        }
        chunks
    }
}

impl Default for ResponseFormatter {
    fn default() -> Self {
        Self::new(128)
    }
}

fn envelope(id: String, object: &str, choice: Choice) -> CompletionEnvelope {
    CompletionEnvelope {
        id,
        object: object.to_string(),
        created: unix_now(),
        choices: vec![choice],
        usage: Usage::default(),
    }
}

fn completion_id() -> String {
    format!("chatcmpl-{}", Uuid::new_v4().simple())
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_stream(body: &str) -> Vec<CompletionEnvelope> {
        let mut lines: Vec<&str> = body.split('\n').collect();
        assert_eq!(lines.pop(), Some(DONE_LINE));
        lines
            .into_iter()
            .map(|line| serde_json::from_str(line.strip_prefix("data: ").unwrap()).unwrap())
            .collect()
    }

    #[test]
    fn test_complete_envelope() {
        let formatter = ResponseFormatter::default();
        let envelope = formatter.complete(&ChatMessage::assistant("Hi there"));

        assert!(envelope.id.starts_with("chatcmpl-"));
        assert_eq!(envelope.object, COMPLETION_OBJECT);
        assert_eq!(envelope.choices.len(), 1);
        assert_eq!(envelope.choices[0].message, Some(ChatMessage::assistant("Hi there")));
        assert_eq!(envelope.choices[0].delta, None);
        assert_eq!(envelope.choices[0].finish_reason.as_deref(), Some("stop"));
        assert_eq!(envelope.usage, Usage::default());
    }

    #[test]
    fn test_stream_300_chars() {
        let formatter = ResponseFormatter::default();
        let content = "x".repeat(300);
        let body = formatter.stream(&ChatMessage::assistant(content.clone()));

        let chunks = parse_stream(&body);
        let sizes: Vec<usize> = chunks
            .iter()
            .map(|c| c.choices[0].delta.as_ref().unwrap().content.chars().count())
            .collect();
        assert_eq!(sizes, vec![128, 128, 44]);

        let rebuilt: String = chunks
            .iter()
            .map(|c| c.choices[0].delta.as_ref().unwrap().content.as_str())
            .collect();
        assert_eq!(rebuilt, content);

        assert!(chunks.iter().all(|c| c.object == CHUNK_OBJECT && c.id == chunks[0].id));
        assert!(chunks.iter().all(|c| c.choices[0].delta.as_ref().unwrap().role == "assistant"));
        assert_eq!(chunks[0].choices[0].finish_reason, None);
        assert_eq!(chunks[2].choices[0].finish_reason.as_deref(), Some("stop"));
    }

    #[test]
    fn test_stream_empty_content() {
        let formatter = ResponseFormatter::default();
        assert_eq!(formatter.stream(&ChatMessage::assistant("")), DONE_LINE);
    }

    #[test]
    fn test_chunks_split_on_characters() {
        let formatter = ResponseFormatter::new(2);
        assert_eq!(
            formatter.chunk_content("héllo wörld"),
            vec!["hé", "ll", "o ", "wö", "rl", "d"]
        );
        assert_eq!(formatter.chunk_content("日本語"), vec!["日本", "語"]);
        assert!(formatter.chunk_content("").is_empty());
    }

    #[test]
    fn test_exact_multiple_has_no_empty_tail() {
        let formatter = ResponseFormatter::default();
        let content = "y".repeat(256);
        assert_eq!(formatter.chunk_content(&content).len(), 2);
    }

    #[test]
    fn test_zero_width_clamped() {
        assert_eq!(ResponseFormatter::new(0).chunk_chars(), 1);
    }

    #[test]
    fn test_formatting_twice_differs_only_in_id_and_created() {
        let formatter = ResponseFormatter::default();
        let result = ChatMessage::assistant("same answer");

        let mut first = formatter.complete(&result);
        let mut second = formatter.complete(&result);
        assert_ne!(first.id, second.id);

        second.id = first.id.clone();
        second.created = first.created;
        assert_eq!(first, second);

        first.choices.clear();
        assert_ne!(first, second);
    }
}
