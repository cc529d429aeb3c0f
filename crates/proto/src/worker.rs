//! Messages exchanged between the coordinator and a worker rank
//!
//! Across a process boundary every message is one JSON object per line:
//! commands on the worker's stdin, events on its stdout.

use crate::chat::{Dialog, GenerationResult};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Zero-based position of a worker inside the execution group
pub type Rank = usize;

/// Coordinator -> worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerCommand {
    /// Generate a reply for the enclosed dialog
    Generate(DispatchedRequest),

    /// Leave the loop and exit
    Shutdown,
}

/// One request as broadcast to every rank
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchedRequest {
    pub request_id: String,

    /// Group-wide request counter, used to detect ranks falling out of step
    pub seq: u64,

    pub dialog: Dialog,
}

/// Worker -> coordinator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerEvent {
    /// Rendezvous joined and model loaded
    Ready { rank: Rank },

    Generated(RankOutput),

    /// Startup (`seq` is `None`) or a single generation failed
    Failed {
        rank: Rank,
        seq: Option<u64>,
        message: String,
    },

    Stopped { rank: Rank },
}

impl WorkerEvent {
    pub fn rank(&self) -> Rank {
        match self {
            WorkerEvent::Ready { rank }
            | WorkerEvent::Failed { rank, .. }
            | WorkerEvent::Stopped { rank } => *rank,
            WorkerEvent::Generated(output) => output.rank,
        }
    }

    /// Short name for logs
    pub fn kind(&self) -> &'static str {
        match self {
            WorkerEvent::Ready { .. } => "ready",
            WorkerEvent::Generated(_) => "generated",
            WorkerEvent::Failed { .. } => "failed",
            WorkerEvent::Stopped { .. } => "stopped",
        }
    }
}

/// A rank's answer to one dispatched request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankOutput {
    pub rank: Rank,
    pub request_id: String,
    pub seq: u64,

    /// Digest of the normalized dialog this rank generated from
    pub dialog_digest: String,

    pub generation: GenerationResult,
}

/// Encode a message as a single newline-terminated line
pub fn encode_frame<T: Serialize>(message: &T) -> serde_json::Result<String> {
    let mut line = serde_json::to_string(message)?;
    line.push('\n');
    Ok(line)
}

/// Decode one line produced by [`encode_frame`]
pub fn decode_frame<T: DeserializeOwned>(line: &str) -> serde_json::Result<T> {
    serde_json::from_str(line.trim_end())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::ChatMessage;

    #[test]
    fn test_command_wire_shape() {
        let command = WorkerCommand::Generate(DispatchedRequest {
            request_id: "req-1".to_string(),
            seq: 7,
            dialog: Dialog::new(vec![ChatMessage::new("user", "hi")]),
        });

        let line = encode_frame(&command).unwrap();
        assert!(line.ends_with('\n'));
        assert_eq!(line.matches('\n').count(), 1);

        let value: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["type"], "generate");
        assert_eq!(value["seq"], 7);
        assert_eq!(value["dialog"][0]["content"], "hi");
    }

    #[test]
    fn test_shutdown_sentinel_decodes() {
        let command: WorkerCommand = decode_frame("{\"type\":\"shutdown\"}\n").unwrap();
        assert_eq!(command, WorkerCommand::Shutdown);
    }

    #[test]
    fn test_event_rank() {
        let failed: WorkerEvent =
            decode_frame(r#"{"type":"failed","rank":3,"seq":null,"message":"boom"}"#).unwrap();

        assert_eq!(failed.rank(), 3);
        assert_eq!(failed.kind(), "failed");
    }

    #[test]
    fn test_multiline_content_stays_on_one_line() {
        let event = WorkerEvent::Generated(RankOutput {
            rank: 0,
            request_id: "r".to_string(),
            seq: 1,
            dialog_digest: "d".to_string(),
            generation: ChatMessage::assistant("line one\nline two"),
        });

        let line = encode_frame(&event).unwrap();
        assert_eq!(line.matches('\n').count(), 1);
        assert_eq!(decode_frame::<WorkerEvent>(&line).unwrap(), event);
    }
}
