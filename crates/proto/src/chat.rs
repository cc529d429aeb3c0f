//! Chat messages, dialogs and the completion envelope returned to clients.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Role that marks a message as a system prompt
pub const SYSTEM_ROLE: &str = "system";

/// Role carried by generated replies
pub const ASSISTANT_ROLE: &str = "assistant";

/// A single role/content pair
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(SYSTEM_ROLE, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(ASSISTANT_ROLE, content)
    }

    pub fn is_system(&self) -> bool {
        self.role == SYSTEM_ROLE
    }
}

/// One worker's reply to one dialog
pub type GenerationResult = ChatMessage;

/// Ordered conversation handed to the generator
///
/// Serializes as a plain JSON array of messages.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Dialog(Vec<ChatMessage>);

impl Dialog {
    pub fn new(messages: Vec<ChatMessage>) -> Self {
        Self(messages)
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Prepend `prompt` as a system message unless the dialog already opens
    /// with one.
    ///
    /// Every rank applies this on its own, so the result must depend on
    /// nothing but the dialog and the prompt.
    pub fn with_default_system(self, prompt: &str) -> Self {
        match self.0.first() {
            Some(first) if first.is_system() => self,
            _ => {
                let mut messages = Vec::with_capacity(self.0.len() + 1);
                messages.push(ChatMessage::system(prompt));
                messages.extend(self.0);
                Self(messages)
            }
        }
    }

    /// Hex SHA-256 over the dialog's JSON form
    pub fn digest(&self) -> String {
        // Field order is fixed by the struct definition, so the encoding is stable.
        let encoded = serde_json::to_vec(&self.0).unwrap_or_default();
        format!("{:x}", Sha256::digest(&encoded))
    }

    pub fn last_user_message(&self) -> Option<&ChatMessage> {
        self.0.iter().rev().find(|m| m.role == "user")
    }
}

impl From<Vec<ChatMessage>> for Dialog {
    fn from(messages: Vec<ChatMessage>) -> Self {
        Self(messages)
    }
}

/// Response object returned by `POST /chat`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionEnvelope {
    pub id: String,
    pub object: String,
    pub created: u64,
    pub choices: Vec<Choice>,
    pub usage: Usage,
}

/// The single choice of an envelope; exactly one of `message` or `delta` is set
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Choice {
    pub index: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<ChatMessage>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delta: Option<ChatMessage>,

    pub finish_reason: Option<String>,
}

/// Token accounting; always zero
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}
