//! `POST /chat` body parsing
//!
//! Everything here runs before the dispatch lock is taken, so a rejected
//! body never reaches a worker queue.

use lockstep_proto::{ChatMessage, Dialog};
use serde_json::Value;
use std::fmt;

/// Rejection codes returned to clients
pub mod codes {
    pub const INVALID_JSON: &str = "invalid_json";
    pub const INVALID_MESSAGE_LIST: &str = "invalid_message_list";
    pub const INVALID_MESSAGE: &str = "invalid_message";
}

/// Why a request body was rejected
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestError {
    pub code: &'static str,
    pub message: String,
}

impl RequestError {
    fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for RequestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for RequestError {}

/// A validated chat request
#[derive(Debug, Clone, PartialEq)]
pub struct ChatRequest {
    pub dialog: Dialog,
    pub stream: bool,
}

impl ChatRequest {
    /// Parse and validate a raw request body
    pub fn parse(body: &[u8]) -> Result<Self, RequestError> {
        let value: Value = serde_json::from_slice(body).map_err(|e| {
            RequestError::new(
                codes::INVALID_JSON,
                format!("request body is not valid JSON: {}", e),
            )
        })?;
        Self::from_value(&value)
    }

    pub fn from_value(value: &Value) -> Result<Self, RequestError> {
        let dialog = validate_messages(value.get("messages"))?;
        let stream = value.get("stream").and_then(Value::as_bool).unwrap_or(false);
        Ok(Self { dialog, stream })
    }
}

/// Check that `messages` is an array of `{role, content}` string pairs
pub fn validate_messages(messages: Option<&Value>) -> Result<Dialog, RequestError> {
    let items = match messages {
        Some(Value::Array(items)) => items,
        Some(other) => {
            return Err(RequestError::new(
                codes::INVALID_MESSAGE_LIST,
                format!("`messages` must be an array, got {}", json_type(other)),
            ));
        }
        None => {
            return Err(RequestError::new(codes::INVALID_MESSAGE_LIST, "`messages` is required"));
        }
    };

    items
        .iter()
        .enumerate()
        .map(|(index, item)| {
            let object = item.as_object().ok_or_else(|| {
                RequestError::new(
                    codes::INVALID_MESSAGE,
                    format!("messages[{}] must be an object, got {}", index, json_type(item)),
                )
            })?;
            let field = |name: &str| match object.get(name) {
                Some(Value::String(text)) => Ok(text.clone()),
                Some(other) => Err(RequestError::new(
                    codes::INVALID_MESSAGE,
                    format!(
                        "messages[{}].{} must be a string, got {}",
                        index,
                        name,
                        json_type(other)
                    ),
                )),
                None => Err(RequestError::new(
                    codes::INVALID_MESSAGE,
                    format!("messages[{}] is missing `{}`", index, name),
                )),
            };
            Ok(ChatMessage::new(field("role")?, field("content")?))
        })
        .collect::<Result<Vec<_>, _>>()
        .map(Dialog::new)
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_valid_request() {
        let request = ChatRequest::from_value(&json!({
            "messages": [{"role": "user", "content": "Hello"}],
            "stream": true
        }))
        .unwrap();

        assert!(request.stream);
        assert_eq!(request.dialog.messages(), &[ChatMessage::new("user", "Hello")]);
    }

    #[test]
    fn test_stream_defaults_to_false() {
        let request = ChatRequest::from_value(&json!({"messages": []})).unwrap();
        assert!(!request.stream);
        assert!(request.dialog.is_empty());

        let request = ChatRequest::from_value(&json!({"messages": [], "stream": "yes"})).unwrap();
        assert!(!request.stream);
    }

    #[test]
    fn test_messages_not_a_list() {
        let err = ChatRequest::from_value(&json!({"messages": "not a list"})).unwrap_err();
        assert_eq!(err.code, codes::INVALID_MESSAGE_LIST);

        let err = ChatRequest::from_value(&json!({"stream": false})).unwrap_err();
        assert_eq!(err.code, codes::INVALID_MESSAGE_LIST);
    }

    #[test]
    fn test_message_missing_content() {
        let err = ChatRequest::from_value(&json!({"messages": [{"role": "user"}]})).unwrap_err();
        assert_eq!(err.code, codes::INVALID_MESSAGE);
        assert!(err.message.contains("content"));
    }

    #[test]
    fn test_message_fields_must_be_strings() {
        let err = ChatRequest::from_value(&json!({
            "messages": [{"role": "user", "content": "ok"}, {"role": 7, "content": "x"}]
        }))
        .unwrap_err();
        assert_eq!(err.code, codes::INVALID_MESSAGE);
        assert!(err.message.starts_with("messages[1].role"));

        let err = ChatRequest::from_value(&json!({"messages": ["hi"]})).unwrap_err();
        assert_eq!(err.code, codes::INVALID_MESSAGE);
    }

    #[test]
    fn test_body_not_json() {
        let err = ChatRequest::parse(b"{messages: nope").unwrap_err();
        assert_eq!(err.code, codes::INVALID_JSON);
    }

    #[test]
    fn test_extra_fields_ignored() {
        let request = ChatRequest::parse(
            br#"{"messages": [{"role": "user", "content": "hi", "name": "bob"}], "model": "x"}"#,
        )
        .unwrap();
        assert_eq!(request.dialog.len(), 1);
    }
}
