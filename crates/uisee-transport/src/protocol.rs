//! Wire protocol for command and acknowledgement payloads.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uisee_core::TargetCommand;

/// Payload published on the command topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandMessage {
    /// `Path=Value` text.
    pub command: String,
}

impl CommandMessage {
    #[must_use]
    pub fn new(target: &TargetCommand) -> Self {
        Self {
            command: target.to_string(),
        }
    }

    /// Encode as JSON bytes.
    ///
    /// # Errors
    /// Returns error if serialization fails.
    pub fn encode(&self) -> Result<Bytes, serde_json::Error> {
        serde_json::to_vec(self).map(Bytes::from)
    }

    /// Parsed target, if the text is well-formed.
    #[must_use]
    pub fn target(&self) -> Option<TargetCommand> {
        TargetCommand::parse(&self.command).ok()
    }
}

/// Decode an acknowledgement payload.
///
/// # Errors
/// Returns error if the payload is not JSON.
pub fn decode_response(payload: &[u8]) -> Result<Value, serde_json::Error> {
    serde_json::from_slice(payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_encoding() {
        let msg = CommandMessage::new(&TargetCommand::widget("Pump1", "IsSet", "1"));
        let bytes = msg.encode().unwrap();
        let json: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json, serde_json::json!({"command": "Page.Widgets.Pump1.IsSet=1"}));

        let parsed: CommandMessage = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(parsed.target().unwrap().value, "1");
    }

    #[test]
    fn test_decode_response() {
        let value = decode_response(br#"{"status": "ok"}"#).unwrap();
        assert_eq!(value["status"], "ok");

        assert_eq!(decode_response(b"\"done\"").unwrap(), Value::String("done".into()));
        assert!(decode_response(b"not json").is_err());
    }
}
