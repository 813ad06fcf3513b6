//! Command bus message types.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Commands a publisher can address to its subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Command {
    /// Shut down cleanly. Idempotent on the receiving side.
    Die,
    /// Report current state to the receiver's event sink.
    StatusProbe,
}

impl Command {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Die => "die",
            Self::StatusProbe => "status-probe",
        }
    }
}

/// One keyed command as it travels on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlMessage {
    pub key: String,
    pub command: Command,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

impl ControlMessage {
    pub fn new(key: impl Into<String>, command: Command) -> Self {
        Self {
            key: key.into(),
            command,
            payload: None,
        }
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Whether the message carries `secret` as its key.
    pub fn authorize(&self, secret: &str) -> bool {
        constant_time_eq(self.key.as_bytes(), secret.as_bytes())
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_wire_shape() {
        let message = ControlMessage::new("k1", Command::Die);
        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json, json!({"key": "k1", "command": "die"}));

        let tagged = ControlMessage::new("k1", Command::Die).with_payload(json!("bye"));
        let json = serde_json::to_value(&tagged).unwrap();
        assert_eq!(json["payload"], json!("bye"));

        let parsed: ControlMessage =
            serde_json::from_str(r#"{"key":"k1","command":"status-probe","payload":{"n":1}}"#)
                .unwrap();
        assert_eq!(parsed.command, Command::StatusProbe);
        assert_eq!(parsed.payload, Some(json!({"n": 1})));
    }

    #[test]
    fn test_unknown_command_is_rejected() {
        let parsed = serde_json::from_str::<ControlMessage>(r#"{"key":"k","command":"reboot"}"#);
        assert!(parsed.is_err());
    }

    #[test]
    fn test_authorize() {
        let message = ControlMessage::new("secret", Command::Die);
        assert!(message.authorize("secret"));
        assert!(!message.authorize("secreT"));
        assert!(!message.authorize("secret-longer"));
        assert!(!message.authorize(""));
    }
}
