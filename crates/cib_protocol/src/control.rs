//! Control channel message types
//!
//! The control socket speaks plain JSON, one object per message. The
//! bridge writes a command, the board answers with a `feedback` array
//! whose entries carry a free-form `type` tag and a message. The tag is
//! classified by substring, not by exact match, because firmware
//! revisions disagree on capitalization.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ProtocolError, Result};

/// Commands the bridge sends to the board.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum ControlCommand {
    /// Forward the board configuration fragment verbatim.
    Config { config: Value },
    /// Open a numbered run; the board dials back the trigger stream.
    StartRun { run_number: u32 },
    /// Close the current run.
    StopRun,
}

/// One feedback entry from a board reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Feedback {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub message: Value,
}

/// Classified severity of a feedback entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// The overall exchange failed.
    Error,
    Warning,
    Info,
    /// Unrecognized tag; relayed as-is.
    Raw,
}

impl Feedback {
    /// Classify the entry by case-insensitive substring match on its tag.
    pub fn severity(&self) -> Severity {
        let kind = self.kind.to_ascii_lowercase();
        if kind.contains("error") {
            Severity::Error
        } else if kind.contains("warning") {
            Severity::Warning
        } else if kind.contains("info") {
            Severity::Info
        } else {
            Severity::Raw
        }
    }

    /// Human-readable rendering of the message payload.
    pub fn message_text(&self) -> String {
        match &self.message {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

/// A full board reply.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ControlReply {
    #[serde(default)]
    pub feedback: Vec<Feedback>,
}

impl ControlReply {
    /// Parse the first JSON object out of a raw reply buffer.
    ///
    /// The reply is read best-effort into a fixed buffer, so the object
    /// may be followed by stale bytes; anything before a complete
    /// object is a framing error.
    pub fn parse(buf: &[u8]) -> Result<Self> {
        let mut stream = serde_json::Deserializer::from_slice(buf).into_iter::<ControlReply>();
        match stream.next() {
            Some(Ok(reply)) => Ok(reply),
            Some(Err(e)) => Err(ProtocolError::MalformedReply(e.to_string())),
            None => Err(ProtocolError::MalformedReply("empty reply".to_string())),
        }
    }

    /// True iff no entry classified as an error.
    pub fn is_ok(&self) -> bool {
        !self
            .feedback
            .iter()
            .any(|f| f.severity() == Severity::Error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_command_wire_format() {
        let cmd = ControlCommand::StartRun { run_number: 42 };
        let json = serde_json::to_string(&cmd).unwrap();
        assert_eq!(json, r#"{"command":"start_run","run_number":42}"#);

        let stop = serde_json::to_string(&ControlCommand::StopRun).unwrap();
        assert_eq!(stop, r#"{"command":"stop_run"}"#);

        let conf = ControlCommand::Config {
            config: json!({"cib": {"trigger": true}}),
        };
        let json = serde_json::to_string(&conf).unwrap();
        assert!(json.starts_with(r#"{"command":"config","config":"#));
    }

    #[test]
    fn test_severity_classification() {
        let cases = [
            ("error", Severity::Error),
            ("ERROR", Severity::Error),
            ("FatalError", Severity::Error),
            ("warning", Severity::Warning),
            ("Warning", Severity::Warning),
            ("info", Severity::Info),
            ("INFO", Severity::Info),
            ("statistics", Severity::Raw),
        ];
        for (kind, expected) in cases {
            let fb = Feedback {
                kind: kind.to_string(),
                message: Value::Null,
            };
            assert_eq!(fb.severity(), expected, "kind {kind}");
        }
    }

    #[test]
    fn test_reply_parse_ignores_trailing_bytes() {
        let mut buf = br#"{"feedback":[{"type":"info","message":"configured"}]}"#.to_vec();
        buf.extend_from_slice(&[b' '; 32]);
        let reply = ControlReply::parse(&buf).unwrap();
        assert_eq!(reply.feedback.len(), 1);
        assert!(reply.is_ok());
        assert_eq!(reply.feedback[0].message_text(), "configured");
    }

    #[test]
    fn test_reply_with_error_entry_fails() {
        let buf = br#"{"feedback":[{"type":"info","message":"ok"},{"type":"Error","message":"bad state"}]}"#;
        let reply = ControlReply::parse(buf).unwrap();
        assert!(!reply.is_ok());
    }

    #[test]
    fn test_reply_without_feedback_is_ok() {
        let reply = ControlReply::parse(b"{}").unwrap();
        assert!(reply.feedback.is_empty());
        assert!(reply.is_ok());
    }

    #[test]
    fn test_garbage_reply_is_framing_error() {
        let err = ControlReply::parse(b"\x00\x00\x00").unwrap_err();
        assert!(matches!(err, ProtocolError::MalformedReply(_)));
    }
}
