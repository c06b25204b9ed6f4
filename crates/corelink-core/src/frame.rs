//! Wire frames pushed from the server to a browser channel.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::snapshot::{GpuDevice, SystemStats};

/// One discrete message delivered over a channel.
///
/// Serialized as a JSON object with a `type` discriminator. Frames are
/// immutable once sent and arrive in the order they were produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    /// One tailed container log line.
    LogLine {
        #[serde(default)]
        container: String,
        data: String,
    },
    /// Periodic GPU sample.
    GpuStats { data: Vec<GpuDevice> },
    /// Periodic host system sample.
    SystemStats { data: SystemStats },
    /// Echo of an accepted command.
    ExecStart { command: String },
    /// Incremental process output.
    ExecOutput { data: String },
    /// Terminal: the process exited on its own.
    ExecDone {
        #[serde(default)]
        command: String,
        #[serde(default)]
        exit_code: Option<i32>,
    },
    /// Terminal: timeout, cancellation, spawn failure, or rejection.
    ExecError { data: String },
    /// Stream or resource failure outside an execution session.
    Error { data: String },
    /// Payload that could not be parsed into any other variant.
    Raw { data: Value },
    /// Keepalive reply.
    Pong,
}

impl Frame {
    /// Build an `exec_error` frame.
    #[must_use]
    pub fn exec_error(message: impl Into<String>) -> Self {
        Self::ExecError {
            data: message.into(),
        }
    }

    /// Build an `error` frame.
    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            data: message.into(),
        }
    }

    /// Whether this frame ends an execution session.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::ExecDone { .. } | Self::ExecError { .. })
    }

    /// Wire type name, as it appears in the `type` field.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::LogLine { .. } => "log_line",
            Self::GpuStats { .. } => "gpu_stats",
            Self::SystemStats { .. } => "system_stats",
            Self::ExecStart { .. } => "exec_start",
            Self::ExecOutput { .. } => "exec_output",
            Self::ExecDone { .. } => "exec_done",
            Self::ExecError { .. } => "exec_error",
            Self::Error { .. } => "error",
            Self::Raw { .. } => "raw",
            Self::Pong => "pong",
        }
    }

    /// Encode to the JSON text sent on the wire.
    ///
    /// # Errors
    /// Returns error if a payload cannot be serialized.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Decode a payload received from the wire.
    ///
    /// Never fails: a payload that does not match a known frame is wrapped
    /// as [`Frame::Raw`] so it can still be surfaced. Valid JSON keeps its
    /// structure; anything else is carried as a string.
    #[must_use]
    pub fn from_wire(text: &str) -> Self {
        match serde_json::from_str::<Value>(text) {
            Ok(value) => serde_json::from_value(value.clone()).unwrap_or(Self::Raw { data: value }),
            Err(_) => Self::Raw {
                data: Value::String(text.to_string()),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exec_frames_use_snake_case_tags() {
        let json = Frame::ExecStart {
            command: "echo hello".into(),
        }
        .to_json()
        .unwrap();
        assert_eq!(json, r#"{"type":"exec_start","command":"echo hello"}"#);

        let done = Frame::ExecDone {
            command: "true".into(),
            exit_code: Some(0),
        };
        let value: Value = serde_json::from_str(&done.to_json().unwrap()).unwrap();
        assert_eq!(value["type"], "exec_done");
        assert_eq!(value["exit_code"], 0);
    }

    #[test]
    fn test_terminal_frames() {
        assert!(Frame::exec_error("boom").is_terminal());
        assert!(
            Frame::ExecDone {
                command: String::new(),
                exit_code: None
            }
            .is_terminal()
        );
        assert!(!Frame::ExecOutput { data: "x".into() }.is_terminal());
        assert!(!Frame::error("gone").is_terminal());
    }

    #[test]
    fn test_from_wire_parses_known_frame() {
        let frame = Frame::from_wire(r#"{"type":"log_line","data":"ready\n"}"#);
        assert_eq!(
            frame,
            Frame::LogLine {
                container: String::new(),
                data: "ready\n".into()
            }
        );
    }

    #[test]
    fn test_from_wire_wraps_unknown_json_as_raw() {
        let frame = Frame::from_wire(r#"{"type":"mystery","n":1}"#);
        let Frame::Raw { data } = frame else {
            panic!("expected raw frame");
        };
        assert_eq!(data["type"], "mystery");
        assert_eq!(data["n"], 1);
    }

    #[test]
    fn test_from_wire_wraps_garbage_as_raw_string() {
        let frame = Frame::from_wire("not json at all");
        assert_eq!(
            frame,
            Frame::Raw {
                data: Value::String("not json at all".into())
            }
        );
        assert_eq!(frame.kind(), "raw");
    }
}
