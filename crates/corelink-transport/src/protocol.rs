//! Client-to-server wire protocol.
//!
//! Server-to-client frames are [`corelink_core::Frame`].

use corelink_core::SampleKind;
use corelink_session::Request;
use serde::{Deserialize, Serialize};

/// Message from client to server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Run a command.
    Exec { command: String },
    /// Run a preset by name.
    Preset { name: String },
    /// Cancel the running command.
    Cancel,
    /// Switch the tailed container.
    Select { container: String },
    /// Start receiving a sample type.
    Subscribe { sample: SampleKind },
    /// Stop receiving a sample type.
    Unsubscribe { sample: SampleKind },
    /// Ping for keepalive.
    Ping,
}

/// Untagged submit, `{"command": "..."}`.
#[derive(Deserialize)]
struct BareCommand {
    command: String,
}

impl ClientMessage {
    /// Create a command submission.
    #[must_use]
    pub fn exec(command: impl Into<String>) -> Self {
        Self::Exec {
            command: command.into(),
        }
    }

    /// Parse a text payload.
    ///
    /// A tagged message is tried first; an object with only a `command`
    /// field is accepted as a submit.
    ///
    /// # Errors
    /// Returns the tagged-message parse error if neither form matches.
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str::<Self>(text).or_else(|tagged_err| {
            serde_json::from_str::<BareCommand>(text)
                .map(|bare| Self::exec(bare.command))
                .map_err(|_| tagged_err)
        })
    }

    /// Encode to JSON text.
    ///
    /// # Errors
    /// Returns error if serialization fails.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

impl From<ClientMessage> for Request {
    fn from(msg: ClientMessage) -> Self {
        match msg {
            ClientMessage::Exec { command } => Self::Exec { command },
            ClientMessage::Preset { name } => Self::Preset { name },
            ClientMessage::Cancel => Self::Cancel,
            ClientMessage::Select { container } => Self::Select { container },
            ClientMessage::Subscribe { sample } => Self::Subscribe(sample),
            ClientMessage::Unsubscribe { sample } => Self::Unsubscribe(sample),
            ClientMessage::Ping => Self::Ping,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tagged_messages() {
        assert_eq!(
            ClientMessage::parse(r#"{"type":"preset","name":"disk_usage"}"#).unwrap(),
            ClientMessage::Preset {
                name: "disk_usage".into()
            }
        );
        assert_eq!(
            ClientMessage::parse(r#"{"type":"subscribe","sample":"gpu"}"#).unwrap(),
            ClientMessage::Subscribe {
                sample: SampleKind::Gpu
            }
        );
        assert_eq!(
            ClientMessage::parse(r#"{"type":"cancel"}"#).unwrap(),
            ClientMessage::Cancel
        );
    }

    #[test]
    fn test_bare_command_is_a_submit() {
        assert_eq!(
            ClientMessage::parse(r#"{"command":"echo hello"}"#).unwrap(),
            ClientMessage::exec("echo hello")
        );
    }

    #[test]
    fn test_invalid_payloads() {
        assert!(ClientMessage::parse("not json").is_err());
        assert!(ClientMessage::parse(r#"{"type":"resize","cols":80}"#).is_err());
        assert!(ClientMessage::parse(r#"{"command":42}"#).is_err());
    }

    #[test]
    fn test_message_serialization() {
        let json = ClientMessage::Select {
            container: "nosana-node".into(),
        }
        .to_json()
        .unwrap();
        assert_eq!(json, r#"{"type":"select","container":"nosana-node"}"#);
    }

    #[test]
    fn test_into_request() {
        assert_eq!(
            Request::from(ClientMessage::Unsubscribe {
                sample: SampleKind::System
            }),
            Request::Unsubscribe(SampleKind::System)
        );
        assert_eq!(
            Request::from(ClientMessage::exec("uptime")),
            Request::Exec {
                command: "uptime".into()
            }
        );
    }
}
