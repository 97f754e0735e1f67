//! Viewer protocol messages.
//!
//! The protocol is JSON over WebSocket text frames. A viewer sends flat
//! objects whose *fields* carry the intent: an `id` alone attaches to that
//! session, `id` + `data` is keyboard input, `id` + `size` is a window
//! resize. The broker pushes `{id, data}` objects back — one per output
//! chunk, plus one replay snapshot on attach.
//!
//! Intent resolution is strict: a message carrying both `data` and `size`
//! is ambiguous and is dropped as malformed (the protocol has no negative
//! acknowledgement path, so malformed messages degrade to keepalives).

use serde::{Deserialize, Serialize};

/// Terminal window geometry in character cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowSize {
    pub cols: u16,
    pub rows: u16,
}

/// An inbound viewer message, before intent classification.
///
/// Unknown fields are tolerated and ignored; only `id`, `data` and `size`
/// participate in classification.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ClientMessage {
    /// Session identifier. Opaque, client-chosen, case-sensitive.
    #[serde(default)]
    pub id: Option<String>,
    /// Input bytes for the session's process, verbatim.
    #[serde(default)]
    pub data: Option<String>,
    /// Requested window geometry.
    #[serde(default)]
    pub size: Option<WindowSize>,
}

/// The resolved meaning of a [`ClientMessage`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientIntent {
    /// Join the session and receive a replay snapshot.
    Attach { id: String },
    /// Write input to the session's process.
    Input { id: String, data: String },
    /// Resize the session's process window.
    Resize { id: String, size: WindowSize },
    /// No recognized intent; ignored.
    Keepalive,
}

impl ClientMessage {
    /// Classify this message into a single intent.
    ///
    /// Messages without an `id`, and messages carrying more than one
    /// intent field, resolve to [`ClientIntent::Keepalive`].
    pub fn classify(self) -> ClientIntent {
        let id = match self.id {
            Some(id) => id,
            None => return ClientIntent::Keepalive,
        };
        match (self.data, self.size) {
            (Some(data), None) => ClientIntent::Input { id, data },
            (None, Some(size)) => ClientIntent::Resize { id, size },
            (None, None) => ClientIntent::Attach { id },
            (Some(_), Some(_)) => ClientIntent::Keepalive,
        }
    }
}

/// An outbound message: one chunk of process output (live push or replay
/// snapshot), tagged with the session that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerMessage {
    pub id: String,
    pub data: String,
}

impl ServerMessage {
    pub fn new(id: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            data: data.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(json: &str) -> ClientIntent {
        serde_json::from_str::<ClientMessage>(json)
            .expect("valid json")
            .classify()
    }

    #[test]
    fn bare_id_is_attach() {
        assert_eq!(
            parse(r#"{"id":"abc"}"#),
            ClientIntent::Attach { id: "abc".into() }
        );
    }

    #[test]
    fn id_and_data_is_input() {
        assert_eq!(
            parse(r#"{"id":"abc","data":"ls\n"}"#),
            ClientIntent::Input {
                id: "abc".into(),
                data: "ls\n".into()
            }
        );
    }

    #[test]
    fn empty_data_is_still_input() {
        // Field presence decides intent, not truthiness.
        assert_eq!(
            parse(r#"{"id":"abc","data":""}"#),
            ClientIntent::Input {
                id: "abc".into(),
                data: String::new()
            }
        );
    }

    #[test]
    fn id_and_size_is_resize() {
        assert_eq!(
            parse(r#"{"id":"abc","size":{"cols":120,"rows":40}}"#),
            ClientIntent::Resize {
                id: "abc".into(),
                size: WindowSize {
                    cols: 120,
                    rows: 40
                }
            }
        );
    }

    #[test]
    fn missing_id_is_keepalive() {
        assert_eq!(parse(r#"{}"#), ClientIntent::Keepalive);
        assert_eq!(parse(r#"{"data":"x"}"#), ClientIntent::Keepalive);
    }

    #[test]
    fn combined_intent_fields_are_rejected() {
        assert_eq!(
            parse(r#"{"id":"abc","data":"x","size":{"cols":1,"rows":1}}"#),
            ClientIntent::Keepalive
        );
    }

    #[test]
    fn unknown_fields_are_tolerated() {
        assert_eq!(
            parse(r#"{"id":"abc","extra":42}"#),
            ClientIntent::Attach { id: "abc".into() }
        );
    }

    #[test]
    fn server_message_round_trips() {
        let msg = ServerMessage::new("abc", "ls\nfile1 file2\n$ ");
        let json = serde_json::to_string(&msg).expect("serialize");
        let back: ServerMessage = serde_json::from_str(&json).expect("parse");
        assert_eq!(back, msg);
    }
}
