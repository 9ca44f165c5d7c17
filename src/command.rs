//! Server protocol commands.
//!
//! The coordination server and the client exchange JSON-encoded
//! [`Command`]s over the duplex channel: `{"cmd": "...", "id": "...",
//! "payload": {...}}`. The `cmd` values form a closed string enum; unknown
//! values decode to [`CommandKind::Unknown`] so newer servers stay
//! compatible with older clients. Payload fields are loosely typed and read
//! through defensive accessors -- a malformed field reads as absent, never
//! panics.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Closed enumeration of command kinds carried in the `cmd` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CommandKind {
    /// Session greeting / readiness announcement.
    Hello,
    /// Begin running a game instance (swap + resume).
    Start,
    /// Pause emulation.
    Pause,
    /// Resume emulation.
    Resume,
    /// Switch to another game/instance.
    Swap,
    /// Wipe local save data and restart the session context.
    ClearSaves,
    /// Replace the cached game catalog and prefetch its assets.
    GamesUpdate,
    /// Show a styled on-screen message.
    Message,
    /// Save the current state and upload it.
    RequestSave,
    /// Read a key from the emulator's own config file.
    CheckConfig,
    /// Write a key to the emulator's own config file (relaunches the peer).
    UpdateConfig,
    /// Persist plugin settings, then reload plugins.
    PluginSettings,
    /// Reload plugins without changing settings.
    PluginReload,
    /// Positive acknowledgment of a previous request id.
    Ack,
    /// Negative acknowledgment with a reason.
    Nack,
    /// Any kind this client does not know (acked for forward compatibility).
    #[serde(other)]
    Unknown,
}

/// One protocol message. Immutable once sent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Command {
    /// Command kind.
    pub cmd: CommandKind,
    /// Correlation id; ack/nack echo the id of the request they answer.
    pub id: String,
    /// Command-specific fields.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub payload: Map<String, Value>,
}

impl Command {
    /// New command with a freshly minted id.
    #[must_use]
    pub fn new(cmd: CommandKind, payload: Map<String, Value>) -> Self {
        Self {
            cmd,
            id: uuid::Uuid::new_v4().to_string(),
            payload,
        }
    }

    /// Greeting identifying this player, sent after each successful dial.
    #[must_use]
    pub fn hello(player: &str) -> Self {
        let mut payload = Map::new();
        payload.insert("player".to_string(), Value::from(player));
        payload.insert("version".to_string(), Value::from(env!("CARGO_PKG_VERSION")));
        Self::new(CommandKind::Hello, payload)
    }

    /// Acknowledgment for `request_id`.
    #[must_use]
    pub fn ack(request_id: &str) -> Self {
        Self {
            cmd: CommandKind::Ack,
            id: request_id.to_string(),
            payload: Map::new(),
        }
    }

    /// Acknowledgment for `request_id` carrying result fields.
    #[must_use]
    pub fn ack_with(request_id: &str, payload: Map<String, Value>) -> Self {
        Self {
            cmd: CommandKind::Ack,
            id: request_id.to_string(),
            payload,
        }
    }

    /// Negative acknowledgment with a machine-readable reason.
    #[must_use]
    pub fn nack(request_id: &str, reason: &str) -> Self {
        let mut payload = Map::new();
        payload.insert("reason".to_string(), Value::from(reason));
        Self {
            cmd: CommandKind::Nack,
            id: request_id.to_string(),
            payload,
        }
    }

    /// Negative acknowledgment with a reason plus extra diagnostic fields.
    #[must_use]
    pub fn nack_with(request_id: &str, reason: &str, mut extra: Map<String, Value>) -> Self {
        extra.insert("reason".to_string(), Value::from(reason));
        Self {
            cmd: CommandKind::Nack,
            id: request_id.to_string(),
            payload: extra,
        }
    }

    /// String payload field, if present and actually a string.
    #[must_use]
    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(Value::as_str)
    }

    /// Unsigned integer payload field.
    #[must_use]
    pub fn u64_field(&self, key: &str) -> Option<u64> {
        self.payload.get(key).and_then(Value::as_u64)
    }

    /// Boolean payload field.
    #[must_use]
    pub fn bool_field(&self, key: &str) -> Option<bool> {
        self.payload.get(key).and_then(Value::as_bool)
    }

    /// Serialize to the wire form.
    #[must_use]
    pub fn encode(&self) -> String {
        serde_json::to_string(self).expect("command serialization cannot fail")
    }

    /// Parse a wire message.
    pub fn decode(text: &str) -> Result<Self> {
        serde_json::from_str(text).context("invalid command message")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_wire_names_are_kebab_case() {
        let json = serde_json::to_string(&CommandKind::ClearSaves).unwrap();
        assert_eq!(json, "\"clear-saves\"");
        let json = serde_json::to_string(&CommandKind::GamesUpdate).unwrap();
        assert_eq!(json, "\"games-update\"");
        let json = serde_json::to_string(&CommandKind::RequestSave).unwrap();
        assert_eq!(json, "\"request-save\"");
    }

    #[test]
    fn test_unknown_kind_decodes() {
        let cmd = Command::decode(r#"{"cmd":"teleport","id":"x1"}"#).unwrap();
        assert_eq!(cmd.cmd, CommandKind::Unknown);
        assert_eq!(cmd.id, "x1");
        assert!(cmd.payload.is_empty());
    }

    #[test]
    fn test_round_trip_with_payload() {
        let mut payload = Map::new();
        payload.insert("game".to_string(), Value::from("zelda.zip"));
        payload.insert("instance_id".to_string(), Value::from("p1-1"));
        let cmd = Command::new(CommandKind::Swap, payload);

        let decoded = Command::decode(&cmd.encode()).unwrap();
        assert_eq!(decoded.cmd, CommandKind::Swap);
        assert_eq!(decoded.id, cmd.id);
        assert_eq!(decoded.str_field("game"), Some("zelda.zip"));
        assert_eq!(decoded.str_field("instance_id"), Some("p1-1"));
    }

    #[test]
    fn test_ack_echoes_request_id() {
        let ack = Command::ack("req-42");
        assert_eq!(ack.cmd, CommandKind::Ack);
        assert_eq!(ack.id, "req-42");
        assert!(ack.payload.is_empty());
    }

    #[test]
    fn test_nack_carries_reason() {
        let nack = Command::nack("req-42", "download failed: mario.zip");
        assert_eq!(nack.cmd, CommandKind::Nack);
        assert_eq!(nack.id, "req-42");
        assert_eq!(nack.str_field("reason"), Some("download failed: mario.zip"));
    }

    #[test]
    fn test_defensive_field_access() {
        let cmd = Command::decode(r#"{"cmd":"swap","id":"a","payload":{"game":7}}"#).unwrap();
        // wrong type reads as absent, not a panic
        assert_eq!(cmd.str_field("game"), None);
        assert_eq!(cmd.u64_field("game"), Some(7));
        assert_eq!(cmd.bool_field("missing"), None);
    }

    #[test]
    fn test_fresh_ids_per_logical_request() {
        let a = Command::new(CommandKind::Pause, Map::new());
        let b = Command::new(CommandKind::Pause, Map::new());
        assert_ne!(a.id, b.id);
    }
}
