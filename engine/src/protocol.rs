//! Wire message definitions shared by transports and the relay.
//!
//! Every message is one JSON text frame:
//!
//! - the first frame a client receives is the initial snapshot, a bare object;
//! - presence frames are `{"type": "USER_JOIN" | "USER_UPDATE" | "USER_DISCONNECT", "payload": ...}`;
//! - anything else must be a patch, a bare array of operations.

use crate::{error::Result, Error, Patch, User, UserId};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Discriminators recognised as presence messages.
pub const PRESENCE_TYPES: [&str; 3] = ["USER_JOIN", "USER_UPDATE", "USER_DISCONNECT"];

/// A presence event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PresenceMessage {
    /// A participant connected
    UserJoin(User),
    /// A participant changed its record
    UserUpdate(User),
    /// A participant disconnected, by id
    UserDisconnect(UserId),
}

impl PresenceMessage {
    /// Encode as a text frame.
    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// A decoded non-initial frame.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    Presence(PresenceMessage),
    Patch(Patch),
}

impl InboundFrame {
    /// Decode a frame received after the initial snapshot.
    ///
    /// Frames carrying a recognised `type` are presence messages; every other
    /// frame is decoded as a patch.
    pub fn decode(text: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(text)?;

        let is_presence = value
            .get("type")
            .and_then(Value::as_str)
            .is_some_and(|kind| PRESENCE_TYPES.contains(&kind));

        if is_presence {
            Ok(InboundFrame::Presence(serde_json::from_value(value)?))
        } else {
            Ok(InboundFrame::Patch(serde_json::from_value(value)?))
        }
    }
}

/// Decode the initial snapshot frame.
pub fn decode_snapshot(text: &str) -> Result<Map<String, Value>> {
    serde_json::from_str(text).map_err(|e| Error::InvalidSnapshot(e.to_string()))
}
