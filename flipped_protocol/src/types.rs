// Core identity types for the spectate protocol.
//
// These are lightweight types used by both `message.rs` (protocol messages)
// and the relay's session management (`flipped_relay::session`). Session IDs
// are relay-assigned compact integers, handed out from 1 upwards when a TCP
// connection is accepted.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Relay-assigned session ID, unique among the sessions of one server.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub u32);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// The part a peer plays in a spectate session.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Runs the game and produces frames.
    Player,
    /// Drives the narrative (names the story, starts SiD).
    Controller,
    /// Watches.
    #[default]
    Spectator,
}

impl Role {
    /// Wire name of the role, as it appears in message fields.
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Player => "player",
            Role::Controller => "controller",
            Role::Spectator => "spectator",
        }
    }

    /// Parse a wire name. Returns `None` for anything unrecognized.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "player" => Some(Role::Player),
            "controller" => Some(Role::Controller),
            "spectator" => Some(Role::Spectator),
            _ => None,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
