#![forbid(unsafe_code)]

use core::fmt;
use core::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A chat room as assigned by the lobby: a display name and the numeric
/// port its proxy endpoint listens on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Room {
	pub name: String,
	pub port: u16,
}

/// Errors for parsing a room from a string.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseRoomError {
	#[error("empty value")]
	Empty,
	#[error("invalid format: {0}")]
	InvalidFormat(String),
	#[error("invalid port: {0}")]
	InvalidPort(String),
}

impl Room {
	/// Create a room with a non-empty name.
	pub fn new(name: impl Into<String>, port: u16) -> Result<Self, ParseRoomError> {
		let name = name.into();
		if name.trim().is_empty() {
			return Err(ParseRoomError::Empty);
		}
		Ok(Self { name, port })
	}
}

impl fmt::Display for Room {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}:{}", self.name, self.port)
	}
}

impl FromStr for Room {
	type Err = ParseRoomError;

	/// Parse a `name:port` string.
	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let s = s.trim();
		if s.is_empty() {
			return Err(ParseRoomError::Empty);
		}
		let (name, port_s) = s
			.rsplit_once(':')
			.ok_or_else(|| ParseRoomError::InvalidFormat("expected name:port".into()))?;
		let port = port_s
			.parse::<u16>()
			.map_err(|_| ParseRoomError::InvalidPort(port_s.to_string()))?;
		Room::new(name, port)
	}
}

/// State of a private conversation with one peer.
///
/// Absence of an entry in the registry is the implicit initial and
/// terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationState {
	InviteSent,
	InviteReceived,
	Active,
	Rejected,
	Closed,
	NoPrivs,
	NoFreePrivs,
}

impl ConversationState {
	pub const fn as_str(self) -> &'static str {
		match self {
			Self::InviteSent => "invite_sent",
			Self::InviteReceived => "invite_received",
			Self::Active => "active",
			Self::Rejected => "rejected",
			Self::Closed => "closed",
			Self::NoPrivs => "no_privs",
			Self::NoFreePrivs => "no_free_privs",
		}
	}
}

impl fmt::Display for ConversationState {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// Why the server kicked or banned this session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockCause {
	Unknown,
	Nick,
	Behaviour,
	Avatar,
}

impl fmt::Display for BlockCause {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let s = match self {
			Self::Unknown => "unknown",
			Self::Nick => "nick",
			Self::Behaviour => "behaviour",
			Self::Avatar => "avatar",
		};
		f.write_str(s)
	}
}

/// A single chat message, room-wide or private.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
	pub sent_at: DateTime<Utc>,
	pub body: String,
	pub sender: String,
}

impl Message {
	pub fn new(sent_at: DateTime<Utc>, body: impl Into<String>, sender: impl Into<String>) -> Self {
		Self {
			sent_at,
			body: body.into(),
			sender: sender.into(),
		}
	}

	/// A message stamped with the current time.
	pub fn now(body: impl Into<String>, sender: impl Into<String>) -> Self {
		Self::new(Utc::now(), body, sender)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn room_parse_and_display() {
		let room: Room = "Pogaduchy:12013".parse().unwrap();
		assert_eq!(room.name, "Pogaduchy");
		assert_eq!(room.port, 12013);
		assert_eq!(room.to_string(), "Pogaduchy:12013");
	}

	#[test]
	fn room_rejects_bad_input() {
		assert_eq!("".parse::<Room>(), Err(ParseRoomError::Empty));
		assert!(matches!("noport".parse::<Room>(), Err(ParseRoomError::InvalidFormat(_))));
		assert!(matches!("a:notanumber".parse::<Room>(), Err(ParseRoomError::InvalidPort(_))));
		assert!(Room::new("   ", 1).is_err());
	}

	#[test]
	fn conversation_state_display() {
		assert_eq!(ConversationState::InviteReceived.to_string(), "invite_received");
		assert_eq!(ConversationState::NoFreePrivs.to_string(), "no_free_privs");
	}
}
