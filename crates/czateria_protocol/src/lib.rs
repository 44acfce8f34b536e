#![forbid(unsafe_code)]

//! Wire codec for the Czateria JSON-over-WebSocket chat protocol.
//!
//! Every frame is a single-line UTF-8 JSON object carrying an integer
//! `code`; private-channel frames (code 97) additionally carry a
//! `subcode`. Outbound command builders are pure; inbound decoding is
//! total and classifies every frame as an event, an intentionally
//! ignored code, or an unhandled code/subcode pair.

mod commands;
mod events;

pub use commands::Command;
pub use events::{Decoded, DecodeError, PrivateEvent, ServerEvent, decode};

/// Protocol codes used on the wire.
pub mod codes {
	pub const SERVER_HELLO: i64 = 138;
	pub const LOGIN: i64 = 108;
	pub const ROOM_MESSAGE_OUT: i64 = 1;
	pub const ROOM_MESSAGE_IN: i64 = 129;
	pub const USERS_JOINED: i64 = 128;
	pub const USER_LEFT: i64 = 130;
	pub const PRIVATE: i64 = 97;
	pub const USER_LIST: i64 = 132;
	pub const USER_CARDS: i64 = 183;
	pub const USER_PRIV_STATUS: i64 = 137;
	pub const USER_CARD_UPDATE: i64 = 184;
	pub const NICKNAME_ASSIGNED: i64 = 200;
	pub const KEEPALIVE: i64 = 1003;
	pub const SERVER_CONDITION: i64 = 150;
	pub const SESSION_END: i64 = 80;

	pub mod private {
		pub const INVITE: i64 = 1;
		pub const MESSAGE: i64 = 2;
		pub const REJECTED: i64 = 13;
		pub const CLOSED: i64 = 14;
		pub const NO_PRIVS: i64 = 16;
		pub const NO_FREE_PRIVS: i64 = 17;
		pub const RE_REJECTED: i64 = 18;
		pub const IMAGE: i64 = 25;
		pub const IMAGE_DELIVERED: i64 = 26;
	}
}
