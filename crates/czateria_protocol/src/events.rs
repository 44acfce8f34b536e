#![forbid(unsafe_code)]

use czateria_domain::{BlockCause, ConversationState};
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

use crate::codes;

/// Decode failure for an inbound frame. The session logs these and
/// keeps running; a bad frame is never fatal.
#[derive(Debug, Error)]
pub enum DecodeError {
	#[error("malformed JSON: {0}")]
	Malformed(#[from] serde_json::Error),
	#[error("frame is not a JSON object")]
	NotAnObject,
}

/// Classification of an inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
	/// A frame with protocol meaning.
	Event(ServerEvent),
	/// A known code this client intentionally ignores
	/// (advertisements, channel topic, emoticon changes).
	Ignored { code: i64 },
	/// A code/subcode pair this client does not know.
	Unhandled { code: i64, subcode: Option<i64> },
}

/// A decoded inbound protocol event.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
	/// Server hello (code 138); gates the handshake.
	Hello,
	/// Room chat message (code 129).
	RoomMessage { sender: String, body: String },
	/// Batch user-join notification (code 128).
	UsersJoined { logins: Vec<String> },
	/// A user left the room (code 130).
	UserLeft { login: String },
	/// Private-channel traffic (code 97).
	Private { peer: String, event: PrivateEvent },
	/// Full user-list snapshot (code 132); raw entries are passed
	/// through for the presentation layer.
	UserListSnapshot { users: Value },
	/// Extended user-card batch (code 183).
	UserCardBatch { cards: Value },
	/// Single user's privilege-flag change (code 137).
	UserPrivStatusChanged { login: String, has_privs: bool },
	/// Single user's card update (code 184).
	UserCardUpdated { card: Value },
	/// Server-assigned nickname (code 200).
	NicknameAssigned { nickname: String },
	/// Keepalive request (code 1003); reply immediately.
	Keepalive,
	/// Fatal session error signaled by the server (150/1). The server
	/// stops processing messages after this.
	SessionFatal,
	/// Kick notification (150/26).
	Kicked { cause: BlockCause },
	/// Ban notification (150/26) with the acting admin, when named.
	Banned { cause: BlockCause, admin: Option<String> },
}

/// Private-channel (code 97) event kinds.
#[derive(Debug, Clone, PartialEq)]
pub enum PrivateEvent {
	/// Subcodes 1 and 2: an invite is just a message that may open a
	/// conversation; the registry decides based on current state.
	Message { body: String },
	/// Subcodes 13/18/14/16/17 mapped to a conversation state.
	StateChanged(ConversationState),
	/// Subcode 25: base64 image payload, decoded downstream.
	Image { data_base64: String },
	/// Subcode 26: image-delivery confirmation, no state effect.
	ImageDelivered,
}

#[derive(Debug, Deserialize)]
struct JoinedUser {
	#[serde(default)]
	login: String,
}

fn int_field(obj: &Value, key: &str) -> Option<i64> {
	obj.get(key).and_then(Value::as_i64)
}

fn str_field(obj: &Value, key: &str) -> String {
	obj.get(key).and_then(Value::as_str).unwrap_or_default().to_string()
}

fn state_for_subcode(subcode: i64) -> Option<ConversationState> {
	match subcode {
		codes::private::REJECTED | codes::private::RE_REJECTED => Some(ConversationState::Rejected),
		codes::private::CLOSED => Some(ConversationState::Closed),
		codes::private::NO_PRIVS => Some(ConversationState::NoPrivs),
		codes::private::NO_FREE_PRIVS => Some(ConversationState::NoFreePrivs),
		_ => None,
	}
}

fn decode_private(obj: &Value) -> Decoded {
	let peer = str_field(obj, "user");
	let subcode = int_field(obj, "subcode");

	let event = match subcode {
		Some(codes::private::INVITE) | Some(codes::private::MESSAGE) => PrivateEvent::Message {
			body: str_field(obj, "msg"),
		},
		Some(codes::private::IMAGE) => match obj.get("data").and_then(Value::as_str) {
			Some(data) => PrivateEvent::Image {
				data_base64: data.to_string(),
			},
			None => {
				return Decoded::Unhandled {
					code: codes::PRIVATE,
					subcode,
				};
			}
		},
		Some(codes::private::IMAGE_DELIVERED) => PrivateEvent::ImageDelivered,
		Some(sc) => match state_for_subcode(sc) {
			Some(state) => PrivateEvent::StateChanged(state),
			None => {
				return Decoded::Unhandled {
					code: codes::PRIVATE,
					subcode,
				};
			}
		},
		None => {
			return Decoded::Unhandled {
				code: codes::PRIVATE,
				subcode: None,
			};
		}
	};

	Decoded::Event(ServerEvent::Private { peer, event })
}

fn decode_kick_ban(obj: &Value) -> Decoded {
	let admin = {
		let s = str_field(obj, "admin");
		if s.is_empty() { None } else { Some(s) }
	};
	let event = match int_field(obj, "type") {
		Some(9) => ServerEvent::Kicked { cause: BlockCause::Nick },
		Some(12) => ServerEvent::Kicked {
			cause: BlockCause::Avatar,
		},
		Some(33) => ServerEvent::Kicked {
			cause: BlockCause::Unknown,
		},
		Some(17) => ServerEvent::Banned {
			cause: BlockCause::Nick,
			admin,
		},
		Some(18) => ServerEvent::Banned {
			cause: BlockCause::Behaviour,
			admin,
		},
		Some(20) => ServerEvent::Banned {
			cause: BlockCause::Avatar,
			admin,
		},
		_ => {
			return Decoded::Unhandled {
				code: codes::SERVER_CONDITION,
				subcode: Some(26),
			};
		}
	};
	Decoded::Event(event)
}

/// Decode one inbound text frame.
///
/// Total over all inputs: malformed frames are an `Err` the caller
/// logs and drops, unknown codes come back as `Decoded::Unhandled`,
/// and the advertisement/topic codes decode as `Decoded::Ignored`.
pub fn decode(text: &str) -> Result<Decoded, DecodeError> {
	let obj: Value = serde_json::from_str(text)?;
	if !obj.is_object() {
		return Err(DecodeError::NotAnObject);
	}

	let code = int_field(&obj, "code").unwrap_or(0);
	let decoded = match code {
		codes::SERVER_HELLO => Decoded::Event(ServerEvent::Hello),
		codes::ROOM_MESSAGE_IN => Decoded::Event(ServerEvent::RoomMessage {
			sender: str_field(&obj, "user"),
			body: str_field(&obj, "msg"),
		}),
		codes::USERS_JOINED => {
			let users: Vec<JoinedUser> =
				serde_json::from_value(obj.get("users").cloned().unwrap_or(Value::Null)).unwrap_or_default();
			Decoded::Event(ServerEvent::UsersJoined {
				logins: users.into_iter().map(|u| u.login).filter(|l| !l.is_empty()).collect(),
			})
		}
		codes::USER_LEFT => Decoded::Event(ServerEvent::UserLeft {
			login: str_field(&obj, "login"),
		}),
		codes::PRIVATE => decode_private(&obj),
		codes::USER_LIST => Decoded::Event(ServerEvent::UserListSnapshot {
			users: obj.get("users").cloned().unwrap_or(Value::Null),
		}),
		codes::USER_CARDS => Decoded::Event(ServerEvent::UserCardBatch {
			cards: obj.get("cards").cloned().unwrap_or(Value::Null),
		}),
		codes::USER_PRIV_STATUS => Decoded::Event(ServerEvent::UserPrivStatusChanged {
			login: str_field(&obj, "user"),
			has_privs: int_field(&obj, "hasPrivs").unwrap_or(0) != 0,
		}),
		codes::USER_CARD_UPDATE => Decoded::Event(ServerEvent::UserCardUpdated { card: obj.clone() }),
		codes::NICKNAME_ASSIGNED => Decoded::Event(ServerEvent::NicknameAssigned {
			nickname: str_field(&obj, "username"),
		}),
		codes::KEEPALIVE => Decoded::Event(ServerEvent::Keepalive),
		codes::SERVER_CONDITION => match int_field(&obj, "subcode") {
			Some(1) => Decoded::Event(ServerEvent::SessionFatal),
			Some(26) => decode_kick_ban(&obj),
			// Other subcodes are informational; the reference client
			// drops them on the floor.
			_ => Decoded::Ignored { code },
		},
		// Advertisement, channel topic, emoticon change, permission
		// broadcast: decoded but intentionally ignored.
		131 | 134 | 135 | 140 => Decoded::Ignored { code },
		_ => Decoded::Unhandled {
			code,
			subcode: int_field(&obj, "subcode"),
		},
	};

	Ok(decoded)
}
