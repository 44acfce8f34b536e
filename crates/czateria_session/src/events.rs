#![forbid(unsafe_code)]

use czateria_domain::{BlockCause, ConversationState, Message};
use serde_json::Value;

/// Outward events raised by the session engine, consumed by the
/// presentation layer. Delivered in dispatch order over the session's
/// event channel.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
	/// A peer opened (or implicitly opened) a private conversation.
	NewConversation { peer: String },
	/// The peer cancelled a conversation that was awaiting accept.
	ConversationCancelled { peer: String },
	/// A peer's conversation state changed (rejected, closed, no
	/// privileges, no free slots).
	ConversationStateChanged { peer: String, state: ConversationState },

	RoomMessageReceived(Message),
	PrivateMessageReceived(Message),

	/// The server (re)assigned this session's nickname.
	NicknameAssigned { nickname: String },
	UserJoined { login: String },
	UserLeft { login: String },

	/// Raw user-list payloads forwarded for the list display model.
	UserListSnapshot { users: Value },
	UserCardBatch { cards: Value },
	UserPrivStatusChanged { login: String, has_privs: bool },
	UserCardUpdated { card: Value },

	/// A private image arrived; bytes are the raw container data with
	/// the sniffed format, left to the consumer to decode and display.
	ImageReceived {
		sender: String,
		bytes: Vec<u8>,
		format: image::ImageFormat,
	},
	/// The server confirmed delivery of an image this session sent.
	ImageDelivered { peer: String },

	Kicked { cause: BlockCause },
	Banned { cause: BlockCause, admin: Option<String> },

	/// The login collaborator could not obtain a fresh session after a
	/// clean remote close; the user must re-authenticate.
	SessionExpired,
	/// Unrecoverable transport or server failure; the session is dead.
	SessionError,
}
