#![forbid(unsafe_code)]

//! Session protocol engine for the Czateria chat service.
//!
//! One `ChatSession` owns one WebSocket connection to one room. Inbound
//! frames are decoded by `czateria_protocol`, gated behind the
//! hello/login handshake, and dispatched through a pure core
//! (`SessionState`) that drives the per-peer private-conversation
//! registry and emits outward `SessionEvent`s. Keepalive, reconnection
//! and teardown live in the async runner.

pub mod engine;
pub mod events;
pub mod image;
pub mod registry;
pub mod runner;

use std::time::Duration;

use czateria_domain::{Message, Room};
use tokio::sync::{mpsc, watch};

pub use engine::{Action, SessionState};
pub use events::SessionEvent;
pub use registry::ConversationRegistry;
pub use runner::{ChatSession, CzatWs, SessionCommand, SessionHandle, WsConnector};

/// How inbound frames reach the dispatch path.
///
/// Some transport bindings deliver receive callbacks synchronously,
/// others on the next loop turn; both must observe identical protocol
/// ordering. `Deferred` re-queues each frame through the event loop
/// before dispatching it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DispatchMode {
	#[default]
	Direct,
	Deferred,
}

/// Engine configuration.
#[derive(Clone)]
pub struct SessionConfig {
	/// Keepalive cadence in both directions.
	pub keepalive_interval: Duration,
	pub dispatch: DispatchMode,
	/// WebSocket URL template; `{port}` is replaced with the room's
	/// assigned port.
	pub ws_url_template: String,
	/// Override the transport connector (tests, proxies).
	pub ws_connector: Option<WsConnector>,
}

impl Default for SessionConfig {
	fn default() -> Self {
		Self {
			keepalive_interval: Duration::from_millis(40_000),
			dispatch: DispatchMode::Direct,
			ws_url_template: "wss://{port}-proxy-czateria.interia.pl".to_string(),
			ws_connector: None,
		}
	}
}

impl SessionConfig {
	/// Connection target for a room, derived from its assigned port.
	pub fn ws_url(&self, room: &Room) -> anyhow::Result<url::Url> {
		let raw = self.ws_url_template.replace("{port}", &room.port.to_string());
		url::Url::parse(&raw).map_err(|e| anyhow::anyhow!("invalid ws url {raw}: {e}"))
	}
}

/// Source of session credentials. Obtaining and renewing them is out
/// of the engine's hands; `restart` is the single reconnect decision.
pub trait LoginProvider: Send + Sync {
	fn session_id(&self) -> String;
	fn nickname(&self) -> String;
	/// The server may reassign the nickname post-handshake (code 200).
	fn set_nickname(&self, nickname: &str);
	/// Try to obtain a fresh session for the room after a clean remote
	/// close. `false` means the session is expired for good. Called on
	/// the session loop; implementations must not block at length.
	fn restart(&self, room: &Room) -> bool;
}

/// User/message suppression policy, pulled on every inbound message
/// and pushed through `subscribe` when the block set changes.
pub trait BlockingPolicy: Send + Sync {
	fn is_user_blocked(&self, nick: &str) -> bool;
	fn is_message_blocked(&self, text: &str) -> bool;
	/// Change notifications; the session reconciles open conversations
	/// on every change.
	fn subscribe(&self) -> watch::Receiver<()>;
}

/// Blocks nothing and never notifies.
pub struct NullBlocker {
	rx: watch::Receiver<()>,
	// Keeps the channel open so `changed()` never resolves.
	_tx: watch::Sender<()>,
}

impl NullBlocker {
	pub fn new() -> Self {
		let (tx, rx) = watch::channel(());
		Self { rx, _tx: tx }
	}
}

impl Default for NullBlocker {
	fn default() -> Self {
		Self::new()
	}
}

impl BlockingPolicy for NullBlocker {
	fn is_user_blocked(&self, _nick: &str) -> bool {
		false
	}
	fn is_message_blocked(&self, _text: &str) -> bool {
		false
	}
	fn subscribe(&self) -> watch::Receiver<()> {
		self.rx.clone()
	}
}

/// Observer for traffic and membership, independent of rendering
/// (logging, history).
pub trait EventSink: Send + Sync {
	fn on_room_message(&self, _msg: &Message) {}
	fn on_private_message_sent(&self, _msg: &Message) {}
	fn on_private_message_received(&self, _msg: &Message) {}
	fn on_user_joined(&self, _login: &str) {}
	fn on_user_left(&self, _login: &str) {}
}

/// Sink that records nothing.
pub struct NullSink;

impl EventSink for NullSink {}

/// Converts user-entered text to wire markup (icon tags etc.) before
/// it is placed in an outbound command.
pub trait MarkupConverter: Send + Sync {
	fn to_wire_markup(&self, text: &str) -> String;
}

/// Passthrough markup: the text goes out as typed.
pub struct PlainMarkup;

impl MarkupConverter for PlainMarkup {
	fn to_wire_markup(&self, text: &str) -> String {
		text.to_string()
	}
}

/// Helper channel types for wiring a session.
pub type SessionEventTx = mpsc::Sender<SessionEvent>;
pub type SessionEventRx = mpsc::Receiver<SessionEvent>;
pub type SessionCommandTx = mpsc::Sender<SessionCommand>;
pub type SessionCommandRx = mpsc::Receiver<SessionCommand>;

/// Build the standard bounded channel pair for one session.
pub fn session_channels(
	command_capacity: usize,
	event_capacity: usize,
) -> (SessionCommandTx, SessionCommandRx, SessionEventTx, SessionEventRx) {
	let (command_tx, command_rx) = mpsc::channel(command_capacity);
	let (event_tx, event_rx) = mpsc::channel(event_capacity);
	(command_tx, command_rx, event_tx, event_rx)
}
