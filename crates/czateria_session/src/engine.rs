#![forbid(unsafe_code)]

//! Pure protocol core.
//!
//! `SessionState` consumes decoded frames and local calls, and returns
//! the `Action`s the runner must carry out. It performs no IO itself,
//! which keeps every handshake, queueing and blocking rule testable
//! without a socket.

use std::sync::Arc;

use czateria_domain::{Message, Room};
use czateria_protocol::{Command, Decoded, PrivateEvent, ServerEvent, decode};
use image::DynamicImage;
use tracing::{debug, warn};

use crate::events::SessionEvent;
use crate::image::{self as img, ImageError};
use crate::registry::ConversationRegistry;
use crate::{BlockingPolicy, EventSink, LoginProvider, MarkupConverter};

/// One effect the runner must perform, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
	/// Send this command on the socket.
	Send(Command),
	/// Deliver this event to the consumer.
	Emit(SessionEvent),
	/// Push the keepalive deadline out by one interval.
	ResetKeepalive,
	/// Tear the connection down; the session is over.
	Stop,
}

/// Session protocol state for one room connection.
pub struct SessionState {
	room: Room,
	nickname: String,
	hello_received: bool,
	registry: ConversationRegistry,
	login: Arc<dyn LoginProvider>,
	blocker: Arc<dyn BlockingPolicy>,
	sink: Arc<dyn EventSink>,
	markup: Arc<dyn MarkupConverter>,
}

impl SessionState {
	pub fn new(
		room: Room,
		login: Arc<dyn LoginProvider>,
		blocker: Arc<dyn BlockingPolicy>,
		sink: Arc<dyn EventSink>,
		markup: Arc<dyn MarkupConverter>,
	) -> Self {
		let nickname = login.nickname();
		Self {
			room,
			nickname,
			hello_received: false,
			registry: ConversationRegistry::new(),
			login,
			blocker,
			sink,
			markup,
		}
	}

	pub fn room(&self) -> &Room {
		&self.room
	}

	pub fn nickname(&self) -> &str {
		&self.nickname
	}

	pub fn hello_received(&self) -> bool {
		self.hello_received
	}

	/// Reset for a fresh connection (reconnect after a clean close).
	pub fn reset(&mut self) {
		self.hello_received = false;
		self.nickname = self.login.nickname();
		self.registry.clear();
	}

	/// Dispatch one inbound text frame.
	pub fn handle_frame(&mut self, text: &str) -> Vec<Action> {
		let event = match decode(text) {
			Ok(Decoded::Event(event)) => event,
			Ok(Decoded::Ignored { code }) => {
				debug!(code, "ignoring frame");
				return Vec::new();
			}
			Ok(Decoded::Unhandled { code, subcode }) => {
				warn!(code, ?subcode, "unhandled frame");
				return Vec::new();
			}
			Err(e) => {
				warn!(error = %e, "dropping malformed frame");
				return Vec::new();
			}
		};

		if !self.hello_received {
			return match event {
				ServerEvent::Hello => {
					self.hello_received = true;
					// The keepalive clock starts with the handshake, not
					// the connection.
					vec![
						Action::Send(Command::Login {
							session_id: self.login.session_id(),
							channel: self.room.name.clone(),
							nickname: self.nickname.clone(),
						}),
						Action::ResetKeepalive,
					]
				}
				other => {
					warn!(event = ?other, "dropping frame received before server hello");
					Vec::new()
				}
			};
		}

		self.handle_event(event)
	}

	fn handle_event(&mut self, event: ServerEvent) -> Vec<Action> {
		match event {
			ServerEvent::Hello => {
				warn!("unexpected hello on an established session");
				Vec::new()
			}
			ServerEvent::RoomMessage { sender, body } => {
				let msg = Message::now(&body, &sender);
				self.sink.on_room_message(&msg);
				if sender == self.nickname
					|| self.blocker.is_user_blocked(&sender)
					|| self.blocker.is_message_blocked(&body)
				{
					return Vec::new();
				}
				vec![Action::Emit(SessionEvent::RoomMessageReceived(msg))]
			}
			ServerEvent::UsersJoined { logins } => logins
				.into_iter()
				.map(|login| {
					self.sink.on_user_joined(&login);
					Action::Emit(SessionEvent::UserJoined { login })
				})
				.collect(),
			ServerEvent::UserLeft { login } => {
				self.sink.on_user_left(&login);
				let mut actions = self.registry.peer_left(&login);
				actions.push(Action::Emit(SessionEvent::UserLeft { login }));
				actions
			}
			ServerEvent::Private { peer, event } => self.handle_private(peer, event),
			ServerEvent::UserListSnapshot { users } => {
				vec![Action::Emit(SessionEvent::UserListSnapshot { users })]
			}
			ServerEvent::UserCardBatch { cards } => {
				vec![Action::Emit(SessionEvent::UserCardBatch { cards })]
			}
			ServerEvent::UserPrivStatusChanged { login, has_privs } => {
				vec![Action::Emit(SessionEvent::UserPrivStatusChanged { login, has_privs })]
			}
			ServerEvent::UserCardUpdated { card } => {
				vec![Action::Emit(SessionEvent::UserCardUpdated { card })]
			}
			ServerEvent::NicknameAssigned { nickname } => {
				self.nickname = nickname.clone();
				self.login.set_nickname(&nickname);
				vec![Action::Emit(SessionEvent::NicknameAssigned { nickname })]
			}
			ServerEvent::Keepalive => vec![Action::Send(Command::Keepalive), Action::ResetKeepalive],
			ServerEvent::SessionFatal => vec![Action::Emit(SessionEvent::SessionError), Action::Stop],
			ServerEvent::Kicked { cause } => vec![Action::Emit(SessionEvent::Kicked { cause })],
			ServerEvent::Banned { cause, admin } => {
				vec![Action::Emit(SessionEvent::Banned { cause, admin })]
			}
		}
	}

	fn handle_private(&mut self, peer: String, event: PrivateEvent) -> Vec<Action> {
		if self.blocker.is_user_blocked(&peer) {
			debug!(%peer, "dropping private traffic from blocked user");
			return Vec::new();
		}
		match event {
			PrivateEvent::Message { body } => {
				if self.blocker.is_message_blocked(&body) {
					debug!(%peer, "dropping blocked private message");
					return Vec::new();
				}
				let msg = Message::now(&body, &peer);
				self.sink.on_private_message_received(&msg);
				self.registry.remote_message(&peer, msg)
			}
			PrivateEvent::StateChanged(state) => self.registry.remote_state_change(&peer, state),
			PrivateEvent::Image { data_base64 } => match img::decode_inbound(&data_base64) {
				Ok(inbound) => vec![Action::Emit(SessionEvent::ImageReceived {
					sender: peer,
					bytes: inbound.bytes,
					format: inbound.format,
				})],
				Err(e) => {
					warn!(%peer, error = %e, "dropping undecodable private image");
					Vec::new()
				}
			},
			PrivateEvent::ImageDelivered => vec![Action::Emit(SessionEvent::ImageDelivered { peer })],
		}
	}

	fn ready(&self, what: &str) -> bool {
		if !self.hello_received {
			warn!(what, "dropping local call before the handshake completed");
			return false;
		}
		true
	}

	/// Local API: send a message to the whole room.
	pub fn send_room_message(&mut self, text: &str) -> Vec<Action> {
		if !self.ready("room message") {
			return Vec::new();
		}
		self.sink.on_room_message(&Message::now(text, &self.nickname));
		vec![Action::Send(Command::RoomMessage {
			body: self.markup.to_wire_markup(text),
		})]
	}

	/// Local API: send a private message, opening the conversation with
	/// an invite when none is live.
	pub fn send_private_message(&mut self, peer: &str, text: &str) -> Vec<Action> {
		if !self.ready("private message") {
			return Vec::new();
		}
		self.sink.on_private_message_sent(&Message::now(text, peer));
		self.registry.local_send(peer, self.markup.to_wire_markup(text))
	}

	/// Local API: accept a pending invite; queued messages are released
	/// in arrival order.
	pub fn accept_private(&mut self, peer: &str) -> Vec<Action> {
		if !self.ready("accept") {
			return Vec::new();
		}
		self.registry.local_accept(peer)
	}

	/// Local API: reject a pending invite.
	pub fn reject_private(&mut self, peer: &str) -> Vec<Action> {
		if !self.ready("reject") {
			return Vec::new();
		}
		self.registry.local_reject(peer)
	}

	/// Local API: close a conversation.
	pub fn close_private(&mut self, peer: &str) -> Vec<Action> {
		if !self.ready("close") {
			return Vec::new();
		}
		self.registry.local_close(peer)
	}

	/// Local API: send an image on the private channel. The image is
	/// bounded to 600x600 and re-encoded as JPEG.
	pub fn send_image(&mut self, peer: &str, image: &DynamicImage) -> Result<Vec<Action>, ImageError> {
		if !self.ready("image") {
			return Ok(Vec::new());
		}
		let out = img::prepare_outbound(image)?;
		Ok(vec![Action::Send(Command::PrivateImage {
			peer: peer.to_string(),
			width: out.width,
			height: out.height,
			data_base64: out.data_base64,
		})])
	}

	/// The blocking policy changed; drop conversations with newly
	/// blocked peers.
	pub fn reconcile_blocklist(&mut self) -> Vec<Action> {
		let blocker = Arc::clone(&self.blocker);
		self.registry.reconcile(|peer| blocker.is_user_blocked(peer))
	}

	#[cfg(test)]
	pub(crate) fn registry(&self) -> &ConversationRegistry {
		&self.registry
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::{NullSink, PlainMarkup};
	use czateria_domain::{BlockCause, ConversationState};
	use std::sync::Mutex;
	use tokio::sync::watch;

	struct FakeLogin {
		nickname: Mutex<String>,
		restart_ok: bool,
	}

	impl FakeLogin {
		fn new(nickname: &str) -> Arc<Self> {
			Arc::new(Self {
				nickname: Mutex::new(nickname.to_string()),
				restart_ok: true,
			})
		}
	}

	impl LoginProvider for FakeLogin {
		fn session_id(&self) -> String {
			"sid-1".into()
		}
		fn nickname(&self) -> String {
			self.nickname.lock().unwrap().clone()
		}
		fn set_nickname(&self, nickname: &str) {
			*self.nickname.lock().unwrap() = nickname.to_string();
		}
		fn restart(&self, _room: &Room) -> bool {
			self.restart_ok
		}
	}

	struct ListBlocker {
		users: Vec<String>,
		words: Vec<String>,
		rx: watch::Receiver<()>,
		_tx: watch::Sender<()>,
	}

	impl ListBlocker {
		fn new(users: &[&str], words: &[&str]) -> Arc<Self> {
			let (tx, rx) = watch::channel(());
			Arc::new(Self {
				users: users.iter().map(|s| s.to_string()).collect(),
				words: words.iter().map(|s| s.to_string()).collect(),
				rx,
				_tx: tx,
			})
		}
	}

	impl BlockingPolicy for ListBlocker {
		fn is_user_blocked(&self, nick: &str) -> bool {
			self.users.iter().any(|u| u == nick)
		}
		fn is_message_blocked(&self, text: &str) -> bool {
			self.words.iter().any(|w| text.contains(w.as_str()))
		}
		fn subscribe(&self) -> watch::Receiver<()> {
			self.rx.clone()
		}
	}

	fn state_with(blocker: Arc<dyn BlockingPolicy>) -> SessionState {
		SessionState::new(
			Room::new("Pogaduchy", 443).unwrap(),
			FakeLogin::new("alice"),
			blocker,
			Arc::new(NullSink),
			Arc::new(PlainMarkup),
		)
	}

	fn ready_state() -> SessionState {
		let mut st = state_with(ListBlocker::new(&[], &[]));
		st.handle_frame(r#"{"code":138}"#);
		st
	}

	fn emitted(actions: &[Action]) -> Vec<&SessionEvent> {
		actions
			.iter()
			.filter_map(|a| match a {
				Action::Emit(ev) => Some(ev),
				_ => None,
			})
			.collect()
	}

	#[test]
	fn frames_before_hello_are_dropped() {
		let mut st = state_with(ListBlocker::new(&[], &[]));
		assert!(st.handle_frame(r#"{"code":129,"user":"bob","msg":"early"}"#).is_empty());
		assert!(st.send_room_message("too early").is_empty());

		let actions = st.handle_frame(r#"{"code":138}"#);
		assert_eq!(actions.len(), 2);
		match &actions[0] {
			Action::Send(Command::Login {
				session_id,
				channel,
				nickname,
			}) => {
				assert_eq!(session_id, "sid-1");
				assert_eq!(channel, "Pogaduchy");
				assert_eq!(nickname, "alice");
			}
			other => panic!("expected login, got {other:?}"),
		}
		assert_eq!(actions[1], Action::ResetKeepalive);
		assert!(st.hello_received());
	}

	#[test]
	fn room_messages_skip_own_echo_and_blocked_senders() {
		let mut st = state_with(ListBlocker::new(&["troll"], &["spamword"]));
		st.handle_frame(r#"{"code":138}"#);

		let a = st.handle_frame(r#"{"code":129,"user":"bob","msg":"hi"}"#);
		assert!(matches!(
			emitted(&a)[0],
			SessionEvent::RoomMessageReceived(m) if m.sender == "bob" && m.body == "hi"
		));

		assert!(st.handle_frame(r#"{"code":129,"user":"alice","msg":"echo"}"#).is_empty());
		assert!(st.handle_frame(r#"{"code":129,"user":"troll","msg":"hi"}"#).is_empty());
		assert!(st.handle_frame(r#"{"code":129,"user":"bob","msg":"spamword!"}"#).is_empty());
	}

	#[test]
	fn unsolicited_private_message_queues_until_accepted() {
		let mut st = ready_state();

		let a = st.handle_frame(r#"{"code":97,"subcode":1,"user":"bob","msg":"psst"}"#);
		assert_eq!(emitted(&a), vec![&SessionEvent::NewConversation { peer: "bob".into() }]);
		assert_eq!(st.registry().state_of("bob"), Some(ConversationState::InviteReceived));

		assert!(st.handle_frame(r#"{"code":97,"subcode":2,"user":"bob","msg":"again"}"#).is_empty());

		let a = st.accept_private("bob");
		let bodies: Vec<_> = emitted(&a)
			.into_iter()
			.filter_map(|ev| match ev {
				SessionEvent::PrivateMessageReceived(m) => Some(m.body.clone()),
				_ => None,
			})
			.collect();
		assert_eq!(bodies, vec!["psst", "again"]);
		assert_eq!(st.registry().state_of("bob"), Some(ConversationState::Active));
	}

	#[test]
	fn remote_cancel_of_pending_invite_still_delivers_queue() {
		let mut st = ready_state();
		st.handle_frame(r#"{"code":97,"subcode":1,"user":"bob","msg":"one"}"#);
		st.handle_frame(r#"{"code":97,"subcode":2,"user":"bob","msg":"two"}"#);

		let a = st.handle_frame(r#"{"code":97,"subcode":14,"user":"bob"}"#);
		let evs = emitted(&a);
		assert!(matches!(evs[0], SessionEvent::PrivateMessageReceived(m) if m.body == "one"));
		assert!(matches!(evs[1], SessionEvent::PrivateMessageReceived(m) if m.body == "two"));
		assert_eq!(
			evs[2],
			&SessionEvent::ConversationStateChanged {
				peer: "bob".into(),
				state: ConversationState::Closed,
			}
		);
		assert_eq!(evs[3], &SessionEvent::ConversationCancelled { peer: "bob".into() });
		assert_eq!(st.registry().state_of("bob"), None);
	}

	#[test]
	fn blocked_private_sender_has_no_effect_at_all() {
		let mut st = state_with(ListBlocker::new(&["troll"], &[]));
		st.handle_frame(r#"{"code":138}"#);

		assert!(st.handle_frame(r#"{"code":97,"subcode":1,"user":"troll","msg":"hi"}"#).is_empty());
		assert!(st.handle_frame(r#"{"code":97,"subcode":14,"user":"troll"}"#).is_empty());
		assert!(
			st.handle_frame(r#"{"code":97,"subcode":25,"user":"troll","data":"QUJD"}"#)
				.is_empty()
		);
		assert_eq!(st.registry().len(), 0);
	}

	#[test]
	fn local_private_send_opens_then_continues() {
		let mut st = ready_state();

		let a = st.send_private_message("bob", "hi");
		assert_eq!(
			a,
			vec![Action::Send(Command::PrivateInvite {
				peer: "bob".into(),
				body: "hi".into(),
			})]
		);

		// Their reply activates the conversation; next send is 97/2.
		st.handle_frame(r#"{"code":97,"subcode":2,"user":"bob","msg":"yo"}"#);
		let a = st.send_private_message("bob", "how are you");
		assert_eq!(
			a,
			vec![Action::Send(Command::PrivateMessage {
				peer: "bob".into(),
				body: "how are you".into(),
			})]
		);
	}

	#[test]
	fn keepalive_is_echoed_and_reschedules() {
		let mut st = ready_state();
		let a = st.handle_frame(r#"{"code":1003}"#);
		assert_eq!(a, vec![Action::Send(Command::Keepalive), Action::ResetKeepalive]);
	}

	#[test]
	fn server_fatal_stops_the_session() {
		let mut st = ready_state();
		let a = st.handle_frame(r#"{"code":150,"subcode":1}"#);
		assert_eq!(a, vec![Action::Emit(SessionEvent::SessionError), Action::Stop]);
	}

	#[test]
	fn kick_and_ban_are_reported_without_stopping() {
		let mut st = ready_state();
		let a = st.handle_frame(r#"{"code":150,"subcode":26,"type":9}"#);
		assert_eq!(a, vec![Action::Emit(SessionEvent::Kicked { cause: BlockCause::Nick })]);

		let a = st.handle_frame(r#"{"code":150,"subcode":26,"type":18,"admin":"mod1"}"#);
		assert_eq!(
			a,
			vec![Action::Emit(SessionEvent::Banned {
				cause: BlockCause::Behaviour,
				admin: Some("mod1".into()),
			})]
		);
	}

	#[test]
	fn nickname_reassignment_updates_echo_suppression() {
		let mut st = ready_state();
		let a = st.handle_frame(r#"{"code":200,"username":"alice_8812"}"#);
		assert_eq!(
			a,
			vec![Action::Emit(SessionEvent::NicknameAssigned {
				nickname: "alice_8812".into(),
			})]
		);
		assert_eq!(st.nickname(), "alice_8812");
		// Echo of the new nickname is now suppressed.
		assert!(st.handle_frame(r#"{"code":129,"user":"alice_8812","msg":"x"}"#).is_empty());
	}

	#[test]
	fn peer_departure_cancels_their_invite() {
		let mut st = ready_state();
		st.handle_frame(r#"{"code":97,"subcode":1,"user":"bob","msg":"hi"}"#);

		let a = st.handle_frame(r#"{"code":130,"login":"bob"}"#);
		let evs = emitted(&a);
		assert!(matches!(evs[0], SessionEvent::PrivateMessageReceived(m) if m.body == "hi"));
		assert_eq!(evs[1], &SessionEvent::ConversationCancelled { peer: "bob".into() });
		assert_eq!(evs[2], &SessionEvent::UserLeft { login: "bob".into() });
	}

	#[test]
	fn inbound_image_is_decoded_and_sniffed() {
		use base64::Engine as _;
		use base64::engine::general_purpose::STANDARD;

		let mut st = ready_state();
		st.handle_frame(r#"{"code":97,"subcode":1,"user":"bob","msg":"hi"}"#);
		st.accept_private("bob");

		let mut buf = std::io::Cursor::new(Vec::new());
		image::DynamicImage::ImageRgb8(image::RgbImage::new(4, 4))
			.write_to(&mut buf, image::ImageFormat::Png)
			.unwrap();
		let payload = STANDARD.encode(buf.into_inner());

		let frame = format!(r#"{{"code":97,"subcode":25,"user":"bob","data":"{payload}"}}"#);
		let a = st.handle_frame(&frame);
		assert!(matches!(
			emitted(&a)[0],
			SessionEvent::ImageReceived { sender, format, .. }
				if sender == "bob" && *format == image::ImageFormat::Png
		));

		// Garbage payloads are dropped without effect.
		assert!(
			st.handle_frame(r#"{"code":97,"subcode":25,"user":"bob","data":"???"}"#)
				.is_empty()
		);
	}

	#[test]
	fn outbound_image_is_bounded_and_sent() {
		let mut st = ready_state();
		let big = image::DynamicImage::ImageRgb8(image::RgbImage::new(1200, 600));
		let a = st.send_image("bob", &big).unwrap();
		match &a[0] {
			Action::Send(Command::PrivateImage { peer, width, height, .. }) => {
				assert_eq!(peer, "bob");
				assert_eq!((*width, *height), (600, 300));
			}
			other => panic!("expected image send, got {other:?}"),
		}
	}

	#[test]
	fn blocklist_reconcile_closes_blocked_conversations() {
		let mut st = state_with(ListBlocker::new(&["eve"], &[]));
		st.handle_frame(r#"{"code":138}"#);
		st.send_private_message("bob", "hi");
		// A locally opened conversation with a blocked peer; inbound
		// traffic from eve would never have created one.
		st.send_private_message("eve", "hi");

		let a = st.reconcile_blocklist();
		assert_eq!(
			a,
			vec![Action::Emit(SessionEvent::ConversationStateChanged {
				peer: "eve".into(),
				state: ConversationState::Closed,
			})]
		);
		assert_eq!(st.registry().state_of("bob"), Some(ConversationState::InviteSent));
	}

	#[test]
	fn reset_clears_handshake_and_conversations() {
		let mut st = ready_state();
		st.send_private_message("bob", "hi");
		st.reset();
		assert!(!st.hello_received());
		assert_eq!(st.registry().len(), 0);
	}

	#[test]
	fn malformed_and_unhandled_frames_are_dropped() {
		let mut st = ready_state();
		assert!(st.handle_frame("{nope").is_empty());
		assert!(st.handle_frame(r#"{"code":9999}"#).is_empty());
		assert!(st.handle_frame(r#"{"code":131}"#).is_empty());
	}
}
