#![forbid(unsafe_code)]

use std::collections::{HashMap, VecDeque};

use czateria_domain::{ConversationState, Message};
use czateria_protocol::Command;
use tracing::warn;

use crate::engine::Action;
use crate::events::SessionEvent;

/// One private conversation with a peer.
///
/// The pending queue holds messages received while our accept/reject
/// decision is outstanding; it is non-empty only in `InviteReceived`
/// and is flushed in FIFO order exactly when that state is left.
#[derive(Debug)]
struct Conversation {
	state: ConversationState,
	pending: VecDeque<Message>,
}

impl Conversation {
	fn new(state: ConversationState) -> Self {
		Self {
			state,
			pending: VecDeque::new(),
		}
	}
}

/// Private-conversation state machine, keyed by peer nickname.
///
/// All mutation happens here; the map key guarantees at most one
/// conversation per peer. Callers have already applied the blocking
/// policy to remote traffic. Transitions return the commands to send
/// and events to emit, in order.
#[derive(Debug, Default)]
pub struct ConversationRegistry {
	entries: HashMap<String, Conversation>,
}

impl ConversationRegistry {
	pub fn new() -> Self {
		Self::default()
	}

	/// Drop every conversation (session restart).
	pub fn clear(&mut self) {
		self.entries.clear();
	}

	pub fn len(&self) -> usize {
		self.entries.len()
	}

	pub fn is_empty(&self) -> bool {
		self.entries.is_empty()
	}

	pub fn state_of(&self, peer: &str) -> Option<ConversationState> {
		self.entries.get(peer).map(|c| c.state)
	}

	pub fn pending_len(&self, peer: &str) -> usize {
		self.entries.get(peer).map(|c| c.pending.len()).unwrap_or(0)
	}

	/// Local API: send a private message. Opens a conversation with an
	/// invite when none is live, otherwise sends within it.
	pub fn local_send(&mut self, peer: &str, wire_body: String) -> Vec<Action> {
		use ConversationState::*;
		match self.entries.get(peer).map(|c| c.state) {
			None | Some(Rejected) | Some(Closed) => {
				self.entries
					.insert(peer.to_string(), Conversation::new(ConversationState::InviteSent));
				vec![Action::Send(Command::PrivateInvite {
					peer: peer.to_string(),
					body: wire_body,
				})]
			}
			Some(Active) | Some(InviteSent) => vec![Action::Send(Command::PrivateMessage {
				peer: peer.to_string(),
				body: wire_body,
			})],
			Some(other) => {
				// Sending while their invite is unanswered (or they have
				// no privs) is a caller bug, not a protocol condition.
				debug_assert!(false, "local send in state {other}");
				warn!(peer, state = %other, "dropping private send in unexpected state");
				Vec::new()
			}
		}
	}

	/// Local API: accept a pending invite, flushing queued messages.
	pub fn local_accept(&mut self, peer: &str) -> Vec<Action> {
		let Some(conv) = self.entries.get_mut(peer) else {
			debug_assert!(false, "accept for absent conversation");
			warn!(peer, "accept for absent conversation");
			return Vec::new();
		};
		if conv.state != ConversationState::InviteReceived {
			debug_assert!(false, "accept in state {}", conv.state);
			warn!(peer, state = %conv.state, "accept outside InviteReceived");
			return Vec::new();
		}
		conv.state = ConversationState::Active;
		Self::flush_pending(conv)
	}

	/// Local API: reject the peer's invite and forget the conversation.
	pub fn local_reject(&mut self, peer: &str) -> Vec<Action> {
		self.entries.remove(peer);
		vec![Action::Send(Command::PrivateReject { peer: peer.to_string() })]
	}

	/// Local API: close the conversation and forget it.
	pub fn local_close(&mut self, peer: &str) -> Vec<Action> {
		self.entries.remove(peer);
		vec![Action::Send(Command::PrivateClose { peer: peer.to_string() })]
	}

	/// Remote message (subcodes 1/2, blocking already applied).
	pub fn remote_message(&mut self, peer: &str, msg: Message) -> Vec<Action> {
		use ConversationState::*;
		match self.state_of(peer) {
			// A fresh invite, or one after the previous exchange ended.
			None | Some(Closed) => self.open_received(peer, msg),
			Some(InviteSent) => {
				if let Some(conv) = self.entries.get_mut(peer) {
					conv.state = Active;
				}
				vec![Action::Emit(SessionEvent::PrivateMessageReceived(msg))]
			}
			Some(Active) => vec![Action::Emit(SessionEvent::PrivateMessageReceived(msg))],
			Some(InviteReceived) => {
				if let Some(conv) = self.entries.get_mut(peer) {
					conv.pending.push_back(msg);
				}
				Vec::new()
			}
			// Reachable from the wire alone (a message arriving after
			// the peer's own invite was rejected), so no assertion here.
			Some(other) => {
				warn!(peer, state = %other, "dropping remote private message in unexpected state");
				Vec::new()
			}
		}
	}

	fn open_received(&mut self, peer: &str, msg: Message) -> Vec<Action> {
		let mut conv = Conversation::new(ConversationState::InviteReceived);
		conv.pending.push_back(msg);
		self.entries.insert(peer.to_string(), conv);
		vec![Action::Emit(SessionEvent::NewConversation { peer: peer.to_string() })]
	}

	/// Remote state subcode (13/18/14/16/17, blocking already applied).
	///
	/// A remote close while our accept decision is outstanding is a
	/// cancellation: queued messages are still delivered even though
	/// the conversation is simultaneously reported cancelled.
	pub fn remote_state_change(&mut self, peer: &str, state: ConversationState) -> Vec<Action> {
		if state == ConversationState::Closed
			&& self.state_of(peer) == Some(ConversationState::InviteReceived)
			&& let Some(mut conv) = self.entries.remove(peer)
		{
			let mut actions = Self::flush_pending(&mut conv);
			actions.push(Action::Emit(SessionEvent::ConversationStateChanged {
				peer: peer.to_string(),
				state: ConversationState::Closed,
			}));
			actions.push(Action::Emit(SessionEvent::ConversationCancelled { peer: peer.to_string() }));
			return actions;
		}

		// Any other transition away from InviteReceived still releases
		// the queue before the new state is stored.
		let mut actions = Vec::new();
		if self.state_of(peer) == Some(ConversationState::InviteReceived)
			&& let Some(conv) = self.entries.get_mut(peer)
		{
			actions.extend(Self::flush_pending(conv));
		}
		self.entries
			.entry(peer.to_string())
			.or_insert_with(|| Conversation::new(state))
			.state = state;
		actions.push(Action::Emit(SessionEvent::ConversationStateChanged {
			peer: peer.to_string(),
			state,
		}));
		actions
	}

	/// The peer left the room (code 130). Any live conversation ends;
	/// an unanswered invite is reported cancelled.
	pub fn peer_left(&mut self, peer: &str) -> Vec<Action> {
		let Some(mut conv) = self.entries.remove(peer) else {
			return Vec::new();
		};
		let was_invite = conv.state == ConversationState::InviteReceived;
		let mut actions = Self::flush_pending(&mut conv);
		if was_invite {
			actions.push(Action::Emit(SessionEvent::ConversationCancelled { peer: peer.to_string() }));
		}
		actions
	}

	/// Blocking-policy change: drop conversations with newly blocked
	/// peers, reporting them closed.
	pub fn reconcile<F>(&mut self, mut is_blocked: F) -> Vec<Action>
	where
		F: FnMut(&str) -> bool,
	{
		let blocked: Vec<String> = self.entries.keys().filter(|p| is_blocked(p)).cloned().collect();
		let mut actions = Vec::new();
		for peer in blocked {
			self.entries.remove(&peer);
			actions.push(Action::Emit(SessionEvent::ConversationStateChanged {
				peer,
				state: ConversationState::Closed,
			}));
		}
		actions
	}

	fn flush_pending(conv: &mut Conversation) -> Vec<Action> {
		conv.pending
			.drain(..)
			.map(|msg| Action::Emit(SessionEvent::PrivateMessageReceived(msg)))
			.collect()
	}

	/// Structural invariant check used by property tests.
	#[cfg(test)]
	fn holds_invariants(&self) -> bool {
		self.entries
			.values()
			.all(|c| c.pending.is_empty() || c.state == ConversationState::InviteReceived)
	}
}
