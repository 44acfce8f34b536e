#![forbid(unsafe_code)]

//! Async session runner: owns the WebSocket, drives the pure core and
//! carries out its `Action`s, including keepalive scheduling and the
//! reconnect-or-expire decision on clean remote closes.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use image::DynamicImage;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::{Instant, sleep, sleep_until};
use tokio_tungstenite::tungstenite::{Error as WsError, Message as WsMessage};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use url::Url;

use czateria_domain::Room;
use czateria_protocol::Command;

use crate::engine::{Action, SessionState};
use crate::events::SessionEvent;
use crate::{
	BlockingPolicy, DispatchMode, EventSink, LoginProvider, MarkupConverter, SessionCommandRx, SessionCommandTx,
	SessionConfig, SessionEventTx,
};

pub type CzatWs = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Pluggable transport factory (tests, proxies).
pub type WsConnector = Arc<dyn Fn(Url) -> BoxFuture<'static, anyhow::Result<CzatWs>> + Send + Sync>;

fn default_connector() -> WsConnector {
	Arc::new(|url: Url| {
		Box::pin(async move {
			let (ws, _) = tokio_tungstenite::connect_async(url.as_str()).await?;
			Ok(ws)
		})
	})
}

/// A request from the consumer to the session loop.
#[derive(Debug)]
pub enum SessionCommand {
	SendRoomMessage(String),
	SendPrivateMessage { peer: String, body: String },
	AcceptConversation(String),
	RejectConversation(String),
	CloseConversation(String),
	SendImage { peer: String, image: DynamicImage },
	Stop,
}

/// Cheap cloneable handle for driving a running session.
#[derive(Clone)]
pub struct SessionHandle {
	tx: SessionCommandTx,
}

impl SessionHandle {
	pub fn new(tx: SessionCommandTx) -> Self {
		Self { tx }
	}

	async fn send(&self, cmd: SessionCommand) -> anyhow::Result<()> {
		self.tx.send(cmd).await.map_err(|_| anyhow::anyhow!("session loop is gone"))
	}

	pub async fn send_room_message(&self, text: impl Into<String>) -> anyhow::Result<()> {
		self.send(SessionCommand::SendRoomMessage(text.into())).await
	}

	pub async fn send_private_message(&self, peer: impl Into<String>, body: impl Into<String>) -> anyhow::Result<()> {
		self.send(SessionCommand::SendPrivateMessage {
			peer: peer.into(),
			body: body.into(),
		})
		.await
	}

	pub async fn accept_conversation(&self, peer: impl Into<String>) -> anyhow::Result<()> {
		self.send(SessionCommand::AcceptConversation(peer.into())).await
	}

	pub async fn reject_conversation(&self, peer: impl Into<String>) -> anyhow::Result<()> {
		self.send(SessionCommand::RejectConversation(peer.into())).await
	}

	pub async fn close_conversation(&self, peer: impl Into<String>) -> anyhow::Result<()> {
		self.send(SessionCommand::CloseConversation(peer.into())).await
	}

	pub async fn send_image(&self, peer: impl Into<String>, image: DynamicImage) -> anyhow::Result<()> {
		self.send(SessionCommand::SendImage {
			peer: peer.into(),
			image,
		})
		.await
	}

	pub async fn stop(&self) -> anyhow::Result<()> {
		self.send(SessionCommand::Stop).await
	}
}

enum Flow {
	Continue,
	Shutdown,
}

/// One connection to one room.
pub struct ChatSession {
	state: SessionState,
	config: SessionConfig,
	login: Arc<dyn LoginProvider>,
	blocker_rx: watch::Receiver<()>,
}

impl ChatSession {
	pub fn new(
		room: Room,
		config: SessionConfig,
		login: Arc<dyn LoginProvider>,
		blocker: Arc<dyn BlockingPolicy>,
		sink: Arc<dyn EventSink>,
		markup: Arc<dyn MarkupConverter>,
	) -> Self {
		let blocker_rx = blocker.subscribe();
		let state = SessionState::new(room, Arc::clone(&login), blocker, sink, markup);
		Self {
			state,
			config,
			login,
			blocker_rx,
		}
	}

	/// Spawn the session on the current runtime and return its handle.
	pub fn spawn(self, event_tx: SessionEventTx, command_capacity: usize) -> SessionHandle {
		let (tx, rx) = tokio::sync::mpsc::channel(command_capacity);
		tokio::spawn(self.run(rx, event_tx));
		SessionHandle::new(tx)
	}

	/// Drive the session until it stops: the consumer asked, the server
	/// ended it, or the transport failed.
	pub async fn run(mut self, mut command_rx: SessionCommandRx, event_tx: SessionEventTx) {
		let connector = self.config.ws_connector.clone().unwrap_or_else(default_connector);
		let interval = self.config.keepalive_interval;

		'session: loop {
			let url = match self.config.ws_url(self.state.room()) {
				Ok(url) => url,
				Err(err) => {
					warn!(error = %err, "cannot build session url");
					let _ = event_tx.send(SessionEvent::SessionError).await;
					return;
				}
			};

			info!(%url, room = %self.state.room().name, "connecting to chat room");
			let mut ws = match connector(url).await {
				Ok(ws) => ws,
				Err(err) => {
					warn!(error = %err, "chat connect failed");
					let _ = event_tx.send(SessionEvent::SessionError).await;
					return;
				}
			};

			self.state.reset();
			let mut deadline = Instant::now() + interval;
			let mut inbound: VecDeque<String> = VecDeque::new();
			let mut blocklist_live = true;

			loop {
				tokio::select! {
					cmd = command_rx.recv() => {
						let Some(cmd) = cmd else {
							debug!("command channel dropped, ending session");
							self.shutdown(&mut ws).await;
							return;
						};
						if let SessionCommand::Stop = cmd {
							self.shutdown(&mut ws).await;
							return;
						}
						let actions = self.handle_command(cmd);
						match self.apply(actions, &mut ws, &event_tx, &mut deadline).await {
							Flow::Continue => {}
							Flow::Shutdown => return,
						}
					}
					frame = ws.next() => {
						match frame {
							Some(Ok(WsMessage::Text(text))) => match self.config.dispatch {
								DispatchMode::Direct => {
									let actions = self.state.handle_frame(&text);
									match self.apply(actions, &mut ws, &event_tx, &mut deadline).await {
										Flow::Continue => {}
										Flow::Shutdown => return,
									}
								}
								DispatchMode::Deferred => inbound.push_back(text.to_string()),
							},
							Some(Ok(WsMessage::Ping(data))) => {
								let _ = ws.send(WsMessage::Pong(data)).await;
							}
							Some(Ok(WsMessage::Close(frame))) => {
								debug!(?frame, "server closed the websocket");
								match self.clean_close(&event_tx).await {
									Flow::Continue => continue 'session,
									Flow::Shutdown => return,
								}
							}
							Some(Ok(_)) => {}
							Some(Err(WsError::ConnectionClosed)) | Some(Err(WsError::AlreadyClosed)) | None => {
								match self.clean_close(&event_tx).await {
									Flow::Continue => continue 'session,
									Flow::Shutdown => return,
								}
							}
							Some(Err(err)) => {
								warn!(error = %err, "websocket error");
								let _ = event_tx.send(SessionEvent::SessionError).await;
								return;
							}
						}
					}
					// Deferred frames go back through the loop one per turn
					// so commands and timers interleave in arrival order.
					_ = sleep(Duration::ZERO), if !inbound.is_empty() => {
						if let Some(text) = inbound.pop_front() {
							let actions = self.state.handle_frame(&text);
							match self.apply(actions, &mut ws, &event_tx, &mut deadline).await {
								Flow::Continue => {}
								Flow::Shutdown => return,
							}
						}
					}
					// No command other than the login reply may go out
					// before the hello, keepalives included.
					_ = sleep_until(deadline), if self.state.hello_received() => {
						if let Err(err) = send_command(&mut ws, &Command::Keepalive).await {
							warn!(error = %err, "keepalive send failed");
							let _ = event_tx.send(SessionEvent::SessionError).await;
							return;
						}
						deadline = Instant::now() + interval;
					}
					changed = self.blocker_rx.changed(), if blocklist_live => {
						if changed.is_ok() {
							let actions = self.state.reconcile_blocklist();
							match self.apply(actions, &mut ws, &event_tx, &mut deadline).await {
								Flow::Continue => {}
								Flow::Shutdown => return,
							}
						} else {
							blocklist_live = false;
						}
					}
				}
			}
		}
	}

	fn handle_command(&mut self, cmd: SessionCommand) -> Vec<Action> {
		match cmd {
			SessionCommand::SendRoomMessage(text) => self.state.send_room_message(&text),
			SessionCommand::SendPrivateMessage { peer, body } => self.state.send_private_message(&peer, &body),
			SessionCommand::AcceptConversation(peer) => self.state.accept_private(&peer),
			SessionCommand::RejectConversation(peer) => self.state.reject_private(&peer),
			SessionCommand::CloseConversation(peer) => self.state.close_private(&peer),
			SessionCommand::SendImage { peer, image } => match self.state.send_image(&peer, &image) {
				Ok(actions) => actions,
				Err(err) => {
					warn!(%peer, error = %err, "image send failed");
					Vec::new()
				}
			},
			SessionCommand::Stop => Vec::new(),
		}
	}

	async fn apply(
		&mut self,
		actions: Vec<Action>,
		ws: &mut CzatWs,
		event_tx: &SessionEventTx,
		deadline: &mut Instant,
	) -> Flow {
		for action in actions {
			match action {
				Action::Send(cmd) => {
					if let Err(err) = send_command(ws, &cmd).await {
						warn!(error = %err, "command send failed");
						let _ = event_tx.send(SessionEvent::SessionError).await;
						return Flow::Shutdown;
					}
				}
				Action::Emit(event) => {
					if event_tx.send(event).await.is_err() {
						debug!("event channel dropped, ending session");
						self.shutdown(ws).await;
						return Flow::Shutdown;
					}
				}
				Action::ResetKeepalive => {
					*deadline = Instant::now() + self.config.keepalive_interval;
				}
				Action::Stop => {
					let _ = ws.close(None).await;
					return Flow::Shutdown;
				}
			}
		}
		Flow::Continue
	}

	/// The server closed the socket without a fatal condition. Before
	/// the handshake that just means the room is unreachable; after it,
	/// ask the login collaborator for a fresh session and reconnect, or
	/// report expiry.
	async fn clean_close(&mut self, event_tx: &SessionEventTx) -> Flow {
		if !self.state.hello_received() {
			warn!("socket closed before the server hello");
			return Flow::Shutdown;
		}
		if self.login.restart(self.state.room()) {
			info!(room = %self.state.room().name, "session restarted, reconnecting");
			Flow::Continue
		} else {
			let _ = event_tx.send(SessionEvent::SessionExpired).await;
			Flow::Shutdown
		}
	}

	async fn shutdown(&mut self, ws: &mut CzatWs) {
		if self.state.hello_received()
			&& let Err(err) = send_command(ws, &Command::SessionEnd).await
		{
			debug!(error = %err, "session end send failed");
		}
		let _ = ws.close(None).await;
	}
}

async fn send_command(ws: &mut CzatWs, cmd: &Command) -> anyhow::Result<()> {
	ws.send(WsMessage::Text(cmd.encode().into())).await?;
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::{NullBlocker, NullSink, PlainMarkup, SessionConfig, SessionEventRx, session_channels};
	use serde_json::{Value, json};
	use std::sync::atomic::{AtomicUsize, Ordering};
	use tokio::net::TcpListener;
	use tokio::time::timeout;

	type ServerWs = WebSocketStream<TcpStream>;

	struct TestLogin {
		restarts_left: AtomicUsize,
	}

	impl LoginProvider for TestLogin {
		fn session_id(&self) -> String {
			"sid-1".into()
		}
		fn nickname(&self) -> String {
			"alice".into()
		}
		fn set_nickname(&self, _nickname: &str) {}
		fn restart(&self, _room: &Room) -> bool {
			self.restarts_left
				.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
				.is_ok()
		}
	}

	async fn start_session(
		restarts: usize,
		dispatch: DispatchMode,
		keepalive: Duration,
	) -> (TcpListener, SessionHandle, SessionEventRx) {
		let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
		let port = listener.local_addr().unwrap().port();
		let room = Room::new("testroom", port).unwrap();

		let connector: WsConnector = Arc::new(|url: Url| {
			Box::pin(async move {
				let (ws, _) = tokio_tungstenite::connect_async(url.as_str()).await?;
				Ok(ws)
			})
		});
		let config = SessionConfig {
			keepalive_interval: keepalive,
			dispatch,
			ws_url_template: "ws://127.0.0.1:{port}".into(),
			ws_connector: Some(connector),
		};

		let login = Arc::new(TestLogin {
			restarts_left: AtomicUsize::new(restarts),
		});
		let session = ChatSession::new(
			room,
			config,
			login,
			Arc::new(NullBlocker::new()),
			Arc::new(NullSink),
			Arc::new(PlainMarkup),
		);
		let (command_tx, command_rx, event_tx, event_rx) = session_channels(8, 64);
		tokio::spawn(session.run(command_rx, event_tx));
		(listener, SessionHandle::new(command_tx), event_rx)
	}

	async fn accept_client(listener: &TcpListener) -> ServerWs {
		let (stream, _) = timeout(Duration::from_secs(5), listener.accept()).await.unwrap().unwrap();
		tokio_tungstenite::accept_async(stream).await.unwrap()
	}

	async fn recv_json(ws: &mut ServerWs) -> Value {
		loop {
			match timeout(Duration::from_secs(5), ws.next()).await.unwrap() {
				Some(Ok(WsMessage::Text(text))) => return serde_json::from_str(&text).unwrap(),
				Some(Ok(_)) => continue,
				other => panic!("expected a text frame, got {other:?}"),
			}
		}
	}

	async fn send_json(ws: &mut ServerWs, value: Value) {
		ws.send(WsMessage::Text(value.to_string().into())).await.unwrap();
	}

	async fn handshake(listener: &TcpListener) -> ServerWs {
		let mut ws = accept_client(listener).await;
		send_json(&mut ws, json!({ "code": 138 })).await;
		let login = recv_json(&mut ws).await;
		assert_eq!(login["code"], json!(108));
		ws
	}

	#[tokio::test]
	async fn keepalive_starts_only_after_the_hello() {
		let (listener, _handle, _event_rx) = start_session(0, DispatchMode::Direct, Duration::from_millis(50)).await;
		let mut ws = accept_client(&listener).await;

		// Several intervals pass without the hello; the client stays silent.
		assert!(timeout(Duration::from_millis(200), ws.next()).await.is_err());

		send_json(&mut ws, json!({ "code": 138 })).await;
		let login = recv_json(&mut ws).await;
		assert_eq!(login["code"], json!(108));
		let keepalive = recv_json(&mut ws).await;
		assert_eq!(keepalive, json!({ "code": 1003 }));
	}

	#[tokio::test]
	async fn clean_close_restarts_then_expires() {
		let (listener, _handle, mut event_rx) = start_session(1, DispatchMode::Direct, Duration::from_secs(40)).await;

		let mut ws = handshake(&listener).await;
		ws.close(None).await.unwrap();
		drop(ws);

		// restart() succeeds once: a fresh connection and a fresh handshake.
		let mut ws = handshake(&listener).await;
		ws.close(None).await.unwrap();
		drop(ws);

		let event = timeout(Duration::from_secs(5), event_rx.recv()).await.unwrap();
		assert_eq!(event, Some(SessionEvent::SessionExpired));
	}

	#[tokio::test]
	async fn deferred_dispatch_preserves_frame_order() {
		let (listener, _handle, mut event_rx) = start_session(0, DispatchMode::Deferred, Duration::from_secs(40)).await;
		let mut ws = handshake(&listener).await;

		send_json(&mut ws, json!({ "code": 129, "user": "bob", "msg": "one" })).await;
		send_json(&mut ws, json!({ "code": 129, "user": "bob", "msg": "two" })).await;

		for expected in ["one", "two"] {
			let event = timeout(Duration::from_secs(5), event_rx.recv()).await.unwrap().unwrap();
			match event {
				SessionEvent::RoomMessageReceived(msg) => {
					assert_eq!(msg.sender, "bob");
					assert_eq!(msg.body, expected);
				}
				other => panic!("expected a room message, got {other:?}"),
			}
		}
	}

	#[tokio::test]
	async fn handle_forwards_commands_in_order() {
		let (tx, mut rx) = tokio::sync::mpsc::channel(8);
		let handle = SessionHandle::new(tx);

		handle.send_room_message("hello").await.unwrap();
		handle.send_private_message("bob", "psst").await.unwrap();
		handle.accept_conversation("bob").await.unwrap();
		handle.stop().await.unwrap();

		assert!(matches!(rx.recv().await, Some(SessionCommand::SendRoomMessage(t)) if t == "hello"));
		assert!(matches!(
			rx.recv().await,
			Some(SessionCommand::SendPrivateMessage { peer, body }) if peer == "bob" && body == "psst"
		));
		assert!(matches!(rx.recv().await, Some(SessionCommand::AcceptConversation(p)) if p == "bob"));
		assert!(matches!(rx.recv().await, Some(SessionCommand::Stop)));
	}

	#[tokio::test]
	async fn handle_reports_a_gone_session() {
		let (tx, rx) = tokio::sync::mpsc::channel(1);
		drop(rx);
		let handle = SessionHandle::new(tx);
		assert!(handle.stop().await.is_err());
	}
}
