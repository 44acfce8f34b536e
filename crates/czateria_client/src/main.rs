#![forbid(unsafe_code)]

mod config;

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use czateria_domain::{Message, Room};
use czateria_session::{
	BlockingPolicy, ChatSession, EventSink, LoginProvider, PlainMarkup, SessionConfig, SessionEvent, SessionHandle,
	session_channels,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: czateria_client [--room name:port] [--nick nickname] [--session id]\n\
\n\
Options:\n\
\t--room     Room to join, as name:port (or `room` in config)\n\
\t--nick     Nickname to present at login\n\
\t--session  Pre-obtained session id\n\
\t--config   Config file path (default: ~/.czateria/config.toml)\n\
\t--help     Show this help\n\
\n\
Input:\n\
\tplain text        send to the room\n\
\t/msg NICK TEXT    send a private message\n\
\t/accept NICK      accept a pending invite\n\
\t/reject NICK      reject a pending invite\n\
\t/close NICK       close a conversation\n\
\t/quit             leave\n\
"
	);
	std::process::exit(2)
}

struct CliArgs {
	room: Option<String>,
	nickname: Option<String>,
	session_id: Option<String>,
	config_path: Option<PathBuf>,
}

fn parse_args() -> CliArgs {
	let mut args = CliArgs {
		room: None,
		nickname: None,
		session_id: None,
		config_path: None,
	};

	let mut it = std::env::args().skip(1);
	while let Some(arg) = it.next() {
		match arg.as_str() {
			"--help" | "-h" => usage_and_exit(),
			"--room" => args.room = Some(it.next().unwrap_or_else(|| usage_and_exit())),
			"--nick" => args.nickname = Some(it.next().unwrap_or_else(|| usage_and_exit())),
			"--session" => args.session_id = Some(it.next().unwrap_or_else(|| usage_and_exit())),
			"--config" => args.config_path = Some(PathBuf::from(it.next().unwrap_or_else(|| usage_and_exit()))),
			other => {
				eprintln!("Unknown argument: {other}");
				usage_and_exit();
			}
		}
	}

	args
}

fn init_tracing() {
	let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,czateria_session=debug".to_string());

	tracing_subscriber::registry()
		.with(tracing_subscriber::EnvFilter::new(filter))
		.with(tracing_subscriber::fmt::layer().with_target(false).with_writer(std::io::stderr))
		.init();
}

/// Fixed credentials from config/flags. The session id is single-use:
/// once the server drops it there is nothing to restart with.
struct StaticLogin {
	session_id: String,
	nickname: Mutex<String>,
}

impl LoginProvider for StaticLogin {
	fn session_id(&self) -> String {
		self.session_id.clone()
	}

	fn nickname(&self) -> String {
		self.nickname.lock().unwrap_or_else(|e| e.into_inner()).clone()
	}

	fn set_nickname(&self, nickname: &str) {
		*self.nickname.lock().unwrap_or_else(|e| e.into_inner()) = nickname.to_string();
	}

	fn restart(&self, _room: &Room) -> bool {
		false
	}
}

/// Static block lists from the config file.
struct ConfigBlocker {
	users: Vec<String>,
	words: Vec<String>,
	rx: watch::Receiver<()>,
	// Keeps the channel open so `changed()` never resolves.
	_tx: watch::Sender<()>,
}

impl ConfigBlocker {
	fn new(users: Vec<String>, words: Vec<String>) -> Self {
		let (tx, rx) = watch::channel(());
		Self {
			users,
			words,
			rx,
			_tx: tx,
		}
	}
}

impl BlockingPolicy for ConfigBlocker {
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

/// Mirrors sent traffic to the log; received traffic is already
/// printed by the event loop.
struct LogSink;

impl EventSink for LogSink {
	fn on_private_message_sent(&self, msg: &Message) {
		info!(peer = %msg.sender, "private message sent");
	}
}

fn print_message(prefix: &str, msg: &Message) {
	println!("[{}] {prefix}<{}> {}", msg.sent_at.format("%H:%M:%S"), msg.sender, msg.body);
}

fn print_event(event: SessionEvent) -> bool {
	match event {
		SessionEvent::RoomMessageReceived(msg) => print_message("", &msg),
		SessionEvent::PrivateMessageReceived(msg) => print_message("(priv) ", &msg),
		SessionEvent::NewConversation { peer } => {
			println!("* {peer} wants to talk; /accept {peer} or /reject {peer}");
		}
		SessionEvent::ConversationCancelled { peer } => println!("* {peer} cancelled the conversation"),
		SessionEvent::ConversationStateChanged { peer, state } => println!("* conversation with {peer}: {state}"),
		SessionEvent::NicknameAssigned { nickname } => println!("* you are now known as {nickname}"),
		SessionEvent::UserJoined { login } => println!("* {login} joined"),
		SessionEvent::UserLeft { login } => println!("* {login} left"),
		SessionEvent::UserListSnapshot { users } => {
			if let Some(list) = users.as_array() {
				println!("* {} users in the room", list.len());
			}
		}
		SessionEvent::UserCardBatch { .. } | SessionEvent::UserCardUpdated { .. } => {}
		SessionEvent::UserPrivStatusChanged { login, has_privs } => {
			println!("* {login} {} private conversations", if has_privs { "accepts" } else { "refuses" });
		}
		SessionEvent::ImageReceived { sender, bytes, format } => {
			let ext = format.extensions_str().first().copied().unwrap_or("bin");
			let path = std::env::temp_dir().join(format!("czateria_{sender}_{}.{ext}", std::process::id()));
			match std::fs::write(&path, &bytes) {
				Ok(()) => println!("* {sender} sent an image, saved to {}", path.display()),
				Err(e) => warn!(error = %e, "could not save received image"),
			}
		}
		SessionEvent::ImageDelivered { peer } => println!("* image delivered to {peer}"),
		SessionEvent::Kicked { cause } => println!("* you were kicked ({cause:?})"),
		SessionEvent::Banned { cause, admin } => {
			println!("* you were banned ({cause:?}) by {}", admin.as_deref().unwrap_or("the server"));
		}
		SessionEvent::SessionExpired => {
			println!("* session expired, please log in again");
			return false;
		}
		SessionEvent::SessionError => {
			println!("* session ended with an error");
			return false;
		}
	}
	true
}

async fn handle_line(handle: &SessionHandle, line: &str) -> anyhow::Result<bool> {
	let line = line.trim();
	if line.is_empty() {
		return Ok(true);
	}

	if let Some(rest) = line.strip_prefix('/') {
		let mut parts = rest.splitn(3, ' ');
		match (parts.next(), parts.next(), parts.next()) {
			(Some("quit"), _, _) => {
				handle.stop().await?;
				return Ok(false);
			}
			(Some("msg"), Some(peer), Some(text)) => handle.send_private_message(peer, text).await?,
			(Some("accept"), Some(peer), None) => handle.accept_conversation(peer).await?,
			(Some("reject"), Some(peer), None) => handle.reject_conversation(peer).await?,
			(Some("close"), Some(peer), None) => handle.close_conversation(peer).await?,
			_ => println!("* unknown command; see --help"),
		}
		return Ok(true);
	}

	handle.send_room_message(line).await?;
	Ok(true)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	init_tracing();

	let args = parse_args();
	let config_path = match args.config_path {
		Some(path) => path,
		None => config::default_config_path()?,
	};
	let cfg = config::load_client_config_from_path(&config_path)?;
	info!(path = %config_path.display(), "loaded client config (toml + env overrides)");

	let room_arg = args
		.room
		.or(cfg.room)
		.ok_or_else(|| anyhow::anyhow!("no room given (--room name:port or `room` in config)"))?;
	let room = Room::from_str(&room_arg)?;

	let nickname = args.nickname.or(cfg.nickname).unwrap_or_default();
	let session_id = args
		.session_id
		.or(cfg.session_id)
		.ok_or_else(|| anyhow::anyhow!("no session id given (--session or `session_id` in config)"))?;

	let mut session_cfg = SessionConfig {
		keepalive_interval: cfg.keepalive_interval,
		..SessionConfig::default()
	};
	if let Some(template) = cfg.ws_url_template {
		session_cfg.ws_url_template = template;
	}

	let login = Arc::new(StaticLogin {
		session_id,
		nickname: Mutex::new(nickname),
	});
	let blocker = Arc::new(ConfigBlocker::new(cfg.blocked_users, cfg.blocked_words));

	let (command_tx, command_rx, event_tx, mut event_rx) = session_channels(32, 256);
	let session = ChatSession::new(room, session_cfg, login, blocker, Arc::new(LogSink), Arc::new(PlainMarkup));
	let session_task = tokio::spawn(session.run(command_rx, event_tx));
	let handle = SessionHandle::new(command_tx);

	let mut lines = BufReader::new(tokio::io::stdin()).lines();

	loop {
		tokio::select! {
			event = event_rx.recv() => {
				let Some(event) = event else {
					break;
				};
				if !print_event(event) {
					break;
				}
			}
			line = lines.next_line() => {
				match line? {
					Some(line) => {
						if !handle_line(&handle, &line).await? {
							break;
						}
					}
					None => {
						let _ = handle.stop().await;
						break;
					}
				}
			}
		}
	}

	let _ = session_task.await;
	Ok(())
}
