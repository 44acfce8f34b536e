#![forbid(unsafe_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use serde::Deserialize;
use tracing::info;

/// Default config path: `~/.czateria/config.toml`.
pub fn default_config_path() -> anyhow::Result<PathBuf> {
	let home = dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
	Ok(home.join(".czateria").join("config.toml"))
}

/// Load the client config from TOML and env overrides.
pub fn load_client_config_from_path(path: &Path) -> anyhow::Result<ClientConfig> {
	let file_cfg = read_toml_if_exists(path)
		.with_context(|| format!("read config from {}", path.display()))?
		.unwrap_or_default();

	let mut cfg = ClientConfig::from_file(file_cfg);

	apply_env_overrides(&mut cfg);

	Ok(cfg)
}

/// Client config (v1).
#[derive(Debug, Clone)]
pub struct ClientConfig {
	/// Room to join, as `name:port`.
	pub room: Option<String>,
	/// Nickname presented at login.
	pub nickname: Option<String>,
	/// Pre-obtained session id.
	pub session_id: Option<String>,
	/// Keepalive cadence.
	pub keepalive_interval: Duration,
	/// WebSocket URL template; `{port}` is replaced per room.
	pub ws_url_template: Option<String>,
	/// Nicknames whose traffic is suppressed.
	pub blocked_users: Vec<String>,
	/// Substrings that suppress a message.
	pub blocked_words: Vec<String>,
}

impl Default for ClientConfig {
	fn default() -> Self {
		Self {
			room: None,
			nickname: None,
			session_id: None,
			keepalive_interval: Duration::from_millis(40_000),
			ws_url_template: None,
			blocked_users: Vec::new(),
			blocked_words: Vec::new(),
		}
	}
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileConfig {
	room: Option<String>,
	nickname: Option<String>,
	session_id: Option<String>,
	keepalive_interval_ms: Option<u64>,
	ws_url_template: Option<String>,

	#[serde(default)]
	blocked_users: Vec<String>,
	#[serde(default)]
	blocked_words: Vec<String>,
}

impl ClientConfig {
	fn from_file(file: FileConfig) -> Self {
		let defaults = Self::default();
		Self {
			room: file.room.filter(|s| !s.trim().is_empty()),
			nickname: file.nickname.filter(|s| !s.trim().is_empty()),
			session_id: file.session_id.filter(|s| !s.trim().is_empty()),
			keepalive_interval: file
				.keepalive_interval_ms
				.map(Duration::from_millis)
				.unwrap_or(defaults.keepalive_interval),
			ws_url_template: file.ws_url_template.filter(|s| !s.trim().is_empty()),
			blocked_users: file.blocked_users,
			blocked_words: file.blocked_words,
		}
	}
}

fn read_toml_if_exists(path: &Path) -> anyhow::Result<Option<FileConfig>> {
	match fs::read_to_string(path) {
		Ok(s) => {
			let cfg: FileConfig = toml::from_str(&s).context("parse TOML")?;
			Ok(Some(cfg))
		}
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
		Err(e) => Err(anyhow!(e).context("read config file")),
	}
}

fn apply_env_overrides(cfg: &mut ClientConfig) {
	if let Ok(v) = std::env::var("CZATERIA_ROOM") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.room = Some(v);
			info!("client config: room overridden by env");
		}
	}

	if let Ok(v) = std::env::var("CZATERIA_NICKNAME") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.nickname = Some(v);
			info!("client config: nickname overridden by env");
		}
	}

	if let Ok(v) = std::env::var("CZATERIA_SESSION_ID") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.session_id = Some(v);
			info!("client config: session_id overridden by env");
		}
	}

	if let Ok(v) = std::env::var("CZATERIA_KEEPALIVE_MS")
		&& let Ok(ms) = v.trim().parse::<u64>()
	{
		cfg.keepalive_interval = Duration::from_millis(ms);
		info!(ms, "client config: keepalive_interval overridden by env");
	}

	if let Ok(v) = std::env::var("CZATERIA_WS_URL_TEMPLATE") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.ws_url_template = Some(v);
			info!("client config: ws_url_template overridden by env");
		}
	}
}
