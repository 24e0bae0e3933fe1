#![forbid(unsafe_code)]

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context as _, anyhow};
use multichat_platform::SecretString;
use serde::Deserialize;
use tracing::{info, warn};

pub const DEFAULT_BOT_NICKNAME: &str = "🤖";
pub const DEFAULT_HISTORY_LENGTH: usize = 100;
pub const DEFAULT_PORT: u16 = 80;

/// Default config path: `~/.multichat/config.toml`.
pub fn default_config_path() -> anyhow::Result<PathBuf> {
	let home = dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
	Ok(home.join(".multichat").join("config.toml"))
}

/// Load the server config from `MULTICHAT_CONFIG` (or the default path) and env overrides.
pub fn load_server_config() -> anyhow::Result<ServerConfig> {
	let path = match std::env::var("MULTICHAT_CONFIG") {
		Ok(p) if !p.trim().is_empty() => PathBuf::from(p.trim()),
		_ => default_config_path()?,
	};
	load_server_config_from_path(&path)
}

/// Same as `load_server_config` but with an explicit config path.
pub fn load_server_config_from_path(path: &Path) -> anyhow::Result<ServerConfig> {
	let file_cfg = read_toml_if_exists(path)
		.with_context(|| format!("read config from {}", path.display()))?
		.unwrap_or_default();

	let mut cfg = ServerConfig::from_file(file_cfg);

	apply_env_overrides(&mut cfg);

	Ok(cfg)
}

/// Server config for one channel instance.
#[derive(Debug, Clone)]
pub struct ServerConfig {
	/// Primary chat channel this instance serves (lower-case login).
	pub channel: String,
	pub twitch: TwitchSettings,
	pub server: ServerSettings,
	pub chat: ChatSettings,
	pub persistence: PersistenceSettings,
}

impl Default for ServerConfig {
	fn default() -> Self {
		Self::from_file(FileConfig::default())
	}
}

/// Primary chat credentials.
#[derive(Debug, Clone, Default)]
pub struct TwitchSettings {
	pub bot_username: String,
	pub oauth_token: Option<SecretString>,
	/// App credentials for Helix (channel id and native emotes).
	pub client_id: Option<String>,
	pub client_secret: Option<SecretString>,
	/// Account allowed to run moderator commands in any channel.
	pub super_admin_username: Option<String>,
}

/// HTTP surface settings.
#[derive(Debug, Clone)]
pub struct ServerSettings {
	pub port: u16,
	/// Explicit bind address; falls back to `0.0.0.0:{port}`.
	pub http_bind: Option<String>,
	/// Public base URL used in chat replies (`!botpage`).
	pub base_url: String,
	/// Optional metrics exporter bind address (host:port).
	pub metrics_bind: Option<String>,
	/// Bearer token for mutating routes. Mutations are disabled when unset.
	pub admin_token: Option<SecretString>,
	/// Page template; its hash is sent to every websocket client.
	pub index_html: PathBuf,
	/// `[{id, code}]` alias table for `:code:` emoji.
	pub yt_emotes: PathBuf,
}

impl ServerSettings {
	pub fn http_bind(&self) -> String {
		self.http_bind
			.clone()
			.unwrap_or_else(|| format!("0.0.0.0:{}", self.port))
	}
}

/// Chat feed settings.
#[derive(Debug, Clone)]
pub struct ChatSettings {
	pub history_length: usize,
	pub default_bot_nickname: String,
}

/// Config store settings.
#[derive(Debug, Clone, Default)]
pub struct PersistenceSettings {
	/// `sqlite:` URL; `None` keeps props in memory.
	pub database_url: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileConfig {
	channel: Option<String>,

	#[serde(default)]
	twitch: FileTwitchSettings,

	#[serde(default)]
	server: FileServerSettings,

	#[serde(default)]
	chat: FileChatSettings,

	#[serde(default)]
	persistence: FilePersistenceSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileTwitchSettings {
	bot_username: Option<String>,
	oauth_token: Option<String>,
	client_id: Option<String>,
	client_secret: Option<String>,
	super_admin_username: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileServerSettings {
	port: Option<u16>,
	http_bind: Option<String>,
	base_url: Option<String>,
	metrics_bind: Option<String>,
	admin_token: Option<String>,
	index_html: Option<String>,
	yt_emotes: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileChatSettings {
	history_length: Option<usize>,
	default_bot_nickname: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FilePersistenceSettings {
	database_url: Option<String>,
}

fn non_empty(v: Option<String>) -> Option<String> {
	v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

impl ServerConfig {
	fn from_file(file: FileConfig) -> Self {
		let twitch = TwitchSettings {
			bot_username: non_empty(file.twitch.bot_username)
				.map(|s| s.to_lowercase())
				.unwrap_or_default(),
			oauth_token: non_empty(file.twitch.oauth_token).map(SecretString::new),
			client_id: non_empty(file.twitch.client_id),
			client_secret: non_empty(file.twitch.client_secret).map(SecretString::new),
			super_admin_username: non_empty(file.twitch.super_admin_username),
		};

		Self {
			channel: non_empty(file.channel)
				.map(|s| s.trim_start_matches('#').to_lowercase())
				.unwrap_or_default(),
			twitch,
			server: ServerSettings {
				port: file.server.port.unwrap_or(DEFAULT_PORT),
				http_bind: non_empty(file.server.http_bind),
				base_url: non_empty(file.server.base_url)
					.map(|s| s.trim_end_matches('/').to_string())
					.unwrap_or_default(),
				metrics_bind: non_empty(file.server.metrics_bind),
				admin_token: non_empty(file.server.admin_token).map(SecretString::new),
				index_html: non_empty(file.server.index_html)
					.map(PathBuf::from)
					.unwrap_or_else(|| PathBuf::from("index.html")),
				yt_emotes: non_empty(file.server.yt_emotes)
					.map(PathBuf::from)
					.unwrap_or_else(|| PathBuf::from("yt.json")),
			},
			chat: ChatSettings {
				history_length: file.chat.history_length.unwrap_or(DEFAULT_HISTORY_LENGTH),
				default_bot_nickname: non_empty(file.chat.default_bot_nickname)
					.unwrap_or_else(|| DEFAULT_BOT_NICKNAME.to_string()),
			},
			persistence: PersistenceSettings {
				database_url: non_empty(file.persistence.database_url),
			},
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

fn apply_env_overrides(cfg: &mut ServerConfig) {
	apply_overrides(cfg, |key| std::env::var(key).ok());
}

fn apply_overrides(cfg: &mut ServerConfig, env: impl Fn(&str) -> Option<String>) {
	let var = |key: &str| env(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

	if let Some(v) = var("TWITCH_CHANNEL") {
		cfg.channel = v.trim_start_matches('#').to_lowercase();
		info!("server config: channel overridden by env");
	}

	if let Some(v) = var("TWITCH_BOT_USERNAME") {
		cfg.twitch.bot_username = v.to_lowercase();
		info!("twitch config: bot_username overridden by env");
	}

	if let Some(v) = var("TWITCH_BOT_OAUTH_TOKEN") {
		cfg.twitch.oauth_token = Some(SecretString::new(v));
		info!("twitch config: oauth_token overridden by env");
	}

	if let Some(v) = var("TWITCH_CLIENT_ID") {
		cfg.twitch.client_id = Some(v);
		info!("twitch config: client_id overridden by env");
	}

	if let Some(v) = var("TWITCH_SECRET") {
		cfg.twitch.client_secret = Some(SecretString::new(v));
		info!("twitch config: client_secret overridden by env");
	}

	if let Some(v) = var("TWITCH_SUPER_ADMIN_USERNAME") {
		cfg.twitch.super_admin_username = Some(v);
		info!("twitch config: super_admin_username overridden by env");
	}

	if let Some(v) = var("BASE_URL") {
		cfg.server.base_url = v.trim_end_matches('/').to_string();
		info!("server config: base_url overridden by env");
	}

	if let Some(v) = var("PORT") {
		match v.parse::<u16>() {
			Ok(port) => {
				cfg.server.port = port;
				info!(port, "server config: port overridden by env");
			}
			Err(e) => warn!(error = %e, value = %v, "server config: ignoring invalid PORT"),
		}
	}

	if let Some(v) = var("DEFAULT_BOT_NICKNAME") {
		cfg.chat.default_bot_nickname = v;
		info!("chat config: default_bot_nickname overridden by env");
	}

	if let Some(v) = var("CHAT_HISTORY_LENGTH")
		&& let Ok(len) = v.parse::<usize>()
	{
		cfg.chat.history_length = len;
		info!(len, "chat config: history_length overridden by env");
	}

	if let Some(v) = var("MULTICHAT_DATABASE_URL") {
		cfg.persistence.database_url = Some(v);
		info!("persistence: database_url overridden by env");
	}

	if let Some(v) = var("MULTICHAT_METRICS_BIND") {
		cfg.server.metrics_bind = Some(v);
		info!("server config: metrics_bind overridden by env");
	}

	if let Some(v) = var("MULTICHAT_ADMIN_TOKEN") {
		cfg.server.admin_token = Some(SecretString::new(v));
		info!("server auth: admin_token overridden by env");
	}

	if let Some(v) = var("MULTICHAT_INDEX_HTML") {
		cfg.server.index_html = PathBuf::from(v);
		info!("server config: index_html overridden by env");
	}

	if let Some(v) = var("MULTICHAT_YT_EMOTES") {
		cfg.server.yt_emotes = PathBuf::from(v);
		info!("server config: yt_emotes overridden by env");
	}

	if let Some(v) = var("MULTICHAT_HTTP_BIND") {
		cfg.server.http_bind = Some(v);
		info!("server config: http_bind overridden by env");
	}

	if cfg.channel.is_empty() {
		warn!("server config: no channel configured");
	}
	if cfg.server.admin_token.is_none() {
		warn!("server auth: no admin_token; mutating routes are disabled");
	}
}
