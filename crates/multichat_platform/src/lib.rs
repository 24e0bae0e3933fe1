#![forbid(unsafe_code)]

pub mod assets;
pub mod kick;
pub mod owncast;
pub mod pronouns;
pub mod twitch;
pub mod youtube;

use std::fmt;
use std::time::SystemTime;

use multichat_domain::{ChatSource, EmoteRanges};
use tokio::sync::mpsc;
use uuid::Uuid;

/// Server → connector control message.
#[derive(Debug)]
pub enum ConnectorControl {
	/// Send a line into the platform's chat (primary chat only; others ignore it).
	Say { text: String },

	/// Close the connection and return from `run`.
	Shutdown,
}

/// Connector → server event message.
#[derive(Debug, Clone)]
pub enum ConnectorEvent {
	/// Connection status update.
	Status(ConnectorStatus),

	/// Normalized inbound chat line.
	Chat(Box<InboundChat>),

	/// Text the bot should say on primary chat.
	///
	/// `later` asks for the short announcement delay so the line orders after
	/// any pending disconnect notice.
	Announce { text: String, later: bool },
}

/// Chat line as received from a platform, before enrichment.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundChat {
	pub source: ChatSource,

	/// Display name as shown by the platform.
	pub username: String,

	/// Lower-case account name when the platform distinguishes it.
	pub login: String,

	pub color: String,
	pub text: String,

	/// Platform-native emote annotations (URL → ranges).
	pub emotes: EmoteRanges,

	pub is_moderator: bool,
	pub is_broadcaster: bool,
}

impl InboundChat {
	pub fn new(source: ChatSource, username: impl Into<String>, text: impl Into<String>) -> Self {
		let username = username.into();
		Self {
			source,
			login: username.to_lowercase(),
			username,
			color: String::new(),
			text: text.into(),
			emotes: EmoteRanges::new(),
			is_moderator: false,
			is_broadcaster: false,
		}
	}
}

/// Connector status event.
#[derive(Debug, Clone)]
pub struct ConnectorStatus {
	pub source: ChatSource,
	pub connected: bool,
	pub detail: String,
	pub last_error: Option<String>,
	pub time: SystemTime,
}

/// Wrapper that redacts in logs.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct SecretString(String);

impl SecretString {
	pub fn new(s: impl Into<String>) -> Self {
		Self(s.into())
	}

	/// Access the inner secret string.
	pub fn expose(&self) -> &str {
		&self.0
	}

	pub fn is_empty(&self) -> bool {
		self.0.is_empty()
	}
}

impl fmt::Debug for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("SecretString(<redacted>)")
	}
}

impl fmt::Display for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("<redacted>")
	}
}

impl<'de> serde::Deserialize<'de> for SecretString {
	fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
	where
		D: serde::Deserializer<'de>,
	{
		let s = String::deserialize(deserializer)?;
		Ok(SecretString::new(s))
	}
}

/// Helper types for wiring connectors.
pub type ConnectorControlTx = mpsc::Sender<ConnectorControl>;
pub type ConnectorControlRx = mpsc::Receiver<ConnectorControl>;
pub type ConnectorEventTx = mpsc::Sender<ConnectorEvent>;
pub type ConnectorEventRx = mpsc::Receiver<ConnectorEvent>;

/// A runnable connection to one chat platform.
///
/// `run` owns a single session: it connects, reports `Status(connected=true)`
/// once the handshake succeeds, forwards chat until the socket fails or
/// `Shutdown` arrives, then returns. Reconnecting is the caller's job.
#[async_trait::async_trait]
pub trait PlatformConnector: Send + Sync + 'static {
	fn source(&self) -> ChatSource;

	async fn run(self: Box<Self>, control_rx: ConnectorControlRx, events_tx: ConnectorEventTx) -> anyhow::Result<()>;
}

/// Build a standard bounded channel pair.
pub fn bounded_connector_channels(
	control_capacity: usize,
	events_capacity: usize,
) -> (ConnectorControlTx, ConnectorControlRx, ConnectorEventTx, ConnectorEventRx) {
	let (control_tx, control_rx) = mpsc::channel(control_capacity);
	let (events_tx, events_rx) = mpsc::channel(events_capacity);
	(control_tx, control_rx, events_tx, events_rx)
}

/// Build a status event.
pub fn status(source: ChatSource, connected: bool, detail: impl Into<String>) -> ConnectorEvent {
	ConnectorEvent::Status(ConnectorStatus {
		source,
		connected,
		detail: detail.into(),
		last_error: None,
		time: SystemTime::now(),
	})
}

/// Build a fatal-error status event.
pub fn status_error(source: ChatSource, detail: impl Into<String>, err: impl fmt::Display) -> ConnectorEvent {
	ConnectorEvent::Status(ConnectorStatus {
		source,
		connected: false,
		detail: detail.into(),
		last_error: Some(err.to_string()),
		time: SystemTime::now(),
	})
}

/// Generate an opaque session id.
pub fn new_session_id() -> String {
	Uuid::new_v4().to_string()
}
