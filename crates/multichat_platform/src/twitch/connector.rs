#![forbid(unsafe_code)]

use multichat_domain::{ChatSource, EmoteRanges, format_range};
use tracing::{debug, info, warn};
use twitch_irc::login::StaticLoginCredentials;
use twitch_irc::message::{Emote, PrivmsgMessage, ServerMessage};
use twitch_irc::{ClientConfig, SecureTCPTransport, TwitchIRCClient};

use crate::assets::twitch_cdn;
use crate::{
	ConnectorControl, ConnectorControlRx, ConnectorEvent, ConnectorEventTx, InboundChat, PlatformConnector, SecretString,
	new_session_id, status,
};

type TwitchClient = TwitchIRCClient<SecureTCPTransport, StaticLoginCredentials>;

/// Bot identity and target channel for the IRC session.
#[derive(Debug, Clone)]
pub struct TwitchConfig {
	pub channel: String,
	pub bot_login: String,
	pub oauth_token: SecretString,
}

impl TwitchConfig {
	pub fn new(channel: impl Into<String>, bot_login: impl Into<String>, oauth_token: SecretString) -> Self {
		Self {
			channel: channel.into().trim_start_matches('#').to_lowercase(),
			bot_login: bot_login.into().to_lowercase(),
			oauth_token,
		}
	}

	/// Login credentials; the token is accepted with or without the `oauth:` prefix.
	fn credentials(&self) -> StaticLoginCredentials {
		let token = self.oauth_token.expose();
		let token = token.strip_prefix("oauth:").unwrap_or(token);
		StaticLoginCredentials::new(self.bot_login.clone(), Some(token.to_string()))
	}
}

/// Twitch chat through `twitch_irc`.
pub struct TwitchIrcConnector {
	cfg: TwitchConfig,
}

impl TwitchIrcConnector {
	pub fn new(cfg: TwitchConfig) -> Self {
		Self { cfg }
	}

	async fn say(&self, client: &TwitchClient, text: String) {
		let text = text.replace(['\r', '\n'], " ");
		if let Err(e) = client.say(self.cfg.channel.clone(), text).await {
			warn!(error = %e, channel = %self.cfg.channel, "twitch say failed");
		}
	}

	/// Handle one server message; `Ok(false)` ends the session.
	async fn handle_message(
		&self,
		message: ServerMessage,
		connected: &mut bool,
		events_tx: &ConnectorEventTx,
	) -> anyhow::Result<bool> {
		match message {
			ServerMessage::RoomState(room) if room.channel_login == self.cfg.channel => {
				if !*connected {
					*connected = true;
					info!(channel = %self.cfg.channel, "twitch irc joined");
					let _ = events_tx.try_send(status(
						ChatSource::Twitch,
						true,
						format!("joined #{}", self.cfg.channel),
					));
				}
			}
			ServerMessage::Notice(notice) => {
				let text = notice.message_text.as_str();
				if text.contains("Login authentication failed") || text.contains("Improperly formatted auth") {
					anyhow::bail!("twitch irc auth rejected: {text}");
				}
				debug!(notice = text, "twitch irc notice");
			}
			ServerMessage::Privmsg(msg) => {
				if let Some(chat) = privmsg_to_chat(&msg, &self.cfg.channel, &self.cfg.bot_login) {
					metrics::counter!("multichat_connector_messages_total", "source" => "twitch").increment(1);
					if events_tx.send(ConnectorEvent::Chat(Box::new(chat))).await.is_err() {
						return Ok(false);
					}
				}
			}
			_ => {}
		}
		Ok(true)
	}
}

/// Twitch emote positions (char ranges, end exclusive) as inclusive ranges keyed by CDN URL.
pub fn emote_ranges(emotes: &[Emote]) -> EmoteRanges {
	let mut out = EmoteRanges::new();
	for emote in emotes {
		if emote.char_range.end <= emote.char_range.start {
			continue;
		}
		out.entry(twitch_cdn(&emote.id))
			.or_insert_with(Vec::new)
			.push(format_range(emote.char_range.start, emote.char_range.end - 1));
	}
	out
}

/// Map a PRIVMSG for `channel` to an inbound chat, skipping the bot's own lines.
pub fn privmsg_to_chat(msg: &PrivmsgMessage, channel: &str, bot_login: &str) -> Option<InboundChat> {
	if !msg.channel_login.eq_ignore_ascii_case(channel.trim_start_matches('#')) {
		return None;
	}
	if msg.sender.login.eq_ignore_ascii_case(bot_login) {
		return None;
	}

	let username = if msg.sender.name.trim().is_empty() {
		msg.sender.login.clone()
	} else {
		msg.sender.name.clone()
	};

	let mut chat = InboundChat::new(ChatSource::Twitch, username, msg.message_text.clone());
	chat.login = msg.sender.login.to_lowercase();
	chat.color = msg
		.name_color
		.as_ref()
		.map(|c| format!("#{:02X}{:02X}{:02X}", c.r, c.g, c.b))
		.unwrap_or_default();
	chat.is_moderator = msg.badges.iter().any(|b| b.name == "moderator");
	chat.is_broadcaster = msg.badges.iter().any(|b| b.name == "broadcaster");
	chat.emotes = emote_ranges(&msg.emotes);
	Some(chat)
}

#[async_trait::async_trait]
impl PlatformConnector for TwitchIrcConnector {
	fn source(&self) -> ChatSource {
		ChatSource::Twitch
	}

	async fn run(self: Box<Self>, mut control_rx: ConnectorControlRx, events_tx: ConnectorEventTx) -> anyhow::Result<()> {
		let session_id = new_session_id();
		info!(%session_id, channel = %self.cfg.channel, "twitch irc connecting");

		let config = ClientConfig::new_simple(self.cfg.credentials());
		let (mut incoming, client) = TwitchClient::new(config);
		client
			.join(self.cfg.channel.clone())
			.map_err(|e| anyhow::anyhow!("invalid twitch channel {}: {e}", self.cfg.channel))?;

		let mut connected = false;
		let result: anyhow::Result<()> = loop {
			tokio::select! {
				cmd = control_rx.recv() => {
					match cmd {
						Some(ConnectorControl::Say { text }) => self.say(&client, text).await,
						Some(ConnectorControl::Shutdown) | None => {
							info!(%session_id, "twitch irc received Shutdown");
							break Ok(());
						}
					}
				}

				message = incoming.recv() => {
					let Some(message) = message else {
						break Err(anyhow::anyhow!("twitch irc stream ended"));
					};
					match self.handle_message(message, &mut connected, &events_tx).await {
						Ok(true) => {}
						Ok(false) => break Ok(()),
						Err(e) => break Err(e),
					}
				}
			}
		};

		drop(client);
		let _ = events_tx.try_send(status(ChatSource::Twitch, false, "twitch irc stopped"));
		result
	}
}
