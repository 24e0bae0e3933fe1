#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use multichat_domain::{ChatSource, EmoteRanges};
use tracing::debug;

use super::chat::ChatService;
use super::connectors::ConnectorSupervisor;
use super::props::PropStore;

/// Delay for announcements that should land after a pending disconnect notice.
pub const ANNOUNCE_DELAY: Duration = Duration::from_millis(500);

/// Outbound voice of the bot on primary chat.
#[async_trait]
pub trait Speaker: Send + Sync + 'static {
	async fn say(&self, text: String);
}

/// Say `text` after `delay` on a detached task.
pub fn say_after(speaker: Arc<dyn Speaker>, text: String, delay: Duration) {
	tokio::spawn(async move {
		tokio::time::sleep(delay).await;
		speaker.say(text).await;
	});
}

pub fn say_later(speaker: Arc<dyn Speaker>, text: String) {
	say_after(speaker, text, ANNOUNCE_DELAY);
}

/// Sends through the primary-chat connector and echoes the line into the feed as the bot.
pub struct PrimaryChatSpeaker {
	connector: Arc<ConnectorSupervisor>,
	chat: Arc<ChatService>,
	props: Arc<PropStore>,
	bot_username: String,
}

impl PrimaryChatSpeaker {
	pub fn new(
		connector: Arc<ConnectorSupervisor>,
		chat: Arc<ChatService>,
		props: Arc<PropStore>,
		bot_username: impl Into<String>,
	) -> Self {
		Self {
			connector,
			chat,
			props,
			bot_username: bot_username.into(),
		}
	}
}

#[async_trait]
impl Speaker for PrimaryChatSpeaker {
	async fn say(&self, text: String) {
		if !self.connector.say(text.clone()).await {
			debug!(%text, "primary chat not connected; dropping line");
			return;
		}

		let nickname = self.props.viewer_string(&self.bot_username, "nickname").await;
		self.chat.send_chat(
			ChatSource::Twitch,
			&self.bot_username,
			&nickname,
			"",
			&text,
			EmoteRanges::new(),
		);
	}
}
