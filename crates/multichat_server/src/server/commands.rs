#![forbid(unsafe_code)]

use std::sync::Arc;

use multichat_domain::PropValue;
use multichat_platform::InboundChat;
use multichat_util::profanity::is_profane;
use tracing::{info, warn};

use super::chat::ChatService;
use super::props::PropStore;
use super::speaker::Speaker;

pub const HELP_TEXT: &str = "commands: !nick - set your nickname; !botpage - link to the page with nicknames and other info; !multichat - link to combined chat; !clear - clear the multichat";

/// Result of looking at one chat line for a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandOutcome {
	pub valid_command: bool,
	pub should_reply: bool,
}

impl CommandOutcome {
	const NONE: Self = Self {
		valid_command: false,
		should_reply: true,
	};
	const REPLIED: Self = Self {
		valid_command: true,
		should_reply: true,
	};
	const SILENT: Self = Self {
		valid_command: true,
		should_reply: false,
	};
}

#[derive(Debug, Clone)]
pub struct CommandSettings {
	pub channel: String,
	pub base_url: String,
	pub super_admin_username: String,
}

/// Primary-chat `!` commands.
pub struct CommandHandler {
	settings: CommandSettings,
	props: Arc<PropStore>,
	chat: Arc<ChatService>,
	speaker: Arc<dyn Speaker>,
}

impl CommandHandler {
	pub fn new(
		settings: CommandSettings,
		props: Arc<PropStore>,
		chat: Arc<ChatService>,
		speaker: Arc<dyn Speaker>,
	) -> Self {
		Self {
			settings,
			props,
			chat,
			speaker,
		}
	}

	/// Run the command in `line`, if any. `username` is the display name used in replies and prop keys.
	pub async fn handle(&self, line: &InboundChat, username: &str) -> CommandOutcome {
		let command = line.text.replace(" \u{e0000}", " ");
		let command = command.trim();

		match command {
			"!help" | "!commands" => self.say(HELP_TEXT.to_string()).await,
			"!botpage" => {
				self.say(format!(
					"see the nicknames and other bot info at {}/{}",
					self.settings.base_url, self.settings.channel
				))
				.await
			}
			"!multichat" => {
				self.say(format!(
					"see the multichat at {}/{}/chat (change font and show/hide options on !botpage)",
					self.settings.base_url, self.settings.channel
				))
				.await
			}
			"!clear" => return self.clear(line, username).await,
			"!nick" => self.clear_nickname(username).await,
			_ => match command.strip_prefix("!nick ") {
				Some(nickname) => self.set_nickname(username, nickname.trim()).await,
				None => return CommandOutcome::NONE,
			},
		}
		metrics::counter!("multichat_commands_total").increment(1);
		CommandOutcome::REPLIED
	}

	async fn say(&self, text: String) {
		self.speaker.say(text).await;
	}

	fn may_clear(&self, line: &InboundChat) -> bool {
		line.is_moderator
			|| line.is_broadcaster
			|| line.login.eq_ignore_ascii_case(&self.settings.channel)
			|| (!self.settings.super_admin_username.is_empty()
				&& line.login.eq_ignore_ascii_case(&self.settings.super_admin_username))
	}

	async fn clear(&self, line: &InboundChat, username: &str) -> CommandOutcome {
		metrics::counter!("multichat_commands_total").increment(1);
		if self.may_clear(line) {
			info!(%username, "chat cleared by command");
			self.chat.clear_chat();
			CommandOutcome::SILENT
		} else {
			self.say(format!("@{username} you do not have permission to clear chat"))
				.await;
			CommandOutcome::REPLIED
		}
	}

	async fn clear_nickname(&self, username: &str) {
		if self.props.get_viewer_prop(username, "nickname").await.is_null() {
			self.say(format!("@{username} please provide a nickname, e.g. !nick name"))
				.await;
			return;
		}

		if let Err(e) = self.props.set_viewer_prop(username, "nickname", PropValue::Null).await {
			warn!(%username, error = %e, "clearing nickname failed");
			return;
		}
		self.say(format!("@{username} removed nickname, sad to see you go"))
			.await;
	}

	async fn set_nickname(&self, username: &str, nickname: &str) {
		let max_len = self.props.channel_number::<usize>("max_nickname_length").await;
		let current = self.props.get_viewer_prop(username, "nickname").await;

		let reply = if is_profane(nickname) {
			format!("@{username} no profanity allowed in nickname, choose a different one")
		} else if current.as_str() == Some(nickname) {
			format!("@{username} you already have that nickname")
		} else if nickname.len() > max_len {
			format!("@{username} nickname \"{nickname}\" is too long, max length = {max_len}")
		} else if self.props.is_nickname_taken(nickname).await {
			format!("@{username} nickname \"{nickname}\" is already taken, see !botpage for the list")
		} else {
			if let Err(e) = self
				.props
				.set_viewer_prop(username, "nickname", PropValue::from(nickname))
				.await
			{
				warn!(%username, error = %e, "setting nickname failed");
				return;
			}
			info!(%username, %nickname, "nickname set");
			format!("@{username} set nickname to {nickname}")
		};
		self.say(reply).await;
	}
}
